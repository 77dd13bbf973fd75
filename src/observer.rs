//! The observer/notification engine (spec §4.G, component G): live
//! subscriptions over a [`Specification`], delivered as nested add/remove
//! callbacks instead of a re-run query.
//!
//! An [`Observer`] registers one store listener per inverse specification
//! (`crate::inverse::invert`) before it performs its own initial read — that
//! ordering is what makes registration atomic with respect to concurrent
//! saves (spec §4.G.1). From then on, every inverse's delta is routed to
//! the projection-tree position (`crate::inverse::Path`) it was derived
//! for, keyed by `hash(tuple restricted to result_subset)`, so an add for a
//! tuple already presented is a no-op and a remove for a tuple never
//! presented is a no-op — the same property that makes `MaybeAdd` and
//! `MaybeRemove` safe to treat identically to `Add`/`Remove` here: the
//! dedup *is* the recheck.
//!
//! Dispatch is entirely synchronous — the teacher has no async runtime, and
//! `FactStore::save` already invokes listeners before returning, so by the
//! time a caller's `save` call returns, every observer watching it has
//! already been notified. `loaded()`/`processed()` are therefore plain
//! synchronous calls, not futures (spec §9).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{CallbackError, Result};
use crate::fact::Reference;
use crate::inverse::{invert, InverseSpecification, Operation, Path, PathStep};
use crate::spec::{Label, Specification};
use crate::store::{FactStore, ListenerDelta, ListenerToken, ProjectedValue, QueryResult, Tuple};

/// Invoked once per newly surfaced result at a projection-tree position.
/// May return a remove callback, invoked exactly once if that same result
/// is later retracted.
pub type AddHandler = Box<dyn FnMut(&QueryResult) -> Option<RemoveCallback> + Send>;

/// Invoked when a previously added result is retracted. Never invoked if
/// `stop()` is called instead — stopping discards outstanding remove
/// callbacks rather than firing them.
pub type RemoveCallback = Box<dyn FnMut() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initializing,
    Loaded,
    Running,
    Stopped,
}

/// One projection-tree position's bookkeeping: the registered handler (if
/// any), results buffered before a handler registered, and the set of
/// currently-presented results keyed by notification key.
#[derive(Default)]
struct Node {
    handler: Option<AddHandler>,
    buffered: Vec<(String, QueryResult)>,
    active: HashMap<String, Option<RemoveCallback>>,
}

struct ObserverInner {
    store: Arc<dyn FactStore>,
    specification: Specification,
    given: Vec<Reference>,
    path_result_subsets: HashMap<Path, Vec<Label>>,
    state: Mutex<State>,
    tokens: Mutex<Vec<ListenerToken>>,
    tree: Mutex<HashMap<Path, Node>>,
    errors: Mutex<Vec<String>>,
}

/// A live subscription over a specification (spec §4.G).
///
/// Lifecycle is one-way: `initializing` → `loaded` → `running`, except
/// `stop()`, which is reachable from any state and idempotent.
pub struct Observer {
    inner: Arc<ObserverInner>,
}

/// A handle onto one nested collection within an observer's projection
/// tree — the root collection, a `Composite` entry, or a nested
/// `Specification` projection reached through one or more of those.
#[derive(Clone)]
pub struct CollectionHandle {
    inner: Arc<ObserverInner>,
    path: Path,
}

impl Observer {
    /// Starts an observer: registers one listener per inverse derived from
    /// `specification` (spec §4.F), then performs the initial read and
    /// dispatches its results as adds. Registration happens first so no
    /// fact saved concurrently with construction can be missed.
    pub fn start(
        store: Arc<dyn FactStore>,
        given: Vec<Reference>,
        specification: Specification,
    ) -> Result<Self> {
        let inverses = invert(&specification);
        let path_result_subsets = build_path_result_subsets(&specification, &inverses);

        let inner = Arc::new(ObserverInner {
            store,
            specification,
            given,
            path_result_subsets,
            state: Mutex::new(State::Initializing),
            tokens: Mutex::new(Vec::new()),
            tree: Mutex::new(HashMap::new()),
            errors: Mutex::new(Vec::new()),
        });

        {
            let mut tokens = inner.tokens.lock().expect("observer token registry poisoned");
            for inverse in &inverses {
                let dispatch_inner = Arc::clone(&inner);
                let inverse_for_closure = inverse.clone();
                let token = inner.store.add_specification_listener(
                    inverse.inverse_specification.clone(),
                    Arc::new(move |delta: ListenerDelta| {
                        dispatch_inner.handle_listener_delta(&inverse_for_closure, delta);
                    }),
                )?;
                tokens.push(token);
            }
        }

        inner.run_initial_load()?;
        *inner.state.lock().expect("observer state poisoned") = State::Loaded;
        *inner.state.lock().expect("observer state poisoned") = State::Running;

        Ok(Observer { inner })
    }

    /// Registers `handler` on the root collection. Any result already
    /// presented at the root before this call is replayed immediately, in
    /// the order it was first presented.
    pub fn on_added(&self, handler: AddHandler) {
        self.inner.register_handler(&[], handler);
    }

    /// A handle onto the nested collection at `path` (as produced by
    /// `crate::inverse::invert`'s `path` field, or built up by hand by
    /// walking `Composite`/`Collection` projection structure).
    pub fn collection(&self, path: Path) -> CollectionHandle {
        CollectionHandle {
            inner: Arc::clone(&self.inner),
            path,
        }
    }

    /// Blocks until the initial read has completed. Synchronous dispatch
    /// means this is always already true by the time `start` returns; this
    /// exists so callers written against the observer contract don't need
    /// to special-case the synchronous backend.
    pub fn loaded(&self) -> Result<()> {
        Ok(())
    }

    /// Blocks until every notification queued so far has been dispatched.
    /// As with `loaded`, always trivially true under synchronous dispatch.
    pub fn processed(&self) -> Result<()> {
        Ok(())
    }

    /// Re-runs the initial read and dispatches any result not already
    /// presented. Existing results are unaffected (the notification-key
    /// dedup treats them as already added). Addresses the case the
    /// `given` references are not yet all present in storage at
    /// construction time but settle afterward — the inverter only derives
    /// listeners for facts of types it already knows to walk backward
    /// from, so a late-arriving given has no inverse of its own and must
    /// be picked up by re-reading (spec §4.G.5).
    pub fn refresh(&self) -> Result<()> {
        self.inner.run_initial_load()
    }

    /// Callback failures recorded so far, in the order they occurred.
    pub fn errors(&self) -> Vec<String> {
        self.inner.errors.lock().expect("observer error sink poisoned").clone()
    }

    /// Cancels every registered listener and marks the observer stopped.
    /// Idempotent: calling `stop` more than once, or after construction
    /// failed partway, does nothing further. Outstanding remove callbacks
    /// are discarded, not invoked.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.inner.state.lock().expect("observer state poisoned");
        if *state == State::Stopped {
            return Ok(());
        }
        *state = State::Stopped;
        drop(state);

        let mut tokens = self.inner.tokens.lock().expect("observer token registry poisoned");
        for token in tokens.drain(..) {
            self.inner.store.remove_specification_listener(token)?;
        }
        Ok(())
    }
}

/// For each distinct path an inverse targets, the label subset its
/// notification key is hashed over — all inverses at the same path share
/// the same subset by construction (`crate::inverse::effective_result_subset`).
/// The root path falls back to the specification's own given labels if no
/// inverse touches it (a specification with no matches and no existentials
/// at all).
fn build_path_result_subsets(
    specification: &Specification,
    inverses: &[InverseSpecification],
) -> HashMap<Path, Vec<Label>> {
    let mut map = HashMap::new();
    for inverse in inverses {
        map.entry(inverse.path.clone()).or_insert_with(|| inverse.result_subset.clone());
    }
    map.entry(Vec::new()).or_insert_with(|| {
        specification.given.iter().map(|g| g.label.clone()).collect()
    });
    map
}

fn notification_key(tuple: &Tuple, result_subset: &[Label]) -> String {
    let mut hasher = blake3::Hasher::new();
    let mut labels: Vec<&Label> = result_subset.iter().collect();
    labels.sort();
    for label in labels {
        hasher.update(&(label.len() as u64).to_be_bytes());
        hasher.update(label.as_bytes());
        match tuple.get(label) {
            Some(reference) => {
                hasher.update(&[1u8]);
                hasher.update(&(reference.fact_type.len() as u64).to_be_bytes());
                hasher.update(reference.fact_type.as_bytes());
                hasher.update(&(reference.hash.len() as u64).to_be_bytes());
                hasher.update(reference.hash.as_bytes());
            }
            None => hasher.update(&[0u8]),
        }
    }
    hasher.finalize().to_hex().to_string()
}

impl ObserverInner {
    fn run_initial_load(&self) -> Result<()> {
        let results = crate::runner::run(self.store.as_ref(), &self.given, &self.specification)?;
        for result in &results {
            self.dispatch_add(&[], result);
        }
        Ok(())
    }

    /// Routes one inverse's delta. `Add`/`MaybeAdd` both resolve to the
    /// same dispatch: a tuple already presented is skipped by the
    /// notification-key dedup, which is exactly the recheck `MaybeAdd`
    /// needs. `Remove`/`MaybeRemove` resolve the same way in the other
    /// direction — a tuple never presented has nothing to retract.
    fn handle_listener_delta(&self, inverse: &InverseSpecification, delta: ListenerDelta) {
        for result in &delta.results {
            match inverse.operation {
                Operation::Add | Operation::MaybeAdd => {
                    self.dispatch_add(&inverse.path, result);
                }
                Operation::Remove | Operation::MaybeRemove => {
                    let key = notification_key(&result.tuple, &inverse.result_subset);
                    self.dispatch_remove(&inverse.path, &key);
                }
            }
        }
    }

    fn dispatch_add(&self, path: &[PathStep], result: &QueryResult) {
        let subset = self.path_result_subsets.get(path).cloned().unwrap_or_default();
        let key = notification_key(&result.tuple, &subset);
        self.dispatch_add_at(path, &key, result);
        self.walk_projected(path, &result.projection);
    }

    fn dispatch_add_at(&self, path: &[PathStep], key: &str, result: &QueryResult) {
        let handler_opt = {
            let mut tree = self.tree.lock().expect("observer tree poisoned");
            let node = tree.entry(path.to_vec()).or_default();
            if node.active.contains_key(key) {
                return;
            }
            node.handler.take()
        };

        match handler_opt {
            None => {
                let mut tree = self.tree.lock().expect("observer tree poisoned");
                let node = tree.entry(path.to_vec()).or_default();
                node.buffered.push((key.to_string(), result.clone()));
                node.active.insert(key.to_string(), None);
            }
            Some(mut handler) => {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(result)));
                let remove = match outcome {
                    Ok(remove) => remove,
                    Err(_) => {
                        self.record_error("add callback panicked");
                        None
                    }
                };
                let mut tree = self.tree.lock().expect("observer tree poisoned");
                let node = tree.entry(path.to_vec()).or_default();
                node.active.insert(key.to_string(), remove);
                node.handler = Some(handler);
            }
        }
    }

    fn dispatch_remove(&self, path: &[PathStep], key: &str) {
        let (remove_cb, existed) = {
            let mut tree = self.tree.lock().expect("observer tree poisoned");
            let Some(node) = tree.get_mut(path) else { return };
            node.buffered.retain(|(k, _)| k != key);
            match node.active.remove(key) {
                Some(cb) => (cb, true),
                None => (None, false),
            }
        };
        if !existed {
            return;
        }
        if let Some(mut cb) = remove_cb {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb()));
            if outcome.is_err() {
                self.record_error("remove callback panicked");
            }
        }
    }

    /// Recurses into `value`'s nested collections, dispatching each inner
    /// result as an add at the corresponding deeper path.
    fn walk_projected(&self, path: &[PathStep], value: &ProjectedValue) {
        match value {
            ProjectedValue::Collection(results) => {
                let mut nested = path.to_vec();
                nested.push(PathStep::Collection);
                for r in results {
                    self.dispatch_add(&nested, r);
                }
            }
            ProjectedValue::Composite(entries) => {
                for (name, v) in entries {
                    let mut nested = path.to_vec();
                    nested.push(PathStep::Composite(name.clone()));
                    self.walk_projected(&nested, v);
                }
            }
            ProjectedValue::Reference(_) | ProjectedValue::Scalar(_) | ProjectedValue::Timestamp(_) => {}
        }
    }

    /// Registers `handler` at `path`, replaying any buffered results in the
    /// order they were first presented. A second registration at an
    /// already-handled path is a no-op — one handler per collection.
    fn register_handler(&self, path: &[PathStep], handler: AddHandler) {
        let buffered = {
            let mut tree = self.tree.lock().expect("observer tree poisoned");
            let node = tree.entry(path.to_vec()).or_default();
            if node.handler.is_some() {
                return;
            }
            std::mem::take(&mut node.buffered)
        };

        let mut handler = handler;
        for (key, result) in buffered {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&result)));
            let remove = match outcome {
                Ok(remove) => remove,
                Err(_) => {
                    self.record_error("add callback panicked during buffered replay");
                    None
                }
            };
            let mut tree = self.tree.lock().expect("observer tree poisoned");
            let node = tree.entry(path.to_vec()).or_default();
            node.active.insert(key, remove);
        }

        let mut tree = self.tree.lock().expect("observer tree poisoned");
        let node = tree.entry(path.to_vec()).or_default();
        node.handler = Some(handler);
    }

    fn record_error(&self, message: &str) {
        self.errors
            .lock()
            .expect("observer error sink poisoned")
            .push(CallbackError(message.to_string()).to_string());
    }
}

impl CollectionHandle {
    /// Registers `handler` on this collection, replaying any buffered
    /// results first (spec §4.G.3).
    pub fn on_added(&self, handler: AddHandler) {
        self.inner.register_handler(&self.path, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::{Fact, FactEnvelope, PredecessorValue, Scalar};
    use crate::spec::parse;
    use crate::store::redb_store::RedbFactStore;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    fn make_fact(fact_type: &str, preds: &[(&str, &Reference)], fields: &[(&str, Scalar)]) -> Fact {
        let mut predecessors = BTreeMap::new();
        for (role, r) in preds {
            predecessors.insert(role.to_string(), PredecessorValue::Single((*r).clone()));
        }
        let mut f = BTreeMap::new();
        for (name, v) in fields {
            f.insert(name.to_string(), v.clone());
        }
        Fact::new(fact_type, predecessors, f).unwrap()
    }

    fn store() -> Arc<dyn FactStore> {
        Arc::new(RedbFactStore::open_in_memory().unwrap())
    }

    #[test]
    fn initial_load_dispatches_existing_results_immediately() {
        let store = store();
        let c = make_fact("Company", &[], &[("identifier", Scalar::from("Acme"))]);
        let c_ref = c.reference();
        let o = make_fact("Office", &[("company", &c_ref)], &[("identifier", Scalar::from("Open"))]);
        let o_ref = o.reference();
        store.save(vec![FactEnvelope::new(c), FactEnvelope::new(o)]).unwrap();

        let spec = parse("(company: Company) { o: Office [ o->company = company ] } => o").unwrap();
        let observer = Observer::start(Arc::clone(&store), vec![c_ref], spec).unwrap();

        let seen: Arc<StdMutex<Vec<Reference>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        observer.on_added(Box::new(move |result| {
            if let ProjectedValue::Reference(r) = &result.projection {
                seen_clone.lock().unwrap().push(r.clone());
            }
            None
        }));

        assert_eq!(seen.lock().unwrap().as_slice(), &[o_ref]);
    }

    #[test]
    fn new_fact_triggers_live_add() {
        let store = store();
        let c = make_fact("Company", &[], &[("identifier", Scalar::from("Acme"))]);
        let c_ref = c.reference();
        store.save(vec![FactEnvelope::new(c)]).unwrap();

        let spec = parse("(company: Company) { o: Office [ o->company = company ] } => o").unwrap();
        let observer = Observer::start(Arc::clone(&store), vec![c_ref.clone()], spec).unwrap();

        let seen: Arc<StdMutex<Vec<Reference>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        observer.on_added(Box::new(move |result| {
            if let ProjectedValue::Reference(r) = &result.projection {
                seen_clone.lock().unwrap().push(r.clone());
            }
            None
        }));
        assert!(seen.lock().unwrap().is_empty());

        let o = make_fact("Office", &[("company", &c_ref)], &[("identifier", Scalar::from("Open"))]);
        let o_ref = o.reference();
        store.save(vec![FactEnvelope::new(o)]).unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), &[o_ref]);
    }

    #[test]
    fn negative_existential_transition_removes_result() {
        let store = store();
        let c = make_fact("Company", &[], &[("identifier", Scalar::from("Acme"))]);
        let c_ref = c.reference();
        let o = make_fact("Office", &[("company", &c_ref)], &[("identifier", Scalar::from("Open"))]);
        let o_ref = o.reference();
        store.save(vec![FactEnvelope::new(c), FactEnvelope::new(o)]).unwrap();

        let spec = parse(
            "(company: Company) { o: Office [ o->company = company, !E { cl: Office.Closed [ cl->office = o ] } ] } => o",
        )
        .unwrap();
        let observer = Observer::start(Arc::clone(&store), vec![c_ref], spec).unwrap();

        let removed: Arc<StdMutex<bool>> = Arc::new(StdMutex::new(false));
        let removed_clone = Arc::clone(&removed);
        observer.on_added(Box::new(move |_result| {
            let removed_flag = Arc::clone(&removed_clone);
            Some(Box::new(move || {
                *removed_flag.lock().unwrap() = true;
            }) as RemoveCallback)
        }));
        assert!(!*removed.lock().unwrap());

        let closure = make_fact(
            "Office.Closed",
            &[("office", &o_ref)],
            &[("date", Scalar::from("2024-01-01"))],
        );
        store.save(vec![FactEnvelope::new(closure)]).unwrap();

        assert!(*removed.lock().unwrap());
    }

    #[test]
    fn buffered_adds_replay_in_registration_order() {
        let store = store();
        let c = make_fact("Company", &[], &[("identifier", Scalar::from("Acme"))]);
        let c_ref = c.reference();
        let o1 = make_fact("Office", &[("company", &c_ref)], &[("identifier", Scalar::from("A"))]);
        let o2 = make_fact("Office", &[("company", &c_ref)], &[("identifier", Scalar::from("B"))]);
        store
            .save(vec![FactEnvelope::new(c), FactEnvelope::new(o1), FactEnvelope::new(o2)])
            .unwrap();

        let spec = parse("(company: Company) { o: Office [ o->company = company ] } => o.identifier").unwrap();
        let observer = Observer::start(Arc::clone(&store), vec![c_ref], spec).unwrap();

        // No handler registered yet: both results are buffered.
        let seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        observer.on_added(Box::new(move |result| {
            if let ProjectedValue::Scalar(Scalar::String(s)) = &result.projection {
                seen_clone.lock().unwrap().push(s.clone());
            }
            None
        }));

        let mut identifiers = seen.lock().unwrap().clone();
        identifiers.sort();
        assert_eq!(identifiers, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn stop_is_idempotent_and_suppresses_further_notifications() {
        let store = store();
        let c = make_fact("Company", &[], &[("identifier", Scalar::from("Acme"))]);
        let c_ref = c.reference();
        store.save(vec![FactEnvelope::new(c)]).unwrap();

        let spec = parse("(company: Company) { o: Office [ o->company = company ] } => o").unwrap();
        let observer = Observer::start(Arc::clone(&store), vec![c_ref.clone()], spec).unwrap();

        let seen: Arc<StdMutex<Vec<Reference>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        observer.on_added(Box::new(move |result| {
            if let ProjectedValue::Reference(r) = &result.projection {
                seen_clone.lock().unwrap().push(r.clone());
            }
            None
        }));

        observer.stop().unwrap();
        observer.stop().unwrap();

        let o = make_fact("Office", &[("company", &c_ref)], &[("identifier", Scalar::from("Open"))]);
        store.save(vec![FactEnvelope::new(o)]).unwrap();

        assert!(seen.lock().unwrap().is_empty());
    }
}
