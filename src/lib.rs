//! factgraph — a content-addressed, append-only fact graph database with a
//! declarative specification query language and incremental live
//! subscriptions.
//!
//! A [`Fact`] is an immutable record whose identity is the hash of its own
//! contents plus its named **predecessor** references to other facts —
//! facts form a directed acyclic graph in which edges point backward in
//! time. A [`Specification`] walks that graph from a set of **given**
//! anchor facts, traversing predecessor/successor edges with optional
//! existential conditions, and shapes results via a **projection** that may
//! be a scalar, a field reference, a sub-query, or a composite.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use factgraph::fact::{Fact, PredecessorValue, Scalar};
//! use factgraph::store::{FactStore, redb_store::RedbFactStore};
//! use factgraph::spec::parse;
//! use std::collections::BTreeMap;
//!
//! let store = RedbFactStore::open("company.factgraph").unwrap();
//!
//! let user = Fact::new("User", BTreeMap::new(), {
//!     let mut fields = BTreeMap::new();
//!     fields.insert("publicKey".to_string(), Scalar::from("k"));
//!     fields
//! }).unwrap();
//! let user_ref = user.reference();
//!
//! let mut predecessors = BTreeMap::new();
//! predecessors.insert("creator".to_string(), PredecessorValue::Single(user_ref));
//! let company = Fact::new("Company", predecessors, {
//!     let mut fields = BTreeMap::new();
//!     fields.insert("identifier".to_string(), Scalar::from("Acme"));
//!     fields
//! }).unwrap();
//! let company_ref = company.reference();
//!
//! store.save(vec![
//!     factgraph::fact::FactEnvelope::new(user),
//!     factgraph::fact::FactEnvelope::new(company),
//! ]).unwrap();
//!
//! let spec = parse("(company: Company) { } => company.identifier").unwrap();
//! let results = store.read(&[company_ref], &spec).unwrap();
//! assert_eq!(results.len(), 1);
//! ```
//!
//! # Live subscriptions
//!
//! [`Observer::start`](observer::Observer::start) registers the
//! specification's inverse listeners (`inverse::invert`) before running the
//! initial read, so a fact saved concurrently with construction is never
//! missed and never double-delivered. From then on, every nested collection
//! in the projection tree exposes a [`CollectionHandle`](observer::CollectionHandle)
//! on which callers register `onAdded` handlers — including after the fact,
//! via buffered replay (spec §4.G.3).

pub mod error;
pub mod fact;
pub mod inverse;
pub mod observer;
pub mod purge;
pub mod runner;
pub mod spec;
pub mod store;

pub use error::{BuildError, CallbackError, FactGraphError, Result, RuntimeDataError};
pub use fact::{Fact, FactEnvelope, NotANumber, PredecessorValue, Reference, Scalar};
pub use inverse::{invert, InverseSpecification, Operation, Path, PathStep};
pub use observer::{AddHandler, CollectionHandle, Observer, RemoveCallback};
pub use purge::{
    check_compliance, eligible_for_purge, purge_inverse_specification, PurgeCondition,
    PurgeTrigger,
};
pub use spec::{
    describe, parse, validate, Condition, ExistentialCondition, Label, LabeledGiven, Match,
    PathCondition, Projection, Schema, Specification, TypeName,
};
pub use store::{
    FactStore, ListenerDelta, ListenerHandler, ListenerToken, ProjectedValue, PurgeCount,
    QueryResult, Tuple,
};

#[cfg(feature = "redb-store")]
pub use store::redb_store::RedbFactStore;

#[cfg(test)]
mod tests {
    //! End-to-end scenarios from spec §8, exercised against the shipped
    //! `redb` backend — each one mirrors a literal example from the design
    //! document rather than a synthetic unit test.

    use super::*;
    use crate::store::redb_store::RedbFactStore;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    fn fact(fact_type: &str, preds: &[(&str, &Reference)], fields: &[(&str, Scalar)]) -> Fact {
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

    /// Scenario 1/2 (spec §8): a positive/negative existential over
    /// `Office.Closed` selects exactly the offices with (or without) a
    /// matching closure record.
    #[test]
    fn office_closed_existential_scenarios() {
        let store = RedbFactStore::open_in_memory().unwrap();
        let u = fact("User", &[], &[("publicKey", Scalar::from("k"))]);
        let u_ref = u.reference();
        let c = fact("Company", &[("creator", &u_ref)], &[("identifier", Scalar::from("TestCo"))]);
        let c_ref = c.reference();
        let o1 = fact("Office", &[("company", &c_ref)], &[("identifier", Scalar::from("Open"))]);
        let o2 = fact("Office", &[("company", &c_ref)], &[("identifier", Scalar::from("Closed"))]);
        let o1_ref = o1.reference();
        let o2_ref = o2.reference();
        let closed = fact("Office.Closed", &[("office", &o2_ref)], &[("date", Scalar::from("2023-06-01"))]);

        store
            .save(vec![
                FactEnvelope::new(u),
                FactEnvelope::new(c),
                FactEnvelope::new(o1),
                FactEnvelope::new(o2),
                FactEnvelope::new(closed),
            ])
            .unwrap();

        let positive =
            parse("(office: Office [E { cl: Office.Closed [ cl->office = office ] }]) => office").unwrap();
        assert_eq!(store.read(&[o2_ref.clone()], &positive).unwrap().len(), 1);
        assert!(store.read(&[o1_ref.clone()], &positive).unwrap().is_empty());

        let negative =
            parse("(office: Office [!E { cl: Office.Closed [ cl->office = office ] }]) => office").unwrap();
        assert_eq!(store.read(&[o1_ref], &negative).unwrap().len(), 1);
        assert!(store.read(&[o2_ref], &negative).unwrap().is_empty());
    }

    /// Scenario 3 (spec §8): a nested `managers` collection delivers adds
    /// as `Manager` facts are saved after the observer has already started.
    #[test]
    fn nested_collection_add_after_subscribe() {
        let store: Arc<dyn FactStore> = Arc::new(RedbFactStore::open_in_memory().unwrap());
        let c = fact("Company", &[], &[("identifier", Scalar::from("Acme"))]);
        let c_ref = c.reference();
        let o1 = fact("Office", &[("company", &c_ref)], &[("identifier", Scalar::from("Open"))]);
        let o1_ref = o1.reference();
        store.save(vec![FactEnvelope::new(c), FactEnvelope::new(o1)]).unwrap();

        let spec = parse(
            "(company: Company) { o: Office [ o->company = company ] } => { identifier = o.identifier, managers = (m: Manager [ m->office = o ]) { } => m.employeeNumber }",
        )
        .unwrap();
        let observer = Observer::start(Arc::clone(&store), vec![c_ref], spec).unwrap();

        let identifiers_seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let identifiers_seen_clone = Arc::clone(&identifiers_seen);
        observer.on_added(Box::new(move |result| {
            if let ProjectedValue::Composite(entries) = &result.projection {
                if let Some((_, ProjectedValue::Scalar(Scalar::String(s)))) =
                    entries.iter().find(|(name, _)| name == "identifier")
                {
                    identifiers_seen_clone.lock().unwrap().push(s.clone());
                }
            }
            None
        }));
        assert_eq!(identifiers_seen.lock().unwrap().as_slice(), &["Open".to_string()]);

        // The `managers` sub-collection lives at `[Composite("managers"), Collection]`
        // in the projection tree the inverter derived paths against.
        let managers = observer.collection(vec![
            PathStep::Composite("managers".to_string()),
            PathStep::Collection,
        ]);
        let managers_seen: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
        let managers_seen_clone = Arc::clone(&managers_seen);
        managers.on_added(Box::new(move |m| {
            if let ProjectedValue::Scalar(Scalar::Number(n)) = &m.projection {
                managers_seen_clone.lock().unwrap().push(*n);
            }
            None
        }));

        assert!(managers_seen.lock().unwrap().is_empty());

        let manager_101 = fact(
            "Manager",
            &[("office", &o1_ref)],
            &[("employeeNumber", Scalar::from(101.0))],
        );
        store.save(vec![FactEnvelope::new(manager_101)]).unwrap();
        assert_eq!(managers_seen.lock().unwrap().as_slice(), &[101.0]);

        let manager_102 = fact(
            "Manager",
            &[("office", &o1_ref)],
            &[("employeeNumber", Scalar::from(102.0))],
        );
        store.save(vec![FactEnvelope::new(manager_102)]).unwrap();
        assert_eq!(managers_seen.lock().unwrap().as_slice(), &[101.0, 102.0]);

        observer.stop().unwrap();
    }

    /// Scenario 4 (spec §8): once an `Office.Closed` fact names a
    /// previously-presented office, its remove callback fires exactly once.
    #[test]
    fn negative_existential_transition_fires_remove_once() {
        let store: Arc<dyn FactStore> = Arc::new(RedbFactStore::open_in_memory().unwrap());
        let c = fact("Company", &[], &[("identifier", Scalar::from("Acme"))]);
        let c_ref = c.reference();
        let o1 = fact("Office", &[("company", &c_ref)], &[("identifier", Scalar::from("Open"))]);
        let o1_ref = o1.reference();
        store.save(vec![FactEnvelope::new(c), FactEnvelope::new(o1)]).unwrap();

        let spec = parse(
            "(company: Company) { office: Office [ office->company = company, !E { cl: Office.Closed [ cl->office = office ] } ] } => office",
        )
        .unwrap();
        let observer = Observer::start(Arc::clone(&store), vec![c_ref], spec).unwrap();

        let remove_count = Arc::new(Mutex::new(0u32));
        let remove_count_for_add = Arc::clone(&remove_count);
        observer.on_added(Box::new(move |_result| {
            let count = Arc::clone(&remove_count_for_add);
            Some(Box::new(move || {
                *count.lock().unwrap() += 1;
            }) as RemoveCallback)
        }));

        let closed = fact("Office.Closed", &[("office", &o1_ref)], &[("date", Scalar::from("2024-02-01"))]);
        store.save(vec![FactEnvelope::new(closed)]).unwrap();

        assert_eq!(*remove_count.lock().unwrap(), 1);
        observer.stop().unwrap();
    }

    /// Scenario 5 (spec §8): a spec that omits an exact-shaped purge
    /// condition on a purge-conditioned type fails compliance with a
    /// diagnostic naming the type.
    #[test]
    fn purge_compliance_flags_missing_condition() {
        struct NoSchema;
        impl Schema for NoSchema {
            fn role_target(&self, _fact_type: &str, _role: &str) -> Option<String> {
                None
            }
        }

        let deleted_condition = ExistentialCondition {
            exists: false,
            matches: vec![Match::new("d", "X.Deleted").with_conditions(vec![Condition::Path(
                PathCondition::new("d", vec!["x".to_string()], "x", vec![]),
            )])],
        };
        let pc = PurgeCondition::new("X", "x", deleted_condition);

        let non_compliant = parse("(x: X) { y: X [ y = x ] } => y").unwrap();
        let err = check_compliance(&non_compliant, &[pc.clone()], &NoSchema).unwrap_err();
        assert!(matches!(err, BuildError::PurgeComplianceFailure(diagnostics) if diagnostics.iter().any(|d| d.contains('X'))));

        let compliant = parse("(x: X) { y: X [ y = x, !E { d: X.Deleted [ d->x = y ] } ] } => y").unwrap();
        assert!(check_compliance(&compliant, &[pc], &NoSchema).is_ok());
    }

    /// Scenario 6 (spec §8): every literal specification from this test
    /// module round-trips through `describe`/`parse`.
    #[test]
    fn round_trip_every_literal_scenario_spec() {
        let sources = [
            "(office: Office [E { cl: Office.Closed [ cl->office = office ] }]) => office",
            "(office: Office [!E { cl: Office.Closed [ cl->office = office ] }]) => office",
            "(company: Company) { o: Office [ o->company = company ] } => { identifier = o.identifier, managers = (m: Manager [ m->office = o ]) { } => m.employeeNumber }",
            "(company: Company) { office: Office [ office->company = company, !E { cl: Office.Closed [ cl->office = office ] } ] } => office",
            "(x: X) { y: X [ y = x, !E { d: X.Deleted [ d->x = y ] } ] } => y",
        ];
        for src in sources {
            let spec = parse(src).unwrap();
            let described = describe(&spec);
            let reparsed = parse(&described).unwrap();
            assert_eq!(spec, reparsed, "round-trip mismatch for {src}");
        }
    }

    /// Testable property (spec §8): saving the same fact twice is
    /// idempotent — the second `save` reports no newly persisted envelopes.
    #[test]
    fn save_is_idempotent() {
        let store = RedbFactStore::open_in_memory().unwrap();
        let c = fact("Company", &[], &[("identifier", Scalar::from("Acme"))]);
        assert_eq!(store.save(vec![FactEnvelope::new(c.clone())]).unwrap().len(), 1);
        assert!(store.save(vec![FactEnvelope::new(c)]).unwrap().is_empty());
    }

    /// Boundary behavior (spec §8): a given reference to an absent fact
    /// yields empty results, never an error.
    #[test]
    fn given_reference_to_absent_fact_yields_empty_results() {
        let store = RedbFactStore::open_in_memory().unwrap();
        let spec = parse("(office: Office) { } => office").unwrap();
        let absent = Reference::new("Office", "doesnotexist");
        assert!(store.read(&[absent], &spec).unwrap().is_empty());
    }
}
