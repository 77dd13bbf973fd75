//! `redb`-backed [`FactStore`] implementation — the one concrete backend
//! this crate ships, in the teacher's own storage idiom (`redb::Database`,
//! string-keyed tables, JSON-serialized rows, prefix scans via `iter()`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::error::{FactGraphError, Result};
use crate::fact::{Fact, FactEnvelope, PredecessorValue, Reference};
use crate::purge::{PurgeCondition, PurgeTrigger};
use crate::spec::Specification;
use crate::store::{FactStore, ListenerHandler, ListenerToken, PurgeCount, QueryResult};

fn storage_err(e: impl std::fmt::Display) -> FactGraphError {
    FactGraphError::Storage(e.to_string())
}

/// `"{type}\0{hash}"` — never contains a literal NUL since fact types and
/// hashes are never user-supplied free text that could embed one (types
/// come from schema identifiers, hashes are hex digests).
fn fact_key(reference: &Reference) -> String {
    format!("{}\0{}", reference.fact_type, reference.hash)
}

/// `"{type}\0{hash}\0{role}"` — the successors table's key, indexed by the
/// *predecessor* fact and the role under which a successor names it.
fn successor_key(predecessor: &Reference, role: &str) -> String {
    format!("{}\0{}\0{}", predecessor.fact_type, predecessor.hash, role)
}

/// Every persisted fact, `"{type}\0{hash}" -> Fact` JSON. The source of
/// truth for `by_type`, `which_exist`, and role/predecessor lookups.
const FACTS: TableDefinition<&str, &str> = TableDefinition::new("facts");

/// Every persisted fact's full envelope (fact plus opaque signatures),
/// `"{type}\0{hash}" -> FactEnvelope` JSON. Kept separate from `FACTS` so
/// that the hot scan paths (`by_type`, predecessor walks) never need to
/// deserialize signature bytes they don't use.
const ENVELOPES: TableDefinition<&str, &str> = TableDefinition::new("envelopes");

/// `"{type}\0{hash}" -> RFC 3339 timestamp` — the known-at time assigned
/// to a fact the moment its `save` batch committed.
const KNOWN_AT: TableDefinition<&str, &str> = TableDefinition::new("known_at");

/// `"{type}\0{hash}\0{role}" -> JSON Vec<Reference>` — the successor
/// index: which facts name this one as a predecessor under this role, in
/// the order they were first saved. Maintained incrementally by `save`.
const SUCCESSORS: TableDefinition<&str, &str> = TableDefinition::new("successors");

struct Listener {
    specification: Specification,
    handler: ListenerHandler,
}

/// `redb`-backed [`FactStore`]. An embedded, serverless, ACID-backed fact
/// store — the one concrete backend this crate ships.
pub struct RedbFactStore {
    db: Database,
    listeners: RwLock<HashMap<u64, Listener>>,
    next_token: AtomicU64,
    purge_conditions: RwLock<Vec<PurgeCondition>>,
}

impl RedbFactStore {
    /// Open or create a fact store at `path`. The file is created if it
    /// does not exist.
    pub fn open(path: &str) -> Result<Self> {
        let db = Database::create(path).map_err(storage_err)?;
        Self::init(db)
    }

    /// Create an in-memory fact store (no file I/O). Data is lost when the
    /// instance is dropped — useful for tests and ephemeral workloads.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(storage_err)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        {
            let write_txn = db.begin_write().map_err(storage_err)?;
            write_txn.open_table(FACTS).map_err(storage_err)?;
            write_txn.open_table(ENVELOPES).map_err(storage_err)?;
            write_txn.open_table(KNOWN_AT).map_err(storage_err)?;
            write_txn.open_table(SUCCESSORS).map_err(storage_err)?;
            write_txn.commit().map_err(storage_err)?;
        }
        Ok(Self {
            db,
            listeners: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            purge_conditions: RwLock::new(Vec::new()),
        })
    }

    fn fact_exists(&self, reference: &Reference) -> Result<bool> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(FACTS).map_err(storage_err)?;
        Ok(table.get(fact_key(reference).as_str()).map_err(storage_err)?.is_some())
    }

    /// Appends `successor` to the successor list recorded for
    /// `(predecessor, role)`, inside an already-open write transaction.
    fn append_successor(
        write_txn: &redb::WriteTransaction,
        predecessor: &Reference,
        role: &str,
        successor: &Reference,
    ) -> Result<()> {
        let key = successor_key(predecessor, role);
        let mut table = write_txn.open_table(SUCCESSORS).map_err(storage_err)?;
        let mut current: Vec<Reference> = match table.get(key.as_str()).map_err(storage_err)? {
            Some(existing) => serde_json::from_str(existing.value()).map_err(storage_err)?,
            None => Vec::new(),
        };
        current.push(successor.clone());
        let encoded = serde_json::to_string(&current).map_err(storage_err)?;
        table.insert(key.as_str(), encoded.as_str()).map_err(storage_err)?;
        Ok(())
    }

    /// All successors of `root`'s fact, across every role and predecessor
    /// position, except those already listed in `exclude` — the BFS
    /// frontier expansion step used by `purge_descendants`.
    fn direct_successors_excluding(
        &self,
        reference: &Reference,
        exclude: &[Reference],
    ) -> Result<Vec<Reference>> {
        let prefix = format!("{}\0{}\0", reference.fact_type, reference.hash);
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(SUCCESSORS).map_err(storage_err)?;
        let mut found = Vec::new();
        for entry in table.iter().map_err(storage_err)? {
            let (k, v) = entry.map_err(storage_err)?;
            if !k.value().starts_with(&prefix) {
                continue;
            }
            let refs: Vec<Reference> = serde_json::from_str(v.value()).map_err(storage_err)?;
            for r in refs {
                if !exclude.contains(&r) && !found.contains(&r) {
                    found.push(r);
                }
            }
        }
        Ok(found)
    }
}

impl FactStore for RedbFactStore {
    fn save(&self, envelopes: Vec<FactEnvelope>) -> Result<Vec<FactEnvelope>> {
        let mut newly_saved = Vec::new();
        let now = Utc::now().to_rfc3339();

        {
            let write_txn = self.db.begin_write().map_err(storage_err)?;
            {
                let mut facts = write_txn.open_table(FACTS).map_err(storage_err)?;
                let mut envs = write_txn.open_table(ENVELOPES).map_err(storage_err)?;
                let mut known_at = write_txn.open_table(KNOWN_AT).map_err(storage_err)?;

                for envelope in &envelopes {
                    let reference = envelope.reference();
                    let key = fact_key(&reference);
                    if facts.get(key.as_str()).map_err(storage_err)?.is_some() {
                        continue;
                    }

                    let fact_json = serde_json::to_string(&envelope.fact).map_err(storage_err)?;
                    let envelope_json = serde_json::to_string(envelope).map_err(storage_err)?;
                    facts.insert(key.as_str(), fact_json.as_str()).map_err(storage_err)?;
                    envs.insert(key.as_str(), envelope_json.as_str()).map_err(storage_err)?;
                    known_at.insert(key.as_str(), now.as_str()).map_err(storage_err)?;
                    newly_saved.push(envelope.clone());
                }
            }

            for envelope in &newly_saved {
                let successor_ref = envelope.reference();
                for (role, value) in &envelope.fact.predecessors {
                    for predecessor in value.references() {
                        Self::append_successor(&write_txn, predecessor, role, &successor_ref)?;
                    }
                }
            }

            write_txn.commit().map_err(storage_err)?;
        }

        // Listener dispatch happens after commit, so a handler that reads
        // back through `self` always observes its own trigger fact.
        self.notify_listeners(&newly_saved)?;
        self.apply_purge_triggers(&newly_saved)?;

        Ok(newly_saved)
    }

    fn which_exist(&self, references: &[Reference]) -> Result<Vec<Reference>> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(FACTS).map_err(storage_err)?;
        let mut present = Vec::with_capacity(references.len());
        for reference in references {
            if table.get(fact_key(reference).as_str()).map_err(storage_err)?.is_some() {
                present.push(reference.clone());
            }
        }
        Ok(present)
    }

    fn load(&self, references: &[Reference]) -> Result<Vec<FactEnvelope>> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(ENVELOPES).map_err(storage_err)?;
        let mut loaded = Vec::new();
        for reference in references {
            if let Some(guard) = table.get(fact_key(reference).as_str()).map_err(storage_err)? {
                let envelope: FactEnvelope = serde_json::from_str(guard.value()).map_err(storage_err)?;
                loaded.push(envelope);
            }
        }
        Ok(loaded)
    }

    fn read(&self, given: &[Reference], specification: &Specification) -> Result<Vec<QueryResult>> {
        crate::runner::run(self, given, specification)
    }

    fn successors(&self, reference: &Reference, role: &str) -> Result<Vec<Reference>> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(SUCCESSORS).map_err(storage_err)?;
        match table
            .get(successor_key(reference, role).as_str())
            .map_err(storage_err)?
        {
            Some(guard) => serde_json::from_str(guard.value()).map_err(storage_err),
            None => Ok(Vec::new()),
        }
    }

    fn by_type(&self, fact_type: &str) -> Result<Vec<Reference>> {
        let prefix = format!("{fact_type}\0");
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(FACTS).map_err(storage_err)?;
        let mut refs = Vec::new();
        for entry in table.iter().map_err(storage_err)? {
            let (k, v) = entry.map_err(storage_err)?;
            if k.value().starts_with(&prefix) {
                let fact: Fact = serde_json::from_str(v.value()).map_err(storage_err)?;
                refs.push(fact.reference());
            }
        }
        Ok(refs)
    }

    fn known_at(&self, reference: &Reference) -> Result<Option<DateTime<Utc>>> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(KNOWN_AT).map_err(storage_err)?;
        match table.get(fact_key(reference).as_str()).map_err(storage_err)? {
            Some(guard) => {
                let parsed = DateTime::parse_from_rfc3339(guard.value()).map_err(storage_err)?;
                Ok(Some(parsed.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    fn purge(&self, purge_conditions: &[PurgeCondition]) -> Result<PurgeCount> {
        let mut roots = Vec::new();
        for pc in purge_conditions {
            roots.extend(crate::purge::eligible_for_purge(self, pc)?);
        }
        let mut removed = 0;
        for root in roots {
            removed += self.purge_descendants(&root, &[])?;
            removed += self.delete_fact(&root)?;
        }
        Ok(removed)
    }

    fn purge_descendants(&self, root: &Reference, triggers: &[Reference]) -> Result<PurgeCount> {
        let mut frontier = self.direct_successors_excluding(root, triggers)?;
        let mut visited: Vec<Reference> = Vec::new();
        let mut removed = 0;

        while let Some(candidate) = frontier.pop() {
            if visited.contains(&candidate) {
                continue;
            }
            visited.push(candidate.clone());
            removed += self.delete_fact(&candidate)?;
            for next in self.direct_successors_excluding(&candidate, triggers)? {
                if !visited.contains(&next) {
                    frontier.push(next);
                }
            }
        }

        Ok(removed)
    }

    fn add_specification_listener(
        &self,
        specification: Specification,
        handler: ListenerHandler,
    ) -> Result<ListenerToken> {
        let id = self.next_token.fetch_add(1, Ordering::SeqCst);
        let mut listeners = self.listeners.write().map_err(|_| storage_err("listener registry poisoned"))?;
        listeners.insert(id, Listener { specification, handler });
        Ok(ListenerToken(id))
    }

    fn remove_specification_listener(&self, token: ListenerToken) -> Result<()> {
        let mut listeners = self.listeners.write().map_err(|_| storage_err("listener registry poisoned"))?;
        listeners.remove(&token.0);
        Ok(())
    }

    fn register_purge_condition(&self, pc: PurgeCondition) -> Result<()> {
        let mut purge_conditions = self
            .purge_conditions
            .write()
            .map_err(|_| storage_err("purge condition registry poisoned"))?;
        purge_conditions.push(pc);
        Ok(())
    }
}

impl RedbFactStore {
    /// Deletes one fact's row from every table. Does not touch its
    /// successors; callers walk those first (`purge`, `purge_descendants`).
    fn delete_fact(&self, reference: &Reference) -> Result<PurgeCount> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        let existed = {
            let mut facts = write_txn.open_table(FACTS).map_err(storage_err)?;
            let mut envs = write_txn.open_table(ENVELOPES).map_err(storage_err)?;
            let mut known_at = write_txn.open_table(KNOWN_AT).map_err(storage_err)?;
            let key = fact_key(reference);
            let existed = facts.remove(key.as_str()).map_err(storage_err)?.is_some();
            envs.remove(key.as_str()).map_err(storage_err)?;
            known_at.remove(key.as_str()).map_err(storage_err)?;
            existed
        };
        write_txn.commit().map_err(storage_err)?;
        Ok(if existed { 1 } else { 0 })
    }

    /// Fires every registered listener whose specification has exactly one
    /// given, of `newly_saved`'s type, by running it with each newly saved
    /// fact bound as that given (spec §4.D, §4.G.4). Handlers are cloned
    /// out of the registry before being invoked so a handler that itself
    /// registers a new listener (spec §4.G.5) does not deadlock against
    /// the registry lock.
    fn notify_listeners(&self, newly_saved: &[FactEnvelope]) -> Result<()> {
        if newly_saved.is_empty() {
            return Ok(());
        }

        let snapshot: Vec<(Specification, ListenerHandler)> = {
            let listeners = self
                .listeners
                .read()
                .map_err(|_| storage_err("listener registry poisoned"))?;
            listeners
                .values()
                .map(|l| (l.specification.clone(), l.handler.clone()))
                .collect()
        };

        for envelope in newly_saved {
            let reference = envelope.reference();
            for (specification, handler) in &snapshot {
                if specification.given.len() != 1 {
                    continue;
                }
                if specification.given[0].fact_type != reference.fact_type {
                    continue;
                }
                let results = crate::runner::run(self, &[reference.clone()], specification)?;
                if results.is_empty() {
                    continue;
                }
                let mut given = crate::store::Tuple::new();
                given.insert(specification.given[0].label.clone(), reference.clone());
                handler(crate::store::ListenerDelta { results, given });
            }
        }

        Ok(())
    }

    /// Runs every registered purge condition's inverse over `newly_saved`
    /// and deletes each discovered root's descendants except the
    /// triggering witness (spec §6 "Purge interface", part b). A witness
    /// fact that matches more than one purge condition (unusual, but not
    /// forbidden) triggers each in turn.
    fn apply_purge_triggers(&self, newly_saved: &[FactEnvelope]) -> Result<()> {
        if newly_saved.is_empty() {
            return Ok(());
        }

        let purge_conditions: Vec<PurgeCondition> = {
            let guard = self
                .purge_conditions
                .read()
                .map_err(|_| storage_err("purge condition registry poisoned"))?;
            guard.clone()
        };
        if purge_conditions.is_empty() {
            return Ok(());
        }

        for pc in &purge_conditions {
            let inverse_spec = crate::purge::purge_inverse_specification(pc);
            let witness_type = &inverse_spec.given[0].fact_type;

            for envelope in newly_saved {
                let witness_ref = envelope.reference();
                if &witness_ref.fact_type != witness_type {
                    continue;
                }

                let results = crate::runner::run(self, &[witness_ref.clone()], &inverse_spec)?;
                for result in results {
                    let crate::store::ProjectedValue::Reference(root) = result.projection else {
                        continue;
                    };
                    let trigger = PurgeTrigger::new(root, vec![witness_ref.clone()]);
                    self.purge_descendants(&trigger.purge_root, &trigger.triggers)?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::{Fact, PredecessorValue, Scalar};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    fn company(name: &str) -> FactEnvelope {
        let mut fields = BTreeMap::new();
        fields.insert("identifier".to_string(), Scalar::from(name));
        FactEnvelope::new(Fact::new("Company", BTreeMap::new(), fields).unwrap())
    }

    fn user(company_ref: &Reference, name: &str) -> FactEnvelope {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), Scalar::from(name));
        let mut preds = BTreeMap::new();
        preds.insert("company".to_string(), PredecessorValue::Single(company_ref.clone()));
        FactEnvelope::new(Fact::new("User", preds, fields).unwrap())
    }

    #[test]
    fn save_is_idempotent_and_reports_only_new_facts() {
        let store = RedbFactStore::open_in_memory().unwrap();
        let c = company("Acme");

        let first = store.save(vec![c.clone()]).unwrap();
        assert_eq!(first.len(), 1);

        let second = store.save(vec![c.clone()]).unwrap();
        assert!(second.is_empty());

        assert_eq!(store.which_exist(&[c.reference()]).unwrap().len(), 1);
    }

    #[test]
    fn successors_index_is_populated_on_save() {
        let store = RedbFactStore::open_in_memory().unwrap();
        let c = company("Acme");
        store.save(vec![c.clone()]).unwrap();

        let u = user(&c.reference(), "alice");
        store.save(vec![u.clone()]).unwrap();

        let found = store.successors(&c.reference(), "company").unwrap();
        assert_eq!(found, vec![u.reference()]);
    }

    #[test]
    fn known_at_is_assigned_on_first_save_only() {
        let store = RedbFactStore::open_in_memory().unwrap();
        let c = company("Acme");
        store.save(vec![c.clone()]).unwrap();
        let first_time = store.known_at(&c.reference()).unwrap().unwrap();

        store.save(vec![c.clone()]).unwrap();
        let second_time = store.known_at(&c.reference()).unwrap().unwrap();
        assert_eq!(first_time, second_time);
    }

    #[test]
    fn listener_fires_for_matching_given_type_only() {
        let store = RedbFactStore::open_in_memory().unwrap();
        let c = company("Acme");
        store.save(vec![c.clone()]).unwrap();

        let spec = crate::spec::parse("(u: User) => u").unwrap();
        let seen: Arc<Mutex<Vec<Reference>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        store
            .add_specification_listener(
                spec,
                std::sync::Arc::new(move |delta: crate::store::ListenerDelta| {
                    seen_clone.lock().unwrap().extend(delta.given.values().cloned());
                }),
            )
            .unwrap();

        // Unrelated type: no notification.
        store.save(vec![company("Other")]).unwrap();
        assert!(seen.lock().unwrap().is_empty());

        let u = user(&c.reference(), "alice");
        store.save(vec![u.clone()]).unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[u.reference()]);
    }

    #[test]
    fn registered_purge_condition_triggers_on_save() {
        use crate::spec::ast::{Condition, ExistentialCondition, Match, PathCondition};

        let store = RedbFactStore::open_in_memory().unwrap();
        let c = company("Acme");
        store.save(vec![c.clone()]).unwrap();
        let u = user(&c.reference(), "alice");
        store.save(vec![u.clone()]).unwrap();

        // A descendant of `u` unrelated to the deletion witness itself —
        // this is what the trigger routine must remove.
        let mut session_preds = BTreeMap::new();
        session_preds.insert("user".to_string(), PredecessorValue::Single(u.reference()));
        let session = FactEnvelope::new(Fact::new("Session", session_preds, BTreeMap::new()).unwrap());
        store.save(vec![session.clone()]).unwrap();

        let deleted_condition = ExistentialCondition {
            exists: false,
            matches: vec![Match::new("d", "User.Deleted").with_conditions(vec![
                Condition::Path(PathCondition::new("d", vec!["u".to_string()], "u", vec![])),
            ])],
        };
        store
            .register_purge_condition(PurgeCondition::new("User", "u", deleted_condition))
            .unwrap();

        let mut preds = BTreeMap::new();
        preds.insert("u".to_string(), PredecessorValue::Single(u.reference()));
        let deleted = FactEnvelope::new(Fact::new("User.Deleted", preds, BTreeMap::new()).unwrap());
        let deleted_ref = deleted.reference();

        store.save(vec![deleted]).unwrap();

        // The session, a descendant of `u` other than the witness, is gone.
        assert!(store.which_exist(&[session.reference()]).unwrap().is_empty());
        // The witness and the purge root itself are not descendants-minus-
        // triggers, so both survive the trigger routine.
        assert_eq!(store.which_exist(&[deleted_ref]).unwrap().len(), 1);
        assert_eq!(store.which_exist(&[u.reference()]).unwrap().len(), 1);
    }

    #[test]
    fn purge_descendants_removes_transitive_successors() {
        let store = RedbFactStore::open_in_memory().unwrap();
        let c = company("Acme");
        store.save(vec![c.clone()]).unwrap();
        let u = user(&c.reference(), "alice");
        store.save(vec![u.clone()]).unwrap();

        let removed = store.purge_descendants(&c.reference(), &[]).unwrap();
        assert_eq!(removed, 1);
        assert!(store.which_exist(&[u.reference()]).unwrap().is_empty());
    }

    #[test]
    fn on_disk_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facts.redb");
        let path_str = path.to_str().unwrap();

        let c = company("Acme");
        {
            let store = RedbFactStore::open(path_str).unwrap();
            store.save(vec![c.clone()]).unwrap();
        }

        let store = RedbFactStore::open(path_str).unwrap();
        assert_eq!(store.which_exist(&[c.reference()]).unwrap().len(), 1);
        assert!(store.known_at(&c.reference()).unwrap().is_some());
    }
}
