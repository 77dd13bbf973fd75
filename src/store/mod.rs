//! The storage contract (spec §4.D): the abstract boundary between the
//! query runner / inverter / observer and a concrete persistence backend.
//!
//! The core never depends on a concrete backend — `FactStore` is the sole
//! seam. [`redb_store::RedbFactStore`] is the one backend this crate
//! ships, as a reference implementation and test harness.

#[cfg(feature = "redb-store")]
pub mod redb_store;

use std::collections::BTreeMap;

use crate::error::Result;
use crate::fact::{FactEnvelope, Reference};
use crate::spec::{Label, Specification};

/// A binding from specification label to fact reference, built up during
/// query evaluation (spec §3 "Tuple").
pub type Tuple = BTreeMap<Label, Reference>;

/// One surviving tuple and its evaluated projection (spec §4.E).
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub tuple: Tuple,
    pub projection: ProjectedValue,
}

/// The evaluated shape of a projection for one tuple (spec §3, §9 "Dynamic
/// projection shapes" — a tagged variant over scalar/reference/timestamp/
/// sub-collection/composite).
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectedValue {
    Reference(Reference),
    Scalar(crate::fact::Scalar),
    Timestamp(chrono::DateTime<chrono::Utc>),
    Collection(Vec<QueryResult>),
    Composite(Vec<(String, ProjectedValue)>),
}

/// Opaque token returned by [`FactStore::add_specification_listener`],
/// passed back to [`FactStore::remove_specification_listener`] to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerToken(pub u64);

/// Delivered to a specification listener when a `save` batch causes it to
/// observe change (spec §4.D): the new result tuples and the given tuples
/// they were discovered relative to.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerDelta {
    pub results: Vec<QueryResult>,
    pub given: Tuple,
}

/// A registered listener callback. `Arc` rather than `Box` so a store can
/// hand out a cloned handle and invoke it without holding its listener
/// registry locked — the observer (`crate::observer`) may itself call
/// `add_specification_listener` from inside a dispatched callback (spec
/// §4.G.5, late-given re-read), which would deadlock against a lock held
/// across the callback invocation.
pub type ListenerHandler = std::sync::Arc<dyn Fn(ListenerDelta) + Send + Sync>;

/// The count of facts actually removed by a purge operation.
pub type PurgeCount = u64;

/// Abstract fact store (spec §4.D). Implementations own durability,
/// indexing, and notification dispatch; the runner, inverter, and observer
/// only ever see this trait. `Send + Sync` so a store can be shared behind
/// an `Arc` across the observer's listener closures.
pub trait FactStore: Send + Sync {
    /// Persist `envelopes`, idempotent by `(type, hash)`. Returns the
    /// strict subset newly persisted, in input order. Assigns a
    /// monotonically non-decreasing known-at timestamp per batch.
    fn save(&self, envelopes: Vec<FactEnvelope>) -> Result<Vec<FactEnvelope>>;

    /// The subset of `references` already present in storage.
    fn which_exist(&self, references: &[Reference]) -> Result<Vec<Reference>>;

    /// Load envelopes for `references`; references not present are
    /// silently dropped from the result (never an error).
    fn load(&self, references: &[Reference]) -> Result<Vec<FactEnvelope>>;

    /// Execute `specification` against this store with `given` references
    /// bound in declared order, returning ordered projected results.
    fn read(&self, given: &[Reference], specification: &Specification) -> Result<Vec<QueryResult>>;

    /// Predecessor-indexed successors of `reference` along `role`, in
    /// storage enumeration order.
    fn successors(&self, reference: &Reference, role: &str) -> Result<Vec<Reference>>;

    /// Every reference of `fact_type` currently in storage, in storage
    /// enumeration order. Used by the runner only as a fallback for
    /// matches whose unknown is not anchored to any bound label by a
    /// path condition — not part of spec §4.D's named operations, but
    /// required to make that fallback concrete rather than unbounded.
    fn by_type(&self, fact_type: &str) -> Result<Vec<Reference>>;

    /// The known-at timestamp assigned when `reference` was first saved,
    /// if present.
    fn known_at(&self, reference: &Reference) -> Result<Option<chrono::DateTime<chrono::Utc>>>;

    /// Delete every fact satisfying one of `purge_conditions`'s deletion
    /// existentials, returning the count removed (spec §6 "Purge
    /// interface", part a's runtime counterpart).
    fn purge(&self, purge_conditions: &[crate::purge::PurgeCondition]) -> Result<PurgeCount>;

    /// Delete all descendants of `root` except those in `triggers`
    /// (spec §6 "Purge interface", part b).
    fn purge_descendants(&self, root: &Reference, triggers: &[Reference]) -> Result<PurgeCount>;

    /// Register `handler` to be invoked whenever a future `save` commits a
    /// fact of `specification`'s sole given type that causes `handler` to
    /// observe change with respect to `specification` run with that fact
    /// as the given. Registration is atomic with respect to `save`: no
    /// window exists in which a concurrently saved fact is neither
    /// reflected in a subsequent `read` nor delivered here.
    ///
    /// This is the primitive the observer (`crate::observer`) builds on:
    /// it registers one listener per inverse specification derived by
    /// `crate::inverse`, each of which has exactly one given — the newly
    /// arrived fact's type (spec §4.F).
    fn add_specification_listener(
        &self,
        specification: Specification,
        handler: ListenerHandler,
    ) -> Result<ListenerToken>;

    /// Cancel a previously registered listener. Idempotent.
    fn remove_specification_listener(&self, token: ListenerToken) -> Result<()>;

    /// Register `pc` so that every future `save` runs its purge-inverse
    /// over the newly arrived facts and, on a match, deletes the purge
    /// root's descendants except the triggering witness (spec §6 "Purge
    /// interface", part b). Registration only affects facts saved after
    /// it returns; it does not sweep facts already present (use
    /// [`FactStore::purge`] for that).
    fn register_purge_condition(&self, pc: crate::purge::PurgeCondition) -> Result<()>;
}
