//! Error taxonomy (spec §7).
//!
//! `BuildError`s are always surfaced at specification-parse/build time,
//! never at query time. `RuntimeDataError`s surface from the query runner.
//! `CallbackError`s are caught inside the observer and routed to its error
//! sink rather than unwound through the dispatch loop. Absent facts are
//! *not* errors — they are modeled as `None`/empty `Vec`, per spec.

/// Top-level crate error.
#[derive(Debug, thiserror::Error)]
pub enum FactGraphError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    RuntimeData(#[from] RuntimeDataError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Callback(#[from] CallbackError),
}

pub type Result<T> = std::result::Result<T, FactGraphError>;

/// Specification-time errors: rejected at parse/build, never at query time.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("could not parse specification: {0}")]
    SyntaxError(String),

    #[error("disconnected specification: subgraphs {0:?}")]
    DisconnectedSpecification(Vec<Vec<String>>),

    #[error("type mismatch in role `{role}` on `{label}`: expected predecessor type `{expected}`, found `{found}`")]
    TypeMismatchInRole {
        label: String,
        role: String,
        expected: String,
        found: String,
    },

    #[error("condition on given `{label}` references forward label `{referenced}`")]
    ForwardGivenReference { label: String, referenced: String },

    #[error("purge compliance failure: {0:?}")]
    PurgeComplianceFailure(Vec<String>),
}

/// Query/projection-time errors. Propagated to the caller of `query`/`read`;
/// never silently swallowed by the observer.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeDataError {
    #[error("projection field `{field}` missing on fact bound to `{label}`")]
    ProjectionFieldMissing { label: String, field: String },

    #[error("projection type error: field `{field}` on `{label}` is not a {expected}")]
    ProjectionTypeError {
        label: String,
        field: String,
        expected: String,
    },
}

/// A user callback registered with the observer threw. Captured and routed
/// to the observer's error sink; never unwound through the dispatch loop.
#[derive(Debug, thiserror::Error)]
#[error("observer callback failed: {0}")]
pub struct CallbackError(pub String);
