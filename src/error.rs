use crate::domain::entity::EntityKind;
use crate::domain::token::Scope;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RoutingError>;

/// Errors raised by the routing engine.
///
/// These are wiring/programming errors and always propagate. Transient or
/// business failures never appear here: entities report them through
/// `Token::report_error`/`report_fatal`, which terminate the token instead
/// of failing the call.
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("expected the {expected} phase, token is in the {found} phase")]
    PhaseMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("token has no phase set")]
    PhaseNotSet,
    #[error("no {0} is set on the token")]
    MissingStatus(&'static str),
    #[error("stage index {index} is out of range (max {max})")]
    StageOutOfRange { index: usize, max: usize },
    #[error("token addresses stage {addressed}, handled by stage {index}")]
    StageMismatch { addressed: usize, index: usize },
    #[error("stage is not attached to a pipeline")]
    StageDetached,
    #[error("no {kind} named '{name}' is registered")]
    UnknownEntity { kind: EntityKind, name: String },
    #[error("no {0} registered for default selection")]
    NoCandidate(EntityKind),
    #[error("ambiguous {kind} selection ({count} candidates)")]
    AmbiguousSelection { kind: EntityKind, count: usize },
    #[error("entity '{entity}' accepts scopes [{offered}], token carries [{carried}]")]
    ScopeMismatch {
        entity: String,
        offered: String,
        carried: String,
    },
    #[error("scope '{0}' is not present in the token payload")]
    UnknownScope(Scope),
    #[error("provider '{0}' does not match any addressed entity")]
    UnresolvedProvider(String),
    #[error("provider state key must be a non-empty name")]
    InvalidStateKey,
    #[error("pipeline has no stages")]
    EmptyPipeline,
    #[error("provider '{0}' is already registered in the pipeline")]
    DuplicateProvider(String),
    #[error("a {kind} named '{name}' is already registered")]
    DuplicateEntity { kind: EntityKind, name: String },
    #[error("entity '{0}' does not take part in info exchange")]
    InfoExchangeUnsupported(String),
    #[error("provider '{name}': {source}")]
    Provider {
        name: String,
        #[source]
        source: Box<RoutingError>,
    },
    #[error("stage {index}: {source}")]
    Stage {
        index: usize,
        #[source]
        source: Box<RoutingError>,
    },
    #[error("wire form rejected: {0}")]
    Wire(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("storage error: {0}")]
    StorageError(#[from] rocksdb::Error),
}

impl RoutingError {
    /// Walks the provider/stage context wrappers down to the error that
    /// started the chain.
    pub fn root(&self) -> &RoutingError {
        match self {
            RoutingError::Provider { source, .. } | RoutingError::Stage { source, .. } => {
                source.root()
            }
            other => other,
        }
    }
}
