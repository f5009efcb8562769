use crate::domain::token::{Scope, Token};
use crate::error::{Result, RoutingError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The three roles an entity can play within a provider: outgoing transfer
/// endpoint, incoming transfer endpoint, or a processing step run between
/// transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Connector,
    Receptacle,
    Operation,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Connector => "connector",
            EntityKind::Receptacle => "receptacle",
            EntityKind::Operation => "operation",
        };
        f.write_str(s)
    }
}

/// Handshake data exchanged between the two endpoints of a transfer.
///
/// The pipeline substitutes a sentinel when one side has no counterpart:
/// the first receptacle of a pipeline sees `BeginningOfChain`, the last
/// connector sees `EndOfChain`.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferInfo {
    BeginningOfChain,
    EndOfChain,
    Payload(serde_json::Value),
}

/// The contract every provider integration implements.
///
/// Implementations must treat an absent per-provider state on the token as
/// "not yet initialized", and must write their state and a refresh timer
/// hint through the token when the underlying operation is pending rather
/// than resolved.
#[async_trait]
pub trait ActionEntity: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> EntityKind;

    /// The value scopes this entity accepts. Selection requires the result
    /// to be set-equal to the token's payload scopes.
    async fn scopes(&self, token: &Token) -> Result<Vec<Scope>>;

    /// Performs the real step. May call external systems and suspend.
    async fn run(&self, token: Token) -> Result<Token>;

    /// Applies the same token effects as [`run`](Self::run) without any
    /// external side effects.
    async fn dry_run(&self, token: Token) -> Result<Token>;

    /// Endpoint handshake: data for the counterpart endpoint. Only
    /// connectors and receptacles take part; the default refuses.
    async fn info(&self, _token: &Token) -> Result<TransferInfo> {
        Err(RoutingError::InfoExchangeUnsupported(self.name().to_string()))
    }

    /// Endpoint handshake: counterpart data pushed ahead of a run.
    async fn set_counterpart_info(&self, _info: TransferInfo) -> Result<()> {
        Err(RoutingError::InfoExchangeUnsupported(self.name().to_string()))
    }

    /// Advisory re-invocation delay the entity suggests when it leaves work
    /// pending. The engine never sleeps on it; the driving loop may.
    fn refresh_timer(&self) -> Option<Duration> {
        None
    }
}
