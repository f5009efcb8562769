//! Treasury-backed transfer endpoints.
//!
//! Both endpoints settle against a shared in-process ledger standing in for
//! the external treasury service a real deployment would call.

use crate::domain::entity::{ActionEntity, EntityKind, TransferInfo};
use crate::domain::token::{ProviderState, Scope, Token, TransferState};
use crate::error::{Result, RoutingError};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Shared treasury balances, keyed by scope.
pub type Ledger = Arc<RwLock<BTreeMap<Scope, Decimal>>>;

pub fn new_ledger() -> Ledger {
    Arc::new(RwLock::new(BTreeMap::new()))
}

/// Incoming endpoint crediting received value to a treasury ledger.
pub struct LedgerReceptacle {
    name: String,
    ledger: Ledger,
    counterpart: RwLock<Option<TransferInfo>>,
}

impl LedgerReceptacle {
    pub fn new(name: impl Into<String>, ledger: Ledger) -> Self {
        Self {
            name: name.into(),
            ledger,
            counterpart: RwLock::new(None),
        }
    }

    /// Counterpart info received during the last transfer handshake.
    pub async fn last_counterpart(&self) -> Option<TransferInfo> {
        self.counterpart.read().await.clone()
    }

    async fn receive(&self, mut token: Token, real: bool) -> Result<Token> {
        // Re-runs after completion happen while a boundary partner is still
        // settling; they must not credit twice.
        if token
            .receptacle_status()
            .is_some_and(|r| r.state == TransferState::TransferComplete)
        {
            return Ok(token);
        }
        if real {
            let mut ledger = self.ledger.write().await;
            for (scope, amount) in &token.payload().values {
                *ledger.entry(scope.clone()).or_insert(Decimal::ZERO) += *amount;
            }
        }
        token.set_receptacle_state(TransferState::TransferComplete)?;
        debug!(entity = %self.name, real, "value received");
        Ok(token)
    }
}

#[async_trait]
impl ActionEntity for LedgerReceptacle {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Receptacle
    }

    async fn scopes(&self, token: &Token) -> Result<Vec<Scope>> {
        // A treasury account takes whatever scopes the token carries.
        Ok(token.payload().values.keys().cloned().collect())
    }

    async fn run(&self, token: Token) -> Result<Token> {
        self.receive(token, true).await
    }

    async fn dry_run(&self, token: Token) -> Result<Token> {
        self.receive(token, false).await
    }

    async fn info(&self, _token: &Token) -> Result<TransferInfo> {
        Ok(TransferInfo::Payload(
            serde_json::json!({ "account": self.name }),
        ))
    }

    async fn set_counterpart_info(&self, info: TransferInfo) -> Result<()> {
        *self.counterpart.write().await = Some(info);
        Ok(())
    }
}

/// Settlement progress a connector keeps on the token between retries.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementState {
    pub attempts: u32,
    pub debited: bool,
}

/// Outgoing endpoint debiting a treasury ledger.
///
/// Settlement resolves after a fixed number of attempts, mimicking the
/// polling window of an external settlement API. Until then the connector
/// stays ready, parks its progress in the token's provider state and leaves
/// a refresh timer hint for the driving loop.
pub struct LedgerConnector {
    name: String,
    ledger: Ledger,
    settle_after: u32,
    retry_after: Duration,
    counterpart: RwLock<Option<TransferInfo>>,
}

impl LedgerConnector {
    pub fn new(name: impl Into<String>, ledger: Ledger, settle_after: u32) -> Self {
        Self {
            name: name.into(),
            ledger,
            settle_after,
            retry_after: Duration::from_millis(25),
            counterpart: RwLock::new(None),
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Counterpart info received during the last transfer handshake.
    pub async fn last_counterpart(&self) -> Option<TransferInfo> {
        self.counterpart.read().await.clone()
    }

    async fn settle(&self, mut token: Token, real: bool) -> Result<Token> {
        let block = token
            .connector_status()
            .ok_or(RoutingError::MissingStatus("connector"))?;
        if block.state == TransferState::TransferComplete {
            return Ok(token);
        }
        let provider = block.provider.clone();

        let mut state = match token.provider_state(&provider)? {
            Some(s) if !s.is_null() => s.decode::<SettlementState>()?,
            _ => SettlementState::default(),
        };

        if !state.debited {
            if real {
                let mut ledger = self.ledger.write().await;
                for (scope, amount) in &token.payload().values {
                    *ledger.entry(scope.clone()).or_insert(Decimal::ZERO) -= *amount;
                }
            }
            state.debited = true;
        }
        state.attempts += 1;

        let settled = state.attempts >= self.settle_after;
        token.set_provider_state(&provider, ProviderState::encode(&state)?)?;
        if settled {
            token.set_connector_state(TransferState::TransferComplete)?;
            info!(entity = %self.name, attempts = state.attempts, "transfer settled");
        } else {
            token.set_refresh_timer(Some(self.retry_after));
            debug!(entity = %self.name, attempts = state.attempts, "settlement pending");
        }
        Ok(token)
    }
}

#[async_trait]
impl ActionEntity for LedgerConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Connector
    }

    async fn scopes(&self, token: &Token) -> Result<Vec<Scope>> {
        Ok(token.payload().values.keys().cloned().collect())
    }

    async fn run(&self, token: Token) -> Result<Token> {
        self.settle(token, true).await
    }

    async fn dry_run(&self, token: Token) -> Result<Token> {
        self.settle(token, false).await
    }

    async fn info(&self, _token: &Token) -> Result<TransferInfo> {
        Ok(TransferInfo::Payload(
            serde_json::json!({ "source": self.name }),
        ))
    }

    async fn set_counterpart_info(&self, info: TransferInfo) -> Result<()> {
        *self.counterpart.write().await = Some(info);
        Ok(())
    }

    fn refresh_timer(&self) -> Option<Duration> {
        Some(self.retry_after)
    }
}
