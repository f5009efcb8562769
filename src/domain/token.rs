use crate::domain::entity::{ActionEntity, EntityKind};
use crate::error::{Result, RoutingError};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// A named value class (currency or asset) tracked in the token payload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(pub String);

impl Scope {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Scope {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Scope {
    fn from(name: String) -> Self {
        Self(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenStatus {
    Running,
    Complete,
    Error,
    Fatal,
    MissingReceptacle,
}

impl TokenStatus {
    /// Terminal tokens are never driven again by `dry_run`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TokenStatus::Complete | TokenStatus::Error | TokenStatus::Fatal
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferState {
    ReadyForTransfer,
    TransferComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationState {
    ReadyForOperation,
    OperationComplete,
}

/// One endpoint of a transfer: the connector or receptacle the token is
/// currently addressed to. `stage` is `None` between provider-level entity
/// selection and the stage stamping its own index onto the block.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointStatus {
    pub state: TransferState,
    pub stage: Option<usize>,
    pub provider: String,
    pub entity: String,
}

/// The processing-phase status block: which provider's operations are
/// queued, and the ordered names still to run.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationStatus {
    pub state: OperationState,
    pub stage: Option<usize>,
    pub provider: String,
    pub remaining: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Transfer,
    Operation,
}

impl PhaseKind {
    pub fn name(&self) -> &'static str {
        match self {
            PhaseKind::Transfer => "transfer",
            PhaseKind::Operation => "operation",
        }
    }
}

/// The phase carries its own status payload, so exactly one status block
/// can exist at a time by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Transfer {
        connector: Option<EndpointStatus>,
        receptacle: Option<EndpointStatus>,
    },
    Operation {
        status: Option<OperationStatus>,
    },
}

impl Phase {
    pub fn kind(&self) -> PhaseKind {
        match self {
            Phase::Transfer { .. } => PhaseKind::Transfer,
            Phase::Operation { .. } => PhaseKind::Operation,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CostValue {
    Exact(Decimal),
    Range { min: Decimal, max: Decimal },
}

/// One line of the append-only cost ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct CostEntry {
    pub provider: String,
    pub entity: String,
    pub kind: EntityKind,
    pub stage: Option<usize>,
    pub scope: Scope,
    pub reason: String,
    pub value: CostValue,
}

/// One distinct (stage, provider, entity, kind) the token has visited.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteVisit {
    pub stage: Option<usize>,
    pub provider: String,
    pub entity: String,
    pub kind: EntityKind,
    pub count: u64,
}

/// Where and why the token stopped. `message` is `None` for the
/// missing-receptacle state.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub provider: String,
    pub entity: String,
    pub kind: EntityKind,
    pub stage: Option<usize>,
    pub message: Option<String>,
}

/// Opaque per-provider scratch space carried on the token.
///
/// Providers declare their own serde state types and move them through this
/// handle; the engine never looks inside.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderState(serde_json::Value);

impl ProviderState {
    pub fn null() -> Self {
        Self(serde_json::Value::Null)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self(serde_json::to_value(value)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.0.clone())?)
    }
}

/// Scoped value balances plus the cost ledger accumulated along the route.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payload {
    pub values: BTreeMap<Scope, Decimal>,
    pub costs: Vec<CostEntry>,
}

/// Anything that names a provider: a plain name or the provider itself.
pub trait ProviderRef {
    fn provider_name(&self) -> &str;
}

impl ProviderRef for str {
    fn provider_name(&self) -> &str {
        self
    }
}

impl ProviderRef for String {
    fn provider_name(&self) -> &str {
        self
    }
}

/// The entity currently acting for a given provider, derived from whichever
/// of connector/receptacle/operation-head the token is addressed to.
#[derive(Debug, Clone)]
pub(crate) struct Acting {
    pub(crate) kind: EntityKind,
    pub(crate) entity: String,
    pub(crate) stage: Option<usize>,
}

/// The unit of work carried through the pipeline.
///
/// A token is created by the pipeline, mutated exclusively through the
/// methods below as it is threaded through stage, provider and entity
/// calls, and is effectively immutable once `status` turns terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub(crate) phase: Option<Phase>,
    pub(crate) status: TokenStatus,
    pub(crate) payload: Payload,
    pub(crate) error_info: Option<ErrorInfo>,
    pub(crate) route_history: Vec<RouteVisit>,
    pub(crate) provider_states: BTreeMap<String, ProviderState>,
    pub(crate) refresh_timer: Option<Duration>,
}

fn join_scopes<'a>(scopes: impl IntoIterator<Item = &'a Scope>) -> String {
    scopes
        .into_iter()
        .map(Scope::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Token {
    pub(crate) fn new(values: BTreeMap<Scope, Decimal>) -> Self {
        Self {
            phase: None,
            status: TokenStatus::Running,
            payload: Payload {
                values,
                costs: Vec::new(),
            },
            error_info: None,
            route_history: Vec::new(),
            provider_states: BTreeMap::new(),
            refresh_timer: None,
        }
    }

    pub fn phase(&self) -> Option<&Phase> {
        self.phase.as_ref()
    }

    pub fn phase_kind(&self) -> Option<PhaseKind> {
        self.phase.as_ref().map(Phase::kind)
    }

    pub fn status(&self) -> TokenStatus {
        self.status
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn error_info(&self) -> Option<&ErrorInfo> {
        self.error_info.as_ref()
    }

    pub fn route_history(&self) -> &[RouteVisit] {
        &self.route_history
    }

    pub fn refresh_timer(&self) -> Option<Duration> {
        self.refresh_timer
    }

    pub fn connector_status(&self) -> Option<&EndpointStatus> {
        match &self.phase {
            Some(Phase::Transfer { connector, .. }) => connector.as_ref(),
            _ => None,
        }
    }

    pub fn receptacle_status(&self) -> Option<&EndpointStatus> {
        match &self.phase {
            Some(Phase::Transfer { receptacle, .. }) => receptacle.as_ref(),
            _ => None,
        }
    }

    pub fn operation_status(&self) -> Option<&OperationStatus> {
        match &self.phase {
            Some(Phase::Operation { status }) => status.as_ref(),
            _ => None,
        }
    }

    /// Switches the token between phases. Re-setting the current phase
    /// preserves its status block; switching installs the other phase empty.
    pub fn set_phase(&mut self, kind: PhaseKind) {
        match (&self.phase, kind) {
            (Some(Phase::Transfer { .. }), PhaseKind::Transfer) => {}
            (Some(Phase::Operation { .. }), PhaseKind::Operation) => {}
            (_, PhaseKind::Transfer) => {
                self.phase = Some(Phase::Transfer {
                    connector: None,
                    receptacle: None,
                });
            }
            (_, PhaseKind::Operation) => {
                self.phase = Some(Phase::Operation { status: None });
            }
        }
    }

    /// Any status other than `Error`/`Fatal` clears the error info.
    pub fn set_status(&mut self, status: TokenStatus) {
        if !matches!(status, TokenStatus::Error | TokenStatus::Fatal) {
            self.error_info = None;
        }
        self.status = status;
    }

    pub fn set_refresh_timer(&mut self, timer: Option<Duration>) {
        self.refresh_timer = timer;
    }

    fn expect_transfer_mut(
        &mut self,
    ) -> Result<(&mut Option<EndpointStatus>, &mut Option<EndpointStatus>)> {
        match &mut self.phase {
            Some(Phase::Transfer {
                connector,
                receptacle,
            }) => Ok((connector, receptacle)),
            Some(Phase::Operation { .. }) => Err(RoutingError::PhaseMismatch {
                expected: "transfer",
                found: "operation",
            }),
            None => Err(RoutingError::PhaseNotSet),
        }
    }

    fn expect_operation_mut(&mut self) -> Result<&mut Option<OperationStatus>> {
        match &mut self.phase {
            Some(Phase::Operation { status }) => Ok(status),
            Some(Phase::Transfer { .. }) => Err(RoutingError::PhaseMismatch {
                expected: "operation",
                found: "transfer",
            }),
            None => Err(RoutingError::PhaseNotSet),
        }
    }

    async fn check_entity_scopes(&self, entity: &dyn ActionEntity) -> Result<()> {
        let offered = entity.scopes(self).await?;
        if self.check_scopes_compatibility(&offered) {
            Ok(())
        } else {
            Err(RoutingError::ScopeMismatch {
                entity: entity.name().to_string(),
                offered: join_scopes(&offered),
                carried: join_scopes(self.payload.values.keys()),
            })
        }
    }

    /// Addresses the token to an outgoing endpoint, ready for transfer.
    /// The stage index is stamped separately by the owning stage.
    pub async fn set_connector_entity(
        &mut self,
        provider: &str,
        entity: &dyn ActionEntity,
    ) -> Result<()> {
        self.check_entity_scopes(entity).await?;
        let block = EndpointStatus {
            state: TransferState::ReadyForTransfer,
            stage: None,
            provider: provider.to_string(),
            entity: entity.name().to_string(),
        };
        let (connector, _) = self.expect_transfer_mut()?;
        *connector = Some(block);
        Ok(())
    }

    /// Addresses the token to an incoming endpoint, ready for transfer.
    pub async fn set_receptacle_entity(
        &mut self,
        provider: &str,
        entity: &dyn ActionEntity,
    ) -> Result<()> {
        self.check_entity_scopes(entity).await?;
        let block = EndpointStatus {
            state: TransferState::ReadyForTransfer,
            stage: None,
            provider: provider.to_string(),
            entity: entity.name().to_string(),
        };
        let (_, receptacle) = self.expect_transfer_mut()?;
        *receptacle = Some(block);
        Ok(())
    }

    /// Queues the ordered operation list of a provider, ready to run.
    pub async fn set_operation_entities(
        &mut self,
        provider: &str,
        entities: &[&dyn ActionEntity],
    ) -> Result<()> {
        for entity in entities {
            self.check_entity_scopes(*entity).await?;
        }
        let remaining = entities.iter().map(|e| e.name().to_string()).collect();
        let block = OperationStatus {
            state: OperationState::ReadyForOperation,
            stage: None,
            provider: provider.to_string(),
            remaining,
        };
        let status = self.expect_operation_mut()?;
        *status = Some(block);
        Ok(())
    }

    /// Pops the head of the remaining-operation queue. With names left the
    /// token stays in the operation phase ready for the next one; with the
    /// queue exhausted it switches back to an empty transfer phase.
    pub fn advance_operation(&mut self) -> Result<()> {
        {
            let status = self.expect_operation_mut()?;
            let block = status
                .as_mut()
                .ok_or(RoutingError::MissingStatus("operation status"))?;
            if !block.remaining.is_empty() {
                block.remaining.remove(0);
            }
            if !block.remaining.is_empty() {
                block.state = OperationState::ReadyForOperation;
                return Ok(());
            }
        }
        self.set_phase(PhaseKind::Transfer);
        Ok(())
    }

    pub fn set_connector_state(&mut self, state: TransferState) -> Result<()> {
        let (connector, _) = self.expect_transfer_mut()?;
        let block = connector
            .as_mut()
            .ok_or(RoutingError::MissingStatus("connector"))?;
        block.state = state;
        Ok(())
    }

    pub fn set_receptacle_state(&mut self, state: TransferState) -> Result<()> {
        let (_, receptacle) = self.expect_transfer_mut()?;
        let block = receptacle
            .as_mut()
            .ok_or(RoutingError::MissingStatus("receptacle"))?;
        block.state = state;
        Ok(())
    }

    pub fn set_operation_state(&mut self, state: OperationState) -> Result<()> {
        let status = self.expect_operation_mut()?;
        let block = status
            .as_mut()
            .ok_or(RoutingError::MissingStatus("operation status"))?;
        block.state = state;
        Ok(())
    }

    pub fn set_connector_stage(&mut self, index: usize) -> Result<()> {
        let (connector, _) = self.expect_transfer_mut()?;
        let block = connector
            .as_mut()
            .ok_or(RoutingError::MissingStatus("connector"))?;
        block.stage = Some(index);
        Ok(())
    }

    pub fn set_receptacle_stage(&mut self, index: usize) -> Result<()> {
        let (_, receptacle) = self.expect_transfer_mut()?;
        let block = receptacle
            .as_mut()
            .ok_or(RoutingError::MissingStatus("receptacle"))?;
        block.stage = Some(index);
        Ok(())
    }

    pub fn set_operation_stage(&mut self, index: usize) -> Result<()> {
        let status = self.expect_operation_mut()?;
        let block = status
            .as_mut()
            .ok_or(RoutingError::MissingStatus("operation status"))?;
        block.stage = Some(index);
        Ok(())
    }

    /// Creates the scope or adds to its existing balance.
    pub fn add_payload_value(&mut self, scope: Scope, amount: Decimal) {
        *self.payload.values.entry(scope).or_insert(Decimal::ZERO) += amount;
    }

    /// Adds to an existing scope balance; the scope must be present.
    pub fn update_payload_value(&mut self, scope: &Scope, amount: Decimal) -> Result<()> {
        let balance = self
            .payload
            .values
            .get_mut(scope)
            .ok_or_else(|| RoutingError::UnknownScope(scope.clone()))?;
        *balance += amount;
        Ok(())
    }

    /// Moves `amount` out of `from` and credits `floor(amount * rate)` to
    /// `to` (created if absent). Moving the exact balance removes the `from`
    /// key entirely; partial moves leave the remainder.
    pub fn exchange(
        &mut self,
        from: &Scope,
        to: Scope,
        amount: Decimal,
        rate: Decimal,
    ) -> Result<()> {
        let balance = self
            .payload
            .values
            .get_mut(from)
            .ok_or_else(|| RoutingError::UnknownScope(from.clone()))?;
        if *balance == amount {
            self.payload.values.remove(from);
        } else {
            *balance -= amount;
        }
        let credited = (amount * rate).floor();
        *self.payload.values.entry(to).or_insert(Decimal::ZERO) += credited;
        Ok(())
    }

    /// Set equality between the given scopes and the payload scope keys.
    pub fn check_scopes_compatibility(&self, scopes: &[Scope]) -> bool {
        let offered: BTreeSet<&Scope> = scopes.iter().collect();
        let carried: BTreeSet<&Scope> = self.payload.values.keys().collect();
        offered == carried
    }

    pub(crate) fn acting_entity(&self, provider: &str) -> Result<Acting> {
        match &self.phase {
            None => Err(RoutingError::PhaseNotSet),
            Some(Phase::Transfer {
                connector,
                receptacle,
            }) => {
                if let Some(block) = connector
                    && block.provider == provider
                {
                    return Ok(Acting {
                        kind: EntityKind::Connector,
                        entity: block.entity.clone(),
                        stage: block.stage,
                    });
                }
                if let Some(block) = receptacle
                    && block.provider == provider
                {
                    return Ok(Acting {
                        kind: EntityKind::Receptacle,
                        entity: block.entity.clone(),
                        stage: block.stage,
                    });
                }
                Err(RoutingError::UnresolvedProvider(provider.to_string()))
            }
            Some(Phase::Operation { status }) => {
                if let Some(block) = status
                    && block.provider == provider
                    && let Some(head) = block.remaining.first()
                {
                    return Ok(Acting {
                        kind: EntityKind::Operation,
                        entity: head.clone(),
                        stage: block.stage,
                    });
                }
                Err(RoutingError::UnresolvedProvider(provider.to_string()))
            }
        }
    }

    /// Appends a cost attributed to the entity currently acting for the
    /// given provider.
    pub fn add_cost<P: ProviderRef + ?Sized>(
        &mut self,
        provider: &P,
        value: CostValue,
        scope: Scope,
        reason: impl Into<String>,
    ) -> Result<()> {
        let name = provider.provider_name().to_string();
        let acting = self.acting_entity(&name)?;
        self.payload.costs.push(CostEntry {
            provider: name,
            entity: acting.entity,
            kind: acting.kind,
            stage: acting.stage,
            scope,
            reason: reason.into(),
            value,
        });
        Ok(())
    }

    /// Records a visit by the entity currently acting for the given
    /// provider, incrementing the count on an identical revisit.
    pub fn add_history_entity<P: ProviderRef + ?Sized>(&mut self, provider: &P) -> Result<()> {
        let name = provider.provider_name().to_string();
        let acting = self.acting_entity(&name)?;
        if let Some(visit) = self.route_history.iter_mut().find(|v| {
            v.stage == acting.stage
                && v.provider == name
                && v.entity == acting.entity
                && v.kind == acting.kind
        }) {
            visit.count += 1;
        } else {
            self.route_history.push(RouteVisit {
                stage: acting.stage,
                provider: name,
                entity: acting.entity,
                kind: acting.kind,
                count: 1,
            });
        }
        Ok(())
    }

    /// Stores provider scratch state. A null state is a no-op so providers
    /// can unconditionally write back possibly-empty state.
    pub fn set_provider_state<P: ProviderRef + ?Sized>(
        &mut self,
        provider: &P,
        state: ProviderState,
    ) -> Result<()> {
        let name = provider.provider_name();
        if name.is_empty() {
            return Err(RoutingError::InvalidStateKey);
        }
        if state.is_null() {
            return Ok(());
        }
        self.provider_states.insert(name.to_string(), state);
        Ok(())
    }

    pub fn provider_state<P: ProviderRef + ?Sized>(
        &self,
        provider: &P,
    ) -> Result<Option<&ProviderState>> {
        let name = provider.provider_name();
        if name.is_empty() {
            return Err(RoutingError::InvalidStateKey);
        }
        Ok(self.provider_states.get(name))
    }

    pub(crate) fn init_provider_slot(&mut self, provider: &str) {
        self.provider_states
            .insert(provider.to_string(), ProviderState::null());
    }

    fn report(
        &mut self,
        provider: &str,
        message: String,
        status: TokenStatus,
    ) -> Result<()> {
        let acting = self.acting_entity(provider)?;
        warn!(
            provider = %provider,
            entity = %acting.entity,
            %message,
            ?status,
            "token reported a failure"
        );
        self.error_info = Some(ErrorInfo {
            provider: provider.to_string(),
            entity: acting.entity,
            kind: acting.kind,
            stage: acting.stage,
            message: Some(message),
        });
        self.status = status;
        Ok(())
    }

    /// Terminates the token with a recoverable business failure attributed
    /// to the acting entity. Returns normally; the driving loop observes
    /// the status.
    pub fn report_error<P: ProviderRef + ?Sized>(
        &mut self,
        provider: &P,
        message: impl Into<String>,
    ) -> Result<()> {
        self.report(provider.provider_name(), message.into(), TokenStatus::Error)
    }

    /// Terminates the token with an unrecoverable failure.
    pub fn report_fatal<P: ProviderRef + ?Sized>(
        &mut self,
        provider: &P,
        message: impl Into<String>,
    ) -> Result<()> {
        self.report(provider.provider_name(), message.into(), TokenStatus::Fatal)
    }

    /// Parks the token in the missing-receptacle state, attributed to the
    /// current connector with no message.
    pub fn missing_receptacle(&mut self) -> Result<()> {
        let (connector, _) = self.expect_transfer_mut()?;
        let block = connector
            .as_ref()
            .ok_or(RoutingError::MissingStatus("connector"))?;
        let info = ErrorInfo {
            provider: block.provider.clone(),
            entity: block.entity.clone(),
            kind: EntityKind::Connector,
            stage: block.stage,
            message: None,
        };
        warn!(provider = %info.provider, entity = %info.entity, "no receptacle queued after connector");
        self.error_info = Some(info);
        self.status = TokenStatus::MissingReceptacle;
        Ok(())
    }
}
