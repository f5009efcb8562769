use async_trait::async_trait;
use payrail::application::pipeline::Pipeline;
use payrail::application::provider::Provider;
use payrail::application::stage::Stage;
use payrail::domain::entity::{ActionEntity, EntityKind, TransferInfo};
use payrail::domain::token::{OperationState, Scope, Token, TokenStatus, TransferState};
use payrail::error::Result;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// What a mock entity does to the token when invoked.
pub enum Behavior {
    /// Mark its own status block complete.
    Complete,
    /// Report a recoverable failure through the token.
    Fail(&'static str),
    /// Report an unrecoverable failure through the token.
    FailFatal(&'static str),
}

/// A scripted entity counting its real (non-dry) invocations, standing in
/// for an integration that calls an external system.
pub struct MockEntity {
    name: String,
    kind: EntityKind,
    behavior: Behavior,
    scopes: Option<Vec<Scope>>,
    pub external_calls: Arc<AtomicU32>,
}

impl MockEntity {
    pub fn new(name: &str, kind: EntityKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            behavior: Behavior::Complete,
            scopes: None,
            external_calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Fixes the accepted scopes instead of mirroring the token's payload.
    pub fn with_scopes(mut self, scopes: &[&str]) -> Self {
        self.scopes = Some(scopes.iter().map(|s| Scope::from(*s)).collect());
        self
    }

    fn provider_of(&self, token: &Token) -> String {
        match self.kind {
            EntityKind::Connector => token.connector_status().map(|b| b.provider.clone()),
            EntityKind::Receptacle => token.receptacle_status().map(|b| b.provider.clone()),
            EntityKind::Operation => token.operation_status().map(|b| b.provider.clone()),
        }
        .unwrap_or_default()
    }

    fn apply(&self, mut token: Token, real: bool) -> Result<Token> {
        if real {
            self.external_calls.fetch_add(1, Ordering::SeqCst);
        }
        match &self.behavior {
            Behavior::Complete => match self.kind {
                EntityKind::Connector => {
                    token.set_connector_state(TransferState::TransferComplete)?;
                }
                EntityKind::Receptacle => {
                    token.set_receptacle_state(TransferState::TransferComplete)?;
                }
                EntityKind::Operation => {
                    token.set_operation_state(OperationState::OperationComplete)?;
                }
            },
            Behavior::Fail(message) => {
                let provider = self.provider_of(&token);
                token.report_error(&provider, *message)?;
            }
            Behavior::FailFatal(message) => {
                let provider = self.provider_of(&token);
                token.report_fatal(&provider, *message)?;
            }
        }
        Ok(token)
    }
}

#[async_trait]
impl ActionEntity for MockEntity {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EntityKind {
        self.kind
    }

    async fn scopes(&self, token: &Token) -> Result<Vec<Scope>> {
        match &self.scopes {
            Some(scopes) => Ok(scopes.clone()),
            None => Ok(token.payload().values.keys().cloned().collect()),
        }
    }

    async fn run(&self, token: Token) -> Result<Token> {
        self.apply(token, true)
    }

    async fn dry_run(&self, token: Token) -> Result<Token> {
        self.apply(token, false)
    }

    async fn info(&self, _token: &Token) -> Result<TransferInfo> {
        Ok(TransferInfo::Payload(
            serde_json::json!({ "entity": self.name }),
        ))
    }

    async fn set_counterpart_info(&self, _info: TransferInfo) -> Result<()> {
        Ok(())
    }
}

/// Call counters for the three entities of a [`scripted_stage`].
pub struct StageCalls {
    pub receptacle: Arc<AtomicU32>,
    pub operation: Arc<AtomicU32>,
    pub connector: Arc<AtomicU32>,
}

impl StageCalls {
    pub fn totals(&self) -> (u32, u32, u32) {
        (
            self.receptacle.load(Ordering::SeqCst),
            self.operation.load(Ordering::SeqCst),
            self.connector.load(Ordering::SeqCst),
        )
    }
}

/// A stage whose provider owns `<name>_in`, `<name>_op` and `<name>_out`,
/// each completing immediately.
pub fn scripted_stage(provider_name: &str) -> (Stage, StageCalls) {
    let receptacle = MockEntity::new(&format!("{provider_name}_in"), EntityKind::Receptacle);
    let operation = MockEntity::new(&format!("{provider_name}_op"), EntityKind::Operation);
    let connector = MockEntity::new(&format!("{provider_name}_out"), EntityKind::Connector);
    let calls = StageCalls {
        receptacle: receptacle.external_calls.clone(),
        operation: operation.external_calls.clone(),
        connector: connector.external_calls.clone(),
    };

    let mut provider = Provider::new(provider_name);
    provider.register(Arc::new(receptacle)).unwrap();
    provider.register(Arc::new(operation)).unwrap();
    provider.register(Arc::new(connector)).unwrap();
    (Stage::new(provider), calls)
}

pub fn two_stage_pipeline() -> (Pipeline, StageCalls, StageCalls) {
    let (first, first_calls) = scripted_stage("acquirer");
    let (second, second_calls) = scripted_stage("payout");
    let pipeline = Pipeline::with_stages(vec![first, second]).unwrap();
    (pipeline, first_calls, second_calls)
}

pub fn eur(amount: Decimal) -> BTreeMap<Scope, Decimal> {
    BTreeMap::from([(Scope::from("eur"), amount)])
}

/// Drives the token until it leaves the running status, failing the test if
/// it never does.
pub async fn drive(pipeline: &Pipeline, mut token: Token, max_steps: u32) -> Result<Token> {
    let mut steps = 0;
    while token.status() == TokenStatus::Running {
        assert!(
            steps < max_steps,
            "token still running after {max_steps} steps"
        );
        steps += 1;
        token = pipeline.run(token, false).await?;
    }
    Ok(token)
}

/// Same as [`drive`], in dry mode.
pub async fn drive_dry(pipeline: &Pipeline, mut token: Token, max_steps: u32) -> Result<Token> {
    let mut steps = 0;
    while token.status() == TokenStatus::Running {
        assert!(
            steps < max_steps,
            "token still running after {max_steps} steps"
        );
        steps += 1;
        token = pipeline.dry_run(token).await?;
    }
    Ok(token)
}
