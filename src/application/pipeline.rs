//! The routing state machine. A pipeline owns the ordered stages, creates
//! tokens and drives each one through the alternating transfer/operation
//! phases until a terminal status is reached.

use crate::application::stage::{Registry, Stage, registry_snapshot};
use crate::domain::entity::TransferInfo;
use crate::domain::token::{OperationState, PhaseKind, Scope, Token, TokenStatus, TransferState};
use crate::error::{Result, RoutingError};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub struct Pipeline {
    stages: Vec<Stage>,
    registry: Registry,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            registry: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn with_stages(stages: Vec<Stage>) -> Result<Self> {
        let mut pipeline = Self::new();
        for stage in stages {
            pipeline.push_stage(stage)?;
        }
        Ok(pipeline)
    }

    /// Appends a stage, fixing it at the next index. Stages are never
    /// removed; only their providers may be swapped afterwards.
    pub fn push_stage(&mut self, mut stage: Stage) -> Result<()> {
        stage.attach(self.stages.len(), self.registry.clone())?;
        self.stages.push(stage);
        Ok(())
    }

    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Provider names ever registered, mapped to whether each is still
    /// active on some stage.
    pub fn registry(&self) -> BTreeMap<String, bool> {
        registry_snapshot(&self.registry)
    }

    /// Creates a token carrying the given balances, addressed to the first
    /// stage's receptacle and ready to be driven.
    pub async fn create_token(&self, values: BTreeMap<Scope, Decimal>) -> Result<Token> {
        let first = self.stages.first().ok_or(RoutingError::EmptyPipeline)?;
        let mut token = Token::new(values);
        token.set_phase(PhaseKind::Transfer);
        first.select_receptacle(&mut token).await?;

        let provider = match token.receptacle_status() {
            Some(block) if !block.provider.is_empty() => block.provider.clone(),
            Some(block) => return Err(RoutingError::UnresolvedProvider(block.provider.clone())),
            None => return Err(RoutingError::MissingStatus("receptacle")),
        };
        token.init_provider_slot(&provider);
        debug!(provider = %provider, "token created");
        Ok(token)
    }

    /// Advances the token by one step of its current phase.
    pub async fn run(&self, token: Token, dry: bool) -> Result<Token> {
        match token.phase_kind() {
            Some(PhaseKind::Transfer) => self.run_transfer(token, dry).await,
            Some(PhaseKind::Operation) => self.run_operation(token, dry).await,
            None => Err(RoutingError::PhaseNotSet),
        }
    }

    /// Same projection as `run` without external side effects. A token
    /// already in a terminal status is returned unchanged.
    pub async fn dry_run(&self, token: Token) -> Result<Token> {
        if token.status().is_terminal() {
            return Ok(token);
        }
        self.run(token, true).await
    }

    fn check_stage_index(&self, stage: Option<usize>) -> Result<usize> {
        let index = stage.ok_or(RoutingError::MissingStatus("stage index"))?;
        if index >= self.stages.len() {
            return Err(RoutingError::StageOutOfRange {
                index,
                max: self.stages.len().saturating_sub(1),
            });
        }
        Ok(index)
    }

    async fn run_operation(&self, mut token: Token, dry: bool) -> Result<Token> {
        let (state, stage) = match token.operation_status() {
            Some(block) => (block.state, block.stage),
            None => return Err(RoutingError::MissingStatus("operation status")),
        };
        let index = self.check_stage_index(stage)?;

        if state != OperationState::OperationComplete {
            return self.stages[index].run(token, dry).await;
        }

        token.advance_operation()?;
        if token.phase_kind() == Some(PhaseKind::Operation) {
            return Ok(token);
        }

        // Queue exhausted: line up the outgoing side here and, when a next
        // stage exists, the incoming side of the boundary.
        debug!(stage = index, "operations done, selecting transfer endpoints");
        self.stages[index].select_connector(&mut token).await?;
        if index + 1 < self.stages.len() {
            self.stages[index + 1].select_receptacle(&mut token).await?;
        }
        Ok(token)
    }

    async fn run_transfer(&self, mut token: Token, dry: bool) -> Result<Token> {
        let connector = token.connector_status().cloned();
        let receptacle = token.receptacle_status().cloned();

        if connector.is_none() && receptacle.is_none() {
            return Err(RoutingError::MissingStatus("transfer status"));
        }

        // Hand-off to the operation phase once the incoming side is done
        // and the outgoing side (if any) is too. Checked before the
        // end-of-pipeline case so the last stage still gets its operations.
        if let Some(r) = &receptacle
            && r.state == TransferState::TransferComplete
            && connector
                .as_ref()
                .is_none_or(|c| c.state == TransferState::TransferComplete)
        {
            let index = self.check_stage_index(r.stage)?;
            debug!(stage = index, "transfer done, selecting operations");
            token.set_phase(PhaseKind::Operation);
            self.stages[index].select_operations(&mut token).await?;
            return Ok(token);
        }

        // Outgoing side finished with nothing queued to receive: the end of
        // the pipeline, or a wiring hole reported on the token.
        if let Some(c) = &connector
            && c.state == TransferState::TransferComplete
            && receptacle.is_none()
        {
            let last = !self.stages.is_empty() && c.stage == Some(self.stages.len() - 1);
            if last {
                token.set_status(TokenStatus::Complete);
            } else {
                token.missing_receptacle()?;
            }
            return Ok(token);
        }

        let connector_stage = match &connector {
            Some(block) => Some(self.check_stage_index(block.stage)?),
            None => None,
        };
        let receptacle_stage = match &receptacle {
            Some(block) => Some(self.check_stage_index(block.stage)?),
            None => None,
        };

        match (connector_stage, receptacle_stage) {
            // Chain head: nothing upstream, so the receptacle gets the
            // beginning-of-chain marker in place of a counterpart.
            (None, Some(r)) => {
                let stage = &self.stages[r];
                stage.info(&token).await?;
                stage
                    .set_info(&token, TransferInfo::BeginningOfChain)
                    .await?;
                stage.run(token, dry).await
            }
            // Chain tail: the connector learns there is no downstream side.
            (Some(c), None) => {
                let stage = &self.stages[c];
                stage.set_info(&token, TransferInfo::EndOfChain).await?;
                stage.run(token, dry).await
            }
            // Stage boundary: exchange counterpart info and run both sides,
            // outgoing first so the incoming side sees its final word.
            (Some(c), Some(r)) => {
                let info = self.stages[r].info(&token).await?;
                self.stages[c].set_info(&token, info).await?;
                let token = self.stages[c].run(token, dry).await?;

                let info = self.stages[c].info(&token).await?;
                self.stages[r].set_info(&token, info).await?;
                self.stages[r].run(token, dry).await
            }
            (None, None) => Err(RoutingError::MissingStatus("transfer status")),
        }
    }
}
