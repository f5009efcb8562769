//! Pipeline positions. A stage owns one swappable provider and refuses
//! tokens addressed to any other position.

use crate::application::provider::Provider;
use crate::domain::entity::TransferInfo;
use crate::domain::token::Token;
use crate::error::{Result, RoutingError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::debug;

/// Shared provider-name register. `true` marks an active provider, `false`
/// one that was swapped out; retired names may be taken again.
pub(crate) type Registry = Arc<Mutex<BTreeMap<String, bool>>>;

fn lock_registry(registry: &Registry) -> MutexGuard<'_, BTreeMap<String, bool>> {
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn register_provider(registry: &Registry, name: &str) -> Result<()> {
    let mut guard = lock_registry(registry);
    if guard.get(name).copied().unwrap_or(false) {
        return Err(RoutingError::DuplicateProvider(name.to_string()));
    }
    guard.insert(name.to_string(), true);
    Ok(())
}

pub(crate) fn deregister_provider(registry: &Registry, name: &str) {
    let mut guard = lock_registry(registry);
    if let Some(active) = guard.get_mut(name) {
        *active = false;
    }
}

pub(crate) fn registry_snapshot(registry: &Registry) -> BTreeMap<String, bool> {
    lock_registry(registry).clone()
}

pub struct Stage {
    index: Option<usize>,
    provider: RwLock<Arc<Provider>>,
    registry: Option<Registry>,
}

impl Stage {
    pub fn new(provider: Provider) -> Self {
        Self {
            index: None,
            provider: RwLock::new(Arc::new(provider)),
            registry: None,
        }
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn current_provider(&self) -> Arc<Provider> {
        match self.provider.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Fixes the stage at a pipeline position and claims its provider name
    /// in the shared register.
    pub(crate) fn attach(&mut self, index: usize, registry: Registry) -> Result<()> {
        let provider = self.current_provider();
        register_provider(&registry, provider.name())?;
        self.index = Some(index);
        self.registry = Some(registry);
        Ok(())
    }

    /// Swaps the provider at runtime. A swap under the same name keeps the
    /// existing registration; otherwise the new name is claimed before the
    /// old one is retired, so a clash leaves the stage untouched.
    pub fn set_provider(&self, provider: Provider) -> Result<()> {
        let current = self.current_provider();
        if current.name() != provider.name()
            && let Some(registry) = &self.registry
        {
            register_provider(registry, provider.name())?;
            deregister_provider(registry, current.name());
        }
        debug!(stage = ?self.index, from = %current.name(), to = %provider.name(), "swapping provider");
        let next = Arc::new(provider);
        match self.provider.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        Ok(())
    }

    fn require_index(&self) -> Result<usize> {
        self.index.ok_or(RoutingError::StageDetached)
    }

    fn wrap(&self, index: usize, source: RoutingError) -> RoutingError {
        RoutingError::Stage {
            index,
            source: Box::new(source),
        }
    }

    /// The entity block the token is addressed to must carry this stage's
    /// index before the provider may act on it.
    fn assert_addressed(&self, token: &Token, index: usize, provider: &Provider) -> Result<()> {
        let acting = token.acting_entity(provider.name())?;
        match acting.stage {
            Some(addressed) if addressed == index => Ok(()),
            Some(addressed) => Err(RoutingError::StageMismatch { addressed, index }),
            None => Err(RoutingError::MissingStatus("stage index")),
        }
    }

    pub async fn run(&self, token: Token, dry: bool) -> Result<Token> {
        let index = self.require_index()?;
        let provider = self.current_provider();
        self.assert_addressed(&token, index, &provider)
            .map_err(|e| self.wrap(index, e))?;
        provider
            .run(token, dry)
            .await
            .map_err(|e| self.wrap(index, e))
    }

    pub async fn info(&self, token: &Token) -> Result<TransferInfo> {
        let index = self.require_index()?;
        let provider = self.current_provider();
        self.assert_addressed(token, index, &provider)
            .map_err(|e| self.wrap(index, e))?;
        provider.info(token).await.map_err(|e| self.wrap(index, e))
    }

    pub async fn set_info(&self, token: &Token, info: TransferInfo) -> Result<()> {
        let index = self.require_index()?;
        let provider = self.current_provider();
        self.assert_addressed(token, index, &provider)
            .map_err(|e| self.wrap(index, e))?;
        provider
            .set_info(token, info)
            .await
            .map_err(|e| self.wrap(index, e))
    }

    pub async fn select_connector(&self, token: &mut Token) -> Result<()> {
        let index = self.require_index()?;
        let provider = self.current_provider();
        provider
            .select_connector(token)
            .await
            .map_err(|e| self.wrap(index, e))?;
        token
            .set_connector_stage(index)
            .map_err(|e| self.wrap(index, e))
    }

    pub async fn select_receptacle(&self, token: &mut Token) -> Result<()> {
        let index = self.require_index()?;
        let provider = self.current_provider();
        provider
            .select_receptacle(token)
            .await
            .map_err(|e| self.wrap(index, e))?;
        token
            .set_receptacle_stage(index)
            .map_err(|e| self.wrap(index, e))
    }

    pub async fn select_operations(&self, token: &mut Token) -> Result<()> {
        let index = self.require_index()?;
        let provider = self.current_provider();
        provider
            .select_operations(token)
            .await
            .map_err(|e| self.wrap(index, e))?;
        token
            .set_operation_stage(index)
            .map_err(|e| self.wrap(index, e))
    }
}
