use crate::domain::entity::{ActionEntity, EntityKind, TransferInfo};
use crate::domain::token::{ProviderRef, Token};
use crate::error::{Result, RoutingError};
use std::sync::Arc;
use tracing::debug;

/// Result of probing the register for a lone entity of one kind.
pub enum Selection {
    One(Arc<dyn ActionEntity>),
    None,
    Many(usize),
}

/// The entities a provider owns, looked up by kind and name.
#[derive(Default, Clone)]
pub struct EntityRegistry {
    entities: Vec<Arc<dyn ActionEntity>>,
}

impl EntityRegistry {
    pub fn register(&mut self, entity: Arc<dyn ActionEntity>) -> Result<()> {
        if self
            .entities
            .iter()
            .any(|e| e.kind() == entity.kind() && e.name() == entity.name())
        {
            return Err(RoutingError::DuplicateEntity {
                kind: entity.kind(),
                name: entity.name().to_string(),
            });
        }
        self.entities.push(entity);
        Ok(())
    }

    pub fn by_name(&self, kind: EntityKind, name: &str) -> Option<Arc<dyn ActionEntity>> {
        self.entities
            .iter()
            .find(|e| e.kind() == kind && e.name() == name)
            .cloned()
    }

    /// All entities of a kind, in registration order.
    pub fn of_kind(&self, kind: EntityKind) -> Vec<Arc<dyn ActionEntity>> {
        self.entities
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn single(&self, kind: EntityKind) -> Selection {
        let mut candidates = self.entities.iter().filter(|e| e.kind() == kind);
        match (candidates.next(), candidates.next()) {
            (None, _) => Selection::None,
            (Some(one), None) => Selection::One(one.clone()),
            (Some(_), Some(_)) => Selection::Many(2 + candidates.count()),
        }
    }
}

/// How a provider picks the endpoint to address when asked to select one.
pub trait SelectPolicy: Send + Sync {
    fn pick(
        &self,
        token: &Token,
        kind: EntityKind,
        registry: &EntityRegistry,
    ) -> Result<Arc<dyn ActionEntity>>;
}

/// Default policy: exactly one registered entity of the kind.
pub struct SingleEntity;

impl SelectPolicy for SingleEntity {
    fn pick(
        &self,
        _token: &Token,
        kind: EntityKind,
        registry: &EntityRegistry,
    ) -> Result<Arc<dyn ActionEntity>> {
        match registry.single(kind) {
            Selection::One(entity) => Ok(entity),
            Selection::None => Err(RoutingError::NoCandidate(kind)),
            Selection::Many(count) => Err(RoutingError::AmbiguousSelection { kind, count }),
        }
    }
}

/// A named bundle of connectors, receptacles and operations representing
/// one payment backend. Dispatches the token to whichever of its entities
/// the token is addressed to, and scopes every failure with its own name.
pub struct Provider {
    name: String,
    entities: EntityRegistry,
    policy: Box<dyn SelectPolicy>,
}

impl Provider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entities: EntityRegistry::default(),
            policy: Box::new(SingleEntity),
        }
    }

    /// Replaces the default single-entity selection policy.
    pub fn with_policy(mut self, policy: impl SelectPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register(&mut self, entity: Arc<dyn ActionEntity>) -> Result<()> {
        self.entities.register(entity).map_err(|e| self.wrap(e))
    }

    fn wrap(&self, source: RoutingError) -> RoutingError {
        RoutingError::Provider {
            name: self.name.clone(),
            source: Box::new(source),
        }
    }

    fn addressed(&self, token: &Token) -> Result<Arc<dyn ActionEntity>> {
        let acting = token.acting_entity(&self.name)?;
        self.entities
            .by_name(acting.kind, &acting.entity)
            .ok_or(RoutingError::UnknownEntity {
                kind: acting.kind,
                name: acting.entity,
            })
    }

    /// Runs the entity the token is currently addressed to and records the
    /// visit. The refresh timer is cleared going in so it always reflects
    /// the last-run entity.
    pub async fn run(&self, mut token: Token, dry: bool) -> Result<Token> {
        let entity = self.addressed(&token).map_err(|e| self.wrap(e))?;
        debug!(
            provider = %self.name,
            entity = %entity.name(),
            kind = %entity.kind(),
            dry,
            "dispatching token"
        );
        token.set_refresh_timer(None);
        let mut token = if dry {
            entity.dry_run(token).await
        } else {
            entity.run(token).await
        }
        .map_err(|e| self.wrap(e))?;
        token.add_history_entity(self).map_err(|e| self.wrap(e))?;
        Ok(token)
    }

    pub async fn select_connector(&self, token: &mut Token) -> Result<()> {
        let entity = self
            .policy
            .pick(token, EntityKind::Connector, &self.entities)
            .map_err(|e| self.wrap(e))?;
        token
            .set_connector_entity(&self.name, entity.as_ref())
            .await
            .map_err(|e| self.wrap(e))
    }

    pub async fn select_receptacle(&self, token: &mut Token) -> Result<()> {
        let entity = self
            .policy
            .pick(token, EntityKind::Receptacle, &self.entities)
            .map_err(|e| self.wrap(e))?;
        token
            .set_receptacle_entity(&self.name, entity.as_ref())
            .await
            .map_err(|e| self.wrap(e))
    }

    /// Queues every owned operation on the token, in registration order.
    pub async fn select_operations(&self, token: &mut Token) -> Result<()> {
        let operations = self.entities.of_kind(EntityKind::Operation);
        let refs: Vec<&dyn ActionEntity> = operations.iter().map(|e| e.as_ref()).collect();
        token
            .set_operation_entities(&self.name, &refs)
            .await
            .map_err(|e| self.wrap(e))
    }

    pub async fn info(&self, token: &Token) -> Result<TransferInfo> {
        let entity = self.addressed(token).map_err(|e| self.wrap(e))?;
        entity.info(token).await.map_err(|e| self.wrap(e))
    }

    pub async fn set_info(&self, token: &Token, info: TransferInfo) -> Result<()> {
        let entity = self.addressed(token).map_err(|e| self.wrap(e))?;
        entity
            .set_counterpart_info(info)
            .await
            .map_err(|e| self.wrap(e))
    }
}

impl ProviderRef for Provider {
    fn provider_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::token::Scope;
    use async_trait::async_trait;

    struct NamedEntity {
        name: &'static str,
        kind: EntityKind,
    }

    #[async_trait]
    impl ActionEntity for NamedEntity {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> EntityKind {
            self.kind
        }

        async fn scopes(&self, token: &Token) -> Result<Vec<Scope>> {
            // Mirrors the payload so selection always passes.
            Ok(token.payload().values.keys().cloned().collect())
        }

        async fn run(&self, token: Token) -> Result<Token> {
            Ok(token)
        }

        async fn dry_run(&self, token: Token) -> Result<Token> {
            Ok(token)
        }
    }

    fn entity(name: &'static str, kind: EntityKind) -> Arc<dyn ActionEntity> {
        Arc::new(NamedEntity { name, kind })
    }

    fn token() -> Token {
        Token::new(std::collections::BTreeMap::from([(
            Scope::from("eur"),
            rust_decimal_macros::dec!(10),
        )]))
    }

    #[tokio::test]
    async fn test_default_selection_requires_exactly_one() {
        let mut provider = Provider::new("acquirer");
        let mut token = token();
        token.set_phase(crate::domain::token::PhaseKind::Transfer);

        let err = provider.select_receptacle(&mut token).await.unwrap_err();
        assert!(matches!(
            err.root(),
            RoutingError::NoCandidate(EntityKind::Receptacle)
        ));

        provider
            .register(entity("card_in", EntityKind::Receptacle))
            .unwrap();
        provider
            .register(entity("wire_in", EntityKind::Receptacle))
            .unwrap();
        let err = provider.select_receptacle(&mut token).await.unwrap_err();
        assert!(matches!(
            err.root(),
            RoutingError::AmbiguousSelection { count: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_single_selection_stamps_entity_name() {
        let mut provider = Provider::new("acquirer");
        provider
            .register(entity("card_in", EntityKind::Receptacle))
            .unwrap();

        let mut token = token();
        token.set_phase(crate::domain::token::PhaseKind::Transfer);
        provider.select_receptacle(&mut token).await.unwrap();

        let block = token.receptacle_status().unwrap();
        assert_eq!(block.entity, "card_in");
        assert_eq!(block.provider, "acquirer");
    }

    #[tokio::test]
    async fn test_run_rejects_unknown_entity_name() {
        let mut provider = Provider::new("acquirer");
        provider
            .register(entity("card_in", EntityKind::Receptacle))
            .unwrap();

        let mut token = token();
        token.set_phase(crate::domain::token::PhaseKind::Transfer);
        // Address the token to an entity this provider never registered.
        let ghost = NamedEntity {
            name: "ghost",
            kind: EntityKind::Receptacle,
        };
        token.set_receptacle_entity("acquirer", &ghost).await.unwrap();

        let err = provider.run(token, false).await.unwrap_err();
        assert!(matches!(
            err.root(),
            RoutingError::UnknownEntity { name, .. } if name == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_run_records_route_history() {
        let mut provider = Provider::new("acquirer");
        provider
            .register(entity("card_in", EntityKind::Receptacle))
            .unwrap();

        let mut token = token();
        token.set_phase(crate::domain::token::PhaseKind::Transfer);
        provider.select_receptacle(&mut token).await.unwrap();

        let token = provider.run(token, false).await.unwrap();
        assert_eq!(token.route_history().len(), 1);
        assert_eq!(token.route_history()[0].entity, "card_in");

        let token = provider.run(token, true).await.unwrap();
        assert_eq!(token.route_history()[0].count, 2);
    }

    #[test]
    fn test_duplicate_entity_rejected_per_kind() {
        let mut provider = Provider::new("acquirer");
        provider
            .register(entity("card", EntityKind::Receptacle))
            .unwrap();
        // Same name under a different kind is a different entity.
        provider
            .register(entity("card", EntityKind::Connector))
            .unwrap();
        let err = provider
            .register(entity("card", EntityKind::Receptacle))
            .unwrap_err();
        assert!(matches!(
            err.root(),
            RoutingError::DuplicateEntity { .. }
        ));
    }
}
