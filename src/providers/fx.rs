//! Processing steps: scope conversion and flat fees.

use crate::domain::entity::{ActionEntity, EntityKind};
use crate::domain::token::{CostValue, OperationState, Scope, Token};
use crate::error::{Result, RoutingError};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Converts the full balance of one scope into another at a fixed rate.
///
/// The credited side is floored, so integer balances stay integers. An
/// optional spread estimate is recorded on the cost ledger as a range.
pub struct ConversionOperation {
    name: String,
    from: Scope,
    to: Scope,
    rate: Decimal,
    spread: Option<(Decimal, Decimal)>,
}

impl ConversionOperation {
    pub fn new(name: impl Into<String>, from: Scope, to: Scope, rate: Decimal) -> Self {
        Self {
            name: name.into(),
            from,
            to,
            rate,
            spread: None,
        }
    }

    /// Records an estimated spread cost of `amount * min_rate ..
    /// amount * max_rate` on each conversion.
    pub fn with_spread(mut self, min_rate: Decimal, max_rate: Decimal) -> Self {
        self.spread = Some((min_rate, max_rate));
        self
    }

    async fn convert(&self, mut token: Token) -> Result<Token> {
        let provider = token
            .operation_status()
            .ok_or(RoutingError::MissingStatus("operation status"))?
            .provider
            .clone();
        let amount = token
            .payload()
            .values
            .get(&self.from)
            .copied()
            .ok_or_else(|| RoutingError::UnknownScope(self.from.clone()))?;

        token.exchange(&self.from, self.to.clone(), amount, self.rate)?;
        if let Some((min_rate, max_rate)) = self.spread {
            token.add_cost(
                &provider,
                CostValue::Range {
                    min: (amount * min_rate).floor(),
                    max: (amount * max_rate).floor(),
                },
                self.from.clone(),
                "fx spread",
            )?;
        }
        token.set_operation_state(OperationState::OperationComplete)?;
        Ok(token)
    }
}

#[async_trait]
impl ActionEntity for ConversionOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Operation
    }

    async fn scopes(&self, _token: &Token) -> Result<Vec<Scope>> {
        Ok(vec![self.from.clone()])
    }

    async fn run(&self, token: Token) -> Result<Token> {
        self.convert(token).await
    }

    // Conversion has no external side effects; the projection is the run.
    async fn dry_run(&self, token: Token) -> Result<Token> {
        self.convert(token).await
    }
}

/// Deducts a flat fee from one scope and records it on the cost ledger.
pub struct FeeOperation {
    name: String,
    scope: Scope,
    fee: Decimal,
    reason: String,
}

impl FeeOperation {
    pub fn new(name: impl Into<String>, scope: Scope, fee: Decimal) -> Self {
        Self {
            name: name.into(),
            scope,
            fee,
            reason: "processing fee".to_string(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    async fn apply(&self, mut token: Token) -> Result<Token> {
        let provider = token
            .operation_status()
            .ok_or(RoutingError::MissingStatus("operation status"))?
            .provider
            .clone();
        token.update_payload_value(&self.scope, -self.fee)?;
        token.add_cost(
            &provider,
            CostValue::Exact(self.fee),
            self.scope.clone(),
            self.reason.clone(),
        )?;
        token.set_operation_state(OperationState::OperationComplete)?;
        Ok(token)
    }
}

#[async_trait]
impl ActionEntity for FeeOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Operation
    }

    async fn scopes(&self, token: &Token) -> Result<Vec<Scope>> {
        Ok(token.payload().values.keys().cloned().collect())
    }

    async fn run(&self, token: Token) -> Result<Token> {
        self.apply(token).await
    }

    async fn dry_run(&self, token: Token) -> Result<Token> {
        self.apply(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::token::PhaseKind;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    async fn operation_token(
        provider: &str,
        entity: &dyn ActionEntity,
        values: &[(&str, Decimal)],
    ) -> Token {
        let mut token = Token::new(
            values
                .iter()
                .map(|(scope, amount)| (Scope::from(*scope), *amount))
                .collect(),
        );
        token.set_phase(PhaseKind::Operation);
        token
            .set_operation_entities(provider, &[entity])
            .await
            .unwrap();
        token
    }

    #[tokio::test]
    async fn test_conversion_moves_full_balance_with_floor() {
        let conversion = ConversionOperation::new(
            "eur_to_usd",
            Scope::from("eur"),
            Scope::from("usd"),
            dec!(1.0843),
        );
        let token = operation_token("fx", &conversion, &[("eur", dec!(995))]).await;

        let token = conversion.run(token).await.unwrap();
        // 995 * 1.0843 = 1078.8785, floored.
        assert_eq!(
            token.payload().values.get(&Scope::from("usd")),
            Some(&dec!(1078))
        );
        assert!(!token.payload().values.contains_key(&Scope::from("eur")));
        assert_eq!(
            token.operation_status().unwrap().state,
            OperationState::OperationComplete
        );
    }

    #[tokio::test]
    async fn test_conversion_records_spread_estimate() {
        let conversion = ConversionOperation::new(
            "eur_to_usd",
            Scope::from("eur"),
            Scope::from("usd"),
            dec!(1.08),
        )
        .with_spread(dec!(0.005), dec!(0.01));
        let token = operation_token("fx", &conversion, &[("eur", dec!(1000))]).await;

        let token = conversion.run(token).await.unwrap();
        let cost = &token.payload().costs[0];
        assert_eq!(cost.provider, "fx");
        assert_eq!(cost.entity, "eur_to_usd");
        assert_eq!(cost.kind, EntityKind::Operation);
        assert_eq!(
            cost.value,
            CostValue::Range {
                min: dec!(5),
                max: dec!(10)
            }
        );
    }

    #[tokio::test]
    async fn test_conversion_requires_source_scope() {
        let conversion = ConversionOperation::new(
            "eur_to_usd",
            Scope::from("eur"),
            Scope::from("usd"),
            dec!(1.08),
        );
        // Queue under a different scope so the source is absent at run time.
        let fee = FeeOperation::new("fee", Scope::from("gbp"), dec!(1));
        let mut token = operation_token("fx", &fee, &[("gbp", dec!(100))]).await;
        token.set_operation_stage(0).unwrap();

        let err = conversion.run(token).await.unwrap_err();
        assert!(matches!(err, RoutingError::UnknownScope(scope) if scope.as_str() == "eur"));
    }

    #[tokio::test]
    async fn test_fee_deducts_and_records_cost() {
        let fee = FeeOperation::new("card_fee", Scope::from("eur"), dec!(30))
            .with_reason("card processing");
        let token = operation_token("acquirer", &fee, &[("eur", dec!(1000))]).await;

        let token = fee.run(token).await.unwrap();
        assert_eq!(
            token.payload().values.get(&Scope::from("eur")),
            Some(&dec!(970))
        );
        let cost = &token.payload().costs[0];
        assert_eq!(cost.value, CostValue::Exact(dec!(30)));
        assert_eq!(cost.reason, "card processing");
        assert_eq!(
            token.operation_status().unwrap().state,
            OperationState::OperationComplete
        );
    }
}
