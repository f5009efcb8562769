use crate::domain::token::{CostValue, Token};
use crate::error::Result;
use std::io::Write;

/// Writes token reports as CSV.
///
/// This writer wraps `csv::Writer` and renders the two views a driver loop
/// usually wants once a token terminates: the accumulated cost ledger and
/// the final scoped balances.
pub struct ReportWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ReportWriter<W> {
    /// Creates a new `ReportWriter` over any `Write` sink (e.g., File, Stdout).
    pub fn new(sink: W) -> Self {
        Self {
            // The cost ledger and balance sections have different widths, so
            // the underlying writer must accept variable-length records.
            writer: csv::WriterBuilder::new().flexible(true).from_writer(sink),
        }
    }

    /// Writes the cost ledger, one row per recorded cost, in the order the
    /// costs were added. Estimated costs render as `min..max`.
    pub fn write_costs(&mut self, token: &Token) -> Result<()> {
        self.writer.write_record([
            "provider",
            "entity",
            "entityType",
            "stage",
            "scope",
            "reason",
            "value",
        ])?;
        for cost in &token.payload().costs {
            let stage = cost.stage.map(|i| i.to_string()).unwrap_or_default();
            let value = match &cost.value {
                CostValue::Exact(value) => value.to_string(),
                CostValue::Range { min, max } => format!("{min}..{max}"),
            };
            self.writer.write_record([
                cost.provider.as_str(),
                cost.entity.as_str(),
                &cost.kind.to_string(),
                &stage,
                cost.scope.as_str(),
                cost.reason.as_str(),
                &value,
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }

    /// Writes the remaining balance per scope.
    pub fn write_balances(&mut self, token: &Token) -> Result<()> {
        self.writer.write_record(["scope", "balance"])?;
        for (scope, balance) in &token.payload().values {
            self.writer
                .write_record([scope.as_str(), &balance.to_string()])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::token::{PhaseKind, Scope};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    struct Sink {
        name: &'static str,
        kind: crate::domain::entity::EntityKind,
    }

    #[async_trait::async_trait]
    impl crate::domain::entity::ActionEntity for Sink {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> crate::domain::entity::EntityKind {
            self.kind
        }

        async fn scopes(&self, token: &Token) -> Result<Vec<Scope>> {
            Ok(token.payload().values.keys().cloned().collect())
        }

        async fn run(&self, token: Token) -> Result<Token> {
            Ok(token)
        }

        async fn dry_run(&self, token: Token) -> Result<Token> {
            Ok(token)
        }
    }

    #[tokio::test]
    async fn test_cost_ledger_rows() {
        let mut token = Token::new(BTreeMap::from([(Scope::from("eur"), dec!(10))]));
        token.set_phase(PhaseKind::Transfer);
        let entity = Sink {
            name: "card_in",
            kind: crate::domain::entity::EntityKind::Receptacle,
        };
        token.set_receptacle_entity("acquirer", &entity).await.unwrap();
        token.set_receptacle_stage(0).unwrap();
        token
            .add_cost(
                "acquirer",
                CostValue::Exact(dec!(0.30)),
                Scope::from("eur"),
                "fixed fee",
            )
            .unwrap();
        token
            .add_cost(
                "acquirer",
                CostValue::Range {
                    min: dec!(0.10),
                    max: dec!(0.25),
                },
                Scope::from("eur"),
                "fx spread",
            )
            .unwrap();

        let mut writer = ReportWriter::new(Vec::new());
        writer.write_costs(&token).unwrap();
        let out = String::from_utf8(writer.writer.into_inner().unwrap()).unwrap();

        let mut lines = out.lines();
        assert_eq!(
            lines.next(),
            Some("provider,entity,entityType,stage,scope,reason,value")
        );
        assert_eq!(
            lines.next(),
            Some("acquirer,card_in,receptacle,0,eur,fixed fee,0.30")
        );
        assert_eq!(
            lines.next(),
            Some("acquirer,card_in,receptacle,0,eur,fx spread,0.10..0.25")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_balance_rows_are_scope_ordered() {
        let token = Token::new(BTreeMap::from([
            (Scope::from("usd"), dec!(3.50)),
            (Scope::from("eur"), dec!(10)),
        ]));

        let mut writer = ReportWriter::new(Vec::new());
        writer.write_balances(&token).unwrap();
        let out = String::from_utf8(writer.writer.into_inner().unwrap()).unwrap();

        assert_eq!(out, "scope,balance\neur,10\nusd,3.50\n");
    }
}
