use clap::Parser;
use miette::{IntoDiagnostic, Result};
use payrail::application::pipeline::Pipeline;
use payrail::application::provider::Provider;
use payrail::application::stage::Stage;
use payrail::domain::ports::TokenStoreBox;
use payrail::domain::token::{Scope, TokenStatus};
use payrail::infrastructure::in_memory::InMemoryTokenStore;
#[cfg(feature = "storage-rocksdb")]
use payrail::infrastructure::rocksdb::RocksDbTokenStore;
use payrail::interfaces::csv::report_writer::ReportWriter;
use payrail::providers::fx::{ConversionOperation, FeeOperation};
use payrail::providers::treasury::{LedgerConnector, LedgerReceptacle, new_ledger};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Routes a token through a two-stage demo pipeline: an acquirer taking
/// value in euros, then a payout provider converting it to dollars.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Initial balances as scope=amount pairs (repeatable)
    #[arg(long = "value", value_parser = parse_value, default_values = ["eur=5000"])]
    values: Vec<(String, Decimal)>,

    /// Key the token is checkpointed under; reuse it to resume a run
    #[arg(long, default_value = "demo")]
    token_key: String,

    /// Simulate the route without external side effects
    #[arg(long)]
    dry_run: bool,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Give up after this many drive steps
    #[arg(long, default_value_t = 64)]
    max_steps: u32,
}

fn parse_value(raw: &str) -> std::result::Result<(String, Decimal), String> {
    let (scope, amount) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected scope=amount, got '{raw}'"))?;
    let amount = amount
        .parse::<Decimal>()
        .map_err(|e| format!("bad amount '{amount}': {e}"))?;
    Ok((scope.to_string(), amount))
}

fn demo_pipeline() -> Result<Pipeline> {
    let acquirer_ledger = new_ledger();
    let payout_ledger = new_ledger();

    let mut acquirer = Provider::new("acquirer");
    acquirer
        .register(Arc::new(LedgerReceptacle::new(
            "card_in",
            acquirer_ledger.clone(),
        )))
        .into_diagnostic()?;
    acquirer
        .register(Arc::new(FeeOperation::new(
            "card_fee",
            Scope::from("eur"),
            dec!(30),
        )))
        .into_diagnostic()?;
    acquirer
        .register(Arc::new(LedgerConnector::new(
            "settle_out",
            acquirer_ledger,
            2,
        )))
        .into_diagnostic()?;

    let mut payout = Provider::new("payout");
    payout
        .register(Arc::new(LedgerReceptacle::new(
            "bank_in",
            payout_ledger.clone(),
        )))
        .into_diagnostic()?;
    payout
        .register(Arc::new(
            ConversionOperation::new(
                "eur_to_usd",
                Scope::from("eur"),
                Scope::from("usd"),
                dec!(1.08),
            )
            .with_spread(dec!(0.005), dec!(0.01)),
        ))
        .into_diagnostic()?;
    payout
        .register(Arc::new(LedgerConnector::new(
            "payout_out",
            payout_ledger,
            2,
        )))
        .into_diagnostic()?;

    Pipeline::with_stages(vec![Stage::new(acquirer), Stage::new(payout)]).into_diagnostic()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("payrail=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    let store: TokenStoreBox = match &cli.db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(db_path) => Box::new(RocksDbTokenStore::open(db_path).into_diagnostic()?),
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => {
            eprintln!(
                "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
            );
            Box::new(InMemoryTokenStore::new())
        }
        None => Box::new(InMemoryTokenStore::new()),
    };

    let pipeline = demo_pipeline()?;

    // Resume a checkpointed token under this key, or mint a fresh one.
    let mut token = match store.load(&cli.token_key).await.into_diagnostic()? {
        Some(token) => token,
        None => {
            let values: BTreeMap<Scope, Decimal> = cli
                .values
                .iter()
                .map(|(scope, amount)| (Scope::from(scope.as_str()), *amount))
                .collect();
            pipeline.create_token(values).await.into_diagnostic()?
        }
    };

    let mut steps = 0;
    while token.status() == TokenStatus::Running {
        if steps >= cli.max_steps {
            store.store(&cli.token_key, &token).await.into_diagnostic()?;
            eprintln!(
                "token still running after {steps} steps; checkpointed as '{}'",
                cli.token_key
            );
            std::process::exit(1);
        }
        steps += 1;

        token = if cli.dry_run {
            pipeline.dry_run(token).await.into_diagnostic()?
        } else {
            pipeline.run(token, false).await.into_diagnostic()?
        };
        store.store(&cli.token_key, &token).await.into_diagnostic()?;

        if let Some(delay) = token.refresh_timer()
            && !cli.dry_run
        {
            tokio::time::sleep(delay).await;
        }
    }

    // Output the cost ledger and final balances.
    let stdout = io::stdout();
    let mut writer = ReportWriter::new(stdout.lock());
    writer.write_costs(&token).into_diagnostic()?;
    writer.write_balances(&token).into_diagnostic()?;

    if token.status() != TokenStatus::Complete {
        match token.error_info() {
            Some(info) => eprintln!(
                "token terminated with status {:?} at {} '{}' (stage {:?}): {}",
                token.status(),
                info.kind,
                info.entity,
                info.stage,
                info.message.as_deref().unwrap_or("no message"),
            ),
            None => eprintln!("token terminated with status {:?}", token.status()),
        }
        std::process::exit(1);
    }

    Ok(())
}
