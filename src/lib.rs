use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{
    fmt::{self, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

pub mod clock;
pub mod config;
pub mod digest;
pub mod layout;
pub mod notifier;
pub mod promoter;
pub mod report;
pub mod scanner;
pub mod scheduler;
pub mod storage;
pub mod store;

use crate::clock::SystemClock;
use crate::config::Config;
use crate::layout::StorageLayout;
use crate::notifier::{DisabledNotifier, Notifier, SmtpNotifier};
use crate::promoter::Promoter;
use crate::scanner::Scanner;
use crate::storage::StorageRoot;
use crate::store::JobStore;

pub fn init_logging() {
    let filter =
        std::env::var("SENTINELLE_LOG").unwrap_or_else(|_| "sentinelle=info,sqlx=warn".to_string());

    // Forward `log` crate records (sqlx, lettre) into the tracing subscriber.
    let _ = tracing_log::LogTracer::init();

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_current_span(false)
        .with_span_list(false);

    let subscriber = tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(stdout_layer);

    let _ = subscriber.try_init();
}

#[derive(Debug, Parser)]
#[command(name = "sentinelle", about = "Backup-monitoring server")]
struct Cli {
    /// Run a single reconciliation pass and exit.
    #[arg(long)]
    once: bool,

    /// Override DATABASE_URL.
    #[arg(long, value_name = "URL")]
    database_url: Option<String>,

    /// Override BACKUP_STORAGE_ROOT.
    #[arg(long, value_name = "PATH")]
    storage_root: Option<PathBuf>,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env().context("load configuration")?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(root) = cli.storage_root {
        config.backup_storage_root = root;
    }
    config.log_effective();

    let pool = store::open_pool(&config.database_url)
        .await
        .context("open database")?;
    store::ensure_schema(&pool)
        .await
        .context("ensure database schema")?;

    let notifier: Arc<dyn Notifier> = match &config.smtp {
        Some(smtp) => match SmtpNotifier::new(smtp) {
            Ok(notifier) => Arc::new(notifier),
            Err(err) => {
                tracing::warn!(
                    target: "sentinelle",
                    event = "notifier_init_failed",
                    error = %err,
                );
                Arc::new(DisabledNotifier::new())
            }
        },
        None => Arc::new(DisabledNotifier::new()),
    };

    let config = Arc::new(config);
    let layout = StorageLayout::new(
        &config.backup_storage_root,
        &config.validated_backups_base_path,
    );
    let staging = StorageRoot::new(&config.backup_storage_root);
    let validated = StorageRoot::new(&config.validated_backups_base_path);
    let promoter = Promoter::new(layout.clone(), staging.clone(), validated);
    let scanner = Arc::new(Scanner::new(
        config.clone(),
        Arc::new(SystemClock),
        JobStore::new(pool),
        staging,
        layout,
        promoter,
        notifier,
    ));

    if cli.once {
        scanner.run_pass().await.context("run reconciliation pass")?;
        return Ok(());
    }

    scheduler::run_ticker(scanner, config.scanner_interval_minutes).await;
    Ok(())
}
