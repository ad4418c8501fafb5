#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use sentinelle::clock::{Clock, SystemClock};
use sentinelle::store::{self, JobStore, NewJob};

/// One-shot catalogue loader: reads a JSON array of expected-job definitions
/// and inserts them, skipping cycles that already exist.
#[derive(Parser)]
#[command(name = "seed_jobs", about = "Load expected backup jobs from a JSON file")]
struct Cli {
    /// JSON file containing an array of job definitions.
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Database to seed; falls back to DATABASE_URL.
    #[arg(long, value_name = "URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    sentinelle::init_logging();
    let cli = Cli::parse();

    let database_url = match cli.database_url {
        Some(url) => url,
        None => std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/sentinelle.sqlite3".to_string()),
    };

    let raw = std::fs::read_to_string(&cli.input)
        .with_context(|| format!("read {}", cli.input.display()))?;
    let jobs: Vec<NewJob> =
        serde_json::from_str(&raw).context("parse job definitions (expected a JSON array)")?;

    let pool = store::open_pool(&database_url).await.context("open database")?;
    store::ensure_schema(&pool).await.context("ensure schema")?;
    let store = JobStore::new(pool);

    let mut created = 0_usize;
    let mut skipped = 0_usize;
    for job in &jobs {
        if job.expected_hour_utc > 23 || job.expected_minute_utc > 59 {
            println!(
                "SKIP  {}/{} ({}): expected time {:02}:{:02} out of range",
                job.company_name,
                job.city,
                job.database_name,
                job.expected_hour_utc,
                job.expected_minute_utc
            );
            skipped += 1;
            continue;
        }
        match store.insert_job(job, SystemClock.now_utc()).await {
            Ok(Some(id)) => {
                created += 1;
                println!(
                    "OK    {}_{}_{} {} @ {:02}:{:02} UTC -> job {}",
                    job.company_name.to_lowercase(),
                    job.city.to_lowercase(),
                    job.neighborhood.to_lowercase(),
                    job.database_name,
                    job.expected_hour_utc,
                    job.expected_minute_utc,
                    id
                );
            }
            Ok(None) => {
                skipped += 1;
                println!(
                    "SKIP  {}_{}_{} {} @ {:02}:{:02} UTC (already catalogued)",
                    job.company_name.to_lowercase(),
                    job.city.to_lowercase(),
                    job.neighborhood.to_lowercase(),
                    job.database_name,
                    job.expected_hour_utc,
                    job.expected_minute_utc
                );
            }
            Err(err) => {
                anyhow::bail!(
                    "insert {}/{}: {err}",
                    job.company_name,
                    job.database_name
                );
            }
        }
    }

    println!("{created} job(s) created, {skipped} skipped, {} total", jobs.len());
    Ok(())
}
