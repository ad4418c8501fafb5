#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tempfile::TempDir;

use sentinelle::clock::FixedClock;
use sentinelle::config::Config;
use sentinelle::layout::StorageLayout;
use sentinelle::notifier::{Notifier, NotifyError};
use sentinelle::promoter::Promoter;
use sentinelle::scanner::Scanner;
use sentinelle::storage::StorageRoot;
use sentinelle::store::{self, BackupEntry, ExpectedBackupJob, JobStore, NewJob};

pub async fn temp_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    store::ensure_schema(&pool).await.unwrap();
    pool
}

/// Notifier that records every (job id, entry status) it is handed.
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<(i64, String)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        job: &ExpectedBackupJob,
        entry: &BackupEntry,
    ) -> Result<(), NotifyError> {
        self.events
            .lock()
            .unwrap()
            .push((job.id, entry.status.as_str().to_string()));
        Ok(())
    }
}

/// A staging tree, a validated tree, and a scanner wired to a pinned clock.
pub struct Harness {
    pub dir: TempDir,
    pub storage_root: PathBuf,
    pub validated_root: PathBuf,
    pub store: JobStore,
    pub notifier: Arc<RecordingNotifier>,
    pub scanner: Scanner,
}

pub async fn harness(now: DateTime<Utc>) -> Harness {
    let dir = TempDir::new().unwrap();
    let storage_root = dir.path().join("backups");
    let validated_root = dir.path().join("validated");
    fs::create_dir_all(&storage_root).unwrap();
    fs::create_dir_all(&validated_root).unwrap();

    let config = Arc::new(Config {
        database_url: "sqlite::memory:".into(),
        backup_storage_root: storage_root.clone(),
        validated_backups_base_path: validated_root.clone(),
        scanner_interval_minutes: 15,
        report_collection_window_minutes: 60,
        max_report_age_days: 1,
        expected_backup_days_of_week: sentinelle::config::parse_days_of_week(
            "MO,TU,WE,TH,FR,SA,SU",
        )
        .unwrap(),
        smtp: None,
    });

    let pool = temp_pool().await;
    let store = JobStore::new(pool);
    let layout = StorageLayout::new(&storage_root, &validated_root);
    let staging = StorageRoot::new(&storage_root);
    let validated = StorageRoot::new(&validated_root);
    let promoter = Promoter::new(layout.clone(), staging.clone(), validated);
    let notifier = Arc::new(RecordingNotifier::default());

    let scanner = Scanner::new(
        config,
        Arc::new(FixedClock(now)),
        store.clone(),
        staging,
        layout,
        promoter,
        notifier.clone(),
    );

    Harness {
        dir,
        storage_root,
        validated_root,
        store,
        notifier,
        scanner,
    }
}

impl Harness {
    /// Replace the scanner with one reading a different instant; state and
    /// filesystem are shared.
    pub fn at(&self, now: DateTime<Utc>) -> Scanner {
        let config = Arc::new(Config {
            database_url: "sqlite::memory:".into(),
            backup_storage_root: self.storage_root.clone(),
            validated_backups_base_path: self.validated_root.clone(),
            scanner_interval_minutes: 15,
            report_collection_window_minutes: 60,
            max_report_age_days: 1,
            expected_backup_days_of_week: sentinelle::config::parse_days_of_week(
                "MO,TU,WE,TH,FR,SA,SU",
            )
            .unwrap(),
            smtp: None,
        });
        let layout = StorageLayout::new(&self.storage_root, &self.validated_root);
        let staging = StorageRoot::new(&self.storage_root);
        let validated = StorageRoot::new(&self.validated_root);
        let promoter = Promoter::new(layout.clone(), staging.clone(), validated);
        Scanner::new(
            config,
            Arc::new(FixedClock(now)),
            self.store.clone(),
            staging,
            layout,
            promoter,
            self.notifier.clone(),
        )
    }

    pub fn write_staged(&self, agent: &str, file: &str, content: &[u8]) -> PathBuf {
        let path = self
            .storage_root
            .join(agent)
            .join("database")
            .join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    pub fn write_report(&self, agent: &str, file_name: &str, doc: &Value) -> PathBuf {
        let path = self.storage_root.join(agent).join("log").join(file_name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, doc.to_string()).unwrap();
        path
    }

    pub fn archived_path(&self, agent: &str, file_name: &str) -> PathBuf {
        self.storage_root
            .join(agent)
            .join("log")
            .join("_archive")
            .join(file_name)
    }

    pub async fn seed_job(&self, database: &str, hour: u32, minute: u32) -> ExpectedBackupJob {
        let seeded_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let id = self
            .store
            .insert_job(
                &NewJob {
                    year: 2025,
                    company_name: "acme".into(),
                    city: "paris".into(),
                    neighborhood: "nord".into(),
                    database_name: database.into(),
                    expected_hour_utc: hour,
                    expected_minute_utc: minute,
                    expected_frequency: "daily".into(),
                    days_of_week: "MO,TU,WE,TH,FR,SA,SU".into(),
                    final_storage_template: None,
                    is_active: true,
                },
                seeded_at,
            )
            .await
            .unwrap()
            .expect("job inserted");
        self.store.job_by_id(id).await.unwrap().unwrap()
    }
}

pub fn sha256_hex(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

pub fn fixed_now() -> DateTime<Utc> {
    // 2025-01-15 is a Wednesday.
    Utc.with_ymd_and_hms(2025, 1, 15, 13, 30, 0).unwrap()
}

/// An all-stages-ok report for one database.
pub fn success_report(
    agent_id: &str,
    db: &str,
    end_time: &str,
    sha256: &str,
    size: i64,
    staged_file_name: &str,
) -> Value {
    json!({
        "operation_start_time": "2025-01-15T13:00:00Z",
        "operation_end_time": end_time,
        "agent_id": agent_id,
        "overall_status": "completed",
        "databases": {
            db: {
                "BACKUP": {
                    "status": true,
                    "start_time": "2025-01-15T13:00:00Z",
                    "end_time": "2025-01-15T13:04:00Z"
                },
                "COMPRESS": {
                    "status": true,
                    "start_time": "2025-01-15T13:04:00Z",
                    "end_time": "2025-01-15T13:06:00Z",
                    "sha256_checksum": sha256,
                    "size": size
                },
                "TRANSFER": {
                    "status": true,
                    "start_time": "2025-01-15T13:06:00Z",
                    "end_time": "2025-01-15T13:09:00Z"
                },
                "staged_file_name": staged_file_name,
                "logs_summary": "all stages completed"
            }
        }
    })
}

