use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc, Weekday};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::layout::AgentId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid database url: {0}")]
    InvalidUrl(String),
    #[error("invalid job definition: {0}")]
    InvalidJob(String),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// Job-level status, mirrored 1:1 from the last entry's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Unknown,
    Ok,
    Failed,
    Missing,
    HashMismatch,
    TransferIntegrityFailed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Unknown => "UNKNOWN",
            JobStatus::Ok => "OK",
            JobStatus::Failed => "FAILED",
            JobStatus::Missing => "MISSING",
            JobStatus::HashMismatch => "HASH_MISMATCH",
            JobStatus::TransferIntegrityFailed => "TRANSFER_INTEGRITY_FAILED",
        }
    }

    fn parse(raw: &str) -> Result<Self, StoreError> {
        Ok(match raw {
            "UNKNOWN" => JobStatus::Unknown,
            "OK" => JobStatus::Ok,
            "FAILED" => JobStatus::Failed,
            "MISSING" => JobStatus::Missing,
            "HASH_MISMATCH" => JobStatus::HashMismatch,
            "TRANSFER_INTEGRITY_FAILED" => JobStatus::TransferIntegrityFailed,
            other => return Err(StoreError::CorruptRow(format!("job status {other:?}"))),
        })
    }
}

/// Status of one scanner decision. `HashMismatch` means content unchanged
/// since the last success; actual digest corruption is
/// `TransferIntegrityFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Success,
    Failed,
    Missing,
    HashMismatch,
    TransferIntegrityFailed,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Success => "SUCCESS",
            EntryStatus::Failed => "FAILED",
            EntryStatus::Missing => "MISSING",
            EntryStatus::HashMismatch => "HASH_MISMATCH",
            EntryStatus::TransferIntegrityFailed => "TRANSFER_INTEGRITY_FAILED",
        }
    }

    fn parse(raw: &str) -> Result<Self, StoreError> {
        Ok(match raw {
            "SUCCESS" => EntryStatus::Success,
            "FAILED" => EntryStatus::Failed,
            "MISSING" => EntryStatus::Missing,
            "HASH_MISMATCH" => EntryStatus::HashMismatch,
            "TRANSFER_INTEGRITY_FAILED" => EntryStatus::TransferIntegrityFailed,
            other => return Err(StoreError::CorruptRow(format!("entry status {other:?}"))),
        })
    }

    /// The job status this decision maps onto.
    pub fn job_status(self) -> JobStatus {
        match self {
            EntryStatus::Success => JobStatus::Ok,
            EntryStatus::Failed => JobStatus::Failed,
            EntryStatus::Missing => JobStatus::Missing,
            EntryStatus::HashMismatch => JobStatus::HashMismatch,
            EntryStatus::TransferIntegrityFailed => JobStatus::TransferIntegrityFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupFrequency {
    Daily,
    Weekly,
    Monthly,
    Hourly,
    Once,
}

impl BackupFrequency {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupFrequency::Daily => "daily",
            BackupFrequency::Weekly => "weekly",
            BackupFrequency::Monthly => "monthly",
            BackupFrequency::Hourly => "hourly",
            BackupFrequency::Once => "once",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        Ok(match raw {
            "daily" => BackupFrequency::Daily,
            "weekly" => BackupFrequency::Weekly,
            "monthly" => BackupFrequency::Monthly,
            "hourly" => BackupFrequency::Hourly,
            "once" => BackupFrequency::Once,
            other => return Err(StoreError::CorruptRow(format!("frequency {other:?}"))),
        })
    }
}

/// One expected backup cycle, as catalogued.
#[derive(Debug, Clone)]
pub struct ExpectedBackupJob {
    pub id: i64,
    pub year: i32,
    pub company_name: String,
    pub city: String,
    pub neighborhood: String,
    pub database_name: String,
    pub expected_hour_utc: u32,
    pub expected_minute_utc: u32,
    pub expected_frequency: BackupFrequency,
    pub days_of_week: String,
    pub final_storage_template: Option<String>,
    pub is_active: bool,
    pub current_status: JobStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_successful_at: Option<DateTime<Utc>>,
    pub previous_successful_hash: Option<String>,
}

impl ExpectedBackupJob {
    pub fn agent_id(&self) -> AgentId {
        AgentId {
            company: self.company_name.to_lowercase(),
            city: self.city.to_lowercase(),
            neighborhood: self.neighborhood.to_lowercase(),
        }
    }

    /// Whether a cycle is expected on the given weekday. An unparseable
    /// stored day list is treated as every-day so a catalogue typo never
    /// silences MISSING detection.
    pub fn expected_on(&self, day: Weekday) -> bool {
        match crate::config::parse_days_of_week(&self.days_of_week) {
            Ok(days) => days.contains(&day),
            Err(_) => {
                tracing::warn!(
                    target: "sentinelle",
                    event = "job_days_of_week_unparseable",
                    job_id = self.id,
                    days_of_week = %self.days_of_week,
                );
                true
            }
        }
    }
}

/// Fields for a job about to be catalogued.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewJob {
    pub year: i32,
    pub company_name: String,
    pub city: String,
    pub neighborhood: String,
    pub database_name: String,
    pub expected_hour_utc: u32,
    pub expected_minute_utc: u32,
    #[serde(default = "default_frequency")]
    pub expected_frequency: String,
    #[serde(default = "default_days_of_week")]
    pub days_of_week: String,
    #[serde(default)]
    pub final_storage_template: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_frequency() -> String {
    "daily".to_string()
}

fn default_days_of_week() -> String {
    "MO,TU,WE,TH,FR,SA".to_string()
}

fn default_true() -> bool {
    true
}

/// Immutable history record of one scanner decision.
#[derive(Debug, Clone)]
pub struct BackupEntry {
    pub id: i64,
    pub expected_job_id: i64,
    pub timestamp: DateTime<Utc>,
    pub status: EntryStatus,
    pub message: String,
    pub operation_log_file_name: Option<String>,
    pub agent_id: Option<String>,
    pub agent_overall_status: Option<String>,
    pub agent_backup_status: Option<bool>,
    pub agent_backup_start_time: Option<String>,
    pub agent_backup_end_time: Option<String>,
    pub agent_backup_hash_pre_compress: Option<String>,
    pub agent_backup_size_pre_compress: Option<i64>,
    pub agent_compress_status: Option<bool>,
    pub agent_compress_start_time: Option<String>,
    pub agent_compress_end_time: Option<String>,
    pub agent_compress_hash: Option<String>,
    pub agent_compress_size: Option<i64>,
    pub agent_transfer_status: Option<bool>,
    pub agent_transfer_start_time: Option<String>,
    pub agent_transfer_end_time: Option<String>,
    pub agent_transfer_error_message: Option<String>,
    pub agent_staged_file_name: Option<String>,
    pub agent_logs_summary: Option<String>,
    pub server_calculated_hash: Option<String>,
    pub server_calculated_size: Option<i64>,
    pub previous_successful_hash_global: Option<String>,
    pub hash_comparison_result: Option<bool>,
}

/// Entry payload before insertion; the id is allocated by the store.
#[derive(Debug, Clone, Default)]
pub struct NewBackupEntry {
    pub status_message: String,
    pub operation_log_file_name: Option<String>,
    pub agent_id: Option<String>,
    pub agent_overall_status: Option<String>,
    pub agent_backup_status: Option<bool>,
    pub agent_backup_start_time: Option<String>,
    pub agent_backup_end_time: Option<String>,
    pub agent_backup_hash_pre_compress: Option<String>,
    pub agent_backup_size_pre_compress: Option<i64>,
    pub agent_compress_status: Option<bool>,
    pub agent_compress_start_time: Option<String>,
    pub agent_compress_end_time: Option<String>,
    pub agent_compress_hash: Option<String>,
    pub agent_compress_size: Option<i64>,
    pub agent_transfer_status: Option<bool>,
    pub agent_transfer_start_time: Option<String>,
    pub agent_transfer_end_time: Option<String>,
    pub agent_transfer_error_message: Option<String>,
    pub agent_staged_file_name: Option<String>,
    pub agent_logs_summary: Option<String>,
    pub server_calculated_hash: Option<String>,
    pub server_calculated_size: Option<i64>,
    pub hash_comparison_result: Option<bool>,
}

const SCHEMA_SQL: &str = "\
CREATE TABLE IF NOT EXISTS expected_backup_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    year INTEGER NOT NULL,
    company_name TEXT NOT NULL,
    city TEXT NOT NULL,
    neighborhood TEXT NOT NULL,
    database_name TEXT NOT NULL,
    expected_hour_utc INTEGER NOT NULL CHECK (expected_hour_utc BETWEEN 0 AND 23),
    expected_minute_utc INTEGER NOT NULL CHECK (expected_minute_utc BETWEEN 0 AND 59),
    expected_frequency TEXT NOT NULL DEFAULT 'daily',
    days_of_week TEXT NOT NULL DEFAULT 'MO,TU,WE,TH,FR,SA',
    final_storage_template TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    current_status TEXT NOT NULL DEFAULT 'UNKNOWN',
    last_checked_at TEXT,
    last_successful_at TEXT,
    previous_successful_hash TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (year, company_name, city, database_name, expected_hour_utc, expected_minute_utc)
);
CREATE TABLE IF NOT EXISTS backup_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    expected_job_id INTEGER NOT NULL
        REFERENCES expected_backup_jobs(id) ON DELETE CASCADE,
    timestamp TEXT NOT NULL,
    status TEXT NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    operation_log_file_name TEXT,
    agent_id TEXT,
    agent_overall_status TEXT,
    agent_backup_status INTEGER,
    agent_backup_start_time TEXT,
    agent_backup_end_time TEXT,
    agent_backup_hash_pre_compress TEXT,
    agent_backup_size_pre_compress INTEGER,
    agent_compress_status INTEGER,
    agent_compress_start_time TEXT,
    agent_compress_end_time TEXT,
    agent_compress_hash TEXT,
    agent_compress_size INTEGER,
    agent_transfer_status INTEGER,
    agent_transfer_start_time TEXT,
    agent_transfer_end_time TEXT,
    agent_transfer_error_message TEXT,
    agent_staged_file_name TEXT,
    agent_logs_summary TEXT,
    server_calculated_hash TEXT,
    server_calculated_size INTEGER,
    previous_successful_hash_global TEXT,
    hash_comparison_result INTEGER,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_backup_entries_job_ts
    ON backup_entries(expected_job_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_expected_jobs_active
    ON expected_backup_jobs(is_active);
";

/// Open the SQLite pool with the pragmas the server relies on.
pub async fn open_pool(database_url: &str) -> Result<SqlitePool, StoreError> {
    let opts = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| StoreError::InvalidUrl(format!("{database_url}: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys=ON;")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("PRAGMA busy_timeout = 5000;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(opts)
        .await?;

    log_effective_pragmas(&pool).await;
    Ok(pool)
}

async fn log_effective_pragmas(pool: &SqlitePool) {
    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));
    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));
    let fks: (i64,) = sqlx::query_as("PRAGMA foreign_keys;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    tracing::info!(
        target: "sentinelle",
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        foreign_keys = fks.0,
    );
    if !jm.0.eq_ignore_ascii_case("wal") {
        tracing::warn!(
            target: "sentinelle",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
}

pub async fn ensure_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    for statement in SCHEMA_SQL.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn to_db_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn from_db_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow(format!("timestamp {raw:?}: {e}")))
}

fn opt_time(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    let raw: Option<String> = row.try_get(column).map_err(StoreError::Database)?;
    raw.as_deref().map(from_db_time).transpose()
}

fn job_from_row(row: &SqliteRow) -> Result<ExpectedBackupJob, StoreError> {
    let frequency: String = row.try_get("expected_frequency")?;
    let status: String = row.try_get("current_status")?;
    Ok(ExpectedBackupJob {
        id: row.try_get("id")?,
        year: row.try_get("year")?,
        company_name: row.try_get("company_name")?,
        city: row.try_get("city")?,
        neighborhood: row.try_get("neighborhood")?,
        database_name: row.try_get("database_name")?,
        expected_hour_utc: row.try_get::<i64, _>("expected_hour_utc")? as u32,
        expected_minute_utc: row.try_get::<i64, _>("expected_minute_utc")? as u32,
        expected_frequency: BackupFrequency::parse(&frequency)?,
        days_of_week: row.try_get("days_of_week")?,
        final_storage_template: row.try_get("final_storage_template")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        current_status: JobStatus::parse(&status)?,
        last_checked_at: opt_time(row, "last_checked_at")?,
        last_successful_at: opt_time(row, "last_successful_at")?,
        previous_successful_hash: row.try_get("previous_successful_hash")?,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<BackupEntry, StoreError> {
    let status: String = row.try_get("status")?;
    let opt_bool = |column: &str| -> Result<Option<bool>, sqlx::Error> {
        Ok(row
            .try_get::<Option<i64>, _>(column)?
            .map(|v| v != 0))
    };
    let raw_ts: String = row.try_get("timestamp")?;
    Ok(BackupEntry {
        id: row.try_get("id")?,
        expected_job_id: row.try_get("expected_job_id")?,
        timestamp: from_db_time(&raw_ts)?,
        status: EntryStatus::parse(&status)?,
        message: row.try_get("message")?,
        operation_log_file_name: row.try_get("operation_log_file_name")?,
        agent_id: row.try_get("agent_id")?,
        agent_overall_status: row.try_get("agent_overall_status")?,
        agent_backup_status: opt_bool("agent_backup_status")?,
        agent_backup_start_time: row.try_get("agent_backup_start_time")?,
        agent_backup_end_time: row.try_get("agent_backup_end_time")?,
        agent_backup_hash_pre_compress: row.try_get("agent_backup_hash_pre_compress")?,
        agent_backup_size_pre_compress: row.try_get("agent_backup_size_pre_compress")?,
        agent_compress_status: opt_bool("agent_compress_status")?,
        agent_compress_start_time: row.try_get("agent_compress_start_time")?,
        agent_compress_end_time: row.try_get("agent_compress_end_time")?,
        agent_compress_hash: row.try_get("agent_compress_hash")?,
        agent_compress_size: row.try_get("agent_compress_size")?,
        agent_transfer_status: opt_bool("agent_transfer_status")?,
        agent_transfer_start_time: row.try_get("agent_transfer_start_time")?,
        agent_transfer_end_time: row.try_get("agent_transfer_end_time")?,
        agent_transfer_error_message: row.try_get("agent_transfer_error_message")?,
        agent_staged_file_name: row.try_get("agent_staged_file_name")?,
        agent_logs_summary: row.try_get("agent_logs_summary")?,
        server_calculated_hash: row.try_get("server_calculated_hash")?,
        server_calculated_size: row.try_get("server_calculated_size")?,
        previous_successful_hash_global: row.try_get("previous_successful_hash_global")?,
        hash_comparison_result: opt_bool("hash_comparison_result")?,
    })
}

/// Transactional access to the job catalogue and its history.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn active_jobs(&self) -> Result<Vec<ExpectedBackupJob>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM expected_backup_jobs WHERE is_active = 1
             ORDER BY company_name, city, neighborhood, database_name, expected_hour_utc",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn job_by_id(&self, id: i64) -> Result<Option<ExpectedBackupJob>, StoreError> {
        let row = sqlx::query("SELECT * FROM expected_backup_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Active jobs for one site+database. Several cycles may share the pair.
    pub async fn find_job_by_agent_db(
        &self,
        agent: &AgentId,
        database_name: &str,
    ) -> Result<Vec<ExpectedBackupJob>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM expected_backup_jobs
             WHERE lower(company_name) = ?1 AND lower(city) = ?2
               AND lower(neighborhood) = ?3 AND database_name = ?4 AND is_active = 1
             ORDER BY expected_hour_utc, expected_minute_utc",
        )
        .bind(&agent.company)
        .bind(&agent.city)
        .bind(&agent.neighborhood)
        .bind(database_name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// True when any entry for the job was decided at or after `since`.
    pub async fn has_entry_since(
        &self,
        job_id: i64,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM backup_entries
             WHERE expected_job_id = ?1 AND timestamp >= ?2",
        )
        .bind(job_id)
        .bind(to_db_time(since))
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn entries_for_job(&self, job_id: i64) -> Result<Vec<BackupEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM backup_entries WHERE expected_job_id = ?1
             ORDER BY timestamp, id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Insert a catalogue row; `Ok(None)` when the uniqueness constraint
    /// already holds an identical cycle.
    pub async fn insert_job(
        &self,
        job: &NewJob,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError> {
        BackupFrequency::parse(&job.expected_frequency).map_err(|_| {
            StoreError::InvalidJob(format!(
                "unknown frequency {:?}",
                job.expected_frequency
            ))
        })?;
        let now = to_db_time(now);
        let result = sqlx::query(
            "INSERT OR IGNORE INTO expected_backup_jobs
             (year, company_name, city, neighborhood, database_name,
              expected_hour_utc, expected_minute_utc, expected_frequency,
              days_of_week, final_storage_template, is_active,
              current_status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'UNKNOWN', ?12, ?12)",
        )
        .bind(job.year)
        .bind(job.company_name.to_lowercase())
        .bind(job.city.to_lowercase())
        .bind(job.neighborhood.to_lowercase())
        .bind(&job.database_name)
        .bind(job.expected_hour_utc)
        .bind(job.expected_minute_utc)
        .bind(&job.expected_frequency)
        .bind(&job.days_of_week)
        .bind(&job.final_storage_template)
        .bind(job.is_active)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            Ok(None)
        } else {
            Ok(Some(result.last_insert_rowid()))
        }
    }

    /// Append the decision entry and patch the job in one transaction.
    /// `previous_successful_hash` advances only on SUCCESS; the entry keeps
    /// the pre-decision hash as its comparison snapshot.
    pub async fn record_decision(
        &self,
        job: &ExpectedBackupJob,
        status: EntryStatus,
        decided_at: DateTime<Utc>,
        entry: &NewBackupEntry,
    ) -> Result<BackupEntry, StoreError> {
        let mut tx = self.pool.begin().await?;
        let decided = to_db_time(decided_at);

        let inserted = sqlx::query(
            "INSERT INTO backup_entries
             (expected_job_id, timestamp, status, message,
              operation_log_file_name, agent_id, agent_overall_status,
              agent_backup_status, agent_backup_start_time, agent_backup_end_time,
              agent_backup_hash_pre_compress, agent_backup_size_pre_compress,
              agent_compress_status, agent_compress_start_time, agent_compress_end_time,
              agent_compress_hash, agent_compress_size,
              agent_transfer_status, agent_transfer_start_time, agent_transfer_end_time,
              agent_transfer_error_message, agent_staged_file_name, agent_logs_summary,
              server_calculated_hash, server_calculated_size,
              previous_successful_hash_global, hash_comparison_result, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?2)",
        )
        .bind(job.id)
        .bind(&decided)
        .bind(status.as_str())
        .bind(&entry.status_message)
        .bind(&entry.operation_log_file_name)
        .bind(&entry.agent_id)
        .bind(&entry.agent_overall_status)
        .bind(entry.agent_backup_status)
        .bind(&entry.agent_backup_start_time)
        .bind(&entry.agent_backup_end_time)
        .bind(&entry.agent_backup_hash_pre_compress)
        .bind(entry.agent_backup_size_pre_compress)
        .bind(entry.agent_compress_status)
        .bind(&entry.agent_compress_start_time)
        .bind(&entry.agent_compress_end_time)
        .bind(&entry.agent_compress_hash)
        .bind(entry.agent_compress_size)
        .bind(entry.agent_transfer_status)
        .bind(&entry.agent_transfer_start_time)
        .bind(&entry.agent_transfer_end_time)
        .bind(&entry.agent_transfer_error_message)
        .bind(&entry.agent_staged_file_name)
        .bind(&entry.agent_logs_summary)
        .bind(&entry.server_calculated_hash)
        .bind(entry.server_calculated_size)
        .bind(&job.previous_successful_hash)
        .bind(entry.hash_comparison_result)
        .execute(&mut *tx)
        .await?;
        let entry_id = inserted.last_insert_rowid();

        if status == EntryStatus::Success {
            sqlx::query(
                "UPDATE expected_backup_jobs
                 SET current_status = ?1, last_checked_at = ?2, updated_at = ?2,
                     last_successful_at = ?2, previous_successful_hash = ?3
                 WHERE id = ?4",
            )
            .bind(status.job_status().as_str())
            .bind(&decided)
            .bind(&entry.server_calculated_hash)
            .bind(job.id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE expected_backup_jobs
                 SET current_status = ?1, last_checked_at = ?2, updated_at = ?2
                 WHERE id = ?3",
            )
            .bind(status.job_status().as_str())
            .bind(&decided)
            .bind(job.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::info!(
            target: "sentinelle",
            event = "decision_recorded",
            job_id = job.id,
            entry_id,
            status = status.as_str(),
        );
        Ok(BackupEntry {
            id: entry_id,
            expected_job_id: job.id,
            timestamp: decided_at,
            status,
            message: entry.status_message.clone(),
            operation_log_file_name: entry.operation_log_file_name.clone(),
            agent_id: entry.agent_id.clone(),
            agent_overall_status: entry.agent_overall_status.clone(),
            agent_backup_status: entry.agent_backup_status,
            agent_backup_start_time: entry.agent_backup_start_time.clone(),
            agent_backup_end_time: entry.agent_backup_end_time.clone(),
            agent_backup_hash_pre_compress: entry.agent_backup_hash_pre_compress.clone(),
            agent_backup_size_pre_compress: entry.agent_backup_size_pre_compress,
            agent_compress_status: entry.agent_compress_status,
            agent_compress_start_time: entry.agent_compress_start_time.clone(),
            agent_compress_end_time: entry.agent_compress_end_time.clone(),
            agent_compress_hash: entry.agent_compress_hash.clone(),
            agent_compress_size: entry.agent_compress_size,
            agent_transfer_status: entry.agent_transfer_status,
            agent_transfer_start_time: entry.agent_transfer_start_time.clone(),
            agent_transfer_end_time: entry.agent_transfer_end_time.clone(),
            agent_transfer_error_message: entry.agent_transfer_error_message.clone(),
            agent_staged_file_name: entry.agent_staged_file_name.clone(),
            agent_logs_summary: entry.agent_logs_summary.clone(),
            server_calculated_hash: entry.server_calculated_hash.clone(),
            server_calculated_size: entry.server_calculated_size,
            previous_successful_hash_global: job.previous_successful_hash.clone(),
            hash_comparison_result: entry.hash_comparison_result,
        })
    }
}

#[cfg(test)]
pub(crate) fn test_job(
    company: &str,
    city: &str,
    neighborhood: &str,
    database: &str,
    hour: u32,
    minute: u32,
) -> ExpectedBackupJob {
    ExpectedBackupJob {
        id: 1,
        year: 2025,
        company_name: company.to_string(),
        city: city.to_string(),
        neighborhood: neighborhood.to_string(),
        database_name: database.to_string(),
        expected_hour_utc: hour,
        expected_minute_utc: minute,
        expected_frequency: BackupFrequency::Daily,
        days_of_week: "MO,TU,WE,TH,FR,SA,SU".to_string(),
        final_storage_template: None,
        is_active: true,
        current_status: JobStatus::Unknown,
        last_checked_at: None,
        last_successful_at: None,
        previous_successful_hash: None,
    }
}
