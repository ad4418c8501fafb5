use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use thiserror::Error;

use crate::clock::Clock;
use crate::config::Config;
use crate::digest;
use crate::layout::{self, AgentId, StorageLayout, LOG_DIR_NAME};
use crate::notifier::Notifier;
use crate::promoter::Promoter;
use crate::report::{self, DatabaseReport, OverallStatus};
use crate::storage::{FsError, StorageRoot};
use crate::store::{
    EntryStatus, ExpectedBackupJob, JobStore, NewBackupEntry, StoreError,
};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fs(#[from] FsError),
}

/// Best report seen this pass for one (agent, database) key.
#[derive(Debug, Clone)]
struct RelevantReport {
    file_name: String,
    agent: AgentId,
    agent_id: String,
    overall_status: OverallStatus,
    end_time: DateTime<Utc>,
    db: DatabaseReport,
}

/// Counters for one reconciliation pass, logged as a single summary event.
#[derive(Debug, Default, Clone)]
pub struct PassSummary {
    pub agent_dirs: u64,
    pub unrecognized_dirs: u64,
    pub reports_seen: u64,
    pub reports_rejected: u64,
    pub entries_appended: u64,
    pub missing_appended: u64,
    pub promoted: u64,
    pub archived: u64,
    pub archive_failures: u64,
    pub duration_ms: u64,
}

/// Outcome of the integrity decision tree for one (job, report) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Decision {
    status: EntryStatus,
    message: String,
    server_hash: Option<String>,
    server_size: Option<i64>,
    hash_comparison_result: Option<bool>,
}

/// What the staged artifact looked like when probed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StagedProbe {
    Missing,
    Unreadable(String),
    Present { hash: String, size: i64 },
}

pub struct Scanner {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    store: JobStore,
    storage: StorageRoot,
    layout: StorageLayout,
    promoter: Promoter,
    notifier: Arc<dyn Notifier>,
    cancel: Arc<AtomicBool>,
}

impl Scanner {
    pub fn new(
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        store: JobStore,
        storage: StorageRoot,
        layout: StorageLayout,
        promoter: Promoter,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            clock,
            store,
            storage,
            layout,
            promoter,
            notifier,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// One-way cancellation: aborts the in-flight pass at the next loop
    /// boundary and keeps any future pass from starting work.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn window(&self) -> Duration {
        Duration::minutes(self.config.report_collection_window_minutes)
    }

    /// One full reconciliation pass: Collect, Evaluate, Archive.
    pub async fn run_pass(&self) -> Result<PassSummary, ScanError> {
        let started = std::time::Instant::now();
        let now = self.clock.now_utc();
        let mut summary = PassSummary::default();

        let (relevant, to_archive) = self.collect(now, &mut summary).await?;
        self.evaluate(now, &relevant, &mut summary).await?;
        self.archive(&to_archive, &mut summary);

        summary.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            target: "sentinelle",
            event = "scan_pass_completed",
            agent_dirs = summary.agent_dirs,
            unrecognized_dirs = summary.unrecognized_dirs,
            reports_seen = summary.reports_seen,
            reports_rejected = summary.reports_rejected,
            entries_appended = summary.entries_appended,
            missing_appended = summary.missing_appended,
            promoted = summary.promoted,
            archived = summary.archived,
            archive_failures = summary.archive_failures,
            duration_ms = summary.duration_ms,
            cancelled = self.cancelled(),
        );
        Ok(summary)
    }

    /// Phase 1: walk agent directories, queue every recognized report for
    /// archival, keep the freshest valid report per (agent, database).
    async fn collect(
        &self,
        now: DateTime<Utc>,
        summary: &mut PassSummary,
    ) -> Result<(HashMap<(String, String), RelevantReport>, BTreeSet<PathBuf>), ScanError> {
        let mut relevant: HashMap<(String, String), RelevantReport> = HashMap::new();
        let mut to_archive: BTreeSet<PathBuf> = BTreeSet::new();

        let root = self.layout.storage_root().to_path_buf();
        if !self.storage.exists(&root)? {
            tracing::warn!(
                target: "sentinelle",
                event = "storage_root_missing",
                path = %root.display(),
            );
            return Ok((relevant, to_archive));
        }

        for agent_dir in self.storage.list_dirs(&root)? {
            if self.cancelled() {
                break;
            }
            let Some(dir_name) = agent_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            summary.agent_dirs += 1;

            let log_dir = agent_dir.join(LOG_DIR_NAME);
            let agent = match AgentId::parse(dir_name) {
                Ok(agent) => agent,
                Err(_) => {
                    // Unrecognized deposit: nothing in it is ever parsed, but
                    // its stray reports are still consumed.
                    summary.unrecognized_dirs += 1;
                    tracing::warn!(
                        target: "sentinelle",
                        event = "agent_dir_unrecognized",
                        dir = dir_name,
                    );
                    for file in self.list_log_files(&log_dir) {
                        if has_json_extension(&file) {
                            to_archive.insert(file);
                        }
                    }
                    continue;
                }
            };

            for file in self.list_log_files(&log_dir) {
                let Some(file_name) = file.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !layout::is_report_file_name(file_name) {
                    continue;
                }
                summary.reports_seen += 1;
                // Processed files never persist in log/, valid or not.
                to_archive.insert(file.clone());

                let parsed = report::load_report(
                    &file,
                    &agent,
                    now,
                    self.config.max_report_age_days,
                );
                let parsed = match parsed {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        summary.reports_rejected += 1;
                        tracing::warn!(
                            target: "sentinelle",
                            event = "report_rejected",
                            path = %file.display(),
                            error = %err,
                        );
                        continue;
                    }
                };
                let reported_agent_id = parsed.agent_id;
                let overall_status = parsed.overall_status;
                let end_time = parsed.operation_end_time;

                for (db_name, db) in parsed.databases {
                    let key = (agent.canonical(), db_name);
                    let candidate = RelevantReport {
                        file_name: file_name.to_string(),
                        agent: agent.clone(),
                        agent_id: reported_agent_id.clone(),
                        overall_status,
                        end_time,
                        db,
                    };
                    match relevant.get(&key) {
                        Some(existing) if existing.end_time >= candidate.end_time => {}
                        _ => {
                            relevant.insert(key, candidate);
                        }
                    }
                }
            }
        }

        Ok((relevant, to_archive))
    }

    /// A log directory that cannot be listed costs this agent one pass, not
    /// the whole scan.
    fn list_log_files(&self, log_dir: &std::path::Path) -> Vec<PathBuf> {
        match self.storage.list_files(log_dir) {
            Ok(files) => files,
            Err(err) => {
                tracing::warn!(
                    target: "sentinelle",
                    event = "log_dir_unreadable",
                    path = %log_dir.display(),
                    error = %err,
                );
                Vec::new()
            }
        }
    }

    /// Phase 2: reconcile every active job against the collected reports.
    async fn evaluate(
        &self,
        now: DateTime<Utc>,
        relevant: &HashMap<(String, String), RelevantReport>,
        summary: &mut PassSummary,
    ) -> Result<(), ScanError> {
        let jobs = self.store.active_jobs().await?;
        for job in jobs {
            if self.cancelled() {
                break;
            }
            let key = (job.agent_id().canonical(), job.database_name.clone());
            match relevant.get(&key) {
                Some(rel) if self.is_relevant_for_job(rel.end_time, &job) => {
                    self.evaluate_with_report(now, &job, rel, summary).await?;
                }
                _ => {
                    // An irrelevant report must not mark a different cycle.
                    self.deadline_check(now, &job, summary).await?;
                }
            }
        }
        Ok(())
    }

    /// `operation_end_time` counts for the cycle anchored at the job's
    /// expected time on the report's own date, within ±W inclusive.
    fn is_relevant_for_job(&self, end_time: DateTime<Utc>, job: &ExpectedBackupJob) -> bool {
        let Some(expected) = expected_datetime(end_time, job) else {
            return false;
        };
        let offset = end_time.signed_duration_since(expected);
        -self.window() <= offset && offset <= self.window()
    }

    async fn evaluate_with_report(
        &self,
        now: DateTime<Utc>,
        job: &ExpectedBackupJob,
        rel: &RelevantReport,
        summary: &mut PassSummary,
    ) -> Result<(), ScanError> {
        // The staged name was validated at report parse; a resolution failure
        // here is treated as an unverifiable artifact.
        let (staged, probe) =
            match self.layout.staging_path(&rel.agent, &rel.db.staged_file_name) {
                Ok(path) => {
                    let probe = self.probe_staged(&path).await;
                    (Some(path), probe)
                }
                Err(err) => (None, StagedProbe::Unreadable(err.to_string())),
            };
        let mut decision = integrity_decision(job, &rel.db, &probe);

        if decision.status == EntryStatus::Success {
            // Success implies the staged path resolved and was readable.
            if let Some(staged) = &staged {
                match self.promoter.promote(staged, job, &rel.db.staged_file_name) {
                    Ok(_) => summary.promoted += 1,
                    Err(err) => {
                        tracing::error!(
                            target: "sentinelle",
                            event = "promotion_failed",
                            job_id = job.id,
                            error = %err,
                        );
                        decision.status = EntryStatus::Failed;
                        decision.message =
                            format!("{} / promotion failed: {err}", decision.message);
                    }
                }
            }
        }

        let entry = new_entry_from_report(rel, &decision);
        let recorded = self
            .store
            .record_decision(job, decision.status, now, &entry)
            .await?;
        summary.entries_appended += 1;

        if recorded.status != EntryStatus::Success {
            if let Err(err) = self.notifier.notify(job, &recorded).await {
                tracing::warn!(
                    target: "sentinelle",
                    event = "notification_failed",
                    job_id = job.id,
                    error = %err,
                );
            }
        }
        Ok(())
    }

    /// Hash and size of the staged artifact, off the async runtime. No DB
    /// transaction is open while this runs.
    async fn probe_staged(&self, staged: &std::path::Path) -> StagedProbe {
        match self.storage.exists(staged) {
            Ok(false) => return StagedProbe::Missing,
            Ok(true) => {}
            Err(err) => return StagedProbe::Unreadable(err.to_string()),
        }
        let size = match self.storage.file_size(staged) {
            Ok(size) => size as i64,
            Err(err) => return StagedProbe::Unreadable(err.to_string()),
        };
        let hash_path = staged.to_path_buf();
        let hashed =
            tokio::task::spawn_blocking(move || digest::file_sha256(&hash_path)).await;
        match hashed {
            Ok(Ok(hash)) => StagedProbe::Present { hash, size },
            Ok(Err(err)) => StagedProbe::Unreadable(err.to_string()),
            Err(err) => StagedProbe::Unreadable(format!("digest task failed: {err}")),
        }
    }

    /// MISSING detection for a job with no usable report this pass.
    async fn deadline_check(
        &self,
        now: DateTime<Utc>,
        job: &ExpectedBackupJob,
        summary: &mut PassSummary,
    ) -> Result<(), ScanError> {
        let Some(anchor) = cycle_anchor(now, job) else {
            return Ok(());
        };
        if !job.expected_on(anchor.weekday()) {
            return Ok(());
        }
        let deadline = anchor + self.window();
        if now <= deadline {
            // Still in flight.
            return Ok(());
        }
        if self
            .store
            .has_entry_since(job.id, anchor - self.window())
            .await?
        {
            // This cycle already produced a decision.
            return Ok(());
        }

        let entry = NewBackupEntry {
            status_message: format!(
                "no report observed for '{}' by {} (cycle anchor {})",
                job.database_name,
                deadline.to_rfc3339(),
                anchor.to_rfc3339(),
            ),
            ..NewBackupEntry::default()
        };
        let recorded = self
            .store
            .record_decision(job, EntryStatus::Missing, now, &entry)
            .await?;
        summary.entries_appended += 1;
        summary.missing_appended += 1;
        tracing::warn!(
            target: "sentinelle",
            event = "job_missing",
            job_id = job.id,
            database = %job.database_name,
            anchor = %anchor.to_rfc3339(),
        );
        if let Err(err) = self.notifier.notify(job, &recorded).await {
            tracing::warn!(
                target: "sentinelle",
                event = "notification_failed",
                job_id = job.id,
                error = %err,
            );
        }
        Ok(())
    }

    /// Phase 3: move every consumed report into its sibling `_archive/`.
    /// Failures are logged; the file stays put and is retried next pass.
    fn archive(&self, to_archive: &BTreeSet<PathBuf>, summary: &mut PassSummary) {
        for path in to_archive {
            if self.cancelled() {
                break;
            }
            match self.storage.exists(path) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    summary.archive_failures += 1;
                    tracing::warn!(
                        target: "sentinelle",
                        event = "report_archive_failed",
                        path = %path.display(),
                        error = %err,
                    );
                    continue;
                }
            }
            let Some(dst) = self.layout.archive_path_for(path) else {
                continue;
            };
            match self.storage.move_file(path, &dst) {
                Ok(()) => {
                    summary.archived += 1;
                    tracing::info!(
                        target: "sentinelle",
                        event = "report_archived",
                        src = %path.display(),
                        dst = %dst.display(),
                    );
                }
                Err(err) => {
                    summary.archive_failures += 1;
                    tracing::warn!(
                        target: "sentinelle",
                        event = "report_archive_failed",
                        path = %path.display(),
                        error = %err,
                    );
                }
            }
        }
    }
}

fn has_json_extension(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// The job's expected completion instant on the given reference date.
fn expected_datetime(
    reference: DateTime<Utc>,
    job: &ExpectedBackupJob,
) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(job.expected_hour_utc, job.expected_minute_utc, 0)?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(
        reference.date_naive().and_time(time),
        Utc,
    ))
}

/// Most recent cycle anchor at or before `now`: today's expected instant if
/// already reached, otherwise yesterday's.
fn cycle_anchor(now: DateTime<Utc>, job: &ExpectedBackupJob) -> Option<DateTime<Utc>> {
    let today = expected_datetime(now, job)?;
    if now >= today {
        Some(today)
    } else {
        Some(today - Duration::days(1))
    }
}

/// The §-ordered decision tree: agent-reported stage failures first, then
/// artifact presence, then digest+size agreement, then the content-unchanged
/// comparison against the last promoted hash.
fn integrity_decision(
    job: &ExpectedBackupJob,
    db: &DatabaseReport,
    probe: &StagedProbe,
) -> Decision {
    let mut failed_stages = Vec::new();
    if !db.backup.status {
        failed_stages.push("BACKUP");
    }
    if !db.compress.status {
        failed_stages.push("COMPRESS");
    }
    if !db.transfer.status {
        failed_stages.push("TRANSFER");
    }
    if !failed_stages.is_empty() {
        let mut message = format!(
            "agent reported failed stage(s) {} for '{}'",
            failed_stages.join(", "),
            job.database_name,
        );
        if let Some(transfer_err) = db
            .transfer
            .error_message
            .as_deref()
            .filter(|_| !db.transfer.status)
        {
            message.push_str(&format!("; transfer error: {transfer_err}"));
        }
        if let Some(logs) = db.logs_summary.as_deref() {
            message.push_str(&format!("; logs: {logs}"));
        }
        return Decision {
            status: EntryStatus::Failed,
            message,
            server_hash: None,
            server_size: None,
            hash_comparison_result: None,
        };
    }

    let (server_hash, server_size) = match probe {
        StagedProbe::Missing => {
            return Decision {
                status: EntryStatus::TransferIntegrityFailed,
                message: format!(
                    "staged artifact '{}' absent although the agent reported a successful transfer",
                    db.staged_file_name,
                ),
                server_hash: None,
                server_size: None,
                hash_comparison_result: None,
            }
        }
        StagedProbe::Unreadable(reason) => {
            return Decision {
                status: EntryStatus::TransferIntegrityFailed,
                message: format!(
                    "staged artifact '{}' could not be verified: {reason}",
                    db.staged_file_name,
                ),
                server_hash: None,
                server_size: None,
                hash_comparison_result: None,
            }
        }
        StagedProbe::Present { hash, size } => (hash.clone(), *size),
    };

    let reported_hash = db
        .compress
        .sha256_checksum
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    let reported_size = db.compress.size.unwrap_or(-1);
    if server_hash != reported_hash || server_size != reported_size {
        return Decision {
            status: EntryStatus::TransferIntegrityFailed,
            message: format!(
                "transfer integrity failed for '{}': agent {}/{} vs server {}/{}",
                job.database_name, reported_hash, reported_size, server_hash, server_size,
            ),
            server_hash: Some(server_hash),
            server_size: Some(server_size),
            hash_comparison_result: None,
        };
    }

    if let Some(previous) = job.previous_successful_hash.as_deref() {
        if previous == server_hash {
            return Decision {
                status: EntryStatus::HashMismatch,
                message: format!(
                    "backup hash for '{}' identical to the previous success; content unchanged",
                    job.database_name,
                ),
                server_hash: Some(server_hash),
                server_size: Some(server_size),
                hash_comparison_result: Some(false),
            };
        }
    }

    Decision {
        status: EntryStatus::Success,
        message: "backup transferred and verified".to_string(),
        server_hash: Some(server_hash),
        server_size: Some(server_size),
        hash_comparison_result: Some(true),
    }
}

fn new_entry_from_report(rel: &RelevantReport, decision: &Decision) -> NewBackupEntry {
    let db = &rel.db;
    NewBackupEntry {
        status_message: decision.message.clone(),
        operation_log_file_name: Some(rel.file_name.clone()),
        agent_id: Some(rel.agent_id.clone()),
        agent_overall_status: Some(rel.overall_status.as_str().to_string()),
        agent_backup_status: Some(db.backup.status),
        agent_backup_start_time: db.backup.start_time.clone(),
        agent_backup_end_time: db.backup.end_time.clone(),
        agent_backup_hash_pre_compress: db.backup.sha256_checksum.clone(),
        agent_backup_size_pre_compress: db.backup.size,
        agent_compress_status: Some(db.compress.status),
        agent_compress_start_time: db.compress.start_time.clone(),
        agent_compress_end_time: db.compress.end_time.clone(),
        agent_compress_hash: db.compress.sha256_checksum.clone(),
        agent_compress_size: db.compress.size,
        agent_transfer_status: Some(db.transfer.status),
        agent_transfer_start_time: db.transfer.start_time.clone(),
        agent_transfer_end_time: db.transfer.end_time.clone(),
        agent_transfer_error_message: db.transfer.error_message.clone(),
        agent_staged_file_name: Some(db.staged_file_name.clone()),
        agent_logs_summary: db.logs_summary.clone(),
        server_calculated_hash: decision.server_hash.clone(),
        server_calculated_size: decision.server_size,
        hash_comparison_result: decision.hash_comparison_result,
    }
}
