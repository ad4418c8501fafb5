#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use chrono::{TimeZone, Utc};
use serde_json::json;

use sentinelle::store::{EntryStatus, JobStatus};
use util::{fixed_now, harness, sha256_hex, success_report};

const AGENT: &str = "acme_paris_nord";
const REPORT_NAME: &str = "20250115_131000_acme_paris_nord.json";

#[tokio::test]
async fn s1_success_promotes_and_archives() {
    let h = harness(fixed_now()).await;
    let job = h.seed_job("sales", 13, 0).await;

    let content = b"X-content";
    h.write_staged(AGENT, "sales.sql.gz", content);
    h.write_report(
        AGENT,
        REPORT_NAME,
        &success_report(
            AGENT,
            "sales",
            "2025-01-15T13:10:00Z",
            &sha256_hex(content),
            content.len() as i64,
            "sales.sql.gz",
        ),
    );

    let summary = h.scanner.run_pass().await.unwrap();
    assert_eq!(summary.entries_appended, 1);
    assert_eq!(summary.promoted, 1);
    assert_eq!(summary.archived, 1);

    let entries = h.store.entries_for_job(job.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, EntryStatus::Success);
    assert_eq!(entries[0].hash_comparison_result, Some(true));
    assert_eq!(
        entries[0].server_calculated_hash.as_deref(),
        Some(sha256_hex(content).as_str())
    );

    let updated = h.store.job_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(updated.current_status, JobStatus::Ok);
    assert_eq!(
        updated.previous_successful_hash.as_deref(),
        Some(sha256_hex(content).as_str())
    );
    assert_eq!(updated.last_successful_at, Some(fixed_now()));

    let promoted = h
        .validated_root
        .join("2025/acme/paris/nord/sales/sales.sql.gz");
    assert_eq!(std::fs::read(&promoted).unwrap(), content);

    assert!(h.archived_path(AGENT, REPORT_NAME).exists());
    assert!(!h.storage_root.join(AGENT).join("log").join(REPORT_NAME).exists());

    // Success produces no notification.
    assert!(h.notifier.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn s2_unchanged_content_is_hash_mismatch_without_promotion() {
    let h = harness(fixed_now()).await;
    let job = h.seed_job("sales", 13, 0).await;

    let content = b"X-content";
    h.write_staged(AGENT, "sales.sql.gz", content);
    h.write_report(
        AGENT,
        REPORT_NAME,
        &success_report(
            AGENT,
            "sales",
            "2025-01-15T13:10:00Z",
            &sha256_hex(content),
            content.len() as i64,
            "sales.sql.gz",
        ),
    );
    h.scanner.run_pass().await.unwrap();

    // Same content reported again for the same cycle.
    let second = "20250115_132000_acme_paris_nord.json";
    h.write_report(
        AGENT,
        second,
        &success_report(
            AGENT,
            "sales",
            "2025-01-15T13:20:00Z",
            &sha256_hex(content),
            content.len() as i64,
            "sales.sql.gz",
        ),
    );
    let later = h.at(Utc.with_ymd_and_hms(2025, 1, 15, 13, 35, 0).unwrap());
    let summary = later.run_pass().await.unwrap();
    assert_eq!(summary.entries_appended, 1);
    assert_eq!(summary.promoted, 0, "no promotion on unchanged content");

    let entries = h.store.entries_for_job(job.id).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].status, EntryStatus::HashMismatch);
    assert_eq!(entries[1].hash_comparison_result, Some(false));

    let updated = h.store.job_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(updated.current_status, JobStatus::HashMismatch);
    // The hash does not advance on a content-unchanged cycle.
    assert_eq!(
        updated.previous_successful_hash.as_deref(),
        Some(sha256_hex(content).as_str())
    );

    let events = h.notifier.events.lock().unwrap();
    assert_eq!(events.as_slice(), &[(job.id, "HASH_MISMATCH".to_string())]);
}

#[tokio::test]
async fn s3_corrupted_staged_artifact_is_transfer_integrity_failure() {
    let h = harness(fixed_now()).await;
    let job = h.seed_job("sales", 13, 0).await;

    h.write_staged(AGENT, "sales.sql.gz", b"Y-actual-bytes");
    let advertised = sha256_hex(b"X-expected-bytes");
    h.write_report(
        AGENT,
        REPORT_NAME,
        &success_report(
            AGENT,
            "sales",
            "2025-01-15T13:10:00Z",
            &advertised,
            16,
            "sales.sql.gz",
        ),
    );

    h.scanner.run_pass().await.unwrap();

    let entries = h.store.entries_for_job(job.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, EntryStatus::TransferIntegrityFailed);

    let updated = h.store.job_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(updated.current_status, JobStatus::TransferIntegrityFailed);
    assert!(updated.previous_successful_hash.is_none());
    assert!(!h
        .validated_root
        .join("2025/acme/paris/nord/sales/sales.sql.gz")
        .exists());
    assert!(h.archived_path(AGENT, REPORT_NAME).exists());
}

#[tokio::test]
async fn s4_missing_after_deadline() {
    let now = Utc.with_ymd_and_hms(2025, 1, 15, 14, 1, 0).unwrap();
    let h = harness(now).await;
    let job = h.seed_job("sales", 13, 0).await;

    let summary = h.scanner.run_pass().await.unwrap();
    assert_eq!(summary.missing_appended, 1);

    let entries = h.store.entries_for_job(job.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, EntryStatus::Missing);

    let updated = h.store.job_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(updated.current_status, JobStatus::Missing);

    let events = h.notifier.events.lock().unwrap();
    assert_eq!(events.as_slice(), &[(job.id, "MISSING".to_string())]);
}

#[tokio::test]
async fn s4_missing_is_not_duplicated_for_the_same_cycle() {
    let now = Utc.with_ymd_and_hms(2025, 1, 15, 14, 1, 0).unwrap();
    let h = harness(now).await;
    let job = h.seed_job("sales", 13, 0).await;

    h.scanner.run_pass().await.unwrap();
    let again = h.at(Utc.with_ymd_and_hms(2025, 1, 15, 14, 16, 0).unwrap());
    let summary = again.run_pass().await.unwrap();
    assert_eq!(summary.missing_appended, 0);
    assert_eq!(h.store.entries_for_job(job.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn s5_still_in_flight_appends_nothing() {
    let h = harness(fixed_now()).await;
    let job = h.seed_job("sales", 13, 0).await;

    let summary = h.scanner.run_pass().await.unwrap();
    assert_eq!(summary.entries_appended, 0);
    assert!(h.store.entries_for_job(job.id).await.unwrap().is_empty());

    let unchanged = h.store.job_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(unchanged.current_status, JobStatus::Unknown);
    assert!(unchanged.last_checked_at.is_none());
}

#[tokio::test]
async fn s6_stale_report_is_archived_without_an_entry() {
    let h = harness(fixed_now()).await;
    let job = h.seed_job("sales", 13, 0).await;

    let content = b"X-content";
    h.write_staged(AGENT, "sales.sql.gz", content);
    let stale = "20250113_131000_acme_paris_nord.json";
    h.write_report(
        AGENT,
        stale,
        &success_report(
            AGENT,
            "sales",
            "2025-01-13T13:10:00Z",
            &sha256_hex(content),
            content.len() as i64,
            "sales.sql.gz",
        ),
    );

    let summary = h.scanner.run_pass().await.unwrap();
    assert_eq!(summary.reports_rejected, 1);
    assert_eq!(summary.entries_appended, 0, "still in flight at 13:30");
    assert!(h.archived_path(AGENT, stale).exists());
    assert!(h.store.entries_for_job(job.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn s7_two_daily_cycles_do_not_cross_contaminate() {
    let now = Utc.with_ymd_and_hms(2025, 1, 15, 20, 30, 0).unwrap();
    let h = harness(now).await;
    let midday = h.seed_job("sales", 13, 0).await;
    let evening = h.seed_job("sales", 20, 0).await;

    let content = b"evening-dump";
    h.write_staged(AGENT, "sales.sql.gz", content);
    let name = "20250115_200500_acme_paris_nord.json";
    h.write_report(
        AGENT,
        name,
        &success_report(
            AGENT,
            "sales",
            "2025-01-15T20:05:00Z",
            &sha256_hex(content),
            content.len() as i64,
            "sales.sql.gz",
        ),
    );

    h.scanner.run_pass().await.unwrap();

    let evening_entries = h.store.entries_for_job(evening.id).await.unwrap();
    assert_eq!(evening_entries.len(), 1);
    assert_eq!(evening_entries[0].status, EntryStatus::Success);

    // The 13:00 cycle is past deadline with no report of its own.
    let midday_entries = h.store.entries_for_job(midday.id).await.unwrap();
    assert_eq!(midday_entries.len(), 1);
    assert_eq!(midday_entries[0].status, EntryStatus::Missing);
}

#[tokio::test]
async fn rerun_on_empty_filesystem_changes_nothing() {
    let h = harness(fixed_now()).await;
    let job = h.seed_job("sales", 13, 0).await;

    let content = b"X-content";
    h.write_staged(AGENT, "sales.sql.gz", content);
    h.write_report(
        AGENT,
        REPORT_NAME,
        &success_report(
            AGENT,
            "sales",
            "2025-01-15T13:10:00Z",
            &sha256_hex(content),
            content.len() as i64,
            "sales.sql.gz",
        ),
    );
    h.scanner.run_pass().await.unwrap();
    let job_after_first = h.store.job_by_id(job.id).await.unwrap().unwrap();

    // Reports are consumed; a later pass finds nothing and, with a SUCCESS
    // already covering the cycle, emits nothing either.
    let later = h.at(Utc.with_ymd_and_hms(2025, 1, 15, 14, 30, 0).unwrap());
    let summary = later.run_pass().await.unwrap();
    assert_eq!(summary.entries_appended, 0);
    assert_eq!(summary.reports_seen, 0);

    assert_eq!(h.store.entries_for_job(job.id).await.unwrap().len(), 1);
    let job_after_second = h.store.job_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(
        job_after_second.last_checked_at,
        job_after_first.last_checked_at
    );
    assert_eq!(job_after_second.current_status, JobStatus::Ok);
}

#[tokio::test]
async fn unrecognized_agent_dir_is_archived_unparsed() {
    let h = harness(fixed_now()).await;
    h.seed_job("sales", 13, 0).await;

    // Not a company_city_neighborhood name; its stray reports are consumed
    // without parsing.
    let stray = h
        .storage_root
        .join("lost+found")
        .join("log")
        .join("junk.json");
    std::fs::create_dir_all(stray.parent().unwrap()).unwrap();
    std::fs::write(&stray, b"not even json").unwrap();

    let summary = h.scanner.run_pass().await.unwrap();
    assert_eq!(summary.unrecognized_dirs, 1);
    assert_eq!(summary.reports_seen, 0);
    assert!(h
        .storage_root
        .join("lost+found/log/_archive/junk.json")
        .exists());
}

#[tokio::test]
async fn non_report_files_in_valid_agent_dirs_are_left_alone() {
    let h = harness(fixed_now()).await;
    h.seed_job("sales", 13, 0).await;

    let stray = h.storage_root.join(AGENT).join("log").join("notes.json");
    std::fs::create_dir_all(stray.parent().unwrap()).unwrap();
    std::fs::write(&stray, b"{}").unwrap();

    let summary = h.scanner.run_pass().await.unwrap();
    assert_eq!(summary.reports_seen, 0);
    assert!(stray.exists(), "unrecognized names are ignored, not archived");
}

#[tokio::test]
async fn invalid_report_is_consumed_and_skipped() {
    let h = harness(fixed_now()).await;
    let job = h.seed_job("sales", 13, 0).await;

    h.write_report(
        AGENT,
        REPORT_NAME,
        &json!({ "agent_id": AGENT, "overall_status": "completed" }),
    );

    let summary = h.scanner.run_pass().await.unwrap();
    assert_eq!(summary.reports_rejected, 1);
    assert_eq!(summary.entries_appended, 0);
    assert!(h.archived_path(AGENT, REPORT_NAME).exists());
    assert!(h.store.entries_for_job(job.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn promotion_failure_demotes_the_decision_to_failed() {
    let h = harness(fixed_now()).await;
    let job = h.seed_job("sales", 13, 0).await;

    let content = b"X-content";
    h.write_staged(AGENT, "sales.sql.gz", content);
    h.write_report(
        AGENT,
        REPORT_NAME,
        &success_report(
            AGENT,
            "sales",
            "2025-01-15T13:10:00Z",
            &sha256_hex(content),
            content.len() as i64,
            "sales.sql.gz",
        ),
    );

    // A plain file where the year directory should go makes ensure_dir fail.
    std::fs::write(h.validated_root.join("2025"), b"roadblock").unwrap();

    let summary = h.scanner.run_pass().await.unwrap();
    assert_eq!(summary.promoted, 0);

    let entries = h.store.entries_for_job(job.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, EntryStatus::Failed);
    assert!(entries[0].message.contains("promotion failed"));

    let updated = h.store.job_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(updated.current_status, JobStatus::Failed);
    // A demoted promotion is not a success: the hash must not advance.
    assert!(updated.previous_successful_hash.is_none());

    let events = h.notifier.events.lock().unwrap();
    assert_eq!(events.as_slice(), &[(job.id, "FAILED".to_string())]);
}

#[tokio::test]
async fn latest_report_wins_the_tie_break() {
    let h = harness(fixed_now()).await;
    let job = h.seed_job("sales", 13, 0).await;

    let old_content = b"old-bytes";
    let new_content = b"new-bytes";
    h.write_staged(AGENT, "sales.sql.gz", new_content);

    h.write_report(
        AGENT,
        "20250115_130500_acme_paris_nord.json",
        &success_report(
            AGENT,
            "sales",
            "2025-01-15T13:05:00Z",
            &sha256_hex(old_content),
            old_content.len() as i64,
            "sales.sql.gz",
        ),
    );
    h.write_report(
        AGENT,
        "20250115_131500_acme_paris_nord.json",
        &success_report(
            AGENT,
            "sales",
            "2025-01-15T13:15:00Z",
            &sha256_hex(new_content),
            new_content.len() as i64,
            "sales.sql.gz",
        ),
    );

    let summary = h.scanner.run_pass().await.unwrap();
    // Both reports consumed, one decision from the freshest.
    assert_eq!(summary.reports_seen, 2);
    assert_eq!(summary.archived, 2);
    let entries = h.store.entries_for_job(job.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, EntryStatus::Success);
    assert_eq!(
        entries[0].server_calculated_hash.as_deref(),
        Some(sha256_hex(new_content).as_str())
    );
}
