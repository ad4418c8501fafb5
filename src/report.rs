use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::layout::{validate_staged_file_name, AgentId};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report not found: {path}")]
    NotFound { path: String },
    #[error("report unreadable: {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("report is not valid JSON: {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("missing required field {0:?}")]
    MissingField(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("report is stale: operation ended {end_time}, older than {max_age_days} day(s)")]
    Stale {
        end_time: DateTime<Utc>,
        max_age_days: i64,
    },
    #[error("agent identity mismatch: report says {reported:?}, directory is {directory:?}")]
    IdentityMismatch { reported: String, directory: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallStatus {
    Completed,
    FailedGlobally,
}

impl OverallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OverallStatus::Completed => "completed",
            OverallStatus::FailedGlobally => "failed_globally",
        }
    }
}

/// One agent-side pipeline stage as reported. Timing fields are audit copy,
/// kept verbatim.
#[derive(Debug, Clone, Default)]
pub struct StageReport {
    pub status: bool,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub sha256_checksum: Option<String>,
    pub size: Option<i64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DatabaseReport {
    pub backup: StageReport,
    pub compress: StageReport,
    pub transfer: StageReport,
    pub staged_file_name: String,
    pub logs_summary: Option<String>,
}

/// Parsed, schema-validated report document.
#[derive(Debug, Clone)]
pub struct AgentReport {
    pub agent_id: String,
    pub operation_start_time: DateTime<Utc>,
    pub operation_end_time: DateTime<Utc>,
    pub overall_status: OverallStatus,
    pub databases: BTreeMap<String, DatabaseReport>,
}

/// Load and validate one report document. Rules run in a fixed order so the
/// first violation names the real problem; everything after a parse failure
/// is unreachable by construction.
pub fn load_report(
    path: &Path,
    expected_agent: &AgentId,
    now: DateTime<Utc>,
    max_age_days: i64,
) -> Result<AgentReport, ReportError> {
    let raw = fs::read_to_string(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ReportError::NotFound {
                path: path.display().to_string(),
            }
        } else {
            ReportError::Unreadable {
                path: path.display().to_string(),
                source: e,
            }
        }
    })?;

    let doc: Value = serde_json::from_str(&raw).map_err(|e| ReportError::Malformed {
        path: path.display().to_string(),
        source: e,
    })?;
    let doc = doc
        .as_object()
        .ok_or_else(|| ReportError::InvalidValue {
            field: "$".into(),
            reason: "document root must be an object".into(),
        })?;

    let agent_id = require_str(doc, "agent_id")?.to_string();
    let overall_status_raw = require_str(doc, "overall_status")?;
    let start_raw = require_str(doc, "operation_start_time")?;
    // operation_timestamp is the legacy spelling of the cycle-end anchor.
    let end_raw = match doc.get("operation_end_time").and_then(Value::as_str) {
        Some(s) => s,
        None => match doc.get("operation_timestamp").and_then(Value::as_str) {
            Some(s) => s,
            None => return Err(ReportError::MissingField("operation_end_time".into())),
        },
    };
    if !doc.contains_key("databases") {
        return Err(ReportError::MissingField("databases".into()));
    }

    let overall_status = match overall_status_raw {
        "completed" => OverallStatus::Completed,
        "failed_globally" => OverallStatus::FailedGlobally,
        other => {
            return Err(ReportError::InvalidValue {
                field: "overall_status".into(),
                reason: format!("expected completed or failed_globally, got {other:?}"),
            })
        }
    };

    let operation_start_time = parse_utc_timestamp(start_raw, "operation_start_time")?;
    let operation_end_time = parse_utc_timestamp(end_raw, "operation_end_time")?;

    let databases_value = doc
        .get("databases")
        .and_then(Value::as_object)
        .ok_or_else(|| ReportError::InvalidValue {
            field: "databases".into(),
            reason: "must be a mapping".into(),
        })?;
    if databases_value.is_empty() {
        return Err(ReportError::InvalidValue {
            field: "databases".into(),
            reason: "must not be empty".into(),
        });
    }

    let mut databases = BTreeMap::new();
    for (db_name, db_value) in databases_value {
        databases.insert(db_name.clone(), parse_database(db_name, db_value)?);
    }

    if now.signed_duration_since(operation_end_time) > Duration::days(max_age_days) {
        return Err(ReportError::Stale {
            end_time: operation_end_time,
            max_age_days,
        });
    }

    let directory = expected_agent.canonical();
    if agent_id.to_lowercase() != directory {
        return Err(ReportError::IdentityMismatch {
            reported: agent_id,
            directory,
        });
    }

    Ok(AgentReport {
        agent_id,
        operation_start_time,
        operation_end_time,
        overall_status,
        databases,
    })
}

fn require_str<'a>(
    doc: &'a serde_json::Map<String, Value>,
    field: &str,
) -> Result<&'a str, ReportError> {
    match doc.get(field) {
        None => Err(ReportError::MissingField(field.to_string())),
        Some(value) => value.as_str().ok_or_else(|| ReportError::InvalidValue {
            field: field.to_string(),
            reason: "expected a string".into(),
        }),
    }
}

fn parse_database(db_name: &str, value: &Value) -> Result<DatabaseReport, ReportError> {
    let entry = value.as_object().ok_or_else(|| ReportError::InvalidValue {
        field: format!("databases.{db_name}"),
        reason: "must be a mapping".into(),
    })?;

    let backup = parse_stage(db_name, entry, "BACKUP")?;
    let compress = parse_stage(db_name, entry, "COMPRESS")?;
    let transfer = parse_stage(db_name, entry, "TRANSFER")?;

    // COMPRESS carries the authoritative post-transfer hash and size.
    if compress.sha256_checksum.is_none() {
        return Err(ReportError::MissingField(format!(
            "databases.{db_name}.COMPRESS.sha256_checksum"
        )));
    }
    if compress.size.is_none() {
        return Err(ReportError::MissingField(format!(
            "databases.{db_name}.COMPRESS.size"
        )));
    }

    let staged_file_name = match entry.get("staged_file_name") {
        None => {
            return Err(ReportError::MissingField(format!(
                "databases.{db_name}.staged_file_name"
            )))
        }
        Some(v) => v
            .as_str()
            .ok_or_else(|| ReportError::InvalidValue {
                field: format!("databases.{db_name}.staged_file_name"),
                reason: "expected a string".into(),
            })?
            .to_string(),
    };
    validate_staged_file_name(&staged_file_name).map_err(|_| ReportError::InvalidValue {
        field: format!("databases.{db_name}.staged_file_name"),
        reason: "must be a bare file name without path separators".into(),
    })?;

    let logs_summary = entry
        .get("logs_summary")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(DatabaseReport {
        backup,
        compress,
        transfer,
        staged_file_name,
        logs_summary,
    })
}

fn parse_stage(
    db_name: &str,
    entry: &serde_json::Map<String, Value>,
    stage: &str,
) -> Result<StageReport, ReportError> {
    let value = entry
        .get(stage)
        .ok_or_else(|| ReportError::MissingField(format!("databases.{db_name}.{stage}")))?;
    let map = value.as_object().ok_or_else(|| ReportError::InvalidValue {
        field: format!("databases.{db_name}.{stage}"),
        reason: "must be a mapping".into(),
    })?;
    let status = map
        .get("status")
        .and_then(Value::as_bool)
        .ok_or_else(|| ReportError::InvalidValue {
            field: format!("databases.{db_name}.{stage}.status"),
            reason: "expected a boolean".into(),
        })?;

    let text = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);
    Ok(StageReport {
        status,
        start_time: text("start_time"),
        end_time: text("end_time"),
        sha256_checksum: text("sha256_checksum"),
        size: map.get("size").and_then(Value::as_i64),
        error_message: text("error_message"),
    })
}

/// ISO-8601 with an explicit offset is the contract; a naive timestamp is
/// tolerated as UTC with a warning, a non-UTC offset is converted.
pub fn parse_utc_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>, ReportError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        if parsed.offset().local_minus_utc() != 0 {
            tracing::warn!(
                target: "sentinelle",
                event = "report_timestamp_not_utc",
                field,
                value = raw,
            );
        }
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            tracing::warn!(
                target: "sentinelle",
                event = "report_timestamp_naive",
                field,
                value = raw,
            );
            return Ok(naive.and_utc());
        }
    }
    Err(ReportError::InvalidValue {
        field: field.to_string(),
        reason: format!("not an ISO-8601 timestamp: {raw:?}"),
    })
}
