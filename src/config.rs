use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::Weekday;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// SMTP settings for the alert notifier. Only built when the whole group is
/// present; a partially configured mailer is treated as unconfigured.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub sender: String,
    pub admin_recipient: String,
}

/// Immutable application configuration, loaded once from the environment and
/// threaded through components by value.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub backup_storage_root: PathBuf,
    pub validated_backups_base_path: PathBuf,
    pub scanner_interval_minutes: u64,
    pub report_collection_window_minutes: i64,
    pub max_report_age_days: i64,
    pub expected_backup_days_of_week: HashSet<Weekday>,
    pub smtp: Option<SmtpConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/sentinelle.sqlite3".to_string());
        let backup_storage_root = PathBuf::from(
            env::var("BACKUP_STORAGE_ROOT").unwrap_or_else(|_| "/mnt/backups".to_string()),
        );
        let validated_backups_base_path = PathBuf::from(
            env::var("VALIDATED_BACKUPS_BASE_PATH")
                .unwrap_or_else(|_| "/mnt/backups/validated".to_string()),
        );

        let scanner_interval_minutes = parse_env("SCANNER_INTERVAL_MINUTES", 15_u64)?;
        let report_collection_window_minutes =
            parse_env("SCANNER_REPORT_COLLECTION_WINDOW_MINUTES", 60_i64)?;
        let max_report_age_days = parse_env("MAX_STATUS_FILE_AGE_DAYS", 1_i64)?;
        let expected_backup_days_of_week = parse_days_of_week(
            &env::var("EXPECTED_BACKUP_DAYS_OF_WEEK")
                .unwrap_or_else(|_| "MO,TU,WE,TH,FR,SA".to_string()),
        )?;

        if scanner_interval_minutes == 0 {
            return Err(ConfigError::Invalid {
                key: "SCANNER_INTERVAL_MINUTES",
                value: "0".into(),
                reason: "interval must be at least one minute".into(),
            });
        }
        if report_collection_window_minutes <= 0 {
            return Err(ConfigError::Invalid {
                key: "SCANNER_REPORT_COLLECTION_WINDOW_MINUTES",
                value: report_collection_window_minutes.to_string(),
                reason: "window must be positive".into(),
            });
        }

        Ok(Config {
            database_url,
            backup_storage_root,
            validated_backups_base_path,
            scanner_interval_minutes,
            report_collection_window_minutes,
            max_report_age_days,
            expected_backup_days_of_week,
            smtp: smtp_from_env(),
        })
    }

    pub fn log_effective(&self) {
        tracing::info!(
            target: "sentinelle",
            event = "config_loaded",
            backup_storage_root = %self.backup_storage_root.display(),
            validated_backups_base_path = %self.validated_backups_base_path.display(),
            scanner_interval_minutes = self.scanner_interval_minutes,
            report_collection_window_minutes = self.report_collection_window_minutes,
            max_report_age_days = self.max_report_age_days,
            smtp_configured = self.smtp.is_some(),
        );
    }
}

fn parse_env<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + ToString,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

pub fn parse_days_of_week(raw: &str) -> Result<HashSet<Weekday>, ConfigError> {
    let mut days = HashSet::new();
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let day = match token.to_ascii_uppercase().as_str() {
            "MO" => Weekday::Mon,
            "TU" => Weekday::Tue,
            "WE" => Weekday::Wed,
            "TH" => Weekday::Thu,
            "FR" => Weekday::Fri,
            "SA" => Weekday::Sat,
            "SU" => Weekday::Sun,
            _ => {
                return Err(ConfigError::Invalid {
                    key: "EXPECTED_BACKUP_DAYS_OF_WEEK",
                    value: raw.to_string(),
                    reason: format!("unknown day code {token:?}"),
                })
            }
        };
        days.insert(day);
    }
    if days.is_empty() {
        return Err(ConfigError::Invalid {
            key: "EXPECTED_BACKUP_DAYS_OF_WEEK",
            value: raw.to_string(),
            reason: "at least one day code is required".into(),
        });
    }
    Ok(days)
}

fn smtp_from_env() -> Option<SmtpConfig> {
    let host = env::var("EMAIL_HOST").ok()?;
    let port = env::var("EMAIL_PORT").ok()?.trim().parse::<u16>().ok()?;
    let username = env::var("EMAIL_USERNAME").ok()?;
    let password = env::var("EMAIL_PASSWORD").ok()?;
    let sender = env::var("EMAIL_SENDER").ok()?;
    let admin_recipient = env::var("ADMIN_EMAIL_RECIPIENT").ok()?;
    Some(SmtpConfig {
        host,
        port,
        username,
        password,
        sender,
        admin_recipient,
    })
}
