use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::store::ExpectedBackupJob;

pub const LOG_DIR_NAME: &str = "log";
pub const DATABASE_DIR_NAME: &str = "database";
pub const ARCHIVE_DIR_NAME: &str = "_archive";

/// Default promotion layout under the validated root.
pub const DEFAULT_PROMOTION_TEMPLATE: &str =
    "{year}/{company}/{city}/{neighborhood}/{database}/{file}";

// Production reports are stamped `YYYYMMDD_HHMMSS_...`; manual test deposits
// use the literal `HORODATAGE_...` prefix. Both are matched case-insensitively.
// The embedded timestamp is never trusted; only the report's own
// operation_end_time is authoritative.
static REPORT_STAMPED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\d{8}_\d{6}_([^_]+)_([^_]+)_([^_]+)\.json$").expect("valid report pattern")
});
static REPORT_MANUAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^HORODATAGE_([^_]+)_([^_]+)_([^_]+)\.json$").expect("valid report pattern")
});

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("invalid agent directory name: {name:?}")]
    InvalidAgentDir { name: String },
    #[error("staged file name is not a bare basename: {name:?}")]
    InvalidStagedName { name: String },
    #[error("promotion template component is not allowed: {component:?}")]
    InvalidTemplateComponent { component: String },
}

/// Canonical site identity: `company_city_neighborhood`, lowercase, exactly
/// three non-empty tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentId {
    pub company: String,
    pub city: String,
    pub neighborhood: String,
}

impl AgentId {
    /// Parse an agent directory name. Anything that does not split into
    /// exactly three non-empty tokens is refused.
    pub fn parse(name: &str) -> Result<Self, LayoutError> {
        let lowered = name.to_lowercase();
        let parts: Vec<&str> = lowered.split('_').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(LayoutError::InvalidAgentDir {
                name: name.to_string(),
            });
        }
        Ok(AgentId {
            company: parts[0].to_string(),
            city: parts[1].to_string(),
            neighborhood: parts[2].to_string(),
        })
    }

    pub fn canonical(&self) -> String {
        format!("{}_{}_{}", self.company, self.city, self.neighborhood)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// True when a file name matches one of the recognized report patterns.
pub fn is_report_file_name(name: &str) -> bool {
    REPORT_STAMPED.is_match(name) || REPORT_MANUAL.is_match(name)
}

/// Reject anything that is not a plain basename before it gets near the
/// filesystem: separators, traversal segments, empties.
pub fn validate_staged_file_name(name: &str) -> Result<(), LayoutError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        return Err(LayoutError::InvalidStagedName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Deterministic mapping from jobs and report artifacts to paths on both
/// storage trees.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    storage_root: PathBuf,
    validated_root: PathBuf,
}

impl StorageLayout {
    pub fn new(storage_root: impl Into<PathBuf>, validated_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            validated_root: validated_root.into(),
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn validated_root(&self) -> &Path {
        &self.validated_root
    }

    pub fn agent_dir(&self, agent: &AgentId) -> PathBuf {
        self.storage_root.join(agent.canonical())
    }

    pub fn log_dir(&self, agent: &AgentId) -> PathBuf {
        self.agent_dir(agent).join(LOG_DIR_NAME)
    }

    pub fn archive_dir(&self, agent: &AgentId) -> PathBuf {
        self.log_dir(agent).join(ARCHIVE_DIR_NAME)
    }

    /// Archive destination for a processed report: sibling `_archive/` of the
    /// file's own log directory.
    pub fn archive_path_for(&self, report_path: &Path) -> Option<PathBuf> {
        let file_name = report_path.file_name()?;
        let parent = report_path.parent()?;
        Some(parent.join(ARCHIVE_DIR_NAME).join(file_name))
    }

    pub fn staging_path(
        &self,
        agent: &AgentId,
        staged_file_name: &str,
    ) -> Result<PathBuf, LayoutError> {
        validate_staged_file_name(staged_file_name)?;
        Ok(self
            .agent_dir(agent)
            .join(DATABASE_DIR_NAME)
            .join(staged_file_name))
    }

    /// Expand the job's promotion template (or the default layout) under the
    /// validated root. Every expanded component must be a plain path segment.
    pub fn promotion_path(
        &self,
        job: &ExpectedBackupJob,
        staged_file_name: &str,
    ) -> Result<PathBuf, LayoutError> {
        validate_staged_file_name(staged_file_name)?;
        let template = job
            .final_storage_template
            .as_deref()
            .unwrap_or(DEFAULT_PROMOTION_TEMPLATE);

        let year = job.year.to_string();
        let expanded = template
            .replace("{year}", &year)
            .replace("{company}", &job.company_name)
            .replace("{city}", &job.city)
            .replace("{neighborhood}", &job.neighborhood)
            .replace("{database}", &job.database_name)
            .replace("{file}", staged_file_name);

        let mut out = self.validated_root.clone();
        for component in expanded.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(LayoutError::InvalidTemplateComponent {
                    component: component.to_string(),
                });
            }
            if component.contains('\\') || component.contains('\0') {
                return Err(LayoutError::InvalidTemplateComponent {
                    component: component.to_string(),
                });
            }
            out.push(component);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_job;

    #[test]
    fn parses_three_token_agent_dirs() {
        let agent = AgentId::parse("Acme_Paris_Nord").unwrap();
        assert_eq!(agent.company, "acme");
        assert_eq!(agent.city, "paris");
        assert_eq!(agent.neighborhood, "nord");
        assert_eq!(agent.canonical(), "acme_paris_nord");
    }

    #[test]
    fn rejects_wrong_token_counts() {
        assert!(AgentId::parse("acme_paris").is_err());
        assert!(AgentId::parse("acme_paris_nord_extra").is_err());
        assert!(AgentId::parse("acme__nord").is_err());
        assert!(AgentId::parse("").is_err());
    }

    #[test]
    fn recognizes_both_report_patterns_case_insensitively() {
        assert!(is_report_file_name("20250115_131000_acme_paris_nord.json"));
        assert!(is_report_file_name("20250115_131000_ACME_PARIS_NORD.JSON"));
        assert!(is_report_file_name("HORODATAGE_acme_paris_nord.json"));
        assert!(is_report_file_name("horodatage_ACME_Paris_Nord.json"));
    }

    #[test]
    fn ignores_unrecognized_file_names() {
        assert!(!is_report_file_name("status.json"));
        assert!(!is_report_file_name("20250115_acme_paris_nord.json"));
        assert!(!is_report_file_name("20250115_131000_acme_paris.json"));
        assert!(!is_report_file_name("20250115_131000_acme_paris_nord.json.bak"));
    }

    #[test]
    fn staged_name_must_be_bare_basename() {
        assert!(validate_staged_file_name("sales.sql.gz").is_ok());
        assert!(validate_staged_file_name("../escape.gz").is_err());
        assert!(validate_staged_file_name("a/b.gz").is_err());
        assert!(validate_staged_file_name("a\\b.gz").is_err());
        assert!(validate_staged_file_name("").is_err());
    }

    #[test]
    fn staging_path_lands_under_agent_database_dir() {
        let layout = StorageLayout::new("/mnt/backups", "/mnt/backups/validated");
        let agent = AgentId::parse("acme_paris_nord").unwrap();
        let path = layout.staging_path(&agent, "sales.sql.gz").unwrap();
        assert_eq!(
            path,
            PathBuf::from("/mnt/backups/acme_paris_nord/database/sales.sql.gz")
        );
    }

    #[test]
    fn promotion_path_uses_default_template() {
        let layout = StorageLayout::new("/mnt/backups", "/mnt/validated");
        let job = test_job("acme", "paris", "nord", "sales", 13, 0);
        let path = layout.promotion_path(&job, "sales.sql.gz").unwrap();
        assert_eq!(
            path,
            PathBuf::from("/mnt/validated/2025/acme/paris/nord/sales/sales.sql.gz")
        );
    }

    #[test]
    fn promotion_template_cannot_escape_validated_root() {
        let layout = StorageLayout::new("/mnt/backups", "/mnt/validated");
        let mut job = test_job("acme", "paris", "nord", "sales", 13, 0);
        job.final_storage_template = Some("../{company}/{file}".to_string());
        assert!(layout.promotion_path(&job, "sales.sql.gz").is_err());
    }

    #[test]
    fn archive_path_is_sibling_under_archive_dir() {
        let layout = StorageLayout::new("/r", "/v");
        let archived = layout
            .archive_path_for(Path::new("/r/acme_paris_nord/log/x.json"))
            .unwrap();
        assert_eq!(
            archived,
            PathBuf::from("/r/acme_paris_nord/log/_archive/x.json")
        );
    }
}
