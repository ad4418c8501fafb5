use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;

use crate::config::SmtpConfig;
use crate::store::{BackupEntry, ExpectedBackupJob};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid mail address or message: {0}")]
    Message(String),
    #[error("smtp delivery failed: {0}")]
    Transport(String),
}

/// Sink for adverse transitions. Called for every entry whose status is not
/// SUCCESS; the caller logs failures and moves on, delivery is best-effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        job: &ExpectedBackupJob,
        entry: &BackupEntry,
    ) -> Result<(), NotifyError>;
}

/// Notifier used when SMTP is not configured: drops everything after one
/// startup warning.
pub struct DisabledNotifier;

impl DisabledNotifier {
    pub fn new() -> Self {
        tracing::warn!(
            target: "sentinelle",
            event = "notifier_disabled",
            msg = "SMTP settings absent; alert notifications are disabled"
        );
        Self
    }
}

impl Default for DisabledNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn notify(
        &self,
        job: &ExpectedBackupJob,
        entry: &BackupEntry,
    ) -> Result<(), NotifyError> {
        tracing::debug!(
            target: "sentinelle",
            event = "notification_dropped",
            job_id = job.id,
            status = entry.status.as_str(),
        );
        Ok(())
    }
}

/// SMTP notifier for the configured admin recipient.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: String,
    recipient: String,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig) -> Result<Self, NotifyError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| NotifyError::Transport(e.to_string()))?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();
        Ok(Self {
            transport,
            sender: config.sender.clone(),
            recipient: config.admin_recipient.clone(),
        })
    }

    fn subject(job: &ExpectedBackupJob, entry: &BackupEntry) -> String {
        let label = entry.status.as_str().replace('_', " ");
        format!("BACKUP ALERT - {} - {}", job.database_name, label)
    }

    fn body(job: &ExpectedBackupJob, entry: &BackupEntry) -> String {
        let comparison = match entry.hash_comparison_result {
            Some(true) => "content changed",
            Some(false) => "content identical to previous success",
            None => "n/a",
        };
        format!(
            "An anomaly was detected for the backup of database '{db}'.\n\
             \n\
             --- Expected job ---\n\
             Job id:            {job_id}\n\
             Database:          {db}\n\
             Agent:             {agent}\n\
             Company:           {company}\n\
             City:              {city}\n\
             Job status:        {job_status}\n\
             \n\
             --- Detected entry ---\n\
             Entry id:          {entry_id}\n\
             Entry status:      {entry_status}\n\
             Detected at:       {ts}\n\
             Message:           {message}\n\
             Agent hash:        {agent_hash}\n\
             Server hash:       {server_hash}\n\
             Agent size:        {agent_size}\n\
             Server size:       {server_size}\n\
             Hash comparison:   {comparison}\n\
             \n\
             Please investigate.\n",
            db = job.database_name,
            job_id = job.id,
            agent = job.agent_id(),
            company = job.company_name,
            city = job.city,
            job_status = job.current_status.as_str(),
            entry_id = entry.id,
            entry_status = entry.status.as_str(),
            ts = entry.timestamp.to_rfc3339(),
            message = entry.message,
            agent_hash = entry.agent_compress_hash.as_deref().unwrap_or("n/a"),
            server_hash = entry.server_calculated_hash.as_deref().unwrap_or("n/a"),
            agent_size = entry
                .agent_compress_size
                .map(|s| s.to_string())
                .unwrap_or_else(|| "n/a".into()),
            server_size = entry
                .server_calculated_size
                .map(|s| s.to_string())
                .unwrap_or_else(|| "n/a".into()),
            comparison = comparison,
        )
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(
        &self,
        job: &ExpectedBackupJob,
        entry: &BackupEntry,
    ) -> Result<(), NotifyError> {
        let message = Message::builder()
            .from(
                self.sender
                    .parse()
                    .map_err(|e| NotifyError::Message(format!("sender: {e}")))?,
            )
            .to(self
                .recipient
                .parse()
                .map_err(|e| NotifyError::Message(format!("recipient: {e}")))?)
            .subject(Self::subject(job, entry))
            .header(ContentType::TEXT_PLAIN)
            .body(Self::body(job, entry))
            .map_err(|e| NotifyError::Message(e.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        tracing::info!(
            target: "sentinelle",
            event = "notification_sent",
            job_id = job.id,
            status = entry.status.as_str(),
        );
        Ok(())
    }
}
