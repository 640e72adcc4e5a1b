//! Outbound notifications for the daily digest.
//!
//! Delivery is best effort: the digest commits settlement before it calls a
//! [`Notifier`], and a failed send is only logged and counted.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("No address for {0}")]
    MissingRecipient(String),
    #[error("Failed to write outbox: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize notification: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Delivery rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

pub trait Notifier: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        if notification.to.trim().is_empty() {
            return Err(NotifyError::MissingRecipient(notification.subject.clone()));
        }
        info!(
            to = %notification.to,
            subject = %notification.subject,
            "notification (log only)\n{}",
            notification.body
        );
        Ok(())
    }
}

/// Appends each notification as one JSON line to a maildrop file that a
/// mail relay picks up.
#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    path: PathBuf,
}

impl OutboxNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Notifier for OutboxNotifier {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        if notification.to.trim().is_empty() {
            return Err(NotifyError::MissingRecipient(notification.subject.clone()));
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(notification)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

/// Outbox delivery when a maildrop path is configured, log-only otherwise.
pub fn notifier_for(outbox: Option<PathBuf>) -> Arc<dyn Notifier> {
    match outbox {
        Some(path) => Arc::new(OutboxNotifier::new(path)),
        None => Arc::new(LogNotifier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn notification(to: &str) -> Notification {
        Notification {
            from: "Taskpoints <noreply@localhost>".to_string(),
            to: to.to_string(),
            subject: "2026-10-19 daily task summary".to_string(),
            body: "Hello\n".to_string(),
        }
    }

    #[test]
    fn outbox_appends_json_lines() {
        let temp = TempDir::new().expect("tempdir");
        let outbox = OutboxNotifier::new(temp.path().join("mail").join("outbox.jsonl"));
        outbox.send(&notification("a@example.com")).expect("send");
        outbox.send(&notification("b@example.com")).expect("send");
        let text = fs::read_to_string(outbox.path()).expect("read");
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("\"to\":\"b@example.com\""));
    }

    #[test]
    fn empty_recipient_is_rejected() {
        assert!(matches!(
            LogNotifier.send(&notification("  ")),
            Err(NotifyError::MissingRecipient(_))
        ));
    }
}
