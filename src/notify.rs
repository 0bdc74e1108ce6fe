//! Outbound notifications.
//!
//! The pipeline tells a collaborator about extraction failures, duplicates,
//! blocked providers and failed batches. Delivery is best effort: use
//! [`notify_quietly`], which logs a failed delivery and carries on.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    ExtractionFailed,
    DuplicateInvoice,
    BlockedProvider,
    BatchFailed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ExtractionFailed => "EXTRACTION_FAILED",
            NotificationKind::DuplicateInvoice => "DUPLICATE_INVOICE",
            NotificationKind::BlockedProvider => "BLOCKED_PROVIDER",
            NotificationKind::BatchFailed => "BATCH_FAILED",
        }
    }
}

#[derive(Debug, Error)]
#[error("Notification delivery failed: {0}")]
pub struct NotifyError(pub String);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        user_id: &str,
        message: &str,
        kind: NotificationKind,
        related_id: Option<&str>,
    ) -> Result<(), NotifyError>;
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(
        &self,
        _user_id: &str,
        _message: &str,
        _kind: NotificationKind,
        _related_id: Option<&str>,
    ) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(
        &self,
        user_id: &str,
        message: &str,
        kind: NotificationKind,
        related_id: Option<&str>,
    ) -> Result<(), NotifyError> {
        info!(
            user = user_id,
            kind = kind.as_str(),
            related = related_id.unwrap_or("-"),
            "{message}"
        );
        Ok(())
    }
}

/// Deliver a notification, logging instead of failing.
pub async fn notify_quietly(
    notifier: &Arc<dyn Notifier>,
    user_id: &str,
    message: &str,
    kind: NotificationKind,
    related_id: Option<&str>,
) {
    if let Err(e) = notifier.notify(user_id, message, kind, related_id).await {
        warn!(user = user_id, kind = kind.as_str(), error = %e, "Notification dropped");
    }
}
