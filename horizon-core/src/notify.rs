use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::pipeline::CycleStatus;
use crate::trigger::TriggerReason;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

pub type NotifyResult<T> = std::result::Result<T, NotifyError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    OptimizationTriggered {
        horizon: String,
        reasons: Vec<TriggerReason>,
        at: DateTime<Utc>,
    },
    ValidationPassed {
        horizon: String,
        candidate_id: String,
        baseline_id: Option<String>,
    },
    ValidationFailed {
        horizon: String,
        candidate_id: String,
        baseline_id: Option<String>,
        reasons: Vec<String>,
    },
    DeploymentSucceeded {
        horizon: String,
        deployment_id: String,
        config_id: String,
        previous_config_id: Option<String>,
    },
    RolledBack {
        horizon: String,
        deployment_id: String,
        restored_config_id: String,
        reason: String,
        automatic: bool,
    },
    CycleFinished {
        horizon: String,
        cycle_id: String,
        status: CycleStatus,
        detail: Option<String>,
    },
}

impl NotificationEvent {
    pub fn horizon(&self) -> &str {
        match self {
            NotificationEvent::OptimizationTriggered { horizon, .. }
            | NotificationEvent::ValidationPassed { horizon, .. }
            | NotificationEvent::ValidationFailed { horizon, .. }
            | NotificationEvent::DeploymentSucceeded { horizon, .. }
            | NotificationEvent::RolledBack { horizon, .. }
            | NotificationEvent::CycleFinished { horizon, .. } => horizon,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::OptimizationTriggered { .. } => "optimization_triggered",
            NotificationEvent::ValidationPassed { .. } => "validation_passed",
            NotificationEvent::ValidationFailed { .. } => "validation_failed",
            NotificationEvent::DeploymentSucceeded { .. } => "deployment_succeeded",
            NotificationEvent::RolledBack { .. } => "rolled_back",
            NotificationEvent::CycleFinished { .. } => "cycle_finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationEvent::CycleFinished { .. })
    }
}

/// Outbound alerting sink. Delivery failures are reported to the caller,
/// which logs them and carries on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> NotifyResult<()>;
}

/// Sends an event and logs delivery failure without propagating it.
pub async fn deliver(notifier: &dyn Notifier, event: NotificationEvent) {
    if let Err(err) = notifier.notify(&event).await {
        warn!(
            target: "notify",
            horizon = %event.horizon(),
            event = event.kind(),
            error = %err,
            "notification delivery failed"
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: &NotificationEvent) -> NotifyResult<()> {
        match event {
            NotificationEvent::RolledBack {
                horizon,
                restored_config_id,
                reason,
                automatic,
                ..
            } => error!(
                target: "notify",
                horizon = %horizon,
                restored = %restored_config_id,
                reason = %reason,
                automatic,
                "configuration rolled back"
            ),
            NotificationEvent::CycleFinished {
                horizon,
                status,
                detail,
                ..
            } => info!(
                target: "notify",
                horizon = %horizon,
                status = status.as_str(),
                detail = detail.as_deref().unwrap_or(""),
                "cycle finished"
            ),
            other => info!(
                target: "notify",
                horizon = %other.horizon(),
                event = other.kind(),
                "{}",
                serde_json::to_string(other).unwrap_or_default()
            ),
        }
        Ok(())
    }
}

/// Fans events out to in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<NotificationEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, event: &NotificationEvent) -> NotifyResult<()> {
        // No subscribers is not a delivery failure.
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}
