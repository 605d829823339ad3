use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::subjects;
use crate::toggles::BotStatus;

/// Domain events emitted on coordinator state transitions. UI hooks and
/// sibling services subscribe to these independently of the
/// coordinator's in-process snapshot subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskEvent {
    SoftPull { reason: String },
    HardPull { reason: String },
    ModeCleared { reason: String },
    BotStateChanged { bot_id: String, status: BotStatus },
}

impl RiskEvent {
    /// Stable event name carried in the payload.
    pub fn name(&self) -> &'static str {
        match self {
            RiskEvent::SoftPull { .. } => "risk.soft_pull",
            RiskEvent::HardPull { .. } => "risk.hard_pull",
            RiskEvent::ModeCleared { .. } => "risk.mode_cleared",
            RiskEvent::BotStateChanged { .. } => "bot.state.changed",
        }
    }

    pub fn subject(&self) -> &'static str {
        match self {
            RiskEvent::SoftPull { .. } => subjects::EVT_RISK_SOFT_PULL,
            RiskEvent::HardPull { .. } => subjects::EVT_RISK_HARD_PULL,
            RiskEvent::ModeCleared { .. } => subjects::EVT_RISK_MODE_CLEARED,
            RiskEvent::BotStateChanged { .. } => subjects::EVT_BOT_STATE_CHANGED,
        }
    }

    pub fn payload(&self) -> Value {
        let ts = Utc::now().timestamp_millis();
        match self {
            RiskEvent::SoftPull { reason }
            | RiskEvent::HardPull { reason }
            | RiskEvent::ModeCleared { reason } => json!({
                "event": self.name(),
                "reason": reason,
                "ts": ts,
            }),
            RiskEvent::BotStateChanged { bot_id, status } => json!({
                "event": self.name(),
                "bot_id": bot_id,
                "status": status,
                "ts": ts,
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("nats publish failed: {0}")]
    Nats(#[from] async_nats::PublishError),
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &RiskEvent) -> Result<(), PublishError>;
}

/// Publishes coordinator events onto the NATS bus. Delivery is
/// at-least-once best-effort; same-subject emission order follows
/// mutation order.
pub struct NatsEventPublisher {
    client: async_nats::Client,
}

impl NatsEventPublisher {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    /// Publish a batch in order, logging failures per event. A failed
    /// publish never propagates back into the coordinator.
    pub async fn publish_all(&self, events: &[RiskEvent]) {
        for event in events {
            if let Err(e) = self.publish(event).await {
                warn!(event = event.name(), "event publish failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl EventPublisher for NatsEventPublisher {
    async fn publish(&self, event: &RiskEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(&event.payload())?;
        self.client
            .publish(event.subject().to_string(), payload.into())
            .await?;
        Ok(())
    }
}
