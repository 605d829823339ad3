use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::events::NatsEventPublisher;
use crate::subjects;
use crate::toggles::{Applied, ToggleCoordinator};

/// Payload of an external risk-enforcement signal. The sender computes
/// drawdown/exposure thresholds; this service only applies the verdict.
/// Example: `{ "kind": "hard_pull", "reason": "daily loss breach" }`
#[derive(Debug, Deserialize)]
struct RiskSignal {
    kind: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Start the signal listener: risk pulls and operator actions arrive as
/// commands, mutate the coordinator, and the resulting domain events go
/// back out on the bus. Returns a handle to the listener task.
pub async fn start_signal_listener(
    client: async_nats::Client,
    coordinator: Arc<ToggleCoordinator>,
) -> Result<tokio::task::JoinHandle<()>, Box<dyn std::error::Error + Send + Sync>> {
    let mut signal_sub = client
        .subscribe(subjects::CMD_RISK_SIGNAL.to_string())
        .await
        .map_err(|e| {
            error!("❌ Failed to subscribe to {}: {}", subjects::CMD_RISK_SIGNAL, e);
            e
        })?;

    let mut reset_sub = client
        .subscribe(subjects::CMD_CONTROL_RESET.to_string())
        .await
        .map_err(|e| {
            error!(
                "❌ Failed to subscribe to {}: {}",
                subjects::CMD_CONTROL_RESET, e
            );
            e
        })?;

    let publisher = NatsEventPublisher::new(client.clone());

    let handle = tokio::spawn(async move {
        info!(
            "👂 Listening for risk signals on '{}'",
            subjects::CMD_RISK_SIGNAL
        );
        loop {
            tokio::select! {
                Some(msg) = signal_sub.next() => {
                    match serde_json::from_slice::<RiskSignal>(&msg.payload) {
                        Ok(signal) => {
                            let reason = signal.reason.as_deref().unwrap_or("external risk signal");
                            let applied = match signal.kind.as_str() {
                                "soft_pull" => coordinator.soft_pull(reason),
                                "hard_pull" => coordinator.hard_pull(reason),
                                "clear" => coordinator.clear_risk_mode(reason),
                                other => {
                                    warn!(kind = other, "unknown risk signal kind, dropping");
                                    continue;
                                }
                            };
                            publish_changes(&publisher, &applied).await;
                        }
                        Err(e) => {
                            warn!("Received malformed risk signal payload: {}", e);
                        }
                    }
                }
                Some(msg) = reset_sub.next() => {
                    let reason = serde_json::from_slice::<RiskSignal>(&msg.payload)
                        .ok()
                        .and_then(|s| s.reason)
                        .unwrap_or_else(|| "operator reset".to_string());
                    let applied = coordinator.reset_to_safe_defaults(&reason);
                    publish_changes(&publisher, &applied).await;
                }
                _ = tokio::time::sleep(tokio::time::Duration::from_secs(60)) => {
                    info!(
                        "Heartbeat... risk mode: {:?}, safe mode: {}",
                        coordinator.get_risk_status(),
                        coordinator.is_in_safe_mode()
                    );
                }
            }
        }
    });

    Ok(handle)
}

async fn publish_changes(publisher: &NatsEventPublisher, applied: &Applied) {
    if applied.changed {
        publisher.publish_all(&applied.events).await;
    }
}
