use std::future::Future;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::audit::{AuditLevel, AuditSink};
use crate::clock::Clock;
use crate::idempotency::{derive_order_key, IdempotencyCache, IdempotencyError};
use crate::metrics;
use crate::model::{OrderTicket, SubmissionReceipt};
use crate::toggles::{BotStatus, RiskMode, ToggleCoordinator};

#[derive(Debug, Clone, PartialEq)]
pub enum GateRejection {
    /// Emergency mode blocks every submission path.
    TradingHalted { mode: RiskMode },
    /// Soft pull restricts new live trading; paper stays reachable.
    LiveRestricted { mode: RiskMode },
    BotDisabled { bot_id: String },
    SimulationOnly { bot_id: String },
    InvalidTicket { field: &'static str },
    /// The same logical order is still executing.
    DuplicateInFlight,
}

impl std::fmt::Display for GateRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateRejection::TradingHalted { mode } => {
                write!(f, "trading halted: risk mode is {:?}", mode)
            }
            GateRejection::LiveRestricted { mode } => {
                write!(f, "live trading restricted while risk mode is {:?}", mode)
            }
            GateRejection::BotDisabled { bot_id } => {
                write!(f, "bot '{}' is off", bot_id)
            }
            GateRejection::SimulationOnly { bot_id } => {
                write!(f, "bot '{}' is simulation-only, live order refused", bot_id)
            }
            GateRejection::InvalidTicket { field } => {
                write!(f, "invalid ticket: {} must be non-empty", field)
            }
            GateRejection::DuplicateInFlight => {
                write!(f, "duplicate order still in flight")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError<E> {
    #[error("order rejected: {0}")]
    Rejected(GateRejection),
    #[error("order submission failed: {0}")]
    Submission(E),
}

/// Front door for order submission: toggle state decides whether the
/// submission path is reachable at all, the idempotency cache decides
/// whether a reachable submission executes once or is deduplicated.
pub struct TradeGate {
    coordinator: Arc<ToggleCoordinator>,
    cache: Arc<IdempotencyCache<SubmissionReceipt>>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    window_secs: i64,
    ttl_ms: i64,
}

impl TradeGate {
    pub fn new(
        coordinator: Arc<ToggleCoordinator>,
        cache: Arc<IdempotencyCache<SubmissionReceipt>>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        window_secs: i64,
        ttl_ms: i64,
    ) -> Self {
        Self {
            coordinator,
            cache,
            audit,
            clock,
            window_secs,
            ttl_ms,
        }
    }

    /// Reachability check only, no side effects beyond the verdict.
    pub fn check(&self, ticket: &OrderTicket) -> Result<(), GateRejection> {
        if ticket.account_id.trim().is_empty() {
            return Err(GateRejection::InvalidTicket { field: "account_id" });
        }
        if ticket.workspace_id.trim().is_empty() {
            return Err(GateRejection::InvalidTicket {
                field: "workspace_id",
            });
        }
        if ticket.symbol.trim().is_empty() {
            return Err(GateRejection::InvalidTicket { field: "symbol" });
        }
        if ticket.quantity <= Decimal::ZERO {
            return Err(GateRejection::InvalidTicket { field: "quantity" });
        }

        let snapshot = self.coordinator.snapshot();
        if snapshot.risk_mode == RiskMode::Emergency {
            return Err(GateRejection::TradingHalted {
                mode: snapshot.risk_mode,
            });
        }
        if ticket.live && snapshot.risk_mode != RiskMode::Normal {
            return Err(GateRejection::LiveRestricted {
                mode: snapshot.risk_mode,
            });
        }

        if let Some(bot_id) = &ticket.bot_id {
            match snapshot.bots.get(bot_id).copied().unwrap_or_default() {
                BotStatus::Off => {
                    return Err(GateRejection::BotDisabled {
                        bot_id: bot_id.clone(),
                    });
                }
                BotStatus::Simulation if ticket.live => {
                    return Err(GateRejection::SimulationOnly {
                        bot_id: bot_id.clone(),
                    });
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Gate and execute a submission at most once per dedup window.
    ///
    /// On a cache hit the original receipt is returned without invoking
    /// `place`; a concurrent duplicate is rejected; a failed `place`
    /// leaves the cache unmodified so the caller can retry.
    pub async fn submit<F, Fut, E>(
        &self,
        ticket: &OrderTicket,
        place: F,
    ) -> Result<SubmissionReceipt, SubmitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SubmissionReceipt, E>>,
    {
        if let Err(rejection) = self.check(ticket) {
            warn!(symbol = %ticket.symbol, "order denied: {}", rejection);
            self.audit.log(
                AuditLevel::Warn,
                "order denied",
                json!({
                    "symbol": ticket.symbol,
                    "side": ticket.side,
                    "bot_id": ticket.bot_id,
                    "live": ticket.live,
                    "denial": rejection.to_string(),
                }),
            );
            metrics::inc_gate_denials();
            return Err(SubmitError::Rejected(rejection));
        }

        let key = derive_order_key(ticket, self.clock.now_millis(), self.window_secs);
        let duplicate = self.cache.has(&key);

        match self.cache.with_idempotency(&key, self.ttl_ms, place).await {
            Ok(receipt) => {
                if duplicate {
                    info!(key = %key, order_id = %receipt.order_id, "duplicate submission collapsed");
                    self.audit.log(
                        AuditLevel::Info,
                        "duplicate submission collapsed",
                        json!({ "key": key, "order_id": receipt.order_id }),
                    );
                    metrics::inc_idempotency_hits();
                } else {
                    metrics::inc_idempotency_misses();
                    metrics::inc_orders_gated();
                }
                Ok(receipt)
            }
            Err(IdempotencyError::InFlight) => {
                warn!(key = %key, "duplicate submission while original still in flight");
                self.audit.log(
                    AuditLevel::Warn,
                    "duplicate submission rejected in flight",
                    json!({ "key": key, "symbol": ticket.symbol }),
                );
                metrics::inc_inflight_rejections();
                Err(SubmitError::Rejected(GateRejection::DuplicateInFlight))
            }
            Err(IdempotencyError::Operation(e)) => Err(SubmitError::Submission(e)),
        }
    }
}
