use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::audit::{AuditLevel, AuditSink};
use crate::events::RiskEvent;
use crate::metrics;

/// Run mode of a single trading bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    #[default]
    Off,
    Simulation,
    Live,
}

/// Whether an individual risk rail blocks violations or only reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RailMode {
    #[default]
    MonitorOnly,
    Enforced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RiskMode {
    #[default]
    Normal,
    Cautious,
    Emergency,
}

fn mode_metric(mode: RiskMode) -> i64 {
    match mode {
        RiskMode::Normal => 0,
        RiskMode::Cautious => 1,
        RiskMode::Emergency => 2,
    }
}

/// Full toggle snapshot handed to subscribers on every change.
/// Subscribers never reconstruct state from partial events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToggleState {
    pub bots: BTreeMap<String, BotStatus>,
    pub rails: BTreeMap<String, RailMode>,
    pub risk_mode: RiskMode,
}

impl ToggleState {
    /// Everything off, rails monitor-only, risk mode normal.
    pub fn safe_defaults(bot_ids: &[String], rail_ids: &[String]) -> Self {
        Self {
            bots: bot_ids
                .iter()
                .map(|id| (id.clone(), BotStatus::Off))
                .collect(),
            rails: rail_ids
                .iter()
                .map(|id| (id.clone(), RailMode::MonitorOnly))
                .collect(),
            risk_mode: RiskMode::Normal,
        }
    }

    pub fn all_bots_off(&self) -> bool {
        self.bots.values().all(|s| *s == BotStatus::Off)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToggleDenial {
    /// `live` is refused while the risk mode is elevated.
    LiveBlocked { mode: RiskMode },
    /// Rails are a fixed set seeded at startup; unknown ids are refused.
    UnknownRail { rail_id: String },
}

impl std::fmt::Display for ToggleDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToggleDenial::LiveBlocked { mode } => {
                write!(f, "live trading blocked while risk mode is {:?}", mode)
            }
            ToggleDenial::UnknownRail { rail_id } => {
                write!(f, "unknown risk rail '{}'", rail_id)
            }
        }
    }
}

/// Outcome of a successful mutation. `events` is what the async layer
/// publishes onto the bus; an idempotent no-op carries none.
#[derive(Debug)]
pub struct Applied {
    pub changed: bool,
    pub snapshot: ToggleState,
    pub events: Vec<RiskEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn Fn(&ToggleState) + Send + Sync>;

struct Inner {
    state: ToggleState,
    listeners: Vec<(u64, Listener)>,
}

/// Single source of truth for bot run-mode and risk-pull state.
///
/// All mutations run to completion under one lock, including the
/// synchronous subscriber fan-out, so no other mutation interleaves mid-change
/// and no window exists where `risk_mode == Emergency` while a bot still
/// reads `Live`. Listeners are invoked while that lock is held and must
/// not call back into the coordinator.
pub struct ToggleCoordinator {
    inner: Mutex<Inner>,
    next_subscription: AtomicU64,
    audit: Arc<dyn AuditSink>,
}

impl ToggleCoordinator {
    pub fn new(initial: ToggleState, audit: Arc<dyn AuditSink>) -> Self {
        metrics::set_risk_mode(mode_metric(initial.risk_mode));
        Self {
            inner: Mutex::new(Inner {
                state: initial,
                listeners: Vec::new(),
            }),
            next_subscription: AtomicU64::new(1),
            audit,
        }
    }

    pub fn snapshot(&self) -> ToggleState {
        self.inner.lock().state.clone()
    }

    pub fn get_risk_status(&self) -> RiskMode {
        self.inner.lock().state.risk_mode
    }

    /// True when the risk mode is elevated or every bot is off.
    pub fn is_in_safe_mode(&self) -> bool {
        let inner = self.inner.lock();
        inner.state.risk_mode != RiskMode::Normal || inner.state.all_bots_off()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ToggleState) + Send + Sync + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().listeners.push((id, Box::new(listener)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id.0);
        inner.listeners.len() != before
    }

    /// Set a bot's run mode. Refuses `Live` while the risk mode is
    /// elevated; setting the current value is a success without a change
    /// event or subscriber call. Unknown bot ids register implicitly.
    pub fn set_bot_status(
        &self,
        bot_id: &str,
        status: BotStatus,
        reason: Option<&str>,
    ) -> Result<Applied, ToggleDenial> {
        let mut inner = self.inner.lock();

        if status == BotStatus::Live && inner.state.risk_mode != RiskMode::Normal {
            let denial = ToggleDenial::LiveBlocked {
                mode: inner.state.risk_mode,
            };
            drop(inner);
            warn!(bot_id, "bot toggle denied: {}", denial);
            self.audit.log(
                AuditLevel::Warn,
                "bot toggle denied",
                json!({ "bot_id": bot_id, "requested": status, "reason": reason, "denial": denial.to_string() }),
            );
            metrics::inc_toggle_denials();
            return Err(denial);
        }

        let prev = inner.state.bots.get(bot_id).copied().unwrap_or_default();
        if prev == status {
            return Ok(Applied {
                changed: false,
                snapshot: inner.state.clone(),
                events: Vec::new(),
            });
        }

        inner.state.bots.insert(bot_id.to_string(), status);
        self.audit.log(
            AuditLevel::Info,
            "bot toggle changed",
            json!({ "bot_id": bot_id, "from": prev, "to": status, "reason": reason }),
        );
        let events = vec![RiskEvent::BotStateChanged {
            bot_id: bot_id.to_string(),
            status,
        }];
        Ok(self.commit(&mut inner, events))
    }

    /// Flip a risk rail between enforced and monitor-only. Same
    /// idempotent no-op contract as bot toggles.
    pub fn set_rail_mode(
        &self,
        rail_id: &str,
        mode: RailMode,
        reason: Option<&str>,
    ) -> Result<Applied, ToggleDenial> {
        let mut inner = self.inner.lock();

        let Some(prev) = inner.state.rails.get(rail_id).copied() else {
            let denial = ToggleDenial::UnknownRail {
                rail_id: rail_id.to_string(),
            };
            drop(inner);
            warn!(rail_id, "rail toggle denied: {}", denial);
            self.audit.log(
                AuditLevel::Warn,
                "rail toggle denied",
                json!({ "rail_id": rail_id, "requested": mode, "reason": reason }),
            );
            metrics::inc_toggle_denials();
            return Err(denial);
        };

        if prev == mode {
            return Ok(Applied {
                changed: false,
                snapshot: inner.state.clone(),
                events: Vec::new(),
            });
        }

        inner.state.rails.insert(rail_id.to_string(), mode);
        self.audit.log(
            AuditLevel::Info,
            "rail toggle changed",
            json!({ "rail_id": rail_id, "from": prev, "to": mode, "reason": reason }),
        );
        Ok(self.commit(&mut inner, Vec::new()))
    }

    /// Soft pull: restrict new live trading pending review. Only
    /// escalates; an elevated mode is never downgraded here.
    pub fn soft_pull(&self, reason: &str) -> Applied {
        let mut inner = self.inner.lock();
        if inner.state.risk_mode != RiskMode::Normal {
            return Applied {
                changed: false,
                snapshot: inner.state.clone(),
                events: Vec::new(),
            };
        }

        inner.state.risk_mode = RiskMode::Cautious;
        metrics::set_risk_mode(mode_metric(RiskMode::Cautious));
        warn!(reason, "🛡️ RISK SOFT PULL: Normal -> Cautious");
        self.audit.log(
            AuditLevel::Warn,
            "risk soft pull",
            json!({ "from": RiskMode::Normal, "to": RiskMode::Cautious, "reason": reason }),
        );
        let events = vec![RiskEvent::SoftPull {
            reason: reason.to_string(),
        }];
        self.commit(&mut inner, events)
    }

    /// Hard pull: enter Emergency and force every live bot to simulation
    /// in the same mutation, so no subscriber ever observes
    /// `Emergency` alongside a `Live` toggle.
    pub fn hard_pull(&self, reason: &str) -> Applied {
        let mut inner = self.inner.lock();
        if inner.state.risk_mode == RiskMode::Emergency {
            return Applied {
                changed: false,
                snapshot: inner.state.clone(),
                events: Vec::new(),
            };
        }

        let prev_mode = inner.state.risk_mode;
        inner.state.risk_mode = RiskMode::Emergency;
        metrics::set_risk_mode(mode_metric(RiskMode::Emergency));

        let mut events = vec![RiskEvent::HardPull {
            reason: reason.to_string(),
        }];
        for (bot_id, status) in inner.state.bots.iter_mut() {
            if *status == BotStatus::Live {
                *status = BotStatus::Simulation;
                events.push(RiskEvent::BotStateChanged {
                    bot_id: bot_id.clone(),
                    status: BotStatus::Simulation,
                });
            }
        }

        warn!(reason, "🚨 RISK HARD PULL: {:?} -> Emergency", prev_mode);
        self.audit.log(
            AuditLevel::Error,
            "risk hard pull",
            json!({ "from": prev_mode, "to": RiskMode::Emergency, "reason": reason, "forced_bots": events.len() - 1 }),
        );
        self.commit(&mut inner, events)
    }

    /// Explicit operator acknowledgement is the only way back to Normal.
    /// Time passing or signal absence never clears an elevated mode.
    pub fn clear_risk_mode(&self, reason: &str) -> Applied {
        let mut inner = self.inner.lock();
        if inner.state.risk_mode == RiskMode::Normal {
            return Applied {
                changed: false,
                snapshot: inner.state.clone(),
                events: Vec::new(),
            };
        }

        let prev_mode = inner.state.risk_mode;
        inner.state.risk_mode = RiskMode::Normal;
        metrics::set_risk_mode(mode_metric(RiskMode::Normal));
        warn!(reason, "✅ RISK MODE CLEARED: {:?} -> Normal", prev_mode);
        self.audit.log(
            AuditLevel::Warn,
            "risk mode cleared",
            json!({ "from": prev_mode, "to": RiskMode::Normal, "reason": reason }),
        );
        let events = vec![RiskEvent::ModeCleared {
            reason: reason.to_string(),
        }];
        self.commit(&mut inner, events)
    }

    /// Unconditional recovery: every bot off, every rail monitor-only,
    /// risk mode normal. Used for manual recovery and by the external
    /// error boundary after repeated unhandled errors.
    pub fn reset_to_safe_defaults(&self, reason: &str) -> Applied {
        let mut inner = self.inner.lock();

        let prev_mode = inner.state.risk_mode;
        let mut events = Vec::new();
        for (bot_id, status) in inner.state.bots.iter_mut() {
            if *status != BotStatus::Off {
                *status = BotStatus::Off;
                events.push(RiskEvent::BotStateChanged {
                    bot_id: bot_id.clone(),
                    status: BotStatus::Off,
                });
            }
        }
        let mut rails_changed = false;
        for mode in inner.state.rails.values_mut() {
            if *mode != RailMode::MonitorOnly {
                *mode = RailMode::MonitorOnly;
                rails_changed = true;
            }
        }
        if prev_mode != RiskMode::Normal {
            inner.state.risk_mode = RiskMode::Normal;
            metrics::set_risk_mode(mode_metric(RiskMode::Normal));
            events.push(RiskEvent::ModeCleared {
                reason: reason.to_string(),
            });
        }

        metrics::inc_safe_resets();
        warn!(reason, "🔒 RESET TO SAFE DEFAULTS");
        self.audit.log(
            AuditLevel::Warn,
            "reset to safe defaults",
            json!({ "previous_mode": prev_mode, "reason": reason }),
        );

        if events.is_empty() && !rails_changed {
            return Applied {
                changed: false,
                snapshot: inner.state.clone(),
                events: Vec::new(),
            };
        }
        self.commit(&mut inner, events)
    }

    /// Notify every listener with the fresh snapshot. A panicking
    /// listener is isolated, logged and counted; the rest still run.
    fn commit(&self, inner: &mut Inner, events: Vec<RiskEvent>) -> Applied {
        let snapshot = inner.state.clone();
        for (id, listener) in inner.listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(&snapshot))).is_err() {
                warn!(subscription = *id, "toggle subscriber panicked; continuing");
                metrics::inc_subscriber_panics();
            }
        }
        Applied {
            changed: true,
            snapshot,
            events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use std::sync::atomic::AtomicU32;

    fn coordinator_with(bots: &[&str]) -> (ToggleCoordinator, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let bot_ids: Vec<String> = bots.iter().map(|s| s.to_string()).collect();
        let rail_ids = vec!["drawdown".to_string(), "exposure".to_string()];
        let coordinator = ToggleCoordinator::new(
            ToggleState::safe_defaults(&bot_ids, &rail_ids),
            audit.clone(),
        );
        (coordinator, audit)
    }

    #[test]
    fn test_safe_defaults_initial_state() {
        let (coordinator, _) = coordinator_with(&["bot_1", "bot_2"]);
        let snap = coordinator.snapshot();

        assert_eq!(snap.risk_mode, RiskMode::Normal);
        assert!(snap.all_bots_off());
        assert_eq!(snap.rails["drawdown"], RailMode::MonitorOnly);
        assert!(coordinator.is_in_safe_mode(), "all bots off counts as safe");
    }

    #[test]
    fn test_bot_transitions_under_normal_mode() {
        let (coordinator, _) = coordinator_with(&["bot_1"]);

        let applied = coordinator
            .set_bot_status("bot_1", BotStatus::Simulation, Some("warm up"))
            .unwrap();
        assert!(applied.changed);

        let applied = coordinator
            .set_bot_status("bot_1", BotStatus::Live, Some("go live"))
            .unwrap();
        assert!(applied.changed);
        assert_eq!(applied.snapshot.bots["bot_1"], BotStatus::Live);
        assert!(!coordinator.is_in_safe_mode());
    }

    #[test]
    fn test_live_denied_while_mode_elevated() {
        let (coordinator, _) = coordinator_with(&["bot_1"]);

        coordinator.soft_pull("drawdown threshold");
        let res = coordinator.set_bot_status("bot_1", BotStatus::Live, None);
        assert_eq!(
            res.unwrap_err(),
            ToggleDenial::LiveBlocked {
                mode: RiskMode::Cautious
            }
        );
        // Toggle untouched by the denial.
        assert_eq!(coordinator.snapshot().bots["bot_1"], BotStatus::Off);

        coordinator.hard_pull("manual kill");
        let res = coordinator.set_bot_status("bot_1", BotStatus::Live, None);
        assert_eq!(
            res.unwrap_err(),
            ToggleDenial::LiveBlocked {
                mode: RiskMode::Emergency
            }
        );

        // Simulation stays reachable under emergency.
        assert!(coordinator
            .set_bot_status("bot_1", BotStatus::Simulation, None)
            .is_ok());
    }

    #[test]
    fn test_hard_pull_forces_live_bots_to_simulation() {
        let (coordinator, _) = coordinator_with(&["bot_1", "bot_2"]);
        coordinator
            .set_bot_status("bot_1", BotStatus::Live, None)
            .unwrap();
        coordinator
            .set_bot_status("bot_2", BotStatus::Simulation, None)
            .unwrap();

        let applied = coordinator.hard_pull("exchange outage");
        assert!(applied.changed);
        assert_eq!(applied.snapshot.risk_mode, RiskMode::Emergency);
        assert_eq!(applied.snapshot.bots["bot_1"], BotStatus::Simulation);
        assert_eq!(applied.snapshot.bots["bot_2"], BotStatus::Simulation);

        // One hard pull event plus one forced-bot event.
        assert_eq!(applied.events.len(), 2);
        assert!(applied
            .events
            .iter()
            .any(|e| matches!(e, RiskEvent::HardPull { .. })));
        assert!(applied.events.iter().any(|e| matches!(
            e,
            RiskEvent::BotStateChanged { bot_id, status }
                if bot_id == "bot_1" && *status == BotStatus::Simulation
        )));
    }

    #[test]
    fn test_soft_pull_only_escalates() {
        let (coordinator, _) = coordinator_with(&[]);

        let applied = coordinator.soft_pull("spread widening");
        assert!(applied.changed);
        assert_eq!(coordinator.get_risk_status(), RiskMode::Cautious);

        // Repeated soft pull is a no-op without a duplicate event.
        let applied = coordinator.soft_pull("spread widening again");
        assert!(!applied.changed);
        assert!(applied.events.is_empty());

        // Soft pull never downgrades an emergency.
        coordinator.hard_pull("kill");
        let applied = coordinator.soft_pull("late signal");
        assert!(!applied.changed);
        assert_eq!(coordinator.get_risk_status(), RiskMode::Emergency);
    }

    #[test]
    fn test_clear_is_explicit_and_idempotent() {
        let (coordinator, _) = coordinator_with(&[]);
        coordinator.hard_pull("kill");

        let applied = coordinator.clear_risk_mode("operator reviewed");
        assert!(applied.changed);
        assert_eq!(coordinator.get_risk_status(), RiskMode::Normal);
        assert!(applied
            .events
            .iter()
            .any(|e| matches!(e, RiskEvent::ModeCleared { .. })));

        let applied = coordinator.clear_risk_mode("double clear");
        assert!(!applied.changed);
        assert!(applied.events.is_empty());
    }

    #[test]
    fn test_idempotent_noop_skips_subscribers() {
        let (coordinator, _) = coordinator_with(&["bot_1"]);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_sub = calls.clone();
        coordinator.subscribe(move |_| {
            calls_sub.fetch_add(1, Ordering::SeqCst);
        });

        // bot_1 is already Off.
        let applied = coordinator
            .set_bot_status("bot_1", BotStatus::Off, None)
            .unwrap();
        assert!(!applied.changed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        coordinator
            .set_bot_status("bot_1", BotStatus::Simulation, None)
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_to_safe_defaults() {
        let (coordinator, _) = coordinator_with(&["bot_1"]);
        coordinator
            .set_bot_status("bot_1", BotStatus::Live, None)
            .unwrap();
        coordinator
            .set_rail_mode("drawdown", RailMode::Enforced, None)
            .unwrap();
        coordinator.hard_pull("kill");

        let applied = coordinator.reset_to_safe_defaults("manual recovery");
        assert!(applied.changed);
        assert_eq!(applied.snapshot.risk_mode, RiskMode::Normal);
        assert_eq!(applied.snapshot.bots["bot_1"], BotStatus::Off);
        assert_eq!(applied.snapshot.rails["drawdown"], RailMode::MonitorOnly);
        assert!(coordinator.is_in_safe_mode());
    }

    #[test]
    fn test_subscriber_panic_does_not_block_others() {
        let (coordinator, _) = coordinator_with(&["bot_1"]);
        let survivor_calls = Arc::new(AtomicU32::new(0));

        coordinator.subscribe(|_| panic!("broken listener"));
        let survivor = survivor_calls.clone();
        coordinator.subscribe(move |snap: &ToggleState| {
            assert_eq!(snap.bots["bot_1"], BotStatus::Simulation);
            survivor.fetch_add(1, Ordering::SeqCst);
        });

        let applied = coordinator
            .set_bot_status("bot_1", BotStatus::Simulation, None)
            .unwrap();
        assert!(applied.changed, "panicking listener must not poison state");
        assert_eq!(survivor_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let (coordinator, _) = coordinator_with(&["bot_1"]);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_sub = calls.clone();
        let id = coordinator.subscribe(move |_| {
            calls_sub.fetch_add(1, Ordering::SeqCst);
        });

        coordinator
            .set_bot_status("bot_1", BotStatus::Simulation, None)
            .unwrap();
        assert!(coordinator.unsubscribe(id));
        coordinator
            .set_bot_status("bot_1", BotStatus::Off, None)
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!coordinator.unsubscribe(id), "second unsubscribe is a no-op");
    }

    #[test]
    fn test_unknown_rail_denied() {
        let (coordinator, audit) = coordinator_with(&[]);
        let res = coordinator.set_rail_mode("slippage", RailMode::Enforced, None);
        assert_eq!(
            res.unwrap_err(),
            ToggleDenial::UnknownRail {
                rail_id: "slippage".to_string()
            }
        );
        assert!(audit.contains("rail toggle denied"));
    }

    #[test]
    fn test_denials_and_changes_audited() {
        let (coordinator, audit) = coordinator_with(&["bot_1"]);
        coordinator
            .set_bot_status("bot_1", BotStatus::Simulation, Some("warm up"))
            .unwrap();
        coordinator.soft_pull("drawdown");
        let _ = coordinator.set_bot_status("bot_1", BotStatus::Live, None);

        assert!(audit.contains("bot toggle changed"));
        assert!(audit.contains("risk soft pull"));
        assert!(audit.contains("bot toggle denied"));
    }
}
