// Canonical Subject Catalog for the control service.
// This file is the Source of Truth for subject strings.

// -----------------------------------------------------------------------------
// COMMANDS
// -----------------------------------------------------------------------------

// Risk-enforcement signals (soft_pull / hard_pull / clear)
pub const CMD_RISK_SIGNAL: &str = "stag.cmd.risk.signal.v1";

// Operator recovery
pub const CMD_CONTROL_RESET: &str = "stag.cmd.control.reset.v1";

// -----------------------------------------------------------------------------
// EVENTS
// -----------------------------------------------------------------------------

pub const EVT_RISK_SOFT_PULL: &str = "stag.evt.risk.soft_pull.v1";
pub const EVT_RISK_HARD_PULL: &str = "stag.evt.risk.hard_pull.v1";
pub const EVT_RISK_MODE_CLEARED: &str = "stag.evt.risk.mode_cleared.v1";
pub const EVT_BOT_STATE_CHANGED: &str = "stag.evt.bot.state_changed.v1";
pub const EVT_ORDER_ACCEPTED: &str = "stag.evt.order.accepted.v1";

// -----------------------------------------------------------------------------
// SUBSCRIPTION PATTERNS (WILDCARDS)
// -----------------------------------------------------------------------------

pub const CMD_WILDCARD: &str = "stag.cmd.>";
pub const EVT_RISK_WILDCARD: &str = "stag.evt.risk.>";
