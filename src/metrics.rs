use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};

// --- Control Plane Metrics ---

pub static RISK_MODE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "stag_control_risk_mode",
        "Current Risk Mode (0=Normal, 1=Cautious, 2=Emergency)"
    )
    .expect("risk_mode gauge")
});

pub static IDEMPOTENCY_HITS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stag_control_idempotency_hits_total",
        "Duplicate submissions served from the idempotency cache"
    )
    .expect("idempotency_hits counter")
});

pub static IDEMPOTENCY_MISSES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stag_control_idempotency_misses_total",
        "First-seen submissions admitted to execution"
    )
    .expect("idempotency_misses counter")
});

pub static INFLIGHT_REJECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stag_control_inflight_rejections_total",
        "Submissions rejected because the same key was still executing"
    )
    .expect("inflight_rejections counter")
});

pub static GATE_DENIALS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stag_control_gate_denials_total",
        "Order tickets denied by the trade gate"
    )
    .expect("gate_denials counter")
});

pub static TOGGLE_DENIALS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stag_control_toggle_denials_total",
        "Toggle mutations denied by the coordinator"
    )
    .expect("toggle_denials counter")
});

pub static SAFE_RESETS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stag_control_safe_resets_total",
        "Times the coordinator was reset to safe defaults"
    )
    .expect("safe_resets counter")
});

pub static SUBSCRIBER_PANICS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stag_control_subscriber_panics_total",
        "Toggle subscribers that panicked during notification"
    )
    .expect("subscriber_panics counter")
});

pub static ORDERS_GATED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stag_control_orders_gated_total",
        "Order tickets that passed the gate and executed"
    )
    .expect("orders_gated counter")
});

pub fn set_risk_mode(mode: i64) {
    RISK_MODE.set(mode);
}

pub fn inc_idempotency_hits() {
    IDEMPOTENCY_HITS.inc();
}

pub fn inc_idempotency_misses() {
    IDEMPOTENCY_MISSES.inc();
}

pub fn inc_inflight_rejections() {
    INFLIGHT_REJECTIONS.inc();
}

pub fn inc_gate_denials() {
    GATE_DENIALS.inc();
}

pub fn inc_toggle_denials() {
    TOGGLE_DENIALS.inc();
}

pub fn inc_safe_resets() {
    SAFE_RESETS.inc();
}

pub fn inc_subscriber_panics() {
    SUBSCRIBER_PANICS.inc();
}

pub fn inc_orders_gated() {
    ORDERS_GATED.inc();
}
