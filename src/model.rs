use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// A manual or bot-driven order request as it arrives from the UI layer.
///
/// The control core does not judge business legality of these fields
/// beyond non-emptiness; sizing and instrument rules live upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTicket {
    pub account_id: String,
    pub workspace_id: String,
    /// Present for bot-driven orders, absent for manual ones.
    #[serde(default)]
    pub bot_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    /// true routes to the live brokerage account, false to paper.
    #[serde(default)]
    pub live: bool,
}

/// The memoized outcome of a gated submission. Duplicate submissions
/// within the idempotency window receive this exact value back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub accepted_at: i64,
}
