use parking_lot::Mutex;
use serde_json::Value;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
}

/// Append-only audit trail for toggle mutations, denials, pulls and
/// dedup hits. Fire-and-forget: implementations must not fail back into
/// the caller and no delivery guarantee is required.
pub trait AuditSink: Send + Sync {
    fn log(&self, level: AuditLevel, message: &str, context: Value);
}

/// Forwards audit records to the tracing subscriber.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log(&self, level: AuditLevel, message: &str, context: Value) {
        match level {
            AuditLevel::Info => info!(target: "audit", %context, "{}", message),
            AuditLevel::Warn => warn!(target: "audit", %context, "{}", message),
            AuditLevel::Error => error!(target: "audit", %context, "{}", message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub level: AuditLevel,
    pub message: String,
    pub context: Value,
}

/// Vec-backed sink for asserting on the audit trail in tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|r| r.message.contains(needle))
    }
}

impl AuditSink for MemoryAuditSink {
    fn log(&self, level: AuditLevel, message: &str, context: Value) {
        self.records.lock().push(AuditRecord {
            level,
            message: message.to_string(),
            context,
        });
    }
}
