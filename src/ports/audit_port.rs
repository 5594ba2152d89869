//! Audit sink port.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub run_id: Uuid,
    pub symbol: String,
    pub step: String,
    pub message: String,
    pub context: Value,
}

/// Fire-and-forget audit trail. Implementations swallow their own failures;
/// the orchestrator also contains a sink that panics.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}
