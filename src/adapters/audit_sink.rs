//! Audit sinks.

use crate::ports::audit_port::{AuditRecord, AuditSink};
use std::sync::Mutex;

/// Writes each record as one JSON line on the `audit` log target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, record: AuditRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => log::info!(target: "audit", "{line}"),
            Err(e) => log::warn!(target: "audit", "unserializable audit record for {}: {e}", record.symbol),
        }
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn for_symbol(&self, symbol: &str) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}
