//! Per-timeframe and per-symbol cascade results.

use crate::domain::condition::ConditionResult;
use crate::domain::context::EvaluationContext;
use crate::domain::timeframe::Timeframe;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Stable reason codes attached to non-VALID outcomes.
pub mod reason {
    pub const INSUFFICIENT_DATA: &str = "INSUFFICIENT_DATA";
    pub const TOO_RECENT: &str = "TOO_RECENT";
    pub const KILL_SWITCH_OFF: &str = "KILL_SWITCH_OFF";
    pub const GRACE_WINDOW: &str = "GRACE_WINDOW";
    pub const NO_RULES_CONFIGURED: &str = "NO_RULES_CONFIGURED";
    pub const UNDECIDED_MISSING_DATA: &str = "UNDECIDED_MISSING_DATA";
    pub const NO_SIGNAL: &str = "NO_SIGNAL";
    pub const NO_PROCESSOR: &str = "NO_PROCESSOR";
    pub const PROCESSOR_PANIC: &str = "PROCESSOR_PANIC";

    /// `ALIGNMENT_<tf>_NE_<parent>`
    pub fn alignment(tf: super::Timeframe, parent: super::Timeframe) -> String {
        format!("ALIGNMENT_{tf}_NE_{parent}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeframeStatus {
    Valid,
    Invalid,
    Skipped,
    GraceWindow,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalSide {
    Long,
    Short,
    #[default]
    None,
}

impl SignalSide {
    /// Both sides passing resolves to LONG.
    pub fn resolve(long_passed: bool, short_passed: bool) -> SignalSide {
        match (long_passed, short_passed) {
            (true, _) => SignalSide::Long,
            (false, true) => SignalSide::Short,
            (false, false) => SignalSide::None,
        }
    }

    pub fn is_directional(self) -> bool {
        self != SignalSide::None
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalSide::Long => "LONG",
            SignalSide::Short => "SHORT",
            SignalSide::None => "NONE",
        }
    }
}

impl fmt::Display for SignalSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One evaluated expression in a rule list, with its audit label.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledResult {
    pub name: String,
    #[serde(flatten)]
    pub result: ConditionResult,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeframeResult {
    pub timeframe: Timeframe,
    pub status: TimeframeStatus,
    pub signal_side: SignalSide,
    pub kline_time: Option<DateTime<Utc>>,
    pub current_price: Option<f64>,
    pub atr: Option<f64>,
    pub conditions_long: Vec<LabeledResult>,
    pub conditions_short: Vec<LabeledResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Context the rules were evaluated against; reused by the execution selector.
    #[serde(skip)]
    pub context: Option<Arc<EvaluationContext>>,
}

impl TimeframeResult {
    fn bare(timeframe: Timeframe, status: TimeframeStatus) -> Self {
        Self {
            timeframe,
            status,
            signal_side: SignalSide::None,
            kline_time: None,
            current_price: None,
            atr: None,
            conditions_long: Vec::new(),
            conditions_short: Vec::new(),
            reason: None,
            error: None,
            context: None,
        }
    }

    pub fn skipped(timeframe: Timeframe, reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::bare(timeframe, TimeframeStatus::Skipped)
        }
    }

    pub fn grace_window(timeframe: Timeframe) -> Self {
        Self {
            reason: Some(reason::GRACE_WINDOW.to_string()),
            ..Self::bare(timeframe, TimeframeStatus::GraceWindow)
        }
    }

    pub fn invalid(timeframe: Timeframe, reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::bare(timeframe, TimeframeStatus::Invalid)
        }
    }

    pub fn error(timeframe: Timeframe, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::bare(timeframe, TimeframeStatus::Error)
        }
    }

    pub fn valid(timeframe: Timeframe, side: SignalSide) -> Self {
        Self {
            signal_side: side,
            ..Self::bare(timeframe, TimeframeStatus::Valid)
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == TimeframeStatus::Valid
    }

    /// Signal side, meaningful only for VALID results.
    pub fn effective_side(&self) -> SignalSide {
        if self.is_valid() {
            self.signal_side
        } else {
            SignalSide::None
        }
    }
}

/// Compact record of a processed step, fed forward as known signals.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownSignal {
    pub timeframe: Timeframe,
    pub status: TimeframeStatus,
    pub signal_side: SignalSide,
    pub kline_time: Option<DateTime<Utc>>,
}

impl From<&TimeframeResult> for KnownSignal {
    fn from(r: &TimeframeResult) -> Self {
        Self {
            timeframe: r.timeframe,
            status: r.status,
            signal_side: r.effective_side(),
            kline_time: r.kline_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SymbolStatus {
    Ready,
    Invalid,
    Skipped,
    GraceWindow,
    Error,
}

impl SymbolStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SymbolStatus::Ready => "READY",
            SymbolStatus::Invalid => "INVALID",
            SymbolStatus::Skipped => "SKIPPED",
            SymbolStatus::GraceWindow => "GRACE_WINDOW",
            SymbolStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for SymbolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TimeframeStatus> for SymbolStatus {
    /// Terminal mapping for a failed step. A VALID step never terminates a run
    /// on its own, so it maps to INVALID here.
    fn from(status: TimeframeStatus) -> Self {
        match status {
            TimeframeStatus::GraceWindow => SymbolStatus::GraceWindow,
            TimeframeStatus::Skipped => SymbolStatus::Skipped,
            TimeframeStatus::Error => SymbolStatus::Error,
            TimeframeStatus::Invalid | TimeframeStatus::Valid => SymbolStatus::Invalid,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolResultDto {
    pub symbol: String,
    pub status: SymbolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_tf: Option<Timeframe>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_timeframe: Option<Timeframe>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_side: Option<SignalSide>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub context: BTreeMap<String, Value>,
}

impl SymbolResultDto {
    pub fn is_ready(&self) -> bool {
        self.status == SymbolStatus::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_passing_breaks_to_long() {
        assert_eq!(SignalSide::resolve(true, true), SignalSide::Long);
        assert_eq!(SignalSide::resolve(false, true), SignalSide::Short);
        assert_eq!(SignalSide::resolve(false, false), SignalSide::None);
    }

    #[test]
    fn side_is_ignored_unless_valid() {
        let mut r = TimeframeResult::invalid(Timeframe::H1, reason::NO_SIGNAL);
        r.signal_side = SignalSide::Long;
        assert_eq!(r.effective_side(), SignalSide::None);
        assert_eq!(KnownSignal::from(&r).signal_side, SignalSide::None);
        let v = TimeframeResult::valid(Timeframe::H1, SignalSide::Short);
        assert_eq!(v.effective_side(), SignalSide::Short);
    }

    #[test]
    fn terminal_status_mapping() {
        assert_eq!(SymbolStatus::from(TimeframeStatus::Skipped), SymbolStatus::Skipped);
        assert_eq!(
            SymbolStatus::from(TimeframeStatus::GraceWindow),
            SymbolStatus::GraceWindow
        );
        assert_eq!(SymbolStatus::from(TimeframeStatus::Error), SymbolStatus::Error);
        assert_eq!(SymbolStatus::from(TimeframeStatus::Invalid), SymbolStatus::Invalid);
    }

    #[test]
    fn alignment_reason_format() {
        assert_eq!(
            reason::alignment(Timeframe::M15, Timeframe::H1),
            "ALIGNMENT_15m_NE_1h"
        );
    }

    #[test]
    fn timeframe_result_serializes_camel_case() {
        let r = TimeframeResult::skipped(Timeframe::M5, reason::TOO_RECENT);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["status"], "SKIPPED");
        assert_eq!(json["signalSide"], "NONE");
        assert_eq!(json["reason"], "TOO_RECENT");
        assert_eq!(json["timeframe"], "5m");
        assert!(json.get("context").is_none());
    }

    #[test]
    fn dto_omits_absent_fields() {
        let dto = SymbolResultDto {
            symbol: "BTCUSDT".into(),
            status: SymbolStatus::GraceWindow,
            execution_tf: None,
            failed_timeframe: Some(Timeframe::H4),
            signal_side: None,
            current_price: None,
            atr: None,
            reason: Some(reason::GRACE_WINDOW.into()),
            context: BTreeMap::new(),
        };
        let json = serde_json::to_value(&dto).unwrap();
        assert_eq!(json["status"], "GRACE_WINDOW");
        assert_eq!(json["failedTimeframe"], "4h");
        assert!(json.get("executionTf").is_none());
    }
}
