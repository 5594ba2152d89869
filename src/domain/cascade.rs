//! Cascade orchestrator: runs timeframe processors coarsest to finest and
//! stops at the first step that does not validate.
//!
//! State machine per symbol run:
//!
//! ```text
//! RUNNING(tf) --VALID, aligned--> RUNNING(finer tf) ... --> READY
//!      |--non-VALID step----------> SKIPPED | GRACE_WINDOW | ERROR | INVALID
//!      |--VALID, side != parent---> INVALID (ALIGNMENT_<tf>_NE_<parent>)
//! ```

use crate::domain::processor::{ProcessContext, RunFlags, TimeframeProcessor};
use crate::domain::result::{
    KnownSignal, SignalSide, SymbolResultDto, SymbolStatus, TimeframeResult, reason,
};
use crate::domain::rulebook::RuleBook;
use crate::domain::timeframe::Timeframe;
use crate::ports::audit_port::{AuditRecord, AuditSink};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Generated per run when absent.
    pub run_id: Option<Uuid>,
    pub now: DateTime<Utc>,
    /// Overrides the rule book's `start_from_timeframe`.
    pub start_from: Option<Timeframe>,
    pub flags: RunFlags,
}

impl RunOptions {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            run_id: None,
            now,
            start_from: None,
            flags: RunFlags::default(),
        }
    }
}

/// Terminal result of one symbol's cascade plus every step it ran.
#[derive(Debug, Clone)]
pub struct CascadeOutcome {
    pub run_id: Uuid,
    pub result: SymbolResultDto,
    pub steps: Vec<TimeframeResult>,
}

pub struct CascadeOrchestrator {
    processors: BTreeMap<Timeframe, Arc<dyn TimeframeProcessor>>,
    audit: Arc<dyn AuditSink>,
}

impl CascadeOrchestrator {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            processors: BTreeMap::new(),
            audit,
        }
    }

    /// Register `processor` for its timeframe, replacing any previous one.
    pub fn with_processor(mut self, processor: Arc<dyn TimeframeProcessor>) -> Self {
        self.processors.insert(processor.timeframe(), processor);
        self
    }

    pub fn with_processors<I>(self, processors: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn TimeframeProcessor>>,
    {
        processors.into_iter().fold(self, Self::with_processor)
    }

    pub fn run(&self, symbol: &str, rules: &RuleBook, options: &RunOptions) -> CascadeOutcome {
        let run_id = options.run_id.unwrap_or_else(Uuid::new_v4);
        let start = options.start_from.unwrap_or(rules.start_from());
        let mut known: Vec<KnownSignal> = Vec::new();
        let mut steps: Vec<TimeframeResult> = Vec::new();

        log::debug!("{symbol}: run {run_id} starting at {start}");

        for &tf in start.cascade_from() {
            let step = match self.processors.get(&tf) {
                Some(processor) => {
                    let ctx = ProcessContext {
                        run_id,
                        now: options.now,
                        prior: &known,
                        flags: options.flags,
                        rules,
                    };
                    match catch_unwind(AssertUnwindSafe(|| processor.process(symbol, &ctx))) {
                        Ok(step) => step,
                        Err(payload) => {
                            let message = panic_message(payload.as_ref());
                            log::error!("{symbol} {tf}: processor panicked: {message}");
                            TimeframeResult {
                                reason: Some(reason::PROCESSOR_PANIC.to_string()),
                                ..TimeframeResult::error(tf, message)
                            }
                        }
                    }
                }
                None => {
                    log::error!("{symbol} {tf}: no processor registered");
                    TimeframeResult {
                        reason: Some(reason::NO_PROCESSOR.to_string()),
                        ..TimeframeResult::error(tf, format!("no processor registered for {tf}"))
                    }
                }
            };

            self.audit_step(run_id, symbol, &step);

            if !step.is_valid() {
                let status = SymbolStatus::from(step.status);
                let reason = step.reason.clone().or_else(|| step.error.clone());
                steps.push(step);
                return self.finish(run_id, symbol, start, status, Some(tf), reason, steps, &known);
            }

            if let Some(parent) = steps.last() {
                if step.signal_side != parent.signal_side {
                    let reason = reason::alignment(tf, parent.timeframe);
                    log::debug!(
                        "{symbol}: {tf} {} does not match {} {}",
                        step.signal_side,
                        parent.timeframe,
                        parent.signal_side
                    );
                    steps.push(step);
                    return self.finish(
                        run_id,
                        symbol,
                        start,
                        SymbolStatus::Invalid,
                        Some(tf),
                        Some(reason),
                        steps,
                        &known,
                    );
                }
            }

            known.push(KnownSignal::from(&step));
            steps.push(step);
        }

        let terminal = steps.last().map(|s| (s.timeframe, s.signal_side));
        match terminal {
            Some((_, side)) if side.is_directional() => {
                self.finish(run_id, symbol, start, SymbolStatus::Ready, None, None, steps, &known)
            }
            other => {
                let tf = other.map_or(start, |(tf, _)| tf);
                self.finish(
                    run_id,
                    symbol,
                    start,
                    SymbolStatus::Invalid,
                    Some(tf),
                    Some(reason::NO_SIGNAL.to_string()),
                    steps,
                    &known,
                )
            }
        }
    }

    /// Hand a record to the sink; a panicking sink is logged and ignored.
    fn record(&self, record: AuditRecord) {
        let (symbol, step) = (record.symbol.clone(), record.step.clone());
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.audit.record(record))) {
            log::error!(
                "{symbol} {step}: audit sink panicked: {}",
                panic_message(payload.as_ref())
            );
        }
    }

    fn audit_step(&self, run_id: Uuid, symbol: &str, step: &TimeframeResult) {
        let context = serde_json::to_value(step).unwrap_or(Value::Null);
        self.record(AuditRecord {
            run_id,
            symbol: symbol.to_string(),
            step: step.timeframe.to_string(),
            message: format!("{:?} {}", step.status, step.signal_side),
            context,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        run_id: Uuid,
        symbol: &str,
        start: Timeframe,
        status: SymbolStatus,
        failed_timeframe: Option<Timeframe>,
        reason: Option<String>,
        steps: Vec<TimeframeResult>,
        known: &[KnownSignal],
    ) -> CascadeOutcome {
        let last = steps.last();
        let ready = status == SymbolStatus::Ready;

        let mut context = BTreeMap::new();
        context.insert("runId".to_string(), json!(run_id));
        context.insert("startFrom".to_string(), json!(start));
        context.insert("knownSignals".to_string(), json!(known));

        let result = SymbolResultDto {
            symbol: symbol.to_string(),
            status,
            execution_tf: if ready { last.map(|s| s.timeframe) } else { None },
            failed_timeframe,
            signal_side: if ready {
                last.map(|s| s.signal_side)
            } else {
                None
            },
            current_price: last.and_then(|s| s.current_price),
            atr: last.and_then(|s| s.atr),
            reason,
            context,
        };

        match status {
            SymbolStatus::Ready => log::info!(
                "{symbol}: READY {} on {}",
                result.signal_side.unwrap_or(SignalSide::None),
                result.execution_tf.map_or("-", Timeframe::as_str)
            ),
            SymbolStatus::Error => log::error!(
                "{symbol}: ERROR at {} ({})",
                failed_timeframe.map_or("-", Timeframe::as_str),
                result.reason.as_deref().unwrap_or("")
            ),
            _ => log::info!(
                "{symbol}: {status:?} at {} ({})",
                failed_timeframe.map_or("-", Timeframe::as_str),
                result.reason.as_deref().unwrap_or("")
            ),
        }

        self.record(AuditRecord {
            run_id,
            symbol: symbol.to_string(),
            step: "result".to_string(),
            message: format!("{status:?}"),
            context: serde_json::to_value(&result).unwrap_or(Value::Null),
        });

        CascadeOutcome {
            run_id,
            result,
            steps,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::registry::ConditionRegistry;
    use crate::domain::result::TimeframeStatus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Sink(Mutex<Vec<AuditRecord>>);

    impl AuditSink for Sink {
        fn record(&self, record: AuditRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    struct Scripted {
        tf: Timeframe,
        status: TimeframeStatus,
        side: SignalSide,
        seen_prior: Mutex<Vec<usize>>,
    }

    impl TimeframeProcessor for Scripted {
        fn timeframe(&self) -> Timeframe {
            self.tf
        }

        fn process(&self, _symbol: &str, ctx: &ProcessContext<'_>) -> TimeframeResult {
            self.seen_prior.lock().unwrap().push(ctx.prior.len());
            match self.status {
                TimeframeStatus::Valid => TimeframeResult::valid(self.tf, self.side),
                TimeframeStatus::Skipped => TimeframeResult::skipped(self.tf, reason::TOO_RECENT),
                _ => TimeframeResult::invalid(self.tf, "scripted"),
            }
        }
    }

    struct Panics;

    impl TimeframeProcessor for Panics {
        fn timeframe(&self) -> Timeframe {
            Timeframe::H1
        }

        fn process(&self, _symbol: &str, _ctx: &ProcessContext<'_>) -> TimeframeResult {
            panic!("index out of bounds");
        }
    }

    fn scripted(tf: Timeframe, status: TimeframeStatus, side: SignalSide) -> Arc<Scripted> {
        Arc::new(Scripted {
            tf,
            status,
            side,
            seen_prior: Mutex::new(Vec::new()),
        })
    }

    fn book() -> RuleBook {
        let cfg = json!({"validation": {"timeframe": {}}});
        RuleBook::compile(&cfg, &ConditionRegistry::new()).unwrap()
    }

    fn options() -> RunOptions {
        RunOptions::at(DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z").unwrap().into())
    }

    #[test]
    fn known_signals_accumulate() {
        let a = scripted(Timeframe::H4, TimeframeStatus::Valid, SignalSide::Short);
        let b = scripted(Timeframe::H1, TimeframeStatus::Valid, SignalSide::Short);
        let orch = CascadeOrchestrator::new(Arc::new(Sink::default()))
            .with_processor(a.clone())
            .with_processor(b.clone());
        let opts = RunOptions {
            start_from: Some(Timeframe::H4),
            ..options()
        };
        let out = orch.run("ETHUSDT", &book(), &opts);
        // 15m has no processor.
        assert_eq!(out.result.status, SymbolStatus::Error);
        assert_eq!(out.result.reason.as_deref(), Some(reason::NO_PROCESSOR));
        assert_eq!(*a.seen_prior.lock().unwrap(), vec![0]);
        assert_eq!(*b.seen_prior.lock().unwrap(), vec![1]);
    }

    #[test]
    fn start_from_override_and_ready() {
        let m5 = scripted(Timeframe::M5, TimeframeStatus::Valid, SignalSide::Short);
        let m1 = scripted(Timeframe::M1, TimeframeStatus::Valid, SignalSide::Short);
        let orch = CascadeOrchestrator::new(Arc::new(Sink::default()))
            .with_processors([
                m5 as Arc<dyn TimeframeProcessor>,
                m1 as Arc<dyn TimeframeProcessor>,
            ]);
        let opts = RunOptions {
            start_from: Some(Timeframe::M5),
            run_id: Some(Uuid::nil()),
            ..options()
        };
        let out = orch.run("ETHUSDT", &book(), &opts);
        assert_eq!(out.run_id, Uuid::nil());
        assert_eq!(out.result.status, SymbolStatus::Ready);
        assert_eq!(out.result.execution_tf, Some(Timeframe::M1));
        assert_eq!(out.result.signal_side, Some(SignalSide::Short));
        assert_eq!(out.steps.len(), 2);
    }

    #[test]
    fn none_terminal_side_is_invalid() {
        let m1 = scripted(Timeframe::M1, TimeframeStatus::Valid, SignalSide::None);
        let orch = CascadeOrchestrator::new(Arc::new(Sink::default())).with_processor(m1);
        let opts = RunOptions {
            start_from: Some(Timeframe::M1),
            ..options()
        };
        let out = orch.run("ETHUSDT", &book(), &opts);
        assert_eq!(out.result.status, SymbolStatus::Invalid);
        assert_eq!(out.result.reason.as_deref(), Some(reason::NO_SIGNAL));
        assert_eq!(out.result.failed_timeframe, Some(Timeframe::M1));
        assert_eq!(out.result.execution_tf, None);
    }

    #[test]
    fn panic_is_contained_as_error() {
        let orch = CascadeOrchestrator::new(Arc::new(Sink::default())).with_processor(Arc::new(Panics));
        let opts = RunOptions {
            start_from: Some(Timeframe::H1),
            ..options()
        };
        let out = orch.run("ETHUSDT", &book(), &opts);
        assert_eq!(out.result.status, SymbolStatus::Error);
        assert_eq!(out.result.failed_timeframe, Some(Timeframe::H1));
        assert_eq!(out.steps[0].error.as_deref(), Some("index out of bounds"));
        assert_eq!(out.steps[0].reason.as_deref(), Some(reason::PROCESSOR_PANIC));
    }

    #[test]
    fn every_step_and_the_result_are_audited() {
        let sink = Arc::new(Sink::default());
        let m5 = scripted(Timeframe::M5, TimeframeStatus::Valid, SignalSide::Long);
        let m1 = scripted(Timeframe::M1, TimeframeStatus::Skipped, SignalSide::None);
        let orch = CascadeOrchestrator::new(sink.clone()).with_processor(m5).with_processor(m1);
        let opts = RunOptions {
            start_from: Some(Timeframe::M5),
            ..options()
        };
        let out = orch.run("ETHUSDT", &book(), &opts);
        assert_eq!(out.result.status, SymbolStatus::Skipped);
        let records = sink.0.lock().unwrap();
        let steps: Vec<&str> = records.iter().map(|r| r.step.as_str()).collect();
        assert_eq!(steps, vec!["5m", "1m", "result"]);
        assert!(records.iter().all(|r| r.run_id == out.run_id));
    }

    struct PanickingSink;

    impl AuditSink for PanickingSink {
        fn record(&self, _record: AuditRecord) {
            panic!("audit store unavailable");
        }
    }

    #[test]
    fn panicking_audit_sink_does_not_abort_the_run() {
        let m5 = scripted(Timeframe::M5, TimeframeStatus::Valid, SignalSide::Long);
        let m1 = scripted(Timeframe::M1, TimeframeStatus::Valid, SignalSide::Long);
        let orch = CascadeOrchestrator::new(Arc::new(PanickingSink))
            .with_processor(m5.clone())
            .with_processor(m1.clone());
        let opts = RunOptions {
            start_from: Some(Timeframe::M5),
            ..options()
        };

        let out = orch.run("ETHUSDT", &book(), &opts);

        assert_eq!(out.result.status, SymbolStatus::Ready);
        assert_eq!(out.result.execution_tf, Some(Timeframe::M1));
        assert_eq!(out.steps.len(), 2);
        assert_eq!(m1.seen_prior.lock().unwrap().len(), 1);
    }
}
