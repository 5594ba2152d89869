#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tfcascade::domain::bar::Bar;
use tfcascade::domain::context::{EvaluationContext, FactValue};
use tfcascade::domain::error::CascadeError;
use tfcascade::domain::processor::{ProcessContext, TimeframeProcessor};
use tfcascade::domain::registry::ConditionRegistry;
use tfcascade::domain::result::{SignalSide, TimeframeResult};
use tfcascade::domain::rulebook::RuleBook;
use tfcascade::domain::timeframe::Timeframe;
use tfcascade::ports::bar_port::BarSource;
use tfcascade::ports::indicator_port::{ContextOptions, IndicatorBuilder};

/// 12:00:30 UTC, half a minute after every timeframe's bar boundary.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap()
}

/// `count` consecutive bars for `tf` whose last one closed at or before `now`.
pub fn closed_bars(symbol: &str, tf: Timeframe, count: usize, now: DateTime<Utc>) -> Vec<Bar> {
    let last_open = tf.bar_open(now) - tf.step();
    bars_ending_at(symbol, tf, count, last_open)
}

pub fn bars_ending_at(symbol: &str, tf: Timeframe, count: usize, last_open: DateTime<Utc>) -> Vec<Bar> {
    (0..count)
        .map(|i| {
            let open_time = last_open - tf.step() * (count - 1 - i) as i32;
            let close = 100.0 + i as f64 * 0.1;
            Bar {
                symbol: symbol.to_string(),
                timeframe: tf,
                open_time,
                open: close - 0.05,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume: 1_000.0,
                extras: BTreeMap::new(),
            }
        })
        .collect()
}

/// Bars keyed by symbol and timeframe, with per-timeframe fetch counters.
#[derive(Default)]
pub struct FakeBarSource {
    bars: HashMap<(String, Timeframe), Vec<Bar>>,
    errors: HashMap<Timeframe, String>,
    calls: Mutex<Vec<Timeframe>>,
}

impl FakeBarSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bars(mut self, symbol: &str, tf: Timeframe, bars: Vec<Bar>) -> Self {
        self.bars.insert((symbol.to_string(), tf), bars);
        self
    }

    /// Closed bars for every timeframe.
    pub fn full(symbol: &str, count: usize, now: DateTime<Utc>) -> Self {
        Timeframe::ALL.iter().fold(Self::new(), |src, &tf| {
            src.with_bars(symbol, tf, closed_bars(symbol, tf, count, now))
        })
    }

    pub fn with_error(mut self, tf: Timeframe, reason: &str) -> Self {
        self.errors.insert(tf, reason.to_string());
        self
    }

    pub fn fetched(&self) -> Vec<Timeframe> {
        let mut tfs = self.calls.lock().unwrap().clone();
        tfs.dedup();
        tfs
    }
}

impl BarSource for FakeBarSource {
    fn get_bars(&self, symbol: &str, tf: Timeframe, limit: usize) -> Result<Vec<Bar>, CascadeError> {
        self.calls.lock().unwrap().push(tf);
        if let Some(reason) = self.errors.get(&tf) {
            return Err(CascadeError::DataSource {
                reason: reason.clone(),
            });
        }
        let all = self
            .bars
            .get(&(symbol.to_string(), tf))
            .cloned()
            .unwrap_or_default();
        let skip = all.len().saturating_sub(limit);
        Ok(all[skip..].to_vec())
    }

    fn get_last_bar(&self, symbol: &str, tf: Timeframe) -> Result<Option<Bar>, CascadeError> {
        Ok(self
            .bars
            .get(&(symbol.to_string(), tf))
            .and_then(|b| b.last().cloned()))
    }
}

/// Fixed numeric facts per timeframe; unknown timeframes get an empty context.
#[derive(Default)]
pub struct FakeIndicators {
    facts: HashMap<Timeframe, Vec<(String, f64)>>,
    pub seen_known: Mutex<Vec<(Timeframe, usize)>>,
}

impl FakeIndicators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tf: Timeframe, facts: &[(&str, f64)]) -> Self {
        self.facts.insert(
            tf,
            facts.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        );
        self
    }

    pub fn everywhere(facts: &[(&str, f64)]) -> Self {
        Timeframe::ALL
            .iter()
            .fold(Self::new(), |ind, &tf| ind.with(tf, facts))
    }
}

impl IndicatorBuilder for FakeIndicators {
    fn build_context(
        &self,
        symbol: &str,
        tf: Timeframe,
        bars: &[Bar],
        options: &ContextOptions,
    ) -> Result<EvaluationContext, CascadeError> {
        self.seen_known
            .lock()
            .unwrap()
            .push((tf, options.known_signals.len()));
        let mut facts: BTreeMap<String, FactValue> = self
            .facts
            .get(&tf)
            .map(|f| {
                f.iter()
                    .map(|(k, v)| (k.clone(), FactValue::Number(*v)))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(last) = bars.last() {
            facts
                .entry("close".to_string())
                .or_insert(FactValue::Number(last.close));
        }
        Ok(EvaluationContext::new(symbol, tf, facts))
    }
}

/// Processor returning a canned result and counting its calls.
pub struct StubProcessor {
    tf: Timeframe,
    make: Box<dyn Fn(Timeframe) -> TimeframeResult + Send + Sync>,
    calls: AtomicUsize,
}

impl StubProcessor {
    pub fn new<F>(tf: Timeframe, make: F) -> Self
    where
        F: Fn(Timeframe) -> TimeframeResult + Send + Sync + 'static,
    {
        Self {
            tf,
            make: Box::new(make),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn valid(tf: Timeframe, side: SignalSide) -> Self {
        Self::new(tf, move |tf| TimeframeResult::valid(tf, side))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TimeframeProcessor for StubProcessor {
    fn timeframe(&self) -> Timeframe {
        self.tf
    }

    fn process(&self, _symbol: &str, _ctx: &ProcessContext<'_>) -> TimeframeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.make)(self.tf)
    }
}

pub fn compile(config: &Value) -> RuleBook {
    RuleBook::compile(config, &ConditionRegistry::with_builtins()).unwrap()
}

pub fn minutes(n: i64) -> Duration {
    Duration::minutes(n)
}
