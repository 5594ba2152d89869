//! Indicator builder for bars that already carry their indicator columns.
//!
//! Every numeric column becomes three facts: the latest value under its
//! name, the one before under `prev_{name}`, and the whole history under
//! `{name}_series`. Series stay aligned with the bars; a bar without a
//! value contributes NaN, and a NaN latest or previous value is left out. `ema_{period}` columns are also grouped into an `ema`
//! map so `ema.50` resolves. Signals from coarser timeframes of the same
//! run appear as `signal_{tf}` text facts.

use crate::domain::bar::Bar;
use crate::domain::context::{EvaluationContext, FactValue};
use crate::domain::error::CascadeError;
use crate::domain::timeframe::Timeframe;
use crate::ports::indicator_port::{ContextOptions, IndicatorBuilder};
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_ATR_PERIOD: usize = 14;

#[derive(Debug, Clone)]
pub struct SnapshotIndicatorBuilder {
    atr_period: usize,
}

impl Default for SnapshotIndicatorBuilder {
    fn default() -> Self {
        Self {
            atr_period: DEFAULT_ATR_PERIOD,
        }
    }
}

impl SnapshotIndicatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Period of the fallback ATR used when the bars have no `atr` column.
    pub fn with_atr_period(mut self, period: usize) -> Self {
        self.atr_period = period.max(1);
        self
    }

    /// Simple mean of the last `atr_period` true ranges.
    fn fallback_atr(&self, bars: &[Bar]) -> Option<f64> {
        if bars.len() < 2 {
            return None;
        }
        let ranges: Vec<f64> = bars
            .windows(2)
            .rev()
            .take(self.atr_period)
            .map(|w| w[1].true_range(w[0].close))
            .collect();
        Some(ranges.iter().sum::<f64>() / ranges.len() as f64)
    }
}

fn insert_column(facts: &mut BTreeMap<String, FactValue>, name: &str, series: Vec<f64>) {
    if series.is_empty() {
        return;
    }
    if let Some(&last) = series.last().filter(|v| v.is_finite()) {
        facts.insert(name.to_string(), FactValue::Number(last));
    }
    if let Some(&prev) = series.iter().rev().nth(1).filter(|v| v.is_finite()) {
        facts.insert(format!("prev_{name}"), FactValue::Number(prev));
    }
    facts.insert(format!("{name}_series"), FactValue::Series(series));
}

impl IndicatorBuilder for SnapshotIndicatorBuilder {
    fn build_context(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bars: &[Bar],
        options: &ContextOptions,
    ) -> Result<EvaluationContext, CascadeError> {
        if bars.is_empty() {
            return Err(CascadeError::DataSource {
                reason: format!("no bars to build a {timeframe} context for {symbol}"),
            });
        }

        let mut facts = BTreeMap::new();
        let core: [(&str, fn(&Bar) -> f64); 5] = [
            ("open", |b| b.open),
            ("high", |b| b.high),
            ("low", |b| b.low),
            ("close", |b| b.close),
            ("volume", |b| b.volume),
        ];
        for (name, get) in core {
            insert_column(&mut facts, name, bars.iter().map(get).collect());
        }

        let columns: BTreeSet<&str> = bars
            .iter()
            .flat_map(|b| b.extras.keys().map(String::as_str))
            .collect();
        let mut ema = BTreeMap::new();
        for column in columns {
            let series: Vec<f64> = bars
                .iter()
                .map(|b| b.extras.get(column).copied().unwrap_or(f64::NAN))
                .collect();
            if let Some(period) = column.strip_prefix("ema_")
                && period.chars().all(|c| c.is_ascii_digit())
                && let Some(&last) = series.last().filter(|v| v.is_finite())
            {
                ema.insert(period.to_string(), last);
            }
            insert_column(&mut facts, column, series);
        }
        if !ema.is_empty() {
            facts.insert("ema".into(), FactValue::Map(ema));
        }

        if !facts.contains_key("atr")
            && let Some(atr) = self.fallback_atr(bars)
        {
            facts.insert("atr".into(), FactValue::Number(atr));
        }

        facts.insert("symbol".into(), FactValue::from(symbol));
        facts.insert("timeframe".into(), FactValue::from(timeframe.as_str()));
        facts.insert("bar_count".into(), FactValue::Number(bars.len() as f64));
        if let Some(run_id) = options.run_id {
            facts.insert("run_id".into(), FactValue::Text(run_id.to_string()));
        }
        for known in &options.known_signals {
            facts.insert(
                format!("signal_{}", known.timeframe),
                FactValue::from(known.signal_side.as_str()),
            );
        }

        log::trace!("{symbol} {timeframe}: built context with {} facts", facts.len());
        Ok(EvaluationContext::new(symbol, timeframe, facts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::result::{KnownSignal, SignalSide, TimeframeStatus};
    use approx::assert_relative_eq;
    use chrono::{TimeZone, Utc};

    fn bars(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                symbol: "BTCUSDT".into(),
                timeframe: Timeframe::H1,
                open_time: start + Timeframe::H1.step() * i as i32,
                open: c - 1.0,
                high: c + 2.0,
                low: c - 2.0,
                close: c,
                volume: 10.0,
                extras: BTreeMap::from([
                    ("rsi".to_string(), 50.0 + i as f64),
                    ("ema_50".to_string(), c - 5.0),
                ]),
            })
            .collect()
    }

    #[test]
    fn columns_become_latest_previous_and_series() {
        let builder = SnapshotIndicatorBuilder::new();
        let ctx = builder
            .build_context("BTCUSDT", Timeframe::H1, &bars(&[100.0, 101.0, 103.0]), &ContextOptions::default())
            .unwrap();
        assert_eq!(ctx.number("close"), Some(103.0));
        assert_eq!(ctx.previous("close"), Some(101.0));
        assert_eq!(ctx.series("rsi"), Some(&[50.0, 51.0, 52.0][..]));
        assert_eq!(ctx.number("ema.50"), Some(98.0));
        assert_eq!(ctx.number("ema_50"), Some(98.0));
        assert_eq!(ctx.number("bar_count"), Some(3.0));
        assert_eq!(ctx.text("timeframe"), Some("1h"));
    }

    #[test]
    fn fallback_atr_averages_true_ranges() {
        let builder = SnapshotIndicatorBuilder::new().with_atr_period(2);
        let ctx = builder
            .build_context("BTCUSDT", Timeframe::H1, &bars(&[100.0, 101.0, 109.0]), &ContextOptions::default())
            .unwrap();
        // ranges: max(4, |103-100|, |99-100|) = 4; max(4, |111-101|, |107-101|) = 10
        assert_relative_eq!(ctx.number("atr").unwrap(), 7.0);
    }

    #[test]
    fn atr_column_wins_over_fallback() {
        let mut input = bars(&[100.0, 101.0]);
        input[1].extras.insert("atr".into(), 1.5);
        let ctx = SnapshotIndicatorBuilder::new()
            .build_context("BTCUSDT", Timeframe::H1, &input, &ContextOptions::default())
            .unwrap();
        assert_eq!(ctx.number("atr"), Some(1.5));
    }

    #[test]
    fn known_signals_become_text_facts() {
        let options = ContextOptions {
            run_id: None,
            known_signals: vec![KnownSignal {
                timeframe: Timeframe::H4,
                status: TimeframeStatus::Valid,
                signal_side: SignalSide::Long,
                kline_time: None,
            }],
        };
        let ctx = SnapshotIndicatorBuilder::new()
            .build_context("BTCUSDT", Timeframe::H1, &bars(&[100.0]), &options)
            .unwrap();
        assert_eq!(ctx.text("signal_4h"), Some("LONG"));
        assert_eq!(ctx.number("atr"), None);
    }

    #[test]
    fn blank_newest_value_is_missing_not_stale() {
        use crate::domain::registry::ConditionRegistry;

        let mut input = bars(&[100.0, 101.0, 102.0]);
        input[0].extras.insert("rsi".into(), 70.0);
        input[1].extras.insert("rsi".into(), 50.0);
        input[2].extras.remove("rsi");
        let ctx = SnapshotIndicatorBuilder::new()
            .build_context("BTCUSDT", Timeframe::H1, &input, &ContextOptions::default())
            .unwrap();

        assert_eq!(ctx.number("rsi"), None);
        assert_eq!(ctx.number("prev_rsi"), Some(50.0));
        assert_eq!(ctx.series("rsi").map(<[f64]>::len), Some(3));

        let registry = ConditionRegistry::with_builtins();
        let results = registry.evaluate(&ctx, &["rsi_bullish"]).unwrap();
        let result = &results["rsi_bullish"];
        assert!(result.meta.missing_data);
        assert!(!result.passed);
    }

    #[test]
    fn blank_middle_value_keeps_bars_aligned() {
        let mut input = bars(&[100.0, 101.0, 102.0]);
        input[1].extras.remove("ema_50");
        let ctx = SnapshotIndicatorBuilder::new()
            .build_context("BTCUSDT", Timeframe::H1, &input, &ContextOptions::default())
            .unwrap();

        assert_eq!(ctx.number("ema_50"), Some(97.0));
        assert_eq!(ctx.number("ema.50"), Some(97.0));
        assert_eq!(ctx.number("prev_ema_50"), None);
        let series = ctx.series("ema_50").unwrap();
        assert_eq!(series.len(), 3);
        assert!(series[1].is_nan());
    }

    #[test]
    fn empty_bars_are_a_data_source_error() {
        let err = SnapshotIndicatorBuilder::new()
            .build_context("BTCUSDT", Timeframe::M5, &[], &ContextOptions::default())
            .unwrap_err();
        assert!(matches!(err, CascadeError::DataSource { .. }));
    }
}
