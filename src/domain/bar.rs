//! Candle (kline) representation.

use crate::domain::timeframe::Timeframe;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Additional numeric columns supplied by the data source (precomputed
    /// indicators, quote volume, spread, ...), keyed by column name.
    pub extras: BTreeMap<String, f64>,
}

impl Bar {
    pub fn close_time(&self) -> DateTime<Utc> {
        self.open_time + self.timeframe.step()
    }

    /// True once a full timeframe step has elapsed since the bar opened.
    pub fn is_closed_at(&self, now: DateTime<Utc>) -> bool {
        self.open_time <= now - self.timeframe.step()
    }

    /// max(high - low, |high - prev_close|, |low - prev_close|)
    pub fn true_range(&self, prev_close: f64) -> f64 {
        let hl = self.high - self.low;
        let hc = (self.high - prev_close).abs();
        let lc = (self.low - prev_close).abs();
        hl.max(hc).max(lc)
    }
}
