//! Kill-switch store port.

use crate::domain::timeframe::Timeframe;
use chrono::{DateTime, Duration, Utc};

pub trait KillSwitchStore: Send + Sync {
    fn can_process(&self, symbol: &str, timeframe: Timeframe, now: DateTime<Utc>) -> bool;

    /// Disable every timeframe of `symbol` until `now + duration`.
    fn disable_for(&self, symbol: &str, duration: Duration, now: DateTime<Utc>);
}
