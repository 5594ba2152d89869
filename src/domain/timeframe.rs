//! Cascade timeframes.
//!
//! Ordered coarsest to finest: `4h → 1h → 15m → 5m → 1m`. The coarse end
//! establishes directional bias (context timeframes), the fine end times
//! entries (execution timeframes).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "1m")]
    M1,
}

impl Timeframe {
    /// Every timeframe in cascade order.
    pub const ALL: [Timeframe; 5] = [
        Timeframe::H4,
        Timeframe::H1,
        Timeframe::M15,
        Timeframe::M5,
        Timeframe::M1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::H4 => "4h",
            Timeframe::H1 => "1h",
            Timeframe::M15 => "15m",
            Timeframe::M5 => "5m",
            Timeframe::M1 => "1m",
        }
    }

    pub fn step_secs(self) -> i64 {
        match self {
            Timeframe::H4 => 4 * 3600,
            Timeframe::H1 => 3600,
            Timeframe::M15 => 15 * 60,
            Timeframe::M5 => 5 * 60,
            Timeframe::M1 => 60,
        }
    }

    pub fn step(self) -> Duration {
        Duration::seconds(self.step_secs())
    }

    fn index(self) -> usize {
        self as usize
    }

    /// The next coarser timeframe, or `None` at the top of the cascade.
    pub fn parent(self) -> Option<Timeframe> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    /// The next finer timeframe, or `None` at the bottom of the cascade.
    pub fn finer(self) -> Option<Timeframe> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// The cascade sequence starting at `self` and running to `1m`.
    pub fn cascade_from(self) -> &'static [Timeframe] {
        &Self::ALL[self.index()..]
    }

    pub fn is_context(self) -> bool {
        matches!(self, Timeframe::H4 | Timeframe::H1 | Timeframe::M15)
    }

    pub fn is_execution(self) -> bool {
        matches!(self, Timeframe::M15 | Timeframe::M5 | Timeframe::M1)
    }

    /// Start of the bar containing `at`, aligned to the epoch.
    pub fn bar_open(self, at: DateTime<Utc>) -> DateTime<Utc> {
        let step = self.step_secs();
        let ts = at.timestamp();
        let aligned = ts - ts.rem_euclid(step);
        DateTime::from_timestamp(aligned, 0).unwrap_or(at)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown timeframe '{0}' (expected one of 4h, 1h, 15m, 5m, 1m)")]
pub struct UnknownTimeframe(pub String);

impl FromStr for Timeframe {
    type Err = UnknownTimeframe;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "4h" => Ok(Timeframe::H4),
            "1h" => Ok(Timeframe::H1),
            "15m" => Ok(Timeframe::M15),
            "5m" => Ok(Timeframe::M5),
            "1m" => Ok(Timeframe::M1),
            _ => Err(UnknownTimeframe(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ordering_is_coarse_to_fine() {
        assert!(Timeframe::H4 < Timeframe::H1);
        assert!(Timeframe::M5 < Timeframe::M1);
        let mut sorted = vec![Timeframe::M1, Timeframe::H4, Timeframe::M15];
        sorted.sort();
        assert_eq!(sorted, vec![Timeframe::H4, Timeframe::M15, Timeframe::M1]);
    }

    #[test]
    fn parent_and_finer() {
        assert_eq!(Timeframe::H4.parent(), None);
        assert_eq!(Timeframe::M15.parent(), Some(Timeframe::H1));
        assert_eq!(Timeframe::M5.finer(), Some(Timeframe::M1));
        assert_eq!(Timeframe::M1.finer(), None);
    }

    #[test]
    fn cascade_from_mid_sequence() {
        assert_eq!(
            Timeframe::M15.cascade_from(),
            &[Timeframe::M15, Timeframe::M5, Timeframe::M1]
        );
        assert_eq!(Timeframe::H4.cascade_from().len(), 5);
    }

    #[test]
    fn parse_and_display_roundtrip() {
        for tf in Timeframe::ALL {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
        assert_eq!(" 15M ".parse::<Timeframe>().unwrap(), Timeframe::M15);
        assert!("2h".parse::<Timeframe>().is_err());
    }

    #[test]
    fn serde_uses_short_form() {
        let json = serde_json::to_string(&Timeframe::M15).unwrap();
        assert_eq!(json, "\"15m\"");
        let tf: Timeframe = serde_json::from_str("\"4h\"").unwrap();
        assert_eq!(tf, Timeframe::H4);
    }

    #[test]
    fn context_and_execution_sets_overlap_on_15m() {
        assert!(Timeframe::M15.is_context() && Timeframe::M15.is_execution());
        assert!(Timeframe::H4.is_context() && !Timeframe::H4.is_execution());
        assert!(!Timeframe::M1.is_context() && Timeframe::M1.is_execution());
    }

    #[test]
    fn bar_open_aligns_to_step() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 13, 47, 12).unwrap();
        assert_eq!(
            Timeframe::M15.bar_open(at),
            Utc.with_ymd_and_hms(2024, 3, 1, 13, 45, 0).unwrap()
        );
        assert_eq!(
            Timeframe::H4.bar_open(at),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
        );
    }
}
