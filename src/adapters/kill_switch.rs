//! In-process kill switch.

use crate::domain::timeframe::Timeframe;
use crate::ports::kill_switch_port::KillSwitchStore;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Manual off switches per symbol+timeframe, plus timed per-symbol disables.
#[derive(Debug, Default)]
pub struct InMemoryKillSwitch {
    off: Mutex<HashSet<(String, Timeframe)>>,
    disabled_until: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryKillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_switches_off<I>(switches: I) -> Self
    where
        I: IntoIterator<Item = (String, Timeframe)>,
    {
        let store = Self::new();
        for (symbol, tf) in switches {
            store.switch_off(&symbol, tf);
        }
        store
    }

    pub fn switch_off(&self, symbol: &str, timeframe: Timeframe) {
        self.off
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((symbol.to_string(), timeframe));
    }

    pub fn disabled_until(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.disabled_until
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(symbol)
            .copied()
    }
}

impl KillSwitchStore for InMemoryKillSwitch {
    fn can_process(&self, symbol: &str, timeframe: Timeframe, now: DateTime<Utc>) -> bool {
        let switched_off = self
            .off
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(symbol.to_string(), timeframe));
        !switched_off && self.disabled_until(symbol).is_none_or(|until| now >= until)
    }

    fn disable_for(&self, symbol: &str, duration: Duration, now: DateTime<Utc>) {
        let until = now + duration;
        let mut map = self.disabled_until.lock().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(symbol.to_string()).or_insert(until);
        // Never shorten an existing disable.
        if until > *entry {
            *entry = until;
        }
        log::debug!("{symbol}: disabled until {}", *entry);
    }
}
