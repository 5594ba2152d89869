//! Evaluation context: the immutable fact sheet one rule evaluation reads.
//!
//! A context is built once per symbol+timeframe snapshot by the indicator
//! builder. The only extension allowed afterwards is threshold injection,
//! which produces a new context sharing the same fact table.

use crate::domain::timeframe::Timeframe;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FactValue {
    Number(f64),
    Bool(bool),
    Text(String),
    Series(Vec<f64>),
    Map(BTreeMap<String, f64>),
}

impl From<f64> for FactValue {
    fn from(v: f64) -> Self {
        FactValue::Number(v)
    }
}

impl From<bool> for FactValue {
    fn from(v: bool) -> Self {
        FactValue::Bool(v)
    }
}

impl From<Vec<f64>> for FactValue {
    fn from(v: Vec<f64>) -> Self {
        FactValue::Series(v)
    }
}

impl From<&str> for FactValue {
    fn from(v: &str) -> Self {
        FactValue::Text(v.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationContext {
    symbol: String,
    timeframe: Timeframe,
    facts: Arc<BTreeMap<String, FactValue>>,
    injected: BTreeMap<String, f64>,
}

impl EvaluationContext {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        facts: BTreeMap<String, FactValue>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            facts: Arc::new(facts),
            injected: BTreeMap::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn facts(&self) -> &BTreeMap<String, FactValue> {
        &self.facts
    }

    /// A copy of this context extended with `{name}_threshold` keys.
    pub fn with_thresholds<'a, I>(&self, thresholds: I) -> EvaluationContext
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut next = self.clone();
        for (name, value) in thresholds {
            next.injected.insert(threshold_key(name), value);
        }
        next
    }

    /// A copy of this context with one extra fact.
    pub fn with_fact(&self, key: impl Into<String>, value: FactValue) -> EvaluationContext {
        let mut facts = (*self.facts).clone();
        facts.insert(key.into(), value);
        Self {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            facts: Arc::new(facts),
            injected: self.injected.clone(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&FactValue> {
        self.facts.get(key)
    }

    /// Injected threshold for condition `name`, if any.
    pub fn threshold(&self, name: &str) -> Option<f64> {
        self.injected.get(&threshold_key(name)).copied()
    }

    /// `{name}_threshold` if injected, otherwise `default`.
    pub fn threshold_or(&self, name: &str, default: f64) -> f64 {
        self.threshold(name).unwrap_or(default)
    }

    /// Numeric fact lookup.
    ///
    /// Resolves plain numbers, the last element of a series (stored under
    /// `key` or `{key}_series`), booleans as 0/1, and dotted map access
    /// (`ema.50`). NaN counts as absent.
    pub fn number(&self, key: &str) -> Option<f64> {
        if let Some(v) = self.injected.get(key) {
            return Some(*v);
        }
        let value = match self.facts.get(key) {
            Some(FactValue::Number(v)) => Some(*v),
            Some(FactValue::Series(s)) => s.last().copied(),
            Some(FactValue::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
            Some(FactValue::Text(_)) | Some(FactValue::Map(_)) => None,
            None => match self.facts.get(&format!("{key}_series")) {
                Some(FactValue::Series(s)) => s.last().copied(),
                _ => {
                    let (head, tail) = key.split_once('.')?;
                    match self.facts.get(head) {
                        Some(FactValue::Map(m)) => m.get(tail).copied(),
                        _ => None,
                    }
                }
            },
        };
        value.filter(|v| v.is_finite())
    }

    /// Series lookup: `{key}_series` first, then a series stored under `key`.
    pub fn series(&self, key: &str) -> Option<&[f64]> {
        match self.facts.get(&format!("{key}_series")) {
            Some(FactValue::Series(s)) => Some(s.as_slice()),
            _ => match self.facts.get(key) {
                Some(FactValue::Series(s)) => Some(s.as_slice()),
                _ => None,
            },
        }
    }

    /// Previous-bar value: `prev_{key}`, else the second-to-last series element.
    pub fn previous(&self, key: &str) -> Option<f64> {
        if let Some(v) = self.number(&format!("prev_{key}")) {
            return Some(v);
        }
        let s = self.series(key)?;
        if s.len() < 2 {
            return None;
        }
        Some(s[s.len() - 2]).filter(|v| v.is_finite())
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.facts.get(key) {
            Some(FactValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.facts.get(key) {
            Some(FactValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }
}

pub fn threshold_key(name: &str) -> String {
    format!("{name}_threshold")
}
