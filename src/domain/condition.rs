//! Condition results and group semantics.
//!
//! A condition result is tri-state: passed, failed, or missing data. Missing
//! entries never count towards a group decision, and a group made only of
//! missing entries is undecided, which both `all_passed` and `any_passed`
//! report as `false`.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConditionMeta {
    pub missing_data: bool,
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionResult {
    pub passed: bool,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    pub meta: ConditionMeta,
}

impl ConditionResult {
    pub fn new(passed: bool, value: impl Into<Value>, threshold: Option<f64>) -> Self {
        Self {
            passed,
            value: value.into(),
            threshold,
            meta: ConditionMeta::default(),
        }
    }

    /// A result whose input could not be computed.
    pub fn missing(reason: impl Into<String>) -> Self {
        let mut meta = ConditionMeta {
            missing_data: true,
            ..ConditionMeta::default()
        };
        meta.details
            .insert("reason".to_string(), Value::String(reason.into()));
        Self {
            passed: false,
            value: Value::Null,
            threshold: None,
            meta,
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta.details.insert(key.to_string(), value.into());
        self
    }

    pub fn is_missing(&self) -> bool {
        self.meta.missing_data
    }

    /// Number of decided (non-missing) results in `results`.
    pub fn decided_count<'a, I>(results: I) -> usize
    where
        I: IntoIterator<Item = &'a ConditionResult>,
    {
        results.into_iter().filter(|r| !r.is_missing()).count()
    }
}

/// True iff at least one result is decided and every decided result passed.
pub fn all_passed<'a, I>(results: I) -> bool
where
    I: IntoIterator<Item = &'a ConditionResult>,
{
    let mut decided = 0usize;
    for r in results {
        if r.is_missing() {
            continue;
        }
        if !r.passed {
            return false;
        }
        decided += 1;
    }
    decided > 0
}

/// True iff at least one decided result passed.
pub fn any_passed<'a, I>(results: I) -> bool
where
    I: IntoIterator<Item = &'a ConditionResult>,
{
    results.into_iter().any(|r| !r.is_missing() && r.passed)
}
