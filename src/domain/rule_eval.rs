//! Evaluation of parametric rule leaves against an [`EvaluationContext`].
//!
//! # Evaluation Semantics
//!
//! - Any fact a leaf needs but cannot find (absent, NaN, series too short)
//!   yields a `missing_data` result, never a failure.
//! - `Compare`: a constant right operand is overridden by `{name}_threshold`.
//! - `Trend(n)`: the last `n` bar-to-bar changes must all clear `eps`.
//! - `Derivative(persist_n)`: the last `persist_n` changes must satisfy every
//!   configured bound; `{name}_threshold` overrides `derivative_gt`.
//! - `Hysteresis`: `level` comes from `{name}_threshold`, then the rule, then 0.
//! - `Range`: checks ATR as a fraction of close, on the listed timeframes or
//!   on the context's own timeframe.

use crate::domain::condition::ConditionResult;
use crate::domain::context::EvaluationContext;
use crate::domain::rule::{
    CompareLeft, FieldOrderKind, Operand, RuleExpression, TrendKind,
};
use crate::domain::timeframe::Timeframe;
use serde_json::json;

/// Evaluate a parametric leaf registered under `name`.
///
/// Composite and name nodes are resolved by the rule book, not here; they
/// report missing data if they ever reach this function.
pub fn evaluate_leaf(name: &str, expr: &RuleExpression, ctx: &EvaluationContext) -> ConditionResult {
    match expr {
        RuleExpression::Compare {
            left,
            op,
            right,
            eps,
        } => {
            let left_val = match left {
                CompareLeft::Value(operand) => resolve_operand(operand, ctx),
                CompareLeft::Slope(field) => slope(field, ctx),
            };
            let right_val = match right {
                Operand::Constant(c) => Some(ctx.threshold_or(name, *c)),
                Operand::Field(_) => resolve_operand(right, ctx),
            };
            match (left_val, right_val) {
                (Some(l), Some(r)) => ConditionResult::new(op.apply(l, r, *eps), l, Some(r))
                    .with_detail("op", op.to_string()),
                _ => ConditionResult::missing("compare operand unavailable"),
            }
        }
        RuleExpression::FieldOrder { kind, fields } => {
            let mut values = Vec::with_capacity(fields.len());
            for field in fields {
                match ctx.number(field) {
                    Some(v) => values.push(v),
                    None => return ConditionResult::missing(format!("field '{field}' unavailable")),
                }
            }
            let passed = values.windows(2).all(|w| match kind {
                FieldOrderKind::LtFields => w[0] < w[1],
                FieldOrderKind::GtFields => w[0] > w[1],
            });
            ConditionResult::new(passed, json!(values), None)
        }
        RuleExpression::Trend {
            kind,
            field,
            n,
            eps,
        } => {
            let Some(diffs) = last_diffs(field, *n, ctx) else {
                return ConditionResult::missing(format!("need {} values of '{field}'", n + 1));
            };
            let passed = diffs.iter().all(|d| match kind {
                TrendKind::Increasing => *d > *eps,
                TrendKind::Decreasing => *d < -*eps,
            });
            ConditionResult::new(passed, json!(diffs), None)
        }
        RuleExpression::Range {
            min,
            max,
            use_atr_tf,
            adapt_with_vol_bucket,
        } => evaluate_range(*min, *max, use_atr_tf, *adapt_with_vol_bucket, ctx),
        RuleExpression::Hysteresis {
            field,
            level,
            min_gap,
            cool_down_bars,
            require_prev_below,
            require_prev_above,
        } => {
            let level = ctx.threshold(name).or(*level).unwrap_or(0.0);
            let needed = 2 + cool_down_bars;
            let window = match ctx.series(field) {
                Some(s) if s.len() >= needed => {
                    let tail = &s[s.len() - needed..];
                    if tail.iter().any(|v| !v.is_finite()) {
                        return ConditionResult::missing(format!(
                            "gap in the last {needed} values of '{field}'"
                        ));
                    }
                    tail.to_vec()
                }
                _ if *cool_down_bars == 0 => match (ctx.previous(field), ctx.number(field)) {
                    (Some(p), Some(c)) => vec![p, c],
                    _ => return ConditionResult::missing(format!("need 2 values of '{field}'")),
                },
                _ => return ConditionResult::missing(format!("need {needed} values of '{field}'")),
            };
            let curr = window[window.len() - 1];
            let prev = window[window.len() - 2];
            let settled = &window[..window.len() - 1];
            let cooled = settled.iter().all(|v| (*v < level) == (prev < level));
            let crossed = if *require_prev_below {
                prev < level && curr >= level + min_gap
            } else if *require_prev_above {
                prev > level && curr <= level - min_gap
            } else {
                (curr - level).abs() >= *min_gap
            };
            ConditionResult::new(crossed && cooled, curr, Some(level))
                .with_detail("prev", prev)
                .with_detail("cooled_down", cooled)
        }
        RuleExpression::Derivative {
            field,
            gt,
            lt,
            persist_n,
        } => {
            let Some(diffs) = last_diffs(field, *persist_n, ctx) else {
                return ConditionResult::missing(format!(
                    "need {} values of '{field}'",
                    persist_n + 1
                ));
            };
            let gt = gt.map(|g| ctx.threshold_or(name, g));
            let passed = diffs
                .iter()
                .all(|d| gt.is_none_or(|g| *d > g) && lt.is_none_or(|l| *d < l));
            let last = diffs.last().copied().unwrap_or(0.0);
            ConditionResult::new(passed, last, gt.or(*lt)).with_detail("diffs", json!(diffs))
        }
        RuleExpression::Bounds { field, min, max } => match ctx.number(field) {
            Some(v) => ConditionResult::new(v >= *min && v <= *max, v, None)
                .with_detail("min", *min)
                .with_detail("max", *max),
            None => ConditionResult::missing(format!("field '{field}' unavailable")),
        },
        RuleExpression::Name { .. } | RuleExpression::AllOf(_) | RuleExpression::AnyOf(_) => {
            ConditionResult::missing(format!("'{}' is not a leaf", expr.kind_name()))
        }
    }
}

fn resolve_operand(operand: &Operand, ctx: &EvaluationContext) -> Option<f64> {
    match operand {
        Operand::Constant(v) => Some(*v),
        Operand::Field(field) => ctx.number(field),
    }
}

fn slope(field: &str, ctx: &EvaluationContext) -> Option<f64> {
    Some(ctx.number(field)? - ctx.previous(field)?)
}

/// The last `n` first differences of `field`'s series.
fn last_diffs(field: &str, n: usize, ctx: &EvaluationContext) -> Option<Vec<f64>> {
    let series = ctx.series(field)?;
    if series.len() < n + 1 {
        return None;
    }
    let tail = &series[series.len() - (n + 1)..];
    if tail.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(tail.windows(2).map(|w| w[1] - w[0]).collect())
}

fn atr_pct(ctx: &EvaluationContext, tf: Option<Timeframe>) -> Option<f64> {
    let (pct_key, atr_key) = match tf {
        Some(tf) => (format!("atr_pct_{tf}"), format!("atr_{tf}")),
        None => ("atr_pct".to_string(), "atr".to_string()),
    };
    if let Some(p) = ctx.number(&pct_key) {
        return Some(p);
    }
    let atr = ctx.number(&atr_key)?;
    let close = ctx.number("close").filter(|c| *c > 0.0)?;
    Some(atr / close)
}

fn evaluate_range(
    min: f64,
    max: f64,
    use_atr_tf: &[Timeframe],
    adapt_with_vol_bucket: bool,
    ctx: &EvaluationContext,
) -> ConditionResult {
    let scale = if adapt_with_vol_bucket {
        ctx.number("vol_bucket_mult").unwrap_or(1.0)
    } else {
        1.0
    };
    let (lo, hi) = (min * scale, max * scale);

    let samples: Vec<(String, f64)> = if use_atr_tf.is_empty() {
        atr_pct(ctx, None)
            .map(|v| vec![(ctx.timeframe().to_string(), v)])
            .unwrap_or_default()
    } else {
        use_atr_tf
            .iter()
            .filter_map(|tf| atr_pct(ctx, Some(*tf)).map(|v| (tf.to_string(), v)))
            .collect()
    };
    if samples.is_empty() {
        return ConditionResult::missing("atr unavailable");
    }

    let passed = samples.iter().all(|(_, v)| *v >= lo && *v <= hi);
    let value: serde_json::Map<String, serde_json::Value> =
        samples.into_iter().map(|(k, v)| (k, json!(v))).collect();
    ConditionResult::new(passed, serde_json::Value::Object(value), None)
        .with_detail("min", lo)
        .with_detail("max", hi)
}
