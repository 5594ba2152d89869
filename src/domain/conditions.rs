//! Built-in condition library.
//!
//! Every built-in reads standard facts from the context and honours an
//! injected `{name}_threshold` before falling back to its own default.

use crate::domain::condition::ConditionResult;
use crate::domain::context::EvaluationContext;
use crate::domain::registry::ConditionRegistry;

/// (name, fact, default threshold, comparison) for single-fact conditions.
type FactCheck = (&'static str, &'static [&'static str], f64, fn(f64, f64) -> bool);

const FACT_CHECKS: &[FactCheck] = &[
    ("rsi_bullish", &["rsi"], 50.0, gt),
    ("rsi_bearish", &["rsi"], 50.0, lt),
    ("macd_hist_positive", &["macd_hist", "macd.hist"], 0.0, gt),
    ("macd_hist_negative", &["macd_hist", "macd.hist"], 0.0, lt),
    ("adx_trending", &["adx"], 20.0, ge),
    ("volume_ratio_ok", &["volume_ratio"], 1.0, ge),
    ("liquidity_ok", &["liquidity", "quote_volume_24h"], 1_000_000.0, ge),
    ("spread_ok", &["spread_bps"], 10.0, le),
];

fn gt(v: f64, t: f64) -> bool {
    v > t
}

fn lt(v: f64, t: f64) -> bool {
    v < t
}

fn ge(v: f64, t: f64) -> bool {
    v >= t
}

fn le(v: f64, t: f64) -> bool {
    v <= t
}

/// Names of every built-in, in registration order.
pub fn builtin_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = FACT_CHECKS.iter().map(|c| c.0).collect();
    names.extend([
        "atr_pct_max",
        "ema_bullish_alignment",
        "ema_bearish_alignment",
        "close_above_ema",
        "close_below_ema",
        "close_above_vwap",
        "close_below_vwap",
    ]);
    names
}

pub fn register_builtins(registry: &mut ConditionRegistry) {
    for &(name, facts, default, cmp) in FACT_CHECKS {
        registry.register(name, move |ctx: &EvaluationContext| {
            let threshold = ctx.threshold_or(name, default);
            match first_number(ctx, facts) {
                Some(v) => ConditionResult::new(cmp(v, threshold), v, Some(threshold)),
                None => ConditionResult::missing(format!("{} unavailable", facts[0])),
            }
        });
    }

    registry.register("atr_pct_max", |ctx: &EvaluationContext| {
        let threshold = ctx.threshold_or("atr_pct_max", 0.03);
        let pct = ctx.number("atr_pct").or_else(|| {
            let close = ctx.number("close").filter(|c| *c > 0.0)?;
            Some(ctx.number("atr")? / close)
        });
        match pct {
            Some(p) => ConditionResult::new(p <= threshold, p, Some(threshold)),
            None => ConditionResult::missing("atr unavailable"),
        }
    });

    registry.register("ema_bullish_alignment", |ctx: &EvaluationContext| {
        ema_alignment(ctx, "ema_bullish_alignment", true)
    });
    registry.register("ema_bearish_alignment", |ctx: &EvaluationContext| {
        ema_alignment(ctx, "ema_bearish_alignment", false)
    });

    registry.register("close_above_ema", |ctx: &EvaluationContext| {
        close_vs_ema(ctx, "close_above_ema", true)
    });
    registry.register("close_below_ema", |ctx: &EvaluationContext| {
        close_vs_ema(ctx, "close_below_ema", false)
    });

    registry.register("close_above_vwap", |ctx: &EvaluationContext| {
        close_vs_vwap(ctx, true)
    });
    registry.register("close_below_vwap", |ctx: &EvaluationContext| {
        close_vs_vwap(ctx, false)
    });
}

fn first_number(ctx: &EvaluationContext, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| ctx.number(k))
}

/// Fast EMA above (below) slow EMA by at least `threshold` as a fraction of slow.
fn ema_alignment(ctx: &EvaluationContext, name: &str, bullish: bool) -> ConditionResult {
    let min_gap = ctx.threshold_or(name, 0.0);
    let fast = first_number(ctx, &["ema_fast", "ema.20"]);
    let slow = first_number(ctx, &["ema_slow", "ema.50"]);
    match (fast, slow) {
        (Some(f), Some(s)) if s != 0.0 => {
            let gap = (f - s) / s;
            let passed = if bullish { gap > min_gap } else { -gap > min_gap };
            ConditionResult::new(passed, gap, Some(min_gap))
        }
        _ => ConditionResult::missing("ema fast/slow unavailable"),
    }
}

/// Close against the EMA whose period is the threshold (default 200).
fn close_vs_ema(ctx: &EvaluationContext, name: &str, above: bool) -> ConditionResult {
    let period = ctx.threshold_or(name, 200.0).round() as i64;
    let dotted = format!("ema.{period}");
    let flat = format!("ema_{period}");
    let ema = first_number(ctx, &[dotted.as_str(), flat.as_str()]);
    match (ctx.number("close"), ema) {
        (Some(close), Some(ema)) => {
            let passed = if above { close > ema } else { close < ema };
            ConditionResult::new(passed, close, Some(ema)).with_detail("period", period)
        }
        _ => ConditionResult::missing(format!("close or ema {period} unavailable")),
    }
}

fn close_vs_vwap(ctx: &EvaluationContext, above: bool) -> ConditionResult {
    match (ctx.number("close"), ctx.number("vwap")) {
        (Some(close), Some(vwap)) => {
            let passed = if above { close > vwap } else { close < vwap };
            ConditionResult::new(passed, close, Some(vwap))
        }
        _ => ConditionResult::missing("close or vwap unavailable"),
    }
}
