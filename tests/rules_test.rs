//! Rule loading, threshold injection and execution selection.

mod common;

use common::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tfcascade::domain::context::{EvaluationContext, FactValue};
use tfcascade::domain::error::CascadeError;
use tfcascade::domain::registry::ConditionRegistry;
use tfcascade::domain::result::SignalSide;
use tfcascade::domain::rulebook::RuleBook;
use tfcascade::domain::selector::{ExecutionChoice, ExecutionSelector, SelectorInput, decision_reason};
use tfcascade::domain::timeframe::Timeframe;
use tfcascade::domain::validator::{self, IssueKind};

fn context(tf: Timeframe, facts: &[(&str, f64)]) -> EvaluationContext {
    let facts: BTreeMap<String, FactValue> = facts
        .iter()
        .map(|(k, v)| (k.to_string(), FactValue::Number(*v)))
        .collect();
    EvaluationContext::new("BTCUSDT", tf, facts)
}

fn selector_input(facts: &[(&str, f64)]) -> SelectorInput {
    SelectorInput::new(SignalSide::Long, Arc::new(context(Timeframe::M1, facts)))
}

#[test]
fn configured_threshold_reaches_the_condition() {
    let book = compile(&json!({
        "validation": {"timeframe": {"1h": {
            "long": [{"atr_pct_max": 0.002}],
            "short": ["atr_pct_max"]
        }}}
    }));
    let rules = book.timeframe(Timeframe::H1).unwrap();
    let ctx = context(Timeframe::H1, &[("close", 100.0), ("atr", 0.5)]);

    let long = book.evaluate_list(&rules.long, &ctx);
    assert!(!long[0].result.passed);
    assert_eq!(long[0].result.threshold, Some(0.002));

    // no threshold configured: the condition's own default applies
    let short = book.evaluate_list(&rules.short, &ctx);
    assert!(short[0].result.passed);
    assert_eq!(short[0].result.threshold, Some(0.03));

    assert_eq!(ctx.threshold("atr_pct_max"), None);
}

#[test]
fn cycle_is_reported_once_and_refused_by_the_compiler() {
    let config = json!({
        "rules": {
            "ruleA": {"all_of": ["ruleB", "rsi_bullish"]},
            "ruleB": {"any_of": ["ruleA"]}
        },
        "validation": {"timeframe": {"4h": {"long": ["ruleA"], "short": []}}}
    });
    let registry = ConditionRegistry::with_builtins();

    let report = validator::validate(&config, &registry);
    let cycles: Vec<_> = report.errors_of(IssueKind::CircularReference).collect();
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].message, "circular reference: ruleA -> ruleB -> ruleA");

    let err = RuleBook::compile(&config, &registry).unwrap_err();
    assert!(matches!(err, CascadeError::CircularReference { .. }));

    let err = RuleBook::load(&config, &registry).unwrap_err();
    assert!(matches!(err, CascadeError::RuleInvalid { .. }));
}

#[test]
fn unknown_condition_is_a_validation_error_with_path() {
    let config = json!({
        "validation": {"timeframe": {"15m": {"long": [{"all_of": ["rsi_bullish", "moon_phase"]}]}}}
    });
    let report = validator::validate(&config, &ConditionRegistry::with_builtins());
    let missing: Vec<_> = report.errors_of(IssueKind::MissingReference).collect();
    assert_eq!(missing.len(), 1);
    assert!(missing[0].path.contains("15m"), "{}", missing[0].path);
    assert!(missing[0].message.contains("moon_phase"));
}

#[test]
fn failing_mandatory_filter_short_circuits_to_none() {
    let book = compile(&json!({
        "validation": {"timeframe": {}},
        "filters_mandatory": [{"liquidity_ok": 500000}],
        "execution_selector": {
            "per_timeframe": {
                "15m": {"stay_on_if": ["adx_trending"]},
                "5m": {"stay_on_if": ["adx_trending"]}
            }
        }
    }));

    let decision = ExecutionSelector::new(&book)
        .select(&selector_input(&[("liquidity", 100_000.0), ("adx", 40.0)]));

    assert_eq!(decision.execution_timeframe, ExecutionChoice::None);
    assert_eq!(decision.reason, decision_reason::FILTERS_MANDATORY_FAILED);
    assert_eq!(decision.meta.keys().collect::<Vec<_>>(), vec!["filters_mandatory"]);
    assert!(!decision.meta["filters_mandatory"].passed);
    assert_eq!(
        decision.meta["filters_mandatory"].results[0].result.threshold,
        Some(500_000.0)
    );
}

#[test]
fn passing_15m_stay_group_stops_the_walk() {
    let book = compile(&json!({
        "validation": {"timeframe": {}},
        "execution_selector": {
            "per_timeframe": {
                "15m": {"stay_on_if": ["adx_trending", "volume_ratio_ok"]},
                "5m": {"stay_on_if": ["adx_trending"]},
                "1m": {"stay_on_if": ["adx_trending"]}
            }
        }
    }));

    let decision = ExecutionSelector::new(&book)
        .select(&selector_input(&[("adx", 30.0), ("volume_ratio", 1.4)]));

    assert_eq!(decision.execution_timeframe, ExecutionChoice::M15);
    assert_eq!(decision.meta.keys().collect::<Vec<_>>(), vec!["15m.stay_on_if"]);
    assert!(decision.meta["15m.stay_on_if"].passed);
    let out = serde_json::to_value(&decision).unwrap();
    assert_eq!(out["executionTimeframe"], json!("15m"));
}

#[test]
fn per_timeframe_forbid_does_not_stop_the_walk() {
    let book = compile(&json!({
        "validation": {"timeframe": {}},
        "execution_selector": {
            "per_timeframe": {
                "15m": {
                    "stay_on_if": ["adx_trending"],
                    "drop_to_lower_if_any": ["volume_ratio_ok"],
                    "forbid_drop_to_lower_if_any": ["close_above_vwap"]
                },
                "5m": {"stay_on_if": ["spread_ok"]}
            }
        }
    }));

    let decision = ExecutionSelector::new(&book).select(&selector_input(&[
        ("adx", 10.0),
        ("volume_ratio", 2.0),
        ("close", 101.0),
        ("vwap", 100.0),
        ("spread_bps", 3.0),
    ]));

    // forbid passed at 15m, yet the walk still reached 5m
    assert!(decision.meta["15m.forbid_drop_to_lower_if_any"].passed);
    assert_eq!(decision.execution_timeframe, ExecutionChoice::M5);
    assert_eq!(decision.reason, "5m.stay_on_if");
}

#[test]
fn legacy_forbid_keeps_15m() {
    let book = compile(&json!({
        "validation": {"timeframe": {}},
        "execution_selector": {
            "stay_on_15m_if": ["adx_trending"],
            "drop_to_5m_if_any": ["volume_ratio_ok"],
            "forbid_drop_to_5m_if_any": ["close_above_vwap"]
        }
    }));

    let decision = ExecutionSelector::new(&book).select(&selector_input(&[
        ("adx", 10.0),
        ("volume_ratio", 2.0),
        ("close", 101.0),
        ("vwap", 100.0),
    ]));

    assert_eq!(decision.execution_timeframe, ExecutionChoice::M15);
    assert_eq!(decision.reason, decision_reason::FORBID_DROP_TO_5M);
}

#[test]
fn rule_book_swap_is_invisible_to_held_snapshots() {
    use tfcascade::domain::rulebook::RuleBookHandle;

    let first = compile(&json!({"validation": {"start_from_timeframe": "4h", "timeframe": {}}}));
    let second = compile(&json!({"validation": {"start_from_timeframe": "15m", "timeframe": {}}}));
    let handle = RuleBookHandle::new(first);

    let held = handle.snapshot();
    let previous = handle.replace(second);

    assert_eq!(held.start_from(), Timeframe::H4);
    assert_eq!(previous.start_from(), Timeframe::H4);
    assert_eq!(handle.snapshot().start_from(), Timeframe::M15);
}
