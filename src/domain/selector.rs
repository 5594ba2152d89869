//! Execution-timeframe selection for a validated signal.
//!
//! Two configuration shapes are supported. The per-timeframe shape walks
//! the configured execution timeframes and stops on the first whose
//! `stay_on_if` group fully passes; its drop/forbid groups are evaluated
//! for the audit trail only, so the walk always advances to the next
//! timeframe. The legacy flat shape has a single 15m-vs-5m decision with a
//! 1m carve-out, where `forbid_drop_to_5m_if_any` does block the drop.
//!
//! Every evaluated group is kept in [`ExecutionDecision::meta`].

use crate::domain::condition;
use crate::domain::context::{EvaluationContext, FactValue};
use crate::domain::result::{LabeledResult, SignalSide};
use crate::domain::rulebook::{ExprId, RuleBook, SelectorLayout};
use crate::domain::timeframe::Timeframe;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub mod decision_reason {
    pub const FILTERS_MANDATORY_FAILED: &str = "filters_mandatory_failed";
    pub const NO_RULES_CONFIGURED: &str = "no_rules_configured";
    pub const NO_TIMEFRAME_SELECTED_FALLBACK: &str = "no_timeframe_selected_fallback";
    pub const STAY: &str = "stay_on_if";
    pub const DROP_TO_5M: &str = "drop_to_5m_if_any";
    pub const FORBID_DROP_TO_5M: &str = "forbid_drop_to_5m_if_any";
    pub const ALLOW_1M: &str = "allow_1m_only_for";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionChoice {
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "NONE")]
    None,
}

impl ExecutionChoice {
    pub fn timeframe(self) -> Option<Timeframe> {
        match self {
            ExecutionChoice::M15 => Some(Timeframe::M15),
            ExecutionChoice::M5 => Some(Timeframe::M5),
            ExecutionChoice::M1 => Some(Timeframe::M1),
            ExecutionChoice::None => None,
        }
    }
}

impl From<Timeframe> for ExecutionChoice {
    /// Context-only timeframes are not executable and map to NONE.
    fn from(tf: Timeframe) -> Self {
        match tf {
            Timeframe::M15 => ExecutionChoice::M15,
            Timeframe::M5 => ExecutionChoice::M5,
            Timeframe::M1 => ExecutionChoice::M1,
            Timeframe::H4 | Timeframe::H1 => ExecutionChoice::None,
        }
    }
}

impl fmt::Display for ExecutionChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.timeframe() {
            Some(tf) => write!(f, "{tf}"),
            None => f.write_str("NONE"),
        }
    }
}

/// One evaluated rule group as recorded in the decision metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupAudit {
    pub passed: bool,
    pub results: Vec<LabeledResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDecision {
    pub execution_timeframe: ExecutionChoice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_r_multiple: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_zone_width_pct: Option<f64>,
    pub reason: String,
    pub meta: BTreeMap<String, GroupAudit>,
}

/// Contexts the selector evaluates against.
#[derive(Debug, Clone)]
pub struct SelectorInput {
    pub side: SignalSide,
    /// Used for any timeframe without its own context.
    pub base: Arc<EvaluationContext>,
    pub per_timeframe: BTreeMap<Timeframe, Arc<EvaluationContext>>,
}

impl SelectorInput {
    pub fn new(side: SignalSide, base: Arc<EvaluationContext>) -> Self {
        Self {
            side,
            base,
            per_timeframe: BTreeMap::new(),
        }
    }

    fn context_for(&self, tf: Timeframe) -> EvaluationContext {
        let ctx = self.per_timeframe.get(&tf).unwrap_or(&self.base);
        ctx.with_fact("signal_side", FactValue::from(self.side.as_str()))
    }

    fn base_context(&self) -> EvaluationContext {
        self.base
            .with_fact("signal_side", FactValue::from(self.side.as_str()))
    }
}

pub struct ExecutionSelector<'a> {
    rules: &'a RuleBook,
}

struct DecisionBuilder {
    meta: BTreeMap<String, GroupAudit>,
    expected_r_multiple: Option<f64>,
    entry_zone_width_pct: Option<f64>,
}

impl DecisionBuilder {
    fn decide(self, choice: ExecutionChoice, reason: impl Into<String>) -> ExecutionDecision {
        ExecutionDecision {
            execution_timeframe: choice,
            expected_r_multiple: self.expected_r_multiple,
            entry_zone_width_pct: self.entry_zone_width_pct,
            reason: reason.into(),
            meta: self.meta,
        }
    }
}

impl<'a> ExecutionSelector<'a> {
    pub fn new(rules: &'a RuleBook) -> Self {
        Self { rules }
    }

    pub fn select(&self, input: &SelectorInput) -> ExecutionDecision {
        let selector = self.rules.selector();
        let base = input.base_context();
        let mut out = DecisionBuilder {
            meta: BTreeMap::new(),
            expected_r_multiple: base.number("expected_r_multiple"),
            entry_zone_width_pct: base.number("entry_zone_width_pct"),
        };

        if !selector.filters_mandatory.is_empty() {
            let results = self.rules.evaluate_list(&selector.filters_mandatory, &base);
            let failed = results
                .iter()
                .any(|r| !r.result.is_missing() && !r.result.passed);
            out.meta.insert(
                "filters_mandatory".to_string(),
                GroupAudit {
                    passed: !failed,
                    results,
                },
            );
            if failed {
                log::debug!("{}: mandatory filters failed", base.symbol());
                return out.decide(
                    ExecutionChoice::None,
                    decision_reason::FILTERS_MANDATORY_FAILED,
                );
            }
        }

        match &selector.layout {
            SelectorLayout::PerTimeframe { order, groups } => {
                for &tf in order {
                    let Some(cfg) = groups.get(&tf) else {
                        continue;
                    };
                    let all: Vec<ExprId> = cfg
                        .stay_on_if
                        .iter()
                        .chain(&cfg.drop_to_lower_if_any)
                        .chain(&cfg.forbid_drop_to_lower_if_any)
                        .copied()
                        .collect();
                    let ctx = input
                        .context_for(tf)
                        .with_thresholds(self.rules.thresholds(&all));

                    let stay = self.group(
                        &mut out,
                        &format!("{tf}.stay_on_if"),
                        &cfg.stay_on_if,
                        &ctx,
                        true,
                    );
                    if stay {
                        return out.decide(tf.into(), format!("{tf}.{}", decision_reason::STAY));
                    }
                    let drop_any = self.group(
                        &mut out,
                        &format!("{tf}.drop_to_lower_if_any"),
                        &cfg.drop_to_lower_if_any,
                        &ctx,
                        false,
                    );
                    let forbid_any = self.group(
                        &mut out,
                        &format!("{tf}.forbid_drop_to_lower_if_any"),
                        &cfg.forbid_drop_to_lower_if_any,
                        &ctx,
                        false,
                    );
                    log::debug!(
                        "{}: {tf} not kept (drop={drop_any}, forbid={forbid_any}), advancing",
                        base.symbol()
                    );
                }

                if self.allow_one_minute(input, &mut out) {
                    return out.decide(ExecutionChoice::M1, decision_reason::ALLOW_1M);
                }
                out.decide(
                    selector.default_timeframe.into(),
                    decision_reason::NO_TIMEFRAME_SELECTED_FALLBACK,
                )
            }
            SelectorLayout::Legacy {
                stay_on_15m_if,
                drop_to_5m_if_any,
                forbid_drop_to_5m_if_any,
            } => {
                if stay_on_15m_if.is_empty()
                    && drop_to_5m_if_any.is_empty()
                    && forbid_drop_to_5m_if_any.is_empty()
                {
                    return out.decide(
                        selector.default_timeframe.into(),
                        decision_reason::NO_RULES_CONFIGURED,
                    );
                }

                let ctx = input.context_for(Timeframe::M15);
                if self.group(&mut out, "stay_on_15m_if", stay_on_15m_if, &ctx, true) {
                    return out.decide(ExecutionChoice::M15, "stay_on_15m_if");
                }
                let drop_any =
                    self.group(&mut out, "drop_to_5m_if_any", drop_to_5m_if_any, &ctx, false);
                let forbid_any = self.group(
                    &mut out,
                    "forbid_drop_to_5m_if_any",
                    forbid_drop_to_5m_if_any,
                    &ctx,
                    false,
                );

                if drop_any && !forbid_any {
                    if self.allow_one_minute(input, &mut out) {
                        return out.decide(ExecutionChoice::M1, decision_reason::ALLOW_1M);
                    }
                    return out.decide(ExecutionChoice::M5, decision_reason::DROP_TO_5M);
                }
                if forbid_any {
                    return out.decide(ExecutionChoice::M15, decision_reason::FORBID_DROP_TO_5M);
                }
                out.decide(
                    selector.default_timeframe.into(),
                    decision_reason::NO_TIMEFRAME_SELECTED_FALLBACK,
                )
            }
        }
    }

    /// Evaluate a non-empty group, record it, and report all-passed or any-passed.
    fn group(
        &self,
        out: &mut DecisionBuilder,
        key: &str,
        ids: &[ExprId],
        ctx: &EvaluationContext,
        require_all: bool,
    ) -> bool {
        if ids.is_empty() {
            return false;
        }
        let results = self.rules.evaluate_list(ids, ctx);
        let passed = if require_all {
            condition::all_passed(results.iter().map(|r| &r.result))
        } else {
            condition::any_passed(results.iter().map(|r| &r.result))
        };
        out.meta
            .insert(key.to_string(), GroupAudit { passed, results });
        passed
    }

    fn allow_one_minute(&self, input: &SelectorInput, out: &mut DecisionBuilder) -> bool {
        let allow = &self.rules.selector().allow_1m_only_for;
        if !allow.enabled {
            return false;
        }
        let ctx = input.context_for(Timeframe::M1);
        self.group(out, decision_reason::ALLOW_1M, &allow.conditions, &ctx, false)
    }
}
