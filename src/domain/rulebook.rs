//! Compiled rule configuration.
//!
//! A [`RuleBook`] is built once per configuration load: every rule expression
//! is parsed, every name is resolved to either a registry condition or a
//! compiled named rule, and the result is stored as an arena of nodes
//! addressed by [`ExprId`]. Evaluation walks the arena only, so it can never
//! meet an unresolved name or a reference cycle.

use crate::domain::condition::{self, ConditionResult};
use crate::domain::context::EvaluationContext;
use crate::domain::error::CascadeError;
use crate::domain::registry::{ConditionId, ConditionRegistry};
use crate::domain::result::LabeledResult;
use crate::domain::rule::RuleExpression;
use crate::domain::rule_eval::evaluate_leaf;
use crate::domain::rule_parser::{self, child_path, index_path};
use crate::domain::timeframe::Timeframe;
use crate::domain::validator::{self, ValidationResult};
use chrono::Duration;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

pub const DEFAULT_MIN_BARS: usize = 50;
pub const DEFAULT_EXECUTION_TIMEFRAMES: [Timeframe; 3] =
    [Timeframe::M15, Timeframe::M5, Timeframe::M1];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(usize);

#[derive(Debug, Clone)]
pub enum ExprNode {
    Leaf {
        name: String,
        condition: ConditionId,
        threshold: Option<f64>,
    },
    AllOf {
        label: String,
        children: Vec<ExprId>,
    },
    AnyOf {
        label: String,
        children: Vec<ExprId>,
    },
}

#[derive(Debug, Clone)]
pub struct TimeframeRules {
    pub long: Vec<ExprId>,
    pub short: Vec<ExprId>,
    pub min_bars: usize,
    pub grace_window: Duration,
}

impl TimeframeRules {
    pub fn is_empty(&self) -> bool {
        self.long.is_empty() && self.short.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimeframeGroups {
    pub stay_on_if: Vec<ExprId>,
    pub drop_to_lower_if_any: Vec<ExprId>,
    pub forbid_drop_to_lower_if_any: Vec<ExprId>,
}

#[derive(Debug, Clone, Default)]
pub struct AllowOneMinute {
    pub enabled: bool,
    pub conditions: Vec<ExprId>,
}

#[derive(Debug, Clone)]
pub enum SelectorLayout {
    PerTimeframe {
        order: Vec<Timeframe>,
        groups: BTreeMap<Timeframe, TimeframeGroups>,
    },
    Legacy {
        stay_on_15m_if: Vec<ExprId>,
        drop_to_5m_if_any: Vec<ExprId>,
        forbid_drop_to_5m_if_any: Vec<ExprId>,
    },
}

#[derive(Debug, Clone)]
pub struct SelectorRules {
    pub layout: SelectorLayout,
    pub filters_mandatory: Vec<ExprId>,
    pub allow_1m_only_for: AllowOneMinute,
    pub default_timeframe: Timeframe,
}

#[derive(Debug, Clone)]
pub struct RuleBook {
    registry: ConditionRegistry,
    nodes: Vec<ExprNode>,
    named: BTreeMap<String, ExprId>,
    timeframes: BTreeMap<Timeframe, TimeframeRules>,
    selector: SelectorRules,
    start_from: Timeframe,
}

impl RuleBook {
    /// Validate then compile `config`; hard validation errors abort the load.
    pub fn load(
        config: &Value,
        base: &ConditionRegistry,
    ) -> Result<(RuleBook, ValidationResult), CascadeError> {
        let report = validator::validate(config, base);
        for warning in &report.warnings {
            log::warn!("rule config: {} ({})", warning.message, warning.path);
        }
        if report.has_errors() {
            let summary = report
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.path, e.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(CascadeError::RuleInvalid {
                reason: format!("{} error(s): {summary}", report.errors.len()),
            });
        }
        let book = Self::compile(config, base)?;
        Ok((book, report))
    }

    /// Compile without running the static validator.
    ///
    /// Still rejects unknown names and reference cycles.
    pub fn compile(config: &Value, base: &ConditionRegistry) -> Result<RuleBook, CascadeError> {
        let root = config.as_object().ok_or_else(|| CascadeError::ConfigInvalid {
            section: "root".into(),
            key: "".into(),
            reason: "rule configuration must be an object".into(),
        })?;
        let mut compiler = Compiler::new(root, base)?;

        let validation = root
            .get("validation")
            .and_then(Value::as_object)
            .ok_or_else(|| CascadeError::ConfigMissing {
                section: "validation".into(),
                key: "timeframe".into(),
            })?;
        let start_from = match validation.get("start_from_timeframe") {
            None | Some(Value::Null) => Timeframe::H4,
            Some(v) => parse_timeframe(v, "validation", "start_from_timeframe")?,
        };
        let timeframe_section = validation
            .get("timeframe")
            .and_then(Value::as_object)
            .ok_or_else(|| CascadeError::ConfigMissing {
                section: "validation".into(),
                key: "timeframe".into(),
            })?;

        let mut timeframes = BTreeMap::new();
        for (key, block) in timeframe_section {
            let tf = parse_timeframe(&json!(key), "validation.timeframe", key)?;
            let path = format!("validation.timeframe.{key}");
            let rules = compiler.timeframe_rules(block, &path)?;
            timeframes.insert(tf, rules);
        }

        let selector = compiler.selector_rules(root)?;

        for name in compiler.defs.keys().cloned().collect::<Vec<_>>() {
            compiler.compile_named(&name, &format!("rules.{name}"), &mut Vec::new())?;
        }

        Ok(RuleBook {
            registry: compiler.registry,
            nodes: compiler.nodes,
            named: compiler.named_roots.into_iter().collect(),
            timeframes,
            selector,
            start_from,
        })
    }

    pub fn registry(&self) -> &ConditionRegistry {
        &self.registry
    }

    pub fn start_from(&self) -> Timeframe {
        self.start_from
    }

    pub fn timeframe(&self, tf: Timeframe) -> Option<&TimeframeRules> {
        self.timeframes.get(&tf)
    }

    pub fn selector(&self) -> &SelectorRules {
        &self.selector
    }

    pub fn named_rule(&self, name: &str) -> Option<ExprId> {
        self.named.get(name).copied()
    }

    pub fn node(&self, id: ExprId) -> &ExprNode {
        &self.nodes[id.0]
    }

    pub fn label(&self, id: ExprId) -> &str {
        match self.node(id) {
            ExprNode::Leaf { name, .. } => name,
            ExprNode::AllOf { label, .. } | ExprNode::AnyOf { label, .. } => label,
        }
    }

    /// Numeric thresholds carried by every leaf reachable from `roots`.
    pub fn thresholds(&self, roots: &[ExprId]) -> Vec<(&str, f64)> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<ExprId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            match self.node(id) {
                ExprNode::Leaf {
                    name,
                    threshold: Some(t),
                    ..
                } => out.push((name.as_str(), *t)),
                ExprNode::Leaf { .. } => {}
                ExprNode::AllOf { children, .. } | ExprNode::AnyOf { children, .. } => {
                    stack.extend(children.iter().copied())
                }
            }
        }
        out
    }

    /// Evaluate one node. `ctx` must already carry injected thresholds.
    pub fn evaluate(&self, id: ExprId, ctx: &EvaluationContext) -> ConditionResult {
        match self.node(id) {
            ExprNode::Leaf { condition, .. } => self.registry.evaluate_id(*condition, ctx),
            ExprNode::AllOf { children, .. } => {
                let results = self.evaluate_children(children, ctx);
                combine(&results, condition::all_passed(results.iter().map(|(_, r)| r)))
            }
            ExprNode::AnyOf { children, .. } => {
                let results = self.evaluate_children(children, ctx);
                combine(&results, condition::any_passed(results.iter().map(|(_, r)| r)))
            }
        }
    }

    fn evaluate_children(
        &self,
        children: &[ExprId],
        ctx: &EvaluationContext,
    ) -> Vec<(String, ConditionResult)> {
        children
            .iter()
            .map(|c| (self.label(*c).to_string(), self.evaluate(*c, ctx)))
            .collect()
    }

    /// Inject the list's thresholds into `ctx`, then evaluate each root.
    pub fn evaluate_list(&self, roots: &[ExprId], ctx: &EvaluationContext) -> Vec<LabeledResult> {
        let injected = ctx.with_thresholds(self.thresholds(roots));
        roots
            .iter()
            .map(|id| LabeledResult {
                name: self.label(*id).to_string(),
                result: self.evaluate(*id, &injected),
            })
            .collect()
    }
}

/// Fold child results into one composite result; undecided groups are missing data.
fn combine(children: &[(String, ConditionResult)], passed: bool) -> ConditionResult {
    let summary: Map<String, Value> = children
        .iter()
        .map(|(label, r)| {
            let v = if r.is_missing() {
                Value::Null
            } else {
                Value::Bool(r.passed)
            };
            (label.clone(), v)
        })
        .collect();
    if ConditionResult::decided_count(children.iter().map(|(_, r)| r)) == 0 {
        let mut missing = ConditionResult::missing("all children missing data");
        missing.value = Value::Object(summary);
        return missing;
    }
    ConditionResult::new(passed, Value::Object(summary), None)
}

struct Compiler {
    defs: BTreeMap<String, RuleExpression>,
    registry: ConditionRegistry,
    nodes: Vec<ExprNode>,
    named_roots: HashMap<String, ExprId>,
}

impl Compiler {
    fn new(root: &Map<String, Value>, base: &ConditionRegistry) -> Result<Self, CascadeError> {
        let mut defs = BTreeMap::new();
        match root.get("rules") {
            None | Some(Value::Null) => {}
            Some(Value::Object(rules)) => {
                for (name, raw) in rules {
                    let expr = rule_parser::parse_expression(raw, &format!("rules.{name}"))?;
                    defs.insert(name.clone(), expr);
                }
            }
            Some(_) => {
                return Err(CascadeError::ConfigInvalid {
                    section: "rules".into(),
                    key: "".into(),
                    reason: "rules must be an object".into(),
                });
            }
        }

        let mut registry = base.clone();
        for (name, expr) in &defs {
            if expr.is_parametric() {
                register_leaf(&mut registry, name, expr.clone());
            }
        }

        Ok(Self {
            defs,
            registry,
            nodes: Vec::new(),
            named_roots: HashMap::new(),
        })
    }

    fn push(&mut self, node: ExprNode) -> ExprId {
        self.nodes.push(node);
        ExprId(self.nodes.len() - 1)
    }

    fn leaf(&mut self, name: &str, threshold: Option<f64>, path: &str) -> Result<ExprId, CascadeError> {
        let condition = self
            .registry
            .id_of(name)
            .ok_or_else(|| CascadeError::UnknownCondition {
                name: name.to_string(),
                path: path.to_string(),
            })?;
        Ok(self.push(ExprNode::Leaf {
            name: name.to_string(),
            condition,
            threshold,
        }))
    }

    fn compile_named(
        &mut self,
        name: &str,
        path: &str,
        stack: &mut Vec<String>,
    ) -> Result<ExprId, CascadeError> {
        if let Some(id) = self.named_roots.get(name) {
            return Ok(*id);
        }
        if stack.iter().any(|s| s == name) {
            return Err(CascadeError::CircularReference {
                rule: name.to_string(),
                path: path.to_string(),
            });
        }
        let Some(def) = self.defs.get(name).cloned() else {
            return Err(CascadeError::UnknownCondition {
                name: name.to_string(),
                path: path.to_string(),
            });
        };
        stack.push(name.to_string());
        let id = if def.is_parametric() {
            self.leaf(name, None, path)
        } else {
            self.compile_expr(&def, &format!("rules.{name}"), stack)
        };
        stack.pop();
        let id = id?;
        if def.is_composite() {
            if let ExprNode::AllOf { label, .. } | ExprNode::AnyOf { label, .. } =
                &mut self.nodes[id.0]
            {
                *label = name.to_string();
            }
        }
        self.named_roots.insert(name.to_string(), id);
        Ok(id)
    }

    fn compile_expr(
        &mut self,
        expr: &RuleExpression,
        path: &str,
        stack: &mut Vec<String>,
    ) -> Result<ExprId, CascadeError> {
        match expr {
            RuleExpression::Name { name, threshold } => {
                let threshold = threshold.and_then(|t| t.injectable());
                match self.defs.get(name).map(RuleExpression::is_parametric) {
                    Some(false) => self.compile_named(name, path, stack),
                    Some(true) | None => self.leaf(name, threshold, path),
                }
            }
            RuleExpression::AllOf(children) | RuleExpression::AnyOf(children) => {
                let key = expr.kind_name();
                let mut ids = Vec::with_capacity(children.len());
                for (i, child) in children.iter().enumerate() {
                    let child_path = index_path(&child_path(path, key), i);
                    ids.push(self.compile_expr(child, &child_path, stack)?);
                }
                let label = key.to_string();
                Ok(self.push(if matches!(expr, RuleExpression::AllOf(_)) {
                    ExprNode::AllOf {
                        label,
                        children: ids,
                    }
                } else {
                    ExprNode::AnyOf {
                        label,
                        children: ids,
                    }
                }))
            }
            _ => {
                register_leaf(&mut self.registry, path, expr.clone());
                self.leaf(path, None, path)
            }
        }
    }

    fn compile_list(&mut self, value: Option<&Value>, path: &str) -> Result<Vec<ExprId>, CascadeError> {
        let Some(value) = value else {
            return Ok(Vec::new());
        };
        let exprs = rule_parser::parse_list(value, path)?;
        exprs
            .iter()
            .enumerate()
            .map(|(i, e)| self.compile_expr(e, &index_path(path, i), &mut Vec::new()))
            .collect()
    }

    fn timeframe_rules(&mut self, block: &Value, path: &str) -> Result<TimeframeRules, CascadeError> {
        let obj = block.as_object().ok_or_else(|| CascadeError::ConfigInvalid {
            section: path.to_string(),
            key: "".into(),
            reason: "timeframe block must be an object".into(),
        })?;
        let min_bars = match obj.get("min_bars") {
            None | Some(Value::Null) => DEFAULT_MIN_BARS,
            Some(v) => v.as_u64().filter(|n| *n > 0).ok_or_else(|| CascadeError::ConfigInvalid {
                section: path.to_string(),
                key: "min_bars".into(),
                reason: "min_bars must be a positive integer".into(),
            })? as usize,
        };
        let grace_secs = match obj.get("grace_window_secs") {
            None | Some(Value::Null) => 0,
            Some(v) => v.as_u64().ok_or_else(|| CascadeError::ConfigInvalid {
                section: path.to_string(),
                key: "grace_window_secs".into(),
                reason: "grace_window_secs must be a non-negative integer".into(),
            })? as i64,
        };
        Ok(TimeframeRules {
            long: self.compile_list(obj.get("long"), &child_path(path, "long"))?,
            short: self.compile_list(obj.get("short"), &child_path(path, "short"))?,
            min_bars,
            grace_window: Duration::seconds(grace_secs),
        })
    }

    fn selector_rules(&mut self, root: &Map<String, Value>) -> Result<SelectorRules, CascadeError> {
        let empty = Map::new();
        let selector = match root.get("execution_selector") {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(m)) => m,
            Some(_) => {
                return Err(CascadeError::ConfigInvalid {
                    section: "execution_selector".into(),
                    key: "".into(),
                    reason: "execution_selector must be an object".into(),
                });
            }
        };

        let filters_mandatory = match selector.get("filters_mandatory") {
            Some(v) => self.compile_list(Some(v), "execution_selector.filters_mandatory")?,
            None => self.compile_list(root.get("filters_mandatory"), "filters_mandatory")?,
        };

        let allow_1m_only_for = match selector.get("allow_1m_only_for") {
            None | Some(Value::Null) => AllowOneMinute::default(),
            Some(Value::Object(m)) => AllowOneMinute {
                enabled: m.get("enabled").and_then(Value::as_bool).unwrap_or(false),
                conditions: self.compile_list(
                    m.get("conditions"),
                    "execution_selector.allow_1m_only_for.conditions",
                )?,
            },
            Some(_) => {
                return Err(CascadeError::ConfigInvalid {
                    section: "execution_selector".into(),
                    key: "allow_1m_only_for".into(),
                    reason: "allow_1m_only_for must be an object".into(),
                });
            }
        };

        let default_timeframe = match selector.get("default_timeframe") {
            None | Some(Value::Null) => Timeframe::M5,
            Some(v) => {
                let tf = parse_timeframe(v, "execution_selector", "default_timeframe")?;
                if !tf.is_execution() {
                    return Err(CascadeError::ConfigInvalid {
                        section: "execution_selector".into(),
                        key: "default_timeframe".into(),
                        reason: format!("{tf} is not an execution timeframe"),
                    });
                }
                tf
            }
        };

        let layout = match selector.get("per_timeframe") {
            Some(Value::Object(per_tf)) => {
                let order = match selector.get("execution_timeframes") {
                    None | Some(Value::Null) => DEFAULT_EXECUTION_TIMEFRAMES.to_vec(),
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|v| parse_timeframe(v, "execution_selector", "execution_timeframes"))
                        .collect::<Result<Vec<_>, _>>()?,
                    Some(_) => {
                        return Err(CascadeError::ConfigInvalid {
                            section: "execution_selector".into(),
                            key: "execution_timeframes".into(),
                            reason: "execution_timeframes must be a list".into(),
                        });
                    }
                };
                let mut groups = BTreeMap::new();
                for (key, block) in per_tf {
                    let tf = parse_timeframe(&json!(key), "execution_selector.per_timeframe", key)?;
                    let path = format!("execution_selector.per_timeframe.{key}");
                    let obj = block.as_object().ok_or_else(|| CascadeError::ConfigInvalid {
                        section: path.clone(),
                        key: "".into(),
                        reason: "per-timeframe block must be an object".into(),
                    })?;
                    groups.insert(
                        tf,
                        TimeframeGroups {
                            stay_on_if: self
                                .compile_list(obj.get("stay_on_if"), &child_path(&path, "stay_on_if"))?,
                            drop_to_lower_if_any: self.compile_list(
                                obj.get("drop_to_lower_if_any"),
                                &child_path(&path, "drop_to_lower_if_any"),
                            )?,
                            forbid_drop_to_lower_if_any: self.compile_list(
                                obj.get("forbid_drop_to_lower_if_any"),
                                &child_path(&path, "forbid_drop_to_lower_if_any"),
                            )?,
                        },
                    );
                }
                SelectorLayout::PerTimeframe { order, groups }
            }
            Some(_) => {
                return Err(CascadeError::ConfigInvalid {
                    section: "execution_selector".into(),
                    key: "per_timeframe".into(),
                    reason: "per_timeframe must be an object".into(),
                });
            }
            None => SelectorLayout::Legacy {
                stay_on_15m_if: self.compile_list(
                    selector.get("stay_on_15m_if"),
                    "execution_selector.stay_on_15m_if",
                )?,
                drop_to_5m_if_any: self.compile_list(
                    selector.get("drop_to_5m_if_any"),
                    "execution_selector.drop_to_5m_if_any",
                )?,
                forbid_drop_to_5m_if_any: self.compile_list(
                    selector.get("forbid_drop_to_5m_if_any"),
                    "execution_selector.forbid_drop_to_5m_if_any",
                )?,
            },
        };

        Ok(SelectorRules {
            layout,
            filters_mandatory,
            allow_1m_only_for,
            default_timeframe,
        })
    }
}

fn register_leaf(registry: &mut ConditionRegistry, name: &str, expr: RuleExpression) {
    let owned = name.to_string();
    registry.register(name, move |ctx: &EvaluationContext| evaluate_leaf(&owned, &expr, ctx));
}

fn parse_timeframe(value: &Value, section: &str, key: &str) -> Result<Timeframe, CascadeError> {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CascadeError::ConfigInvalid {
            section: section.to_string(),
            key: key.to_string(),
            reason: format!("expected a timeframe (4h, 1h, 15m, 5m, 1m), found {value}"),
        })
}

/// Shared, atomically swappable rule book.
///
/// Readers take an `Arc` snapshot and keep it for the whole run, so a reload
/// never exposes a half-updated configuration.
#[derive(Debug)]
pub struct RuleBookHandle {
    current: RwLock<Arc<RuleBook>>,
}

impl RuleBookHandle {
    pub fn new(book: RuleBook) -> Self {
        Self {
            current: RwLock::new(Arc::new(book)),
        }
    }

    pub fn snapshot(&self) -> Arc<RuleBook> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Publish `book`, returning the previous snapshot.
    pub fn replace(&self, book: RuleBook) -> Arc<RuleBook> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(book))
    }
}
