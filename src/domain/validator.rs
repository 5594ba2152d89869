//! Static validation of a raw rule configuration.
//!
//! Checks section shapes, every rule expression node, reference resolution
//! against defined rules and registered conditions, and reference cycles.
//! Never fails: every finding is reported as an error or a warning and the
//! caller decides what is fatal.

use crate::domain::error::{RuleErrorKind, RuleParseError};
use crate::domain::registry::ConditionRegistry;
use crate::domain::rule::{RuleExpression, Threshold};
use crate::domain::rule_parser::{self, child_path, index_path, type_name};
use crate::domain::timeframe::Timeframe;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingSection,
    InvalidType,
    InvalidShape,
    InvalidOperator,
    InvalidBounds,
    EmptyGroup,
    MissingReference,
    CircularReference,
    UnknownTimeframe,
    EmptyRuleSet,
    UnusedRule,
    UnknownKey,
    IgnoredThreshold,
}

impl IssueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueKind::MissingSection => "missing_section",
            IssueKind::InvalidType => "invalid_type",
            IssueKind::InvalidShape => "invalid_shape",
            IssueKind::InvalidOperator => "invalid_operator",
            IssueKind::InvalidBounds => "invalid_bounds",
            IssueKind::EmptyGroup => "empty_group",
            IssueKind::MissingReference => "missing_reference",
            IssueKind::CircularReference => "circular_reference",
            IssueKind::UnknownTimeframe => "unknown_timeframe",
            IssueKind::EmptyRuleSet => "empty_rule_set",
            IssueKind::UnusedRule => "unused_rule",
            IssueKind::UnknownKey => "unknown_key",
            IssueKind::IgnoredThreshold => "ignored_threshold",
        }
    }
}

impl From<RuleErrorKind> for IssueKind {
    fn from(kind: RuleErrorKind) -> Self {
        match kind {
            RuleErrorKind::InvalidShape => IssueKind::InvalidShape,
            RuleErrorKind::InvalidType => IssueKind::InvalidType,
            RuleErrorKind::InvalidOperator => IssueKind::InvalidOperator,
            RuleErrorKind::InvalidBounds => IssueKind::InvalidBounds,
            RuleErrorKind::EmptyGroup => IssueKind::EmptyGroup,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    #[serde(rename = "type")]
    pub kind: IssueKind,
    pub message: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, Value>,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind.as_str(), self.path, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationResult {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }

    pub fn errors_of(&self, kind: IssueKind) -> impl Iterator<Item = &ValidationIssue> {
        self.errors.iter().filter(move |e| e.kind == kind)
    }
}

const TIMEFRAME_KEYS: &[&str] = &["long", "short", "min_bars", "grace_window_secs"];
const PER_TIMEFRAME_GROUPS: &[&str] = &[
    "stay_on_if",
    "drop_to_lower_if_any",
    "forbid_drop_to_lower_if_any",
];
const LEGACY_GROUPS: &[&str] = &[
    "stay_on_15m_if",
    "drop_to_5m_if_any",
    "forbid_drop_to_5m_if_any",
];

/// Validate a raw rule configuration against `registry`.
pub fn validate(config: &Value, registry: &ConditionRegistry) -> ValidationResult {
    let empty = Map::new();
    let Some(root) = config.as_object() else {
        let mut result = ValidationResult::default();
        result.errors.push(issue(
            IssueKind::InvalidType,
            "",
            format!("rule configuration must be an object, found {}", type_name(config)),
        ));
        return result;
    };

    let rules = match root.get("rules") {
        Some(Value::Object(m)) => m,
        _ => &empty,
    };
    let mut checker = Checker {
        rules,
        registry,
        current_rule: None,
        referenced: BTreeSet::new(),
        result: ValidationResult::default(),
    };

    checker.check_rules(root);
    checker.check_validation(root);
    checker.check_selector(root);
    checker.check_cycles();
    checker.check_unused();
    checker.result
}

fn issue(kind: IssueKind, path: &str, message: impl Into<String>) -> ValidationIssue {
    ValidationIssue {
        kind,
        message: message.into(),
        path: path.to_string(),
        rule: None,
        context: BTreeMap::new(),
    }
}

struct Checker<'a> {
    rules: &'a Map<String, Value>,
    registry: &'a ConditionRegistry,
    current_rule: Option<String>,
    referenced: BTreeSet<String>,
    result: ValidationResult,
}

impl Checker<'_> {
    fn error(&mut self, kind: IssueKind, path: &str, message: impl Into<String>) {
        let mut i = issue(kind, path, message);
        i.rule = self.current_rule.clone();
        self.result.errors.push(i);
    }

    fn warn(&mut self, kind: IssueKind, path: &str, message: impl Into<String>) {
        let mut i = issue(kind, path, message);
        i.rule = self.current_rule.clone();
        self.result.warnings.push(i);
    }

    fn parse_error(&mut self, e: RuleParseError) {
        self.error(e.kind.into(), &e.path, e.message);
    }

    fn check_rules(&mut self, root: &Map<String, Value>) {
        match root.get("rules") {
            None | Some(Value::Null) => {}
            Some(Value::Object(rules)) => {
                for (name, body) in rules {
                    self.current_rule = Some(name.clone());
                    self.check_expression(body, &format!("rules.{name}"));
                }
                self.current_rule = None;
            }
            Some(other) => self.error(
                IssueKind::InvalidType,
                "rules",
                format!("rules must be an object, found {}", type_name(other)),
            ),
        }
    }

    fn check_expression(&mut self, value: &Value, path: &str) {
        match value {
            Value::Array(items) => self.check_group(items, path),
            Value::Object(map) if map.contains_key("all_of") || map.contains_key("any_of") => {
                match rule_parser::composite_parts(map, path) {
                    Ok((key, items)) => self.check_group(items, &child_path(path, key)),
                    Err(e) => self.parse_error(e),
                }
            }
            _ => match rule_parser::parse_leaf(value, path) {
                Ok(RuleExpression::Name { name, threshold }) => {
                    self.check_reference(&name, path);
                    if let Some(Threshold::Number(t)) = threshold
                        && self.is_named_group(&name)
                    {
                        self.warn(
                            IssueKind::IgnoredThreshold,
                            path,
                            format!(
                                "threshold {t} on named rule '{name}' is ignored; set it on its leaves"
                            ),
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => self.parse_error(e),
            },
        }
    }

    fn check_group(&mut self, items: &[Value], path: &str) {
        if items.is_empty() {
            self.error(IssueKind::EmptyGroup, path, "group must not be empty");
            return;
        }
        for (i, item) in items.iter().enumerate() {
            self.check_expression(item, &index_path(path, i));
        }
    }

    fn check_reference(&mut self, name: &str, path: &str) {
        self.referenced.insert(name.to_string());
        if !self.rules.contains_key(name) && !self.registry.contains(name) {
            self.error(
                IssueKind::MissingReference,
                path,
                format!("'{name}' is neither a defined rule nor a registered condition"),
            );
        }
    }

    /// A defined rule whose body is a group or an alias, not a parametric leaf.
    fn is_named_group(&self, name: &str) -> bool {
        match self.rules.get(name) {
            Some(Value::Array(_)) => true,
            Some(Value::Object(map)) if map.contains_key("all_of") || map.contains_key("any_of") => {
                true
            }
            Some(body) => matches!(
                rule_parser::parse_leaf(body, name),
                Ok(RuleExpression::Name { .. })
            ),
            None => false,
        }
    }

    /// A rule list: absent or null is fine, otherwise an array of expressions.
    fn check_list(&mut self, value: Option<&Value>, path: &str) -> usize {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Array(items)) => {
                for (i, item) in items.iter().enumerate() {
                    self.check_expression(item, &index_path(path, i));
                }
                items.len()
            }
            Some(other) => {
                self.error(
                    IssueKind::InvalidType,
                    path,
                    format!("expected a list of rule expressions, found {}", type_name(other)),
                );
                0
            }
        }
    }

    fn check_timeframe(&mut self, value: &Value, path: &str) -> Option<Timeframe> {
        match value.as_str().map(str::parse::<Timeframe>) {
            Some(Ok(tf)) => Some(tf),
            _ => {
                self.error(
                    IssueKind::UnknownTimeframe,
                    path,
                    format!("expected one of 4h, 1h, 15m, 5m, 1m, found {value}"),
                );
                None
            }
        }
    }

    fn check_validation(&mut self, root: &Map<String, Value>) {
        let Some(validation) = root.get("validation") else {
            self.error(IssueKind::MissingSection, "validation", "missing 'validation' section");
            return;
        };
        let Some(validation) = validation.as_object() else {
            self.error(
                IssueKind::InvalidType,
                "validation",
                format!("validation must be an object, found {}", type_name(validation)),
            );
            return;
        };

        let start = match validation.get("start_from_timeframe") {
            None | Some(Value::Null) => Some(Timeframe::H4),
            Some(v) => self.check_timeframe(v, "validation.start_from_timeframe"),
        };

        let section = match validation.get("timeframe") {
            Some(Value::Object(m)) => m,
            Some(other) => {
                self.error(
                    IssueKind::InvalidType,
                    "validation.timeframe",
                    format!("validation.timeframe must be an object, found {}", type_name(other)),
                );
                return;
            }
            None => {
                self.error(
                    IssueKind::MissingSection,
                    "validation.timeframe",
                    "missing 'validation.timeframe' section",
                );
                return;
            }
        };

        let mut configured = BTreeSet::new();
        for (key, block) in section {
            let path = format!("validation.timeframe.{key}");
            if let Some(tf) = self.check_timeframe(&json!(key), &path) {
                configured.insert(tf);
            }
            self.check_timeframe_block(block, &path);
        }

        if let Some(start) = start {
            for tf in start.cascade_from() {
                if !configured.contains(tf) {
                    self.warn(
                        IssueKind::MissingSection,
                        &format!("validation.timeframe.{tf}"),
                        format!("{tf} is in the cascade but has no rules; it will always be INVALID"),
                    );
                }
            }
        }
    }

    fn check_timeframe_block(&mut self, block: &Value, path: &str) {
        let Some(obj) = block.as_object() else {
            self.error(
                IssueKind::InvalidType,
                path,
                format!("timeframe block must be an object, found {}", type_name(block)),
            );
            return;
        };
        for key in obj.keys().filter(|k| !TIMEFRAME_KEYS.contains(&k.as_str())) {
            self.warn(
                IssueKind::UnknownKey,
                &child_path(path, key),
                format!("unknown key '{key}' is ignored"),
            );
        }
        let long = self.check_list(obj.get("long"), &child_path(path, "long"));
        let short = self.check_list(obj.get("short"), &child_path(path, "short"));
        if long + short == 0 {
            self.warn(IssueKind::EmptyRuleSet, path, "no long or short rules configured");
        }
        match obj.get("min_bars") {
            None | Some(Value::Null) => {}
            Some(v) if v.as_u64().is_some_and(|n| n > 0) => {}
            Some(v) => self.error(
                IssueKind::InvalidType,
                &child_path(path, "min_bars"),
                format!("min_bars must be a positive integer, found {v}"),
            ),
        }
        match obj.get("grace_window_secs") {
            None | Some(Value::Null) => {}
            Some(v) if v.as_u64().is_some() => {}
            Some(v) => self.error(
                IssueKind::InvalidType,
                &child_path(path, "grace_window_secs"),
                format!("grace_window_secs must be a non-negative integer, found {v}"),
            ),
        }
    }

    fn check_selector(&mut self, root: &Map<String, Value>) {
        self.check_list(root.get("filters_mandatory"), "filters_mandatory");

        let selector = match root.get("execution_selector") {
            None | Some(Value::Null) => return,
            Some(Value::Object(m)) => m,
            Some(other) => {
                self.error(
                    IssueKind::InvalidType,
                    "execution_selector",
                    format!("execution_selector must be an object, found {}", type_name(other)),
                );
                return;
            }
        };

        self.check_list(
            selector.get("filters_mandatory"),
            "execution_selector.filters_mandatory",
        );

        match selector.get("allow_1m_only_for") {
            None | Some(Value::Null) => {}
            Some(Value::Object(m)) => {
                if let Some(v) = m.get("enabled").filter(|v| !v.is_boolean()) {
                    self.error(
                        IssueKind::InvalidType,
                        "execution_selector.allow_1m_only_for.enabled",
                        format!("enabled must be a boolean, found {}", type_name(v)),
                    );
                }
                let n = self.check_list(
                    m.get("conditions"),
                    "execution_selector.allow_1m_only_for.conditions",
                );
                if n == 0 && m.get("enabled").and_then(Value::as_bool).unwrap_or(false) {
                    self.warn(
                        IssueKind::EmptyRuleSet,
                        "execution_selector.allow_1m_only_for",
                        "enabled with no conditions; 1m is never selected",
                    );
                }
            }
            Some(other) => self.error(
                IssueKind::InvalidType,
                "execution_selector.allow_1m_only_for",
                format!("allow_1m_only_for must be an object, found {}", type_name(other)),
            ),
        }

        if let Some(v) = selector.get("default_timeframe").filter(|v| !v.is_null()) {
            let path = "execution_selector.default_timeframe";
            if let Some(tf) = self.check_timeframe(v, path) {
                if !tf.is_execution() {
                    self.error(
                        IssueKind::UnknownTimeframe,
                        path,
                        format!("{tf} is not an execution timeframe"),
                    );
                }
            }
        }

        match selector.get("per_timeframe") {
            None => {
                for group in LEGACY_GROUPS {
                    self.check_list(
                        selector.get(*group),
                        &format!("execution_selector.{group}"),
                    );
                }
            }
            Some(Value::Object(per_tf)) => {
                self.check_per_timeframe(selector, per_tf);
            }
            Some(other) => self.error(
                IssueKind::InvalidType,
                "execution_selector.per_timeframe",
                format!("per_timeframe must be an object, found {}", type_name(other)),
            ),
        }
    }

    fn check_per_timeframe(&mut self, selector: &Map<String, Value>, per_tf: &Map<String, Value>) {
        match selector.get("execution_timeframes") {
            None | Some(Value::Null) => {}
            Some(Value::Array(items)) => {
                for (i, v) in items.iter().enumerate() {
                    self.check_timeframe(v, &index_path("execution_selector.execution_timeframes", i));
                }
            }
            Some(other) => self.error(
                IssueKind::InvalidType,
                "execution_selector.execution_timeframes",
                format!("execution_timeframes must be a list, found {}", type_name(other)),
            ),
        }
        for group in LEGACY_GROUPS.iter().filter(|g| selector.contains_key(**g)) {
            self.warn(
                IssueKind::UnknownKey,
                &format!("execution_selector.{group}"),
                "legacy group is ignored when per_timeframe is configured",
            );
        }

        for (key, block) in per_tf {
            let path = format!("execution_selector.per_timeframe.{key}");
            if let Some(tf) = self.check_timeframe(&json!(key), &path) {
                if !tf.is_execution() {
                    self.warn(
                        IssueKind::UnknownTimeframe,
                        &path,
                        format!("{tf} is not an execution timeframe"),
                    );
                }
            }
            let Some(obj) = block.as_object() else {
                self.error(
                    IssueKind::InvalidType,
                    &path,
                    format!("per-timeframe block must be an object, found {}", type_name(block)),
                );
                continue;
            };
            for k in obj.keys().filter(|k| !PER_TIMEFRAME_GROUPS.contains(&k.as_str())) {
                self.warn(
                    IssueKind::UnknownKey,
                    &child_path(&path, k),
                    format!("unknown group '{k}' is ignored"),
                );
            }
            for group in PER_TIMEFRAME_GROUPS {
                self.check_list(obj.get(*group), &child_path(&path, group));
            }
        }
    }

    fn check_cycles(&mut self) {
        let defs: BTreeMap<&str, RuleExpression> = self
            .rules
            .iter()
            .filter_map(|(name, body)| {
                rule_parser::parse_expression(body, &format!("rules.{name}"))
                    .ok()
                    .map(|expr| (name.as_str(), expr))
            })
            .collect();

        let mut done = BTreeSet::new();
        let mut reported = BTreeSet::new();
        let mut found = Vec::new();
        for name in defs.keys() {
            find_cycles(*name, &defs, &mut Vec::new(), &mut done, &mut reported, &mut found);
        }
        for cycle in found {
            let first = cycle[0].clone();
            let mut i = issue(
                IssueKind::CircularReference,
                &format!("rules.{first}"),
                format!("circular reference: {}", cycle.join(" -> ")),
            );
            i.rule = Some(first);
            i.context.insert("cycle".to_string(), json!(cycle));
            self.result.errors.push(i);
        }
    }

    fn check_unused(&mut self) {
        let unused: Vec<String> = self
            .rules
            .keys()
            .filter(|name| !self.referenced.contains(*name))
            .cloned()
            .collect();
        for name in unused {
            let mut i = issue(
                IssueKind::UnusedRule,
                &format!("rules.{name}"),
                format!("rule '{name}' is defined but never referenced"),
            );
            i.rule = Some(name);
            self.result.warnings.push(i);
        }
    }
}

/// Depth-first walk over rule references.
///
/// `visiting` is the current descent path; meeting a name already on it is a
/// cycle, reported once and not descended further.
fn find_cycles<'a>(
    name: &'a str,
    defs: &'a BTreeMap<&'a str, RuleExpression>,
    visiting: &mut Vec<&'a str>,
    done: &mut BTreeSet<&'a str>,
    reported: &mut BTreeSet<Vec<&'a str>>,
    found: &mut Vec<Vec<String>>,
) {
    if let Some(pos) = visiting.iter().position(|v| *v == name) {
        let members = &visiting[pos..];
        let mut key = members.to_vec();
        key.sort_unstable();
        if reported.insert(key) {
            let mut cycle: Vec<String> = members.iter().map(|s| s.to_string()).collect();
            cycle.push(name.to_string());
            found.push(cycle);
        }
        return;
    }
    if done.contains(name) {
        return;
    }
    let Some((key, expr)) = defs.get_key_value(name) else {
        return;
    };
    visiting.push(*key);
    for reference in expr.references() {
        if let Some((next, _)) = defs.get_key_value(reference) {
            find_cycles(*next, defs, visiting, done, reported, found);
        }
    }
    visiting.pop();
    done.insert(*key);
}
