//! Rule expression parser.
//!
//! Converts a `serde_json::Value` rule node into a [`RuleExpression`]. Errors
//! carry the dotted path of the offending node (`rules.trend_ok.all_of[1].op`).
//!
//! Accepted shapes:
//!
//! ```text
//! "rsi_bullish"                                   Name
//! {"liquidity_ok": 500000}                        Name with threshold
//! [a, b]  /  {"all_of": [a, b]}                   AllOf
//! {"any_of": [a, b]}                              AnyOf
//! {"op": ">", "left": "rsi", "right": 50}         Compare  (or "slope_left")
//! {"lt_fields": ["ema_slow", "ema_fast"]}         FieldOrder (or "gt_fields")
//! {"increasing": "macd_hist", "n": 3}             Trend (or "decreasing")
//! {"min": 0.001, "max": 0.03, "use_atr_tf": []}   Range
//! {"field": "rsi", "level": 50, "min_gap": 2}     Hysteresis
//! {"field": "macd_hist", "derivative_gt": 0}      Derivative
//! {"field": "rsi", "min": 30, "max": 70}          Bounds
//! ```

use crate::domain::error::{RuleErrorKind, RuleParseError};
use crate::domain::rule::{
    CompareLeft, CompareOp, FieldOrderKind, Operand, RuleExpression, Threshold, TrendKind,
};
use crate::domain::timeframe::Timeframe;
use serde_json::{Map, Value};

/// Keys with structural meaning; an object holding any of them is not a name reference.
pub const RESERVED_KEYS: &[&str] = &[
    "all_of",
    "any_of",
    "op",
    "left",
    "slope_left",
    "right",
    "eps",
    "lt_fields",
    "gt_fields",
    "increasing",
    "decreasing",
    "n",
    "field",
    "min",
    "max",
    "use_atr_tf",
    "adapt_with_vol_bucket",
    "level",
    "min_gap",
    "cool_down_bars",
    "require_prev_below",
    "require_prev_above",
    "derivative_gt",
    "derivative_lt",
    "persist_n",
];

pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

pub fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

pub fn index_path(path: &str, index: usize) -> String {
    format!("{path}[{index}]")
}

fn err(kind: RuleErrorKind, path: &str, message: impl Into<String>) -> RuleParseError {
    RuleParseError::new(kind, path, message)
}

/// Parse a full expression, composites included.
pub fn parse_expression(value: &Value, path: &str) -> Result<RuleExpression, RuleParseError> {
    match value {
        Value::Array(items) => Ok(RuleExpression::AllOf(parse_children(items, path)?)),
        Value::Object(map) if map.contains_key("all_of") || map.contains_key("any_of") => {
            let (key, items) = composite_parts(map, path)?;
            let children = parse_children(items, &child_path(path, key))?;
            Ok(if key == "all_of" {
                RuleExpression::AllOf(children)
            } else {
                RuleExpression::AnyOf(children)
            })
        }
        _ => parse_leaf(value, path),
    }
}

/// Parse a list of expressions (a rule group or a timeframe side).
pub fn parse_list(value: &Value, path: &str) -> Result<Vec<RuleExpression>, RuleParseError> {
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| parse_expression(v, &index_path(path, i)))
            .collect(),
        Value::Null => Ok(Vec::new()),
        _ => Err(err(
            RuleErrorKind::InvalidType,
            path,
            "expected a list of rule expressions",
        )),
    }
}

fn parse_children(items: &[Value], path: &str) -> Result<Vec<RuleExpression>, RuleParseError> {
    if items.is_empty() {
        return Err(err(RuleErrorKind::EmptyGroup, path, "group must not be empty"));
    }
    items
        .iter()
        .enumerate()
        .map(|(i, v)| parse_expression(v, &index_path(path, i)))
        .collect()
}

/// Split an `all_of`/`any_of` object into its key and child list.
pub fn composite_parts<'a>(
    map: &'a Map<String, Value>,
    path: &str,
) -> Result<(&'static str, &'a [Value]), RuleParseError> {
    if map.len() != 1 {
        return Err(err(
            RuleErrorKind::InvalidShape,
            path,
            "all_of/any_of must be the only key of its object",
        ));
    }
    let key = if map.contains_key("all_of") {
        "all_of"
    } else {
        "any_of"
    };
    match &map[key] {
        Value::Array(items) => Ok((key, items.as_slice())),
        _ => Err(err(
            RuleErrorKind::InvalidType,
            &child_path(path, key),
            format!("{key} must be a list"),
        )),
    }
}

/// Parse a non-composite node.
pub fn parse_leaf(value: &Value, path: &str) -> Result<RuleExpression, RuleParseError> {
    match value {
        Value::String(name) => {
            if name.trim().is_empty() {
                return Err(err(RuleErrorKind::InvalidType, path, "empty rule name"));
            }
            Ok(RuleExpression::Name {
                name: name.clone(),
                threshold: None,
            })
        }
        Value::Object(map) => parse_object(map, path),
        _ => Err(err(
            RuleErrorKind::InvalidType,
            path,
            format!("expected a rule name or rule object, found {}", type_name(value)),
        )),
    }
}

fn parse_object(map: &Map<String, Value>, path: &str) -> Result<RuleExpression, RuleParseError> {
    if map.is_empty() {
        return Err(err(RuleErrorKind::InvalidShape, path, "empty rule object"));
    }
    if !map.keys().any(|k| is_reserved(k)) {
        return parse_named_threshold(map, path);
    }
    if map.contains_key("all_of") || map.contains_key("any_of") {
        return Err(err(
            RuleErrorKind::InvalidShape,
            path,
            "composite group where a leaf was expected",
        ));
    }

    let fields = Fields { map, path };
    if map.contains_key("op") {
        parse_compare(&fields)
    } else if map.contains_key("lt_fields") || map.contains_key("gt_fields") {
        parse_field_order(&fields)
    } else if map.contains_key("increasing") || map.contains_key("decreasing") {
        parse_trend(&fields)
    } else if map.contains_key("derivative_gt") || map.contains_key("derivative_lt") {
        parse_derivative(&fields)
    } else if ["level", "min_gap", "cool_down_bars", "require_prev_below", "require_prev_above"]
        .iter()
        .any(|k| map.contains_key(*k))
    {
        parse_hysteresis(&fields)
    } else if map.contains_key("min") || map.contains_key("max") {
        if map.contains_key("field") {
            parse_bounds(&fields)
        } else {
            parse_range(&fields)
        }
    } else {
        Err(err(
            RuleErrorKind::InvalidShape,
            path,
            format!(
                "unrecognised rule shape with keys [{}]",
                map.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
        ))
    }
}

fn parse_named_threshold(
    map: &Map<String, Value>,
    path: &str,
) -> Result<RuleExpression, RuleParseError> {
    if map.len() != 1 {
        return Err(err(
            RuleErrorKind::InvalidShape,
            path,
            "a name reference must have exactly one key",
        ));
    }
    let (name, raw) = map.iter().next().ok_or_else(|| {
        err(RuleErrorKind::InvalidShape, path, "empty rule object")
    })?;
    let threshold = match raw {
        Value::Null => None,
        Value::Bool(b) => Some(Threshold::Bool(*b)),
        Value::Number(n) => Some(Threshold::Number(n.as_f64().ok_or_else(|| {
            err(RuleErrorKind::InvalidType, &child_path(path, name), "threshold is not finite")
        })?)),
        other => {
            return Err(err(
                RuleErrorKind::InvalidType,
                &child_path(path, name),
                format!("threshold must be a number, boolean or null, found {}", type_name(other)),
            ));
        }
    };
    Ok(RuleExpression::Name {
        name: name.clone(),
        threshold,
    })
}

struct Fields<'a> {
    map: &'a Map<String, Value>,
    path: &'a str,
}

impl<'a> Fields<'a> {
    fn allow_only(&self, allowed: &[&str]) -> Result<(), RuleParseError> {
        match self.map.keys().find(|k| !allowed.contains(&k.as_str())) {
            Some(k) => Err(err(
                RuleErrorKind::InvalidShape,
                &child_path(self.path, k),
                format!("unexpected key '{k}'"),
            )),
            None => Ok(()),
        }
    }

    fn path_of(&self, key: &str) -> String {
        child_path(self.path, key)
    }

    fn number(&self, key: &str) -> Result<Option<f64>, RuleParseError> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(other) => Err(err(
                RuleErrorKind::InvalidType,
                &self.path_of(key),
                format!("expected a number, found {}", type_name(other)),
            )),
        }
    }

    fn required_number(&self, key: &str) -> Result<f64, RuleParseError> {
        self.number(key)?.ok_or_else(|| {
            err(
                RuleErrorKind::InvalidShape,
                &self.path_of(key),
                format!("missing required number '{key}'"),
            )
        })
    }

    fn count(&self, key: &str) -> Result<Option<usize>, RuleParseError> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_u64().map(|v| Some(v as usize)).ok_or_else(|| {
                err(
                    RuleErrorKind::InvalidType,
                    &self.path_of(key),
                    format!("'{key}' must be a non-negative integer"),
                )
            }),
            Some(other) => Err(err(
                RuleErrorKind::InvalidType,
                &self.path_of(key),
                format!("expected an integer, found {}", type_name(other)),
            )),
        }
    }

    fn flag(&self, key: &str) -> Result<bool, RuleParseError> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(err(
                RuleErrorKind::InvalidType,
                &self.path_of(key),
                format!("expected a boolean, found {}", type_name(other)),
            )),
        }
    }

    fn string(&self, key: &str) -> Result<Option<String>, RuleParseError> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(Some(s.clone())),
            Some(other) => Err(err(
                RuleErrorKind::InvalidType,
                &self.path_of(key),
                format!("expected a field name, found {}", type_name(other)),
            )),
        }
    }

    fn required_string(&self, key: &str) -> Result<String, RuleParseError> {
        self.string(key)?.ok_or_else(|| {
            err(
                RuleErrorKind::InvalidShape,
                &self.path_of(key),
                format!("missing required field '{key}'"),
            )
        })
    }

    fn operand(&self, key: &str) -> Result<Operand, RuleParseError> {
        match self.map.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(Operand::Field(s.clone())),
            Some(Value::Number(n)) => n.as_f64().map(Operand::Constant).ok_or_else(|| {
                err(RuleErrorKind::InvalidType, &self.path_of(key), "operand is not finite")
            }),
            Some(other) => Err(err(
                RuleErrorKind::InvalidType,
                &self.path_of(key),
                format!("operand must be a field name or number, found {}", type_name(other)),
            )),
            None => Err(err(
                RuleErrorKind::InvalidShape,
                &self.path_of(key),
                format!("missing operand '{key}'"),
            )),
        }
    }

    fn bounds(&self) -> Result<(f64, f64), RuleParseError> {
        let min = self.required_number("min")?;
        let max = self.required_number("max")?;
        if min > max {
            return Err(err(
                RuleErrorKind::InvalidBounds,
                self.path,
                format!("min ({min}) must not exceed max ({max})"),
            ));
        }
        Ok((min, max))
    }
}

fn parse_compare(f: &Fields<'_>) -> Result<RuleExpression, RuleParseError> {
    f.allow_only(&["op", "left", "slope_left", "right", "eps"])?;
    let op_path = f.path_of("op");
    let op = match f.map.get("op") {
        Some(Value::String(s)) => CompareOp::parse(s.trim()).ok_or_else(|| {
            err(
                RuleErrorKind::InvalidOperator,
                &op_path,
                format!("unsupported operator '{s}' (expected >, >=, <, <=)"),
            )
        })?,
        _ => {
            return Err(err(
                RuleErrorKind::InvalidOperator,
                &op_path,
                "operator must be one of >, >=, <, <=",
            ));
        }
    };
    let left = match (f.map.contains_key("left"), f.map.contains_key("slope_left")) {
        (true, false) => CompareLeft::Value(f.operand("left")?),
        (false, true) => CompareLeft::Slope(f.required_string("slope_left")?),
        (true, true) => {
            return Err(err(
                RuleErrorKind::InvalidShape,
                f.path,
                "left and slope_left are mutually exclusive",
            ));
        }
        (false, false) => {
            return Err(err(
                RuleErrorKind::InvalidShape,
                f.path,
                "compare needs left or slope_left",
            ));
        }
    };
    let right = f.operand("right")?;
    let eps = non_negative(f, "eps")?;
    Ok(RuleExpression::Compare {
        left,
        op,
        right,
        eps,
    })
}

fn parse_field_order(f: &Fields<'_>) -> Result<RuleExpression, RuleParseError> {
    let (kind, key) = match (f.map.contains_key("lt_fields"), f.map.contains_key("gt_fields")) {
        (true, false) => (FieldOrderKind::LtFields, "lt_fields"),
        (false, true) => (FieldOrderKind::GtFields, "gt_fields"),
        _ => {
            return Err(err(
                RuleErrorKind::InvalidShape,
                f.path,
                "lt_fields and gt_fields are mutually exclusive",
            ));
        }
    };
    f.allow_only(&[key])?;
    let list_path = f.path_of(key);
    let items = match f.map.get(key) {
        Some(Value::Array(items)) => items,
        _ => {
            return Err(err(
                RuleErrorKind::InvalidType,
                &list_path,
                format!("{key} must be a list of field names"),
            ));
        }
    };
    if items.len() < 2 {
        return Err(err(
            RuleErrorKind::InvalidShape,
            &list_path,
            format!("{key} needs at least two fields"),
        ));
    }
    let fields = items
        .iter()
        .enumerate()
        .map(|(i, v)| match v {
            Value::String(s) if !s.trim().is_empty() => Ok(s.clone()),
            other => Err(err(
                RuleErrorKind::InvalidType,
                &index_path(&list_path, i),
                format!("expected a field name, found {}", type_name(other)),
            )),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RuleExpression::FieldOrder { kind, fields })
}

fn parse_trend(f: &Fields<'_>) -> Result<RuleExpression, RuleParseError> {
    let (kind, key) = match (f.map.contains_key("increasing"), f.map.contains_key("decreasing")) {
        (true, false) => (TrendKind::Increasing, "increasing"),
        (false, true) => (TrendKind::Decreasing, "decreasing"),
        _ => {
            return Err(err(
                RuleErrorKind::InvalidShape,
                f.path,
                "increasing and decreasing are mutually exclusive",
            ));
        }
    };
    f.allow_only(&[key, "n", "eps"])?;
    let field = f.required_string(key)?;
    let n = f.count("n")?.unwrap_or(2);
    if n < 1 {
        return Err(err(
            RuleErrorKind::InvalidBounds,
            &f.path_of("n"),
            "n must be at least 1",
        ));
    }
    let eps = non_negative(f, "eps")?;
    Ok(RuleExpression::Trend {
        kind,
        field,
        n,
        eps,
    })
}

fn parse_range(f: &Fields<'_>) -> Result<RuleExpression, RuleParseError> {
    f.allow_only(&["min", "max", "use_atr_tf", "adapt_with_vol_bucket"])?;
    let (min, max) = f.bounds()?;
    let tf_path = f.path_of("use_atr_tf");
    let use_atr_tf = match f.map.get("use_atr_tf") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.as_str()
                    .and_then(|s| s.parse::<Timeframe>().ok())
                    .ok_or_else(|| {
                        err(
                            RuleErrorKind::InvalidType,
                            &index_path(&tf_path, i),
                            format!("expected a timeframe, found {v}"),
                        )
                    })
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => {
            return Err(err(
                RuleErrorKind::InvalidType,
                &tf_path,
                format!("use_atr_tf must be a list, found {}", type_name(other)),
            ));
        }
    };
    Ok(RuleExpression::Range {
        min,
        max,
        use_atr_tf,
        adapt_with_vol_bucket: f.flag("adapt_with_vol_bucket")?,
    })
}

fn parse_hysteresis(f: &Fields<'_>) -> Result<RuleExpression, RuleParseError> {
    f.allow_only(&[
        "field",
        "level",
        "min_gap",
        "cool_down_bars",
        "require_prev_below",
        "require_prev_above",
    ])?;
    let require_prev_below = f.flag("require_prev_below")?;
    let require_prev_above = f.flag("require_prev_above")?;
    if require_prev_below && require_prev_above {
        return Err(err(
            RuleErrorKind::InvalidShape,
            f.path,
            "require_prev_below and require_prev_above are mutually exclusive",
        ));
    }
    Ok(RuleExpression::Hysteresis {
        field: f.required_string("field")?,
        level: f.number("level")?,
        min_gap: non_negative(f, "min_gap")?,
        cool_down_bars: f.count("cool_down_bars")?.unwrap_or(0),
        require_prev_below,
        require_prev_above,
    })
}

fn parse_derivative(f: &Fields<'_>) -> Result<RuleExpression, RuleParseError> {
    f.allow_only(&["field", "derivative_gt", "derivative_lt", "persist_n"])?;
    let gt = f.number("derivative_gt")?;
    let lt = f.number("derivative_lt")?;
    if let (Some(g), Some(l)) = (gt, lt) {
        if g >= l {
            return Err(err(
                RuleErrorKind::InvalidBounds,
                f.path,
                format!("derivative_gt ({g}) must be below derivative_lt ({l})"),
            ));
        }
    }
    let persist_n = f.count("persist_n")?.unwrap_or(1);
    if persist_n < 1 {
        return Err(err(
            RuleErrorKind::InvalidBounds,
            &f.path_of("persist_n"),
            "persist_n must be at least 1",
        ));
    }
    Ok(RuleExpression::Derivative {
        field: f.required_string("field")?,
        gt,
        lt,
        persist_n,
    })
}

fn parse_bounds(f: &Fields<'_>) -> Result<RuleExpression, RuleParseError> {
    f.allow_only(&["field", "min", "max"])?;
    let (min, max) = f.bounds()?;
    Ok(RuleExpression::Bounds {
        field: f.required_string("field")?,
        min,
        max,
    })
}

fn non_negative(f: &Fields<'_>, key: &str) -> Result<f64, RuleParseError> {
    let v = f.number(key)?.unwrap_or(0.0);
    if v < 0.0 {
        return Err(err(
            RuleErrorKind::InvalidBounds,
            &f.path_of(key),
            format!("{key} must be non-negative"),
        ));
    }
    Ok(v)
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
