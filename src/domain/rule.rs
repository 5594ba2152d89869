//! Rule expression AST.
//!
//! - `Name`: reference to a named rule or a registered condition, with an
//!   optional literal threshold
//! - `AllOf` / `AnyOf`: boolean combinators over child expressions
//! - `Compare`, `FieldOrder`, `Trend`, `Range`, `Hysteresis`, `Derivative`,
//!   `Bounds`: parametric checks over context facts
//!
//! Parametric nodes are leaves: once a rule book is compiled each of them is
//! registered as a named condition in the registry.

use crate::domain::timeframe::Timeframe;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold {
    Number(f64),
    Bool(bool),
}

impl Threshold {
    /// Numeric value to inject as `{name}_threshold`; booleans are never injected.
    pub fn injectable(self) -> Option<f64> {
        match self {
            Threshold::Number(v) => Some(v),
            Threshold::Bool(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    pub fn parse(s: &str) -> Option<CompareOp> {
        match s {
            ">" => Some(CompareOp::Gt),
            ">=" => Some(CompareOp::Ge),
            "<" => Some(CompareOp::Lt),
            "<=" => Some(CompareOp::Le),
            _ => None,
        }
    }

    /// Apply with tolerance `eps`: strict comparisons need to clear `eps`,
    /// inclusive ones may miss by at most `eps`.
    pub fn apply(self, left: f64, right: f64, eps: f64) -> bool {
        match self {
            CompareOp::Gt => left > right + eps,
            CompareOp::Ge => left >= right - eps,
            CompareOp::Lt => left < right - eps,
            CompareOp::Le => left <= right + eps,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(String),
    Constant(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompareLeft {
    Value(Operand),
    /// Last-bar change of a series field.
    Slope(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOrderKind {
    /// `fields[0] < fields[1] < ...`
    LtFields,
    /// `fields[0] > fields[1] > ...`
    GtFields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendKind {
    Increasing,
    Decreasing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleExpression {
    Name {
        name: String,
        threshold: Option<Threshold>,
    },
    AllOf(Vec<RuleExpression>),
    AnyOf(Vec<RuleExpression>),
    Compare {
        left: CompareLeft,
        op: CompareOp,
        right: Operand,
        eps: f64,
    },
    FieldOrder {
        kind: FieldOrderKind,
        fields: Vec<String>,
    },
    Trend {
        kind: TrendKind,
        field: String,
        n: usize,
        eps: f64,
    },
    Range {
        min: f64,
        max: f64,
        use_atr_tf: Vec<Timeframe>,
        adapt_with_vol_bucket: bool,
    },
    Hysteresis {
        field: String,
        level: Option<f64>,
        min_gap: f64,
        cool_down_bars: usize,
        require_prev_below: bool,
        require_prev_above: bool,
    },
    Derivative {
        field: String,
        gt: Option<f64>,
        lt: Option<f64>,
        persist_n: usize,
    },
    Bounds {
        field: String,
        min: f64,
        max: f64,
    },
}

impl RuleExpression {
    pub fn name(name: &str) -> RuleExpression {
        RuleExpression::Name {
            name: name.to_string(),
            threshold: None,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, RuleExpression::AllOf(_) | RuleExpression::AnyOf(_))
    }

    /// Parametric leaves evaluate facts directly.
    pub fn is_parametric(&self) -> bool {
        !self.is_composite() && !matches!(self, RuleExpression::Name { .. })
    }

    /// Short tag used in audit labels and error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            RuleExpression::Name { .. } => "name",
            RuleExpression::AllOf(_) => "all_of",
            RuleExpression::AnyOf(_) => "any_of",
            RuleExpression::Compare { .. } => "compare",
            RuleExpression::FieldOrder { .. } => "field_order",
            RuleExpression::Trend { .. } => "trend",
            RuleExpression::Range { .. } => "range",
            RuleExpression::Hysteresis { .. } => "hysteresis",
            RuleExpression::Derivative { .. } => "derivative",
            RuleExpression::Bounds { .. } => "bounds",
        }
    }

    /// Every name referenced through `Name` leaves, in traversal order.
    pub fn references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            RuleExpression::Name { name, .. } => out.push(name.as_str()),
            RuleExpression::AllOf(children) | RuleExpression::AnyOf(children) => {
                for child in children {
                    child.collect_references(out);
                }
            }
            _ => {}
        }
    }
}
