//! Domain error types.

/// What went wrong while parsing a rule node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleErrorKind {
    InvalidShape,
    InvalidType,
    InvalidOperator,
    InvalidBounds,
    EmptyGroup,
}

/// A rule-configuration parse error carrying the JSON path of the offending node.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("parse error at {path}: {message}")]
pub struct RuleParseError {
    pub kind: RuleErrorKind,
    pub message: String,
    pub path: String,
}

impl RuleParseError {
    pub fn new(kind: RuleErrorKind, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: path.into(),
        }
    }
}

/// Top-level error type for tfcascade.
#[derive(Debug, thiserror::Error)]
pub enum CascadeError {
    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    RuleParse(#[from] RuleParseError),

    #[error("invalid rule configuration: {reason}")]
    RuleInvalid { reason: String },

    #[error("unknown condition '{name}' referenced at {path}")]
    UnknownCondition { name: String, path: String },

    #[error("circular reference through rule '{rule}' at {path}")]
    CircularReference { rule: String, path: String },

    #[error("data source error: {reason}")]
    DataSource { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<&CascadeError> for std::process::ExitCode {
    fn from(err: &CascadeError) -> Self {
        let code: u8 = match err {
            CascadeError::Io(_) => 1,
            CascadeError::ConfigParse { .. }
            | CascadeError::ConfigMissing { .. }
            | CascadeError::ConfigInvalid { .. }
            | CascadeError::Json(_) => 2,
            CascadeError::DataSource { .. } => 3,
            CascadeError::RuleParse(_)
            | CascadeError::RuleInvalid { .. }
            | CascadeError::UnknownCondition { .. }
            | CascadeError::CircularReference { .. } => 4,
        };
        std::process::ExitCode::from(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_display_includes_path() {
        let err = RuleParseError::new(
            RuleErrorKind::InvalidOperator,
            "rules.rsi_ok.op",
            "unsupported operator '=='",
        );
        assert_eq!(
            err.to_string(),
            "parse error at rules.rsi_ok.op: unsupported operator '=='"
        );
    }

    #[test]
    fn rule_parse_error_converts_transparently() {
        let err: CascadeError =
            RuleParseError::new(RuleErrorKind::EmptyGroup, "rules.a", "empty group").into();
        assert_eq!(err.to_string(), "parse error at rules.a: empty group");
    }

    #[test]
    fn circular_reference_message() {
        let err = CascadeError::CircularReference {
            rule: "ruleA".into(),
            path: "rules.ruleB.any_of[0]".into(),
        };
        assert!(err.to_string().contains("ruleA"));
    }
}
