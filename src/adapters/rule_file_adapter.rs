//! Rule configuration loaded from a JSON or TOML file.

use crate::domain::error::CascadeError;
use crate::ports::rule_source_port::RuleConfigSource;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleFormat {
    Json,
    Toml,
}

impl RuleFormat {
    /// `.toml` is TOML, anything else is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => RuleFormat::Toml,
            _ => RuleFormat::Json,
        }
    }
}

pub struct FileRuleSource {
    path: PathBuf,
    format: RuleFormat,
}

impl FileRuleSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = RuleFormat::from_path(&path);
        Self { path, format }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse rule configuration text into a JSON tree.
pub fn parse_rules(content: &str, format: RuleFormat, origin: &str) -> Result<Value, CascadeError> {
    let value: Value = match format {
        RuleFormat::Json => serde_json::from_str(content).map_err(|e| CascadeError::ConfigParse {
            file: origin.to_string(),
            reason: e.to_string(),
        })?,
        RuleFormat::Toml => toml::from_str(content).map_err(|e| CascadeError::ConfigParse {
            file: origin.to_string(),
            reason: e.to_string(),
        })?,
    };
    if !value.is_object() {
        return Err(CascadeError::ConfigParse {
            file: origin.to_string(),
            reason: "rule configuration must be an object".into(),
        });
    }
    Ok(value)
}

impl RuleConfigSource for FileRuleSource {
    fn load(&self) -> Result<Value, CascadeError> {
        let content = fs::read_to_string(&self.path).map_err(|e| CascadeError::ConfigParse {
            file: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        parse_rules(&content, self.format, &self.path.display().to_string())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
