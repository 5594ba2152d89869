//! Rule configuration source port.

use crate::domain::error::CascadeError;
use serde_json::Value;

pub trait RuleConfigSource: Send + Sync {
    /// The raw rule configuration tree, not yet validated.
    fn load(&self) -> Result<Value, CascadeError>;

    /// Human-readable origin, used in logs.
    fn describe(&self) -> String;
}
