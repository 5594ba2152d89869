//! Collaborator traits consumed by the cascade.

pub mod audit_port;
pub mod bar_port;
pub mod config_port;
pub mod indicator_port;
pub mod kill_switch_port;
pub mod rule_source_port;
