//! Concrete adapter implementations for ports.

pub mod audit_sink;
pub mod csv_adapter;
pub mod file_config_adapter;
pub mod kill_switch;
pub mod rule_file_adapter;
pub mod snapshot_indicator;
