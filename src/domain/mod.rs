//! Core domain types and logic.

pub mod bar;
pub mod cascade;
pub mod condition;
pub mod conditions;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod processor;
pub mod registry;
pub mod result;
pub mod rule;
pub mod rule_eval;
pub mod rule_parser;
pub mod rulebook;
pub mod selector;
pub mod settings;
pub mod timeframe;
pub mod universe;
pub mod validator;
