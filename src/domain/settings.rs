//! Engine settings read through [`ConfigPort`].

use crate::domain::error::CascadeError;
use crate::domain::timeframe::Timeframe;
use crate::ports::config_port::ConfigPort;
use std::path::PathBuf;

pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub data_dir: Option<PathBuf>,
    pub workers: usize,
    pub log_level: Option<String>,
    pub start_from: Option<Timeframe>,
    /// Symbol and timeframe pairs switched off at startup.
    pub kill_switch_off: Vec<(String, Timeframe)>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            workers: DEFAULT_WORKERS,
            log_level: None,
            start_from: None,
            kill_switch_off: Vec::new(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, CascadeError> {
        let workers = config.get_int("engine", "workers", DEFAULT_WORKERS as i64);
        if !(1..=256).contains(&workers) {
            return Err(CascadeError::ConfigInvalid {
                section: "engine".into(),
                key: "workers".into(),
                reason: format!("must be between 1 and 256, got {workers}"),
            });
        }

        let start_from = config
            .get_string("engine", "start_from_timeframe")
            .map(|raw| {
                raw.parse::<Timeframe>()
                    .map_err(|e| CascadeError::ConfigInvalid {
                        section: "engine".into(),
                        key: "start_from_timeframe".into(),
                        reason: e.to_string(),
                    })
            })
            .transpose()?;

        let kill_switch_off = config
            .get_list("kill_switch", "off")
            .iter()
            .map(|entry| parse_switch(entry))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            data_dir: config.get_string("engine", "data_dir").map(PathBuf::from),
            workers: workers as usize,
            log_level: config.get_string("engine", "log_level"),
            start_from,
            kill_switch_off,
        })
    }
}

/// `SYMBOL:tf`
fn parse_switch(entry: &str) -> Result<(String, Timeframe), CascadeError> {
    let invalid = |reason: String| CascadeError::ConfigInvalid {
        section: "kill_switch".into(),
        key: "off".into(),
        reason,
    };
    let (symbol, tf) = entry
        .split_once(':')
        .ok_or_else(|| invalid(format!("expected SYMBOL:tf, got '{entry}'")))?;
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(invalid(format!("missing symbol in '{entry}'")));
    }
    let tf = tf.parse::<Timeframe>().map_err(|e| invalid(e.to_string()))?;
    Ok((symbol, tf))
}
