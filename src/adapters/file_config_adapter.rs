//! INI engine settings adapter.

use crate::domain::error::CascadeError;
use crate::ports::config_port::ConfigPort;
use configparser::ini::Ini;
use std::path::Path;

#[derive(Debug)]
pub struct FileConfigAdapter {
    config: Ini,
}

impl FileConfigAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        let mut config = Ini::new();
        config.load(path).map_err(|reason| CascadeError::ConfigParse {
            file: path.display().to_string(),
            reason,
        })?;
        Ok(Self { config })
    }

    pub fn from_string(content: &str) -> Result<Self, CascadeError> {
        let mut config = Ini::new();
        config
            .read(content.to_string())
            .map_err(|reason| CascadeError::ConfigParse {
                file: "<inline>".into(),
                reason,
            })?;
        Ok(Self { config })
    }
}

impl ConfigPort for FileConfigAdapter {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.config.get(section, key).filter(|v| !v.trim().is_empty())
    }

    fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        self.config
            .getint(section, key)
            .ok()
            .flatten()
            .unwrap_or(default)
    }
}
