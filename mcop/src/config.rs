use crate::audio::AudioParams;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const NO_THREADS_ENV: &str = "ARTS_NO_THREADS";
pub const DEVICE_ENV: &str = "ARTS_DEVICE";

pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let s = v.trim().to_ascii_lowercase();
            s == "1" || s == "true" || s == "yes" || s == "on"
        })
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadMode {
    #[default]
    Native,
    None,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct McopConfig {
    pub request_timeout_ms: u64,
    pub threads: ThreadMode,
    pub audio: AudioParams,
}

impl Default for McopConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            threads: ThreadMode::Native,
            audio: AudioParams::default(),
        }
    }
}

impl McopConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| Error::Config(err.to_string()))
    }

    /// Reads the file, then applies the environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if env_flag(NO_THREADS_ENV) {
            self.threads = ThreadMode::None;
        }
        if let Ok(device) = std::env::var(DEVICE_ENV)
            && !device.trim().is_empty()
        {
            self.audio.device = device.trim().to_string();
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
