use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TransferError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub device_model: String,
    pub os_version: String,
    pub location: Option<String>,
    pub countdown_tick_ms: u64,
    pub event_buffer: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            device_model: get_default_device_model(),
            os_version: std::env::consts::OS.to_string(),
            location: None,
            countdown_tick_ms: 1000,
            event_buffer: 16,
        }
    }
}

impl TransferSettings {
    pub fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.countdown_tick_ms == 0 {
            return Err(TransferError::Config(
                "countdown_tick_ms must be greater than zero".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(TransferError::Config(
                "event_buffer must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn get_default_device_model() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "Unknown Device".to_string())
}

pub fn load_settings(path: &Path) -> Result<TransferSettings> {
    if !path.exists() {
        return Ok(TransferSettings::default());
    }

    let content = std::fs::read_to_string(path)?;
    let settings: TransferSettings = serde_json::from_str(&content)?;
    settings.validate()?;
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &TransferSettings) -> Result<()> {
    let content = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, content)?;
    Ok(())
}
