// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::connector::SessionConfig;
use crate::storage::Profile;

const APP_DIR: &str = "bluechat";

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for the database and profile.
    #[serde(skip)]
    pub data_dir: PathBuf,

    /// Bluetooth settings.
    #[serde(default)]
    pub bluetooth: BluetoothConfig,

    /// Profile used until the user sets one.
    #[serde(default)]
    pub profile: ProfileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Device name advertised over Bluetooth.
    pub device_name: String,

    /// RFCOMM channel used for chat links.
    pub rfcomm_channel: u8,

    /// Seconds to wait for a peer to answer a connect request.
    pub connect_timeout_secs: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device_name: "BlueChat Desktop".to_string(),
            rfcomm_channel: 3,
            connect_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub name: String,

    /// Avatar color as 0xRRGGBB.
    pub color: u32,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            name: "Desktop".to_string(),
            color: 0x3f51b5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bluetooth: BluetoothConfig::default(),
            profile: ProfileConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("config.toml")
}

impl Config {
    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let config_path = config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::parse(&content)?
        } else {
            let config = Self::default();
            let content = toml::to_string_pretty(&config)?;
            std::fs::write(&config_path, content)?;
            config
        };

        // Set data directory
        config.data_dir = default_data_dir();
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(config)
    }

    /// Parse a TOML document; missing sections fall back to defaults.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.data_dir = default_data_dir();
        Ok(config)
    }

    /// Session settings for the connector.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_secs(self.bluetooth.connect_timeout_secs),
            ..SessionConfig::default()
        }
    }

    /// Profile to seed the profile store with.
    pub fn default_profile(&self) -> Profile {
        Profile {
            name: self.profile.name.clone(),
            color: self.profile.color,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = Config::parse("[bluetooth]\nrfcomm_channel = 5\n").unwrap();
        assert_eq!(config.bluetooth.rfcomm_channel, 5);
        assert_eq!(config.bluetooth.connect_timeout_secs, 30);
        assert_eq!(config.profile.name, "Desktop");
        assert_eq!(config.session().connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_roundtrip_toml() {
        let mut config = Config::default();
        config.profile.name = "Workstation".into();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::parse(&text).unwrap();
        assert_eq!(parsed.profile.name, "Workstation");
        assert_eq!(parsed.default_profile().color, 0x3f51b5);
    }
}
