//! Configuration management for the light driver.
//!
//! This module handles loading and saving configuration from disk: the
//! configured lights and the discovery/open timing.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{LightError, Result};

/// Main configuration structure for the driver.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
   #[serde(default)]
   pub lights: Vec<LightEntry>,

   /// Single-light variant; merged in front of `lights`.
   #[serde(default, alias = "macAddress", skip_serializing_if = "Option::is_none")]
   pub mac_address: Option<String>,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub name: Option<String>,

   /// BlueZ adapter to use; the default adapter when unset.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub adapter: Option<String>,

   #[serde(default = "default_discovery_timeout")]
   pub discovery_timeout_ms: u64,

   #[serde(default = "default_open_timeout")]
   pub open_timeout_ms: u64,

   #[serde(default = "default_open_on_start")]
   pub open_on_start: bool,
}

/// One configured light.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LightEntry {
   #[serde(alias = "macAddress")]
   pub mac_address: String,
   #[serde(default)]
   pub name: String,
}

const fn default_discovery_timeout() -> u64 {
   5000
}

const fn default_open_timeout() -> u64 {
   5000
}

const fn default_open_on_start() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         lights: vec![],
         mac_address: None,
         name: None,
         adapter: None,
         discovery_timeout_ms: default_discovery_timeout(),
         open_timeout_ms: default_open_timeout(),
         open_on_start: default_open_on_start(),
      }
   }
}

/// Deadlines applied to one open attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
   pub discovery_window: Duration,
   pub open_timeout: Duration,
}

impl Default for Timing {
   fn default() -> Self {
      Config::default().timing()
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         Self::load_from(&config_path)
      } else {
         let config = Self::default();
         config.save_to(&config_path)?;
         Ok(config)
      }
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      let contents = fs::read_to_string(path)?;
      Ok(toml::from_str(&contents)?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("HAPPYLIGHT_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(LightError::ConfigDirNotFound);
      };

      Ok(config_dir.join("happylight").join("config.toml"))
   }

   /// All configured lights, the single-light entry first.
   pub fn entries(&self) -> Vec<LightEntry> {
      let single = self.mac_address.as_ref().map(|mac| LightEntry {
         mac_address: mac.clone(),
         name: self.name.clone().unwrap_or_default(),
      });
      single.into_iter().chain(self.lights.iter().cloned()).collect()
   }

   pub fn timing(&self) -> Timing {
      Timing {
         discovery_window: Duration::from_millis(self.discovery_timeout_ms),
         open_timeout: Duration::from_millis(self.open_timeout_ms),
      }
   }
}
