//! Configuration for the protocol engine.
//!
//! This module handles loading and saving tunables from disk: handshake and
//! write timeouts, and the attribute read retry policy used for cold-start
//! personalization reads.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure for the engine.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default = "default_handshake_timeout_ms")]
   pub handshake_timeout_ms: u64,

   #[serde(default = "default_write_timeout_ms")]
   pub write_timeout_ms: u64,

   #[serde(default = "default_connect_timeout_ms")]
   pub connect_timeout_ms: u64,

   #[serde(default = "default_att_read_attempts")]
   pub att_read_attempts: u32,

   #[serde(default = "default_att_read_gap_ms")]
   pub att_read_gap_ms: u64,

   #[serde(default = "default_att_response_timeout_ms")]
   pub att_response_timeout_ms: u64,
}

const fn default_handshake_timeout_ms() -> u64 {
   5_000
}

const fn default_write_timeout_ms() -> u64 {
   25_000
}

const fn default_connect_timeout_ms() -> u64 {
   10_000
}

const fn default_att_read_attempts() -> u32 {
   3
}

const fn default_att_read_gap_ms() -> u64 {
   200
}

const fn default_att_response_timeout_ms() -> u64 {
   2_000
}

impl Default for Config {
   fn default() -> Self {
      Self {
         handshake_timeout_ms: default_handshake_timeout_ms(),
         write_timeout_ms: default_write_timeout_ms(),
         connect_timeout_ms: default_connect_timeout_ms(),
         att_read_attempts: default_att_read_attempts(),
         att_read_gap_ms: default_att_read_gap_ms(),
         att_response_timeout_ms: default_att_response_timeout_ms(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates the default if not present.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("PODLINK_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(Error::ConfigDirNotFound);
      };

      Ok(config_dir.join("podlink").join("config.toml"))
   }

   pub fn handshake_timeout(&self) -> Duration {
      Duration::from_millis(self.handshake_timeout_ms)
   }

   pub fn write_timeout(&self) -> Duration {
      Duration::from_millis(self.write_timeout_ms)
   }

   pub fn connect_timeout(&self) -> Duration {
      Duration::from_millis(self.connect_timeout_ms)
   }

   pub fn att_read_gap(&self) -> Duration {
      Duration::from_millis(self.att_read_gap_ms)
   }

   pub fn att_response_timeout(&self) -> Duration {
      Duration::from_millis(self.att_response_timeout_ms)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn defaults_match_observed_device_behavior() {
      let config = Config::default();
      assert_eq!(config.att_read_attempts, 3);
      assert_eq!(config.att_read_gap_ms, 200);
      assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
   }

   #[test]
   fn round_trips_through_toml() {
      let config = Config {
         att_read_attempts: 5,
         ..Config::default()
      };
      let text = toml::to_string_pretty(&config).unwrap();
      let back: Config = toml::from_str(&text).unwrap();
      assert_eq!(back.att_read_attempts, 5);
      assert_eq!(back.write_timeout_ms, config.write_timeout_ms);
   }

   #[test]
   fn missing_fields_fall_back_to_defaults() {
      let back: Config = toml::from_str("handshake_timeout_ms = 1000").unwrap();
      assert_eq!(back.handshake_timeout_ms, 1_000);
      assert_eq!(back.att_read_attempts, default_att_read_attempts());
   }

   #[test]
   fn loads_from_custom_home() {
      let dir = tempfile::tempdir().unwrap();
      // Serialized env access, std::env is process-global.
      unsafe { env::set_var("PODLINK_HOME", dir.path()) };
      let config = Config::load().unwrap();
      assert!(dir.path().join("podlink/config.toml").exists());
      assert_eq!(config.att_read_attempts, 3);
      unsafe { env::remove_var("PODLINK_HOME") };
   }
}
