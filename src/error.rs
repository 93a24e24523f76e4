//! Error types for the accessory protocol engine.
//!
//! Transport-fatal conditions (socket failure, handshake timeout) surface
//! through this type. A single malformed frame never does: the read loops
//! log and drop those.

use thiserror::Error;

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Device not connected")]
   DeviceNotConnected,

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Handshake failed: {0}")]
   HandshakeFailed(&'static str),

   #[error("Attribute read returned no usable data after {attempts} attempts")]
   AttributeReadExhausted { attempts: u32 },

   #[error("Personalization settings not synced yet, write suppressed")]
   SettingsNotSynced,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
