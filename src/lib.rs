//! Protocol engine for AirPods-class Bluetooth earbuds.
//!
//! Devices expose two L2CAP channels: the accessory control channel carrying
//! framed status notifications and control commands, and a raw ATT channel
//! behind which the audio personalization blobs live. This crate implements
//! the wire codecs for both, typed state tracking per connected device, and
//! the session plumbing to keep them updated.
//!
//! The entry points are [`AacpSession`] for the control channel and
//! [`AttSession`] for personalization.

pub mod aacp;
pub mod bluetooth;
pub mod config;
pub mod error;
pub mod event;
pub mod gatt;

pub use aacp::{
   protocol::{
      BatteryInfo, ControlCommand, ControlCommandId, ConversationAwareness, DeviceInformation,
      EarDetectionStatus, HeadOrientation, MediaEq, NoiseControlMode, StemPress,
   },
   registry::ListenerToken,
   session::{AacpSession, SessionState, WeakAacpSession},
};
pub use config::Config;
pub use error::{Error, Result};
pub use event::{DeviceEvent, EventBus, EventSender};
pub use gatt::{
   att::AttHandle,
   personalization::{HearingAidSettings, TransparencySettings},
   session::AttSession,
};
