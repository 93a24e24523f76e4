//! Event handling system for device status updates.
//!
//! This module provides the event infrastructure for notifying about
//! device state changes such as battery updates, connection status,
//! and feature changes.

use std::sync::Arc;

use crate::aacp::{
   protocol::{
      BatteryInfo, ControlCommand, ConversationAwareness, DeviceInformation, EarDetectionStatus,
      HeadOrientation, MediaEq, NoiseControlMode, StemPress,
   },
   session::AacpSession,
};

/// Events that can be emitted by a device session.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
   DeviceConnected,
   DeviceDisconnected,
   DeviceError,
   BatteryUpdated(BatteryInfo),
   NoiseControlChanged(NoiseControlMode),
   EarDetectionChanged(EarDetectionStatus),
   ConversationAwarenessChanged(ConversationAwareness),
   HeadOrientationChanged(HeadOrientation),
   ControlCommandUpdated(ControlCommand),
   StemPressed(StemPress),
   DeviceInformationUpdated(DeviceInformation),
   MediaEqUpdated(MediaEq),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, session: &AacpSession, event: DeviceEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
