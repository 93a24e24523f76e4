//! Accessory control protocol (AACP) definitions.
//!
//! Protocol constants, the control-command registry, typed device states and
//! the outbound packet builders. Everything here is pure: bytes in, bytes
//! out, no I/O.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use smol_str::SmolStr;

use crate::bluetooth::l2cap::Packet;

/// Fixed 4-byte prefix carried by every AACP data packet.
pub const PREFIX: &[u8] = &[0x04, 0x00, 0x04, 0x00];

/// Opcodes observed on the AACP channel, byte 4 of a prefixed packet.
pub mod opcode {
   pub const BATTERY_INFO: u8 = 0x04;
   pub const EAR_DETECTION: u8 = 0x06;
   pub const CONTROL_COMMAND: u8 = 0x09;
   pub const REQUEST_NOTIFICATIONS: u8 = 0x0F;
   pub const HEAD_TRACKING: u8 = 0x17;
   pub const STEM_PRESS: u8 = 0x19;
   pub const INFORMATION: u8 = 0x1D;
   pub const RENAME: u8 = 0x1E;
   pub const CONVERSATION_AWARENESS: u8 = 0x4B;
   pub const SET_FEATURE_FLAGS: u8 = 0x4D;
   pub const EQ_DATA: u8 = 0x53;
}

/// Version/capability announcement sent first on a fresh connection.
pub const PKT_HANDSHAKE: &[u8] = &[
   0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
pub const PKT_SET_FEATURES: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x4D, 0x00, 0xD7, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
/// Subscribes to unsolicited notifications. Byte 8 drops to 0xFD when ear
/// detection is disabled on-device; safe to resend at any time.
pub const PKT_REQUEST_NOTIFY: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x0F, 0x00, 0xFF, 0xFF, 0xFF, 0xFF,
];

// Parsing headers
pub const HDR_BATTERY: &[u8] = b"\x04\x00\x04\x00\x04\x00";
pub const HDR_CONTROL_CMD: &[u8] = b"\x04\x00\x04\x00\x09\x00";
pub const HDR_NOISE_CTL: &[u8] = b"\x04\x00\x04\x00\x09\x00\x0D";
pub const HDR_EAR_DETECTION: &[u8] = b"\x04\x00\x04\x00\x06\x00";
pub const HDR_CONVERSATION: &[u8] = b"\x04\x00\x04\x00\x4B\x00\x02\x00";
pub const HDR_HEAD_TRACKING: &[u8] = b"\x04\x00\x04\x00\x17\x00\x00\x00\x10\x00";
pub const HDR_INFORMATION: &[u8] = b"\x04\x00\x04\x00\x1D";
pub const HDR_STEM_PRESS: &[u8] = b"\x04\x00\x04\x00\x19\x00";
pub const HDR_EQ_DATA: &[u8] = b"\x04\x00\x04\x00\x53\x00";

// ACK packet headers
pub const HDR_ACK_HANDSHAKE: &[u8] = b"\x01\x00\x04\x00";
pub const HDR_ACK_FEATURES: &[u8] = b"\x04\x00\x04\x00\x2B";

// Exact frame lengths where the wire format is fixed
pub const BATTERY_FRAME_LEN: usize = 22;
pub const NOISE_CTL_FRAME_LEN: usize = 11;
pub const EAR_DETECTION_FRAME_LEN: usize = 8;
pub const CONVERSATION_FRAME_LEN: usize = 10;
pub const HEAD_TRACKING_MIN_LEN: usize = 61;
pub const EQ_DATA_FRAME_LEN: usize = 140;

/// Identifier of a settable/observable device feature carried inside a
/// control command. The set is fixed at build time; identity is the byte.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   PartialOrd,
   Ord,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::EnumIter,
)]
#[repr(u8)]
#[strum(serialize_all = "snake_case")]
pub enum ControlCommandId {
   MicMode = 0x01,
   ButtonSendMode = 0x05,
   OwnsConnection = 0x06,
   EarDetectionConfig = 0x0A,
   ListeningMode = 0x0D,
   VoiceTrigger = 0x12,
   SingleClickMode = 0x14,
   DoubleClickMode = 0x15,
   ClickHoldMode = 0x16,
   DoubleClickInterval = 0x17,
   ClickHoldInterval = 0x18,
   ListeningModeConfigs = 0x1A,
   OneBudAncMode = 0x1B,
   CrownRotationDirection = 0x1C,
   AutoAnswerMode = 0x1E,
   ChimeVolume = 0x1F,
   AutomaticConnectionConfig = 0x20,
   VolumeSwipeInterval = 0x23,
   CallManagementConfig = 0x24,
   VolumeSwipeMode = 0x25,
   AdaptiveVolumeConfig = 0x26,
   SoftwareMuteConfig = 0x27,
   ConversationDetectConfig = 0x28,
   Ssl = 0x29,
   HearingAid = 0x2C,
   AutoAncStrength = 0x2E,
   HpsGainSwipe = 0x2F,
   HrmState = 0x30,
   InCaseToneConfig = 0x31,
   SiriMultitoneConfig = 0x32,
   HearingAssistConfig = 0x33,
   AllowOffOption = 0x34,
   SleepDetectionConfig = 0x35,
   AllowAutoConnect = 0x36,
   PpeToggleConfig = 0x37,
   PpeCapLevelConfig = 0x38,
   StemConfig = 0x39,
}

impl ControlCommandId {
   pub const fn id(self) -> u8 {
      self as u8
   }
}

/// A control command as it travels on the wire: identifier plus raw value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
   pub id: ControlCommandId,
   pub value: Packet,
}

/// Builds a control-command packet. Values up to the 4-byte command
/// container are zero-padded into it; longer values are appended as-is so
/// that commands unknown to this registry still encode best-effort.
pub fn build_control_command(id: ControlCommandId, value: &[u8]) -> Packet {
   let mut packet = Packet::from_slice(HDR_CONTROL_CMD);
   packet.push(id.id());
   if value.len() <= 4 {
      packet.extend_from_slice(value);
      packet.extend(std::iter::repeat_n(0x00, 4 - value.len()));
   } else {
      packet.extend_from_slice(value);
   }
   packet
}

/// Single-byte convenience encoder.
pub fn build_control_command_u8(id: ControlCommandId, value: u8) -> Packet {
   build_control_command(id, &[value])
}

/// Boolean convenience encoder. The device encodes enabled as 0x01 and
/// disabled as 0x02, not 0x00.
pub fn build_control_command_bool(id: ControlCommandId, enabled: bool) -> Packet {
   build_control_command(id, &[if enabled { 0x01 } else { 0x02 }])
}

/// Rename packet: length-prefixed UTF-8 name. The length prefix is a single
/// byte, so over-long names are truncated at a character boundary.
pub fn build_rename(name: &str) -> Packet {
   let mut end = name.len().min(u8::MAX as usize);
   while !name.is_char_boundary(end) {
      end -= 1;
   }
   let bytes = &name.as_bytes()[..end];
   let mut packet = Packet::from_slice(PREFIX);
   packet.extend_from_slice(&[opcode::RENAME, 0x00, bytes.len() as u8, 0x00]);
   packet.extend_from_slice(bytes);
   packet
}

/// Noise control modes supported by the device.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum NoiseControlMode {
   #[strum(serialize = "off")]
   Off = 0x01,
   #[strum(serialize = "nc", serialize = "noise_cancellation")]
   NoiseCancellation = 0x02,
   #[strum(serialize = "trans", serialize = "transparency")]
   Transparency = 0x03,
   #[strum(serialize = "adapt", serialize = "adaptive")]
   Adaptive = 0x04,
}

impl NoiseControlMode {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Physical components reporting battery, as encoded in battery frames.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[repr(u8)]
pub enum BatteryComponent {
   Right = 0x02,
   Left = 0x04,
   Case = 0x08,
}

#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[repr(u8)]
pub enum BatteryChargeStatus {
   Charging = 0x01,
   NotCharging = 0x02,
   Disconnected = 0x04,
}

/// Battery state for a single component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryState {
   /// Charge level in percent, clamped to 0..=100.
   pub level: u8,
   pub status: BatteryChargeStatus,
}

impl BatteryState {
   pub const fn new() -> Self {
      Self {
         level: 0,
         status: BatteryChargeStatus::Disconnected,
      }
   }

   pub fn is_charging(&self) -> bool {
      self.status == BatteryChargeStatus::Charging
   }

   pub fn is_available(&self) -> bool {
      self.status != BatteryChargeStatus::Disconnected
   }
}

impl Default for BatteryState {
   fn default() -> Self {
      Self::new()
   }
}

/// Complete battery snapshot. A valid battery frame always carries all
/// three components, so this is rebuilt wholesale per frame and consumers
/// never observe a torn old-left/new-right combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryInfo {
   pub left: BatteryState,
   pub right: BatteryState,
   pub case: BatteryState,
}

impl BatteryInfo {
   pub const fn new() -> Self {
      Self {
         left: BatteryState::new(),
         right: BatteryState::new(),
         case: BatteryState::new(),
      }
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "left_level": u32::from(self.left.level),
          "right_level": u32::from(self.right.level),
          "case_level": u32::from(self.case.level),
          "left_charging": self.left.is_charging(),
          "right_charging": self.right.is_charging(),
          "case_charging": self.case.is_charging(),
          "left_available": self.left.is_available(),
          "right_available": self.right.is_available(),
          "case_available": self.case.is_available(),
      })
   }
}

impl Default for BatteryInfo {
   fn default() -> Self {
      Self::new()
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EarPlacement {
   InEar,
   OutOfEar,
}

/// In-ear status per bud. Primary/secondary rather than left/right: which
/// bud is primary is negotiated by the device and resolved elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarDetectionStatus {
   pub primary: EarPlacement,
   pub secondary: EarPlacement,
}

impl EarDetectionStatus {
   pub fn both_in_ear(&self) -> bool {
      self.primary == EarPlacement::InEar && self.secondary == EarPlacement::InEar
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "primary_in_ear": self.primary == EarPlacement::InEar,
          "secondary_in_ear": self.secondary == EarPlacement::InEar,
      })
   }
}

/// Conversation-awareness level pushed while the wearer talks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationAwareness {
   pub level: u8,
}

impl ConversationAwareness {
   /// Levels 1 and 2 are pushed while speech is detected and the device
   /// has lowered media volume.
   pub fn is_speaking(&self) -> bool {
      matches!(self.level, 1 | 2)
   }
}

/// Head orientation sample from a head-tracking frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadOrientation {
   pub horizontal: i16,
   pub vertical: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
#[repr(u8)]
pub enum StemPressKind {
   Single = 0x05,
   Double = 0x06,
   Triple = 0x07,
   Long = 0x08,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
#[repr(u8)]
pub enum StemPressBud {
   Left = 0x01,
   Right = 0x02,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StemPress {
   pub kind: StemPressKind,
   pub bud: StemPressBud,
}

/// Identity strings reported by the information frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInformation {
   pub name: SmolStr,
   pub model_number: SmolStr,
   pub manufacturer: SmolStr,
   pub serial_number: SmolStr,
   pub firmware_version: SmolStr,
   pub hardware_revision: SmolStr,
   pub left_serial_number: SmolStr,
   pub right_serial_number: SmolStr,
}

/// Media equalizer state carried by the 140-byte EQ frame. The wire format
/// repeats the same 8 bands in four blocks; only the first is meaningful.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaEq {
   pub on_phone: bool,
   pub on_media: bool,
   pub bands: [f32; 8],
}

/// Builds the outbound media-EQ packet, duplicating the bands into all four
/// blocks the way the vendor client does.
pub fn build_media_eq(eq: &MediaEq) -> Packet {
   let mut packet = Packet::from_slice(HDR_EQ_DATA);
   packet.extend_from_slice(&[
      0x84,
      0x00,
      0x02,
      0x02,
      if eq.on_phone { 0x01 } else { 0x02 },
      if eq.on_media { 0x01 } else { 0x02 },
   ]);
   for _ in 0..4 {
      for band in eq.bands {
         packet.extend_from_slice(&band.to_le_bytes());
      }
   }
   packet
}

impl fmt::Display for BatteryInfo {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(
         f,
         "L:{}% R:{}% C:{}%",
         self.left.level, self.right.level, self.case.level
      )
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn control_command_pads_to_container() {
      let packet = build_control_command_u8(ControlCommandId::ListeningMode, 0x02);
      assert_eq!(
         packet.as_slice(),
         &[0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0D, 0x02, 0x00, 0x00, 0x00]
      );
   }

   #[test]
   fn oversized_control_value_passes_through() {
      let value = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
      let packet = build_control_command(ControlCommandId::StemConfig, &value);
      assert_eq!(&packet[7..], &value);
      assert_eq!(packet.len(), 7 + value.len());
   }

   #[test]
   fn bool_encoding_uses_one_and_two() {
      let on = build_control_command_bool(ControlCommandId::ConversationDetectConfig, true);
      let off = build_control_command_bool(ControlCommandId::ConversationDetectConfig, false);
      assert_eq!(on[7], 0x01);
      assert_eq!(off[7], 0x02);
   }

   #[test]
   fn rename_packet_layout() {
      let packet = build_rename("Buds");
      assert_eq!(&packet[..4], PREFIX);
      assert_eq!(packet[4], opcode::RENAME);
      assert_eq!(packet[6], 4);
      assert_eq!(&packet[8..], b"Buds");
   }

   #[test]
   fn over_long_rename_truncates_at_a_character_boundary() {
      let long = "a".repeat(300);
      let packet = build_rename(&long);
      assert_eq!(packet[6], 255);
      assert_eq!(packet.len(), 8 + 255);

      // 128 two-byte chars: byte 255 falls mid-character
      let accented = "é".repeat(128);
      let packet = build_rename(&accented);
      assert_eq!(packet[6], 254);
      assert!(std::str::from_utf8(&packet[8..]).is_ok());
   }

   #[test]
   fn media_eq_packet_shape() {
      let eq = MediaEq {
         on_phone: true,
         on_media: false,
         bands: [0.5; 8],
      };
      let packet = build_media_eq(&eq);
      assert_eq!(packet.len(), EQ_DATA_FRAME_LEN);
      assert_eq!(packet[6], 0x84);
      assert_eq!(packet[10], 0x01);
      assert_eq!(packet[11], 0x02);
      assert_eq!(&packet[12..16], &0.5f32.to_le_bytes());
      // block 4 mirrors block 1
      assert_eq!(&packet[108..112], &0.5f32.to_le_bytes());
   }

   #[test]
   fn command_id_round_trips_through_repr() {
      assert_eq!(
         ControlCommandId::from_repr(0x0D),
         Some(ControlCommandId::ListeningMode)
      );
      assert_eq!(ControlCommandId::from_repr(0x7F), None);
   }

   #[test]
   fn noise_mode_parses_aliases() {
      assert_eq!(
         "transparency".parse::<NoiseControlMode>().unwrap(),
         NoiseControlMode::Transparency
      );
      assert_eq!(
         "nc".parse::<NoiseControlMode>().unwrap(),
         NoiseControlMode::NoiseCancellation
      );
   }
}
