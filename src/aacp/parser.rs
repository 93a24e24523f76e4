//! Frame classification and parsing for the AACP channel.
//!
//! A received packet is classified in a single pass into a tagged [`Frame`]
//! variant. Predicates check exact length plus prefix; a frame that matches
//! no classifier is [`Frame::Unrecognized`], which is never an error. A frame
//! that matches a classifier but fails to parse yields a [`ProtoError`] the
//! read loop logs and drops.

use log::warn;
use thiserror::Error;

use crate::{
   aacp::protocol::{
      BATTERY_FRAME_LEN, BatteryChargeStatus, BatteryComponent, BatteryInfo, BatteryState,
      CONVERSATION_FRAME_LEN, ControlCommand, ControlCommandId, ConversationAwareness,
      DeviceInformation, EAR_DETECTION_FRAME_LEN, EQ_DATA_FRAME_LEN, EarDetectionStatus,
      EarPlacement, HDR_ACK_FEATURES, HDR_ACK_HANDSHAKE, HDR_BATTERY, HDR_CONTROL_CMD,
      HDR_CONVERSATION, HDR_EAR_DETECTION, HDR_EQ_DATA, HDR_HEAD_TRACKING, HDR_INFORMATION,
      HDR_NOISE_CTL, HDR_STEM_PRESS, HEAD_TRACKING_MIN_LEN, HeadOrientation, MediaEq,
      NOISE_CTL_FRAME_LEN, NoiseControlMode, StemPress, StemPressBud, StemPressKind,
   },
   bluetooth::l2cap::Packet,
};

/// Error type for protocol parsing.
#[derive(Error, Debug)]
pub enum ProtoError {
   /// Packet is not of the expected type
   #[error("Not a {expected} packet")]
   WrongPacketType { expected: &'static str },

   /// Packet is too short for the expected format
   #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
   PacketTooShort { expected: usize, actual: usize },

   /// Unknown noise control mode
   #[error("Unknown noise control mode: 0x{mode:02x}")]
   UnknownNoiseMode { mode: u8 },

   /// Unknown stem press kind or bud byte
   #[error("Unknown stem press encoding: 0x{value:02x}")]
   UnknownStemPress { value: u8 },

   /// Generic invalid packet format
   #[error("Invalid packet format: {reason}")]
   InvalidFormat { reason: &'static str },
}

/// Classification outcome of one received AACP packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
   Battery(BatteryInfo),
   NoiseControl(NoiseControlMode),
   EarDetection(EarDetectionStatus),
   ConversationAwareness(ConversationAwareness),
   HeadTracking(HeadOrientation),
   ControlCommand(ControlCommand),
   StemPress(StemPress),
   MediaEq(MediaEq),
   DeviceInformation(DeviceInformation),
   HandshakeAck,
   FeaturesAck,
   Unrecognized,
}

/// Classifies a packet, trying each frame type in fixed priority order.
pub fn classify(data: &[u8]) -> Result<Frame, ProtoError> {
   if is_battery_frame(data) {
      parse_battery(data).map(Frame::Battery)
   } else if is_noise_control_frame(data) {
      parse_noise_control(data).map(Frame::NoiseControl)
   } else if is_ear_detection_frame(data) {
      parse_ear_detection(data).map(Frame::EarDetection)
   } else if is_conversation_awareness_frame(data) {
      parse_conversation_awareness(data).map(Frame::ConversationAwareness)
   } else if is_head_tracking_frame(data) {
      parse_head_tracking(data).map(Frame::HeadTracking)
   } else if let Some(command) = parse_control_echo(data) {
      Ok(Frame::ControlCommand(command))
   } else if data.starts_with(HDR_STEM_PRESS) {
      parse_stem_press(data).map(Frame::StemPress)
   } else if data.starts_with(HDR_EQ_DATA) {
      parse_media_eq(data).map(Frame::MediaEq)
   } else if data.starts_with(HDR_INFORMATION) {
      parse_device_information(data).map(Frame::DeviceInformation)
   } else if data.starts_with(HDR_ACK_HANDSHAKE) {
      Ok(Frame::HandshakeAck)
   } else if data.starts_with(HDR_ACK_FEATURES) {
      Ok(Frame::FeaturesAck)
   } else {
      Ok(Frame::Unrecognized)
   }
}

pub fn is_battery_frame(data: &[u8]) -> bool {
   data.len() == BATTERY_FRAME_LEN && data.starts_with(HDR_BATTERY)
}

pub fn is_noise_control_frame(data: &[u8]) -> bool {
   data.len() == NOISE_CTL_FRAME_LEN && data.starts_with(HDR_NOISE_CTL)
}

pub fn is_ear_detection_frame(data: &[u8]) -> bool {
   data.len() == EAR_DETECTION_FRAME_LEN && data.starts_with(HDR_EAR_DETECTION)
}

pub fn is_conversation_awareness_frame(data: &[u8]) -> bool {
   data.len() == CONVERSATION_FRAME_LEN && data.starts_with(HDR_CONVERSATION)
}

pub fn is_head_tracking_frame(data: &[u8]) -> bool {
   data.len() >= HEAD_TRACKING_MIN_LEN
      && data.starts_with(HDR_HEAD_TRACKING)
      && matches!(data[10], 0x44 | 0x45)
      && data[11] == 0x00
}

/// Parses the fixed 22-byte battery frame: three (component, level, status)
/// triplets at offsets 7, 12 and 17. All three component records are always
/// rebuilt together.
pub fn parse_battery(data: &[u8]) -> Result<BatteryInfo, ProtoError> {
   if !is_battery_frame(data) {
      return Err(ProtoError::WrongPacketType {
         expected: "battery status",
      });
   }

   let mut info = BatteryInfo::new();
   for offset in [7usize, 12, 17] {
      let id = data[offset];
      let level = data[offset + 2].min(100);
      let status = data[offset + 3];

      let Some(component) = BatteryComponent::from_repr(id) else {
         warn!("Unknown battery component 0x{id:02x}");
         continue;
      };
      let status = BatteryChargeStatus::from_repr(status).unwrap_or_else(|| {
         warn!("Unknown charge status 0x{status:02x} for {component}, treating as NotCharging");
         BatteryChargeStatus::NotCharging
      });

      let state = BatteryState { level, status };
      match component {
         BatteryComponent::Left => info.left = state,
         BatteryComponent::Right => info.right = state,
         BatteryComponent::Case => info.case = state,
      }
   }
   Ok(info)
}

pub fn parse_noise_control(data: &[u8]) -> Result<NoiseControlMode, ProtoError> {
   if data.len() < 8 {
      return Err(ProtoError::PacketTooShort {
         expected: 8,
         actual: data.len(),
      });
   }
   let mode = data[7];
   NoiseControlMode::from_repr(mode).ok_or(ProtoError::UnknownNoiseMode { mode })
}

pub fn parse_ear_detection(data: &[u8]) -> Result<EarDetectionStatus, ProtoError> {
   if data.len() < 8 {
      return Err(ProtoError::PacketTooShort {
         expected: 8,
         actual: data.len(),
      });
   }
   // 0x00 means in-ear on the wire
   let placement = |byte: u8| {
      if byte == 0x00 {
         EarPlacement::InEar
      } else {
         EarPlacement::OutOfEar
      }
   };
   Ok(EarDetectionStatus {
      primary: placement(data[6]),
      secondary: placement(data[7]),
   })
}

pub fn parse_conversation_awareness(data: &[u8]) -> Result<ConversationAwareness, ProtoError> {
   if data.len() < CONVERSATION_FRAME_LEN {
      return Err(ProtoError::PacketTooShort {
         expected: CONVERSATION_FRAME_LEN,
         actual: data.len(),
      });
   }
   Ok(ConversationAwareness { level: data[9] })
}

pub fn parse_head_tracking(data: &[u8]) -> Result<HeadOrientation, ProtoError> {
   if data.len() < 55 {
      return Err(ProtoError::PacketTooShort {
         expected: 55,
         actual: data.len(),
      });
   }
   let horizontal = i16::from_le_bytes([data[51], data[52]]);
   let vertical = i16::from_le_bytes([data[53], data[54]]);
   Ok(HeadOrientation {
      horizontal,
      vertical,
   })
}

/// Recognizes a control-command echo/push by its 7-byte fixed prefix and
/// extracts identifier plus payload. Returns `None` when the prefix does not
/// match or the identifier is outside the known registry; neither is an
/// error. Trailing zero-padding of the 4-byte container is trimmed, with an
/// all-zero payload normalizing to a single zero byte.
pub fn parse_control_echo(data: &[u8]) -> Option<ControlCommand> {
   if !data.starts_with(HDR_CONTROL_CMD) || data.len() < 7 {
      return None;
   }
   let id = ControlCommandId::from_repr(data[6])?;

   let mut value = &data[7..];
   while value.len() > 1 && value[value.len() - 1] == 0x00 {
      value = &value[..value.len() - 1];
   }
   if value.is_empty() {
      value = &[0x00];
   }
   Some(ControlCommand {
      id,
      value: Packet::from_slice(value),
   })
}

pub fn parse_stem_press(data: &[u8]) -> Result<StemPress, ProtoError> {
   if data.len() < 8 {
      return Err(ProtoError::PacketTooShort {
         expected: 8,
         actual: data.len(),
      });
   }
   let kind = StemPressKind::from_repr(data[6])
      .ok_or(ProtoError::UnknownStemPress { value: data[6] })?;
   let bud = StemPressBud::from_repr(data[7])
      .ok_or(ProtoError::UnknownStemPress { value: data[7] })?;
   Ok(StemPress { kind, bud })
}

/// Parses the 140-byte media-EQ frame: enable flags at bytes 10 and 11, then
/// four little-endian 8-float blocks of which only the first is meaningful.
pub fn parse_media_eq(data: &[u8]) -> Result<MediaEq, ProtoError> {
   if data.len() != EQ_DATA_FRAME_LEN {
      return Err(ProtoError::PacketTooShort {
         expected: EQ_DATA_FRAME_LEN,
         actual: data.len(),
      });
   }
   if data[6] != 0x84 {
      return Err(ProtoError::InvalidFormat {
         reason: "EQ frame identifier is not 0x84",
      });
   }

   let mut bands = [0.0f32; 8];
   for (i, band) in bands.iter_mut().enumerate() {
      let at = 12 + i * 4;
      *band = f32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
   }
   Ok(MediaEq {
      on_phone: data[10] == 0x01,
      on_media: data[11] == 0x01,
      bands,
   })
}

/// Parses the information frame: a table of NUL-separated strings starting
/// at byte 6, in a fixed order observed on every firmware so far.
pub fn parse_device_information(data: &[u8]) -> Result<DeviceInformation, ProtoError> {
   if data.len() < 20 {
      return Err(ProtoError::PacketTooShort {
         expected: 20,
         actual: data.len(),
      });
   }

   let strings: Vec<&str> = data[6..]
      .split(|&b| b == 0x00)
      .filter(|chunk| !chunk.is_empty())
      .map(|chunk| std::str::from_utf8(chunk).unwrap_or(""))
      .collect();

   let field = |i: usize| strings.get(i).copied().unwrap_or("").into();
   Ok(DeviceInformation {
      name: field(0),
      model_number: field(1),
      manufacturer: field(2),
      serial_number: field(3),
      firmware_version: field(4),
      hardware_revision: field(6),
      left_serial_number: field(8),
      right_serial_number: field(9),
   })
}

#[cfg(test)]
mod tests {
   use super::*;

   fn battery_frame(
      triplets: [(BatteryComponent, u8, BatteryChargeStatus); 3],
   ) -> [u8; BATTERY_FRAME_LEN] {
      let mut data = [0u8; BATTERY_FRAME_LEN];
      data[..6].copy_from_slice(HDR_BATTERY);
      data[6] = 0x03;
      for (i, (component, level, status)) in triplets.into_iter().enumerate() {
         let offset = 7 + i * 5;
         data[offset] = component as u8;
         data[offset + 2] = level;
         data[offset + 3] = status as u8;
      }
      data
   }

   #[test]
   fn battery_frame_parses_all_components() {
      let data = battery_frame([
         (BatteryComponent::Left, 85, BatteryChargeStatus::Charging),
         (BatteryComponent::Right, 80, BatteryChargeStatus::NotCharging),
         (BatteryComponent::Case, 40, BatteryChargeStatus::Charging),
      ]);
      let info = parse_battery(&data).unwrap();
      assert_eq!(info.left.level, 85);
      assert!(info.left.is_charging());
      assert_eq!(info.right.level, 80);
      assert!(!info.right.is_charging());
      assert_eq!(info.case.level, 40);
      assert!(info.case.is_charging());
   }

   #[test]
   fn battery_frame_is_order_independent() {
      let swapped = battery_frame([
         (BatteryComponent::Right, 80, BatteryChargeStatus::NotCharging),
         (BatteryComponent::Left, 85, BatteryChargeStatus::Charging),
         (BatteryComponent::Case, 40, BatteryChargeStatus::Charging),
      ]);
      let info = parse_battery(&swapped).unwrap();
      assert_eq!(info.left.level, 85);
      assert_eq!(info.right.level, 80);
   }

   #[test]
   fn battery_levels_clamp_to_percent_domain() {
      let data = battery_frame([
         (BatteryComponent::Left, 255, BatteryChargeStatus::Charging),
         (BatteryComponent::Right, 100, BatteryChargeStatus::Charging),
         (BatteryComponent::Case, 0, BatteryChargeStatus::Disconnected),
      ]);
      let info = parse_battery(&data).unwrap();
      assert_eq!(info.left.level, 100);
   }

   #[test]
   fn wrong_prefix_is_never_a_battery_frame() {
      let mut data = [0u8; BATTERY_FRAME_LEN];
      data[0] = 0x05;
      assert!(!is_battery_frame(&data));
      // correct prefix but wrong length
      let mut long = [0u8; BATTERY_FRAME_LEN + 5];
      long[..6].copy_from_slice(HDR_BATTERY);
      assert!(!is_battery_frame(&long));
   }

   #[test]
   fn noise_control_echo_decodes_mode() {
      // the short push form the device sometimes emits
      let data = [0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0D, 0x02];
      let command = parse_control_echo(&data).unwrap();
      assert_eq!(command.id, ControlCommandId::ListeningMode);
      assert_eq!(command.value.as_slice(), &[0x02]);
      assert_eq!(
         NoiseControlMode::from_repr(command.value[0]),
         Some(NoiseControlMode::NoiseCancellation)
      );
   }

   #[test]
   fn noise_control_notification_frame() {
      let data = [
         0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0D, 0x03, 0x00, 0x00, 0x00,
      ];
      assert!(is_noise_control_frame(&data));
      assert_eq!(
         parse_noise_control(&data).unwrap(),
         NoiseControlMode::Transparency
      );
      assert!(matches!(
         parse_noise_control(&[0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0D, 0x09, 0, 0, 0]),
         Err(ProtoError::UnknownNoiseMode { mode: 0x09 })
      ));
   }

   #[test]
   fn control_echo_trims_container_padding() {
      let data = [
         0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x1F, 0x25, 0x00, 0x00, 0x00,
      ];
      let command = parse_control_echo(&data).unwrap();
      assert_eq!(command.id, ControlCommandId::ChimeVolume);
      assert_eq!(command.value.as_slice(), &[0x25]);

      let zeros = [0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x1F, 0x00, 0x00, 0x00, 0x00];
      assert_eq!(
         parse_control_echo(&zeros).unwrap().value.as_slice(),
         &[0x00]
      );
   }

   #[test]
   fn bare_echo_without_container_normalizes_to_zero() {
      // identifier only, the device omits the value container entirely
      let data = [0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x1F];
      let command = parse_control_echo(&data).unwrap();
      assert_eq!(command.id, ControlCommandId::ChimeVolume);
      assert_eq!(command.value.as_slice(), &[0x00]);
      assert!(matches!(
         classify(&data).unwrap(),
         Frame::ControlCommand(_)
      ));
   }

   #[test]
   fn control_echo_rejects_foreign_prefix() {
      assert!(parse_control_echo(&[0x04, 0x00, 0x04, 0x00, 0x06, 0x00, 0x0D, 0x02]).is_none());
      // unknown identifier stays unclassified rather than erroring
      assert!(parse_control_echo(&[0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x7F, 0x02]).is_none());
   }

   #[test]
   fn ear_detection_frame() {
      let data = [0x04, 0x00, 0x04, 0x00, 0x06, 0x00, 0x00, 0x01];
      assert!(is_ear_detection_frame(&data));
      let status = parse_ear_detection(&data).unwrap();
      assert_eq!(status.primary, EarPlacement::InEar);
      assert_eq!(status.secondary, EarPlacement::OutOfEar);
      assert!(!status.both_in_ear());
   }

   #[test]
   fn conversation_awareness_frame() {
      let data = [0x04, 0x00, 0x04, 0x00, 0x4B, 0x00, 0x02, 0x00, 0x00, 0x01];
      assert!(is_conversation_awareness_frame(&data));
      let ca = parse_conversation_awareness(&data).unwrap();
      assert_eq!(ca.level, 1);
      assert!(ca.is_speaking());
   }

   #[test]
   fn head_tracking_frame_extracts_angles() {
      let mut data = [0u8; 70];
      data[..10].copy_from_slice(HDR_HEAD_TRACKING);
      data[10] = 0x44;
      data[51..53].copy_from_slice(&(-90i16).to_le_bytes());
      data[53..55].copy_from_slice(&45i16.to_le_bytes());
      assert!(is_head_tracking_frame(&data));
      let orientation = parse_head_tracking(&data).unwrap();
      assert_eq!(orientation.horizontal, -90);
      assert_eq!(orientation.vertical, 45);

      data[10] = 0x46;
      assert!(!is_head_tracking_frame(&data));
   }

   #[test]
   fn head_tracking_requires_minimum_length() {
      let mut data = [0u8; 60];
      data[..10].copy_from_slice(HDR_HEAD_TRACKING);
      data[10] = 0x44;
      assert!(!is_head_tracking_frame(&data));
   }

   #[test]
   fn classification_is_single_pass_and_tagged() {
      let battery = battery_frame([
         (BatteryComponent::Left, 50, BatteryChargeStatus::Charging),
         (BatteryComponent::Right, 50, BatteryChargeStatus::Charging),
         (BatteryComponent::Case, 50, BatteryChargeStatus::Charging),
      ]);
      assert!(matches!(
         classify(&battery).unwrap(),
         Frame::Battery(info) if info.left.level == 50
      ));

      assert!(matches!(
         classify(&[0x01, 0x00, 0x04, 0x00, 0x00]).unwrap(),
         Frame::HandshakeAck
      ));

      // garbage is unrecognized, not an error
      assert!(matches!(
         classify(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap(),
         Frame::Unrecognized
      ));
   }

   #[test]
   fn classify_is_idempotent() {
      let data = [0x04, 0x00, 0x04, 0x00, 0x06, 0x00, 0x01, 0x00];
      let first = classify(&data).unwrap();
      let second = classify(&data).unwrap();
      assert_eq!(first, second);
   }

   #[test]
   fn stem_press_frame() {
      let data = [0x04, 0x00, 0x04, 0x00, 0x19, 0x00, 0x06, 0x01];
      let press = parse_stem_press(&data).unwrap();
      assert_eq!(press.kind, StemPressKind::Double);
      assert_eq!(press.bud, StemPressBud::Left);
   }

   #[test]
   fn media_eq_round_trip() {
      let eq = MediaEq {
         on_phone: false,
         on_media: true,
         bands: [1.0, -0.5, 0.25, 0.0, 2.0, -2.0, 0.75, 0.1],
      };
      let packet = crate::aacp::protocol::build_media_eq(&eq);
      let parsed = parse_media_eq(&packet).unwrap();
      assert_eq!(parsed.on_phone, eq.on_phone);
      assert_eq!(parsed.on_media, eq.on_media);
      assert_eq!(parsed.bands, eq.bands);
   }

   #[test]
   fn device_information_strings() {
      let mut data = Vec::from(HDR_INFORMATION);
      data.push(0x00);
      for s in [
         "Buds Pro",
         "A2931",
         "Example Inc.",
         "SN12345",
         "6A300",
         "6A301",
         "1.0.0",
         "updater",
         "SNL",
         "SNR",
      ] {
         data.push(0x00);
         data.extend_from_slice(s.as_bytes());
      }
      let info = parse_device_information(&data).unwrap();
      assert_eq!(info.name, "Buds Pro");
      assert_eq!(info.model_number, "A2931");
      assert_eq!(info.firmware_version, "6A300");
      assert_eq!(info.hardware_revision, "1.0.0");
      assert_eq!(info.right_serial_number, "SNR");
   }
}
