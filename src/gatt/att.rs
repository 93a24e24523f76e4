//! Minimal ATT PDU encoding.
//!
//! Handles are fixed per firmware; there is no discovery step. The client
//! CCCD sits directly after each characteristic's value handle.

use crate::bluetooth::l2cap::Packet;

pub mod pdu {
   pub const READ_REQUEST: u8 = 0x0A;
   pub const READ_RESPONSE: u8 = 0x0B;
   pub const WRITE_REQUEST: u8 = 0x12;
   pub const WRITE_RESPONSE: u8 = 0x13;
   pub const HANDLE_VALUE_NTF: u8 = 0x1B;
}

/// Value written to a CCCD to enable notifications.
pub const CCCD_ENABLE: &[u8] = &[0x01, 0x00];

/// Attribute handles of the personalization characteristics.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::FromRepr,
)]
#[repr(u16)]
#[strum(serialize_all = "snake_case")]
pub enum AttHandle {
   Transparency = 0x18,
   LoudSoundReduction = 0x1B,
   HearingAid = 0x2A,
}

impl AttHandle {
   pub const fn handle(self) -> u16 {
      self as u16
   }

   /// Client characteristic configuration descriptor for this handle.
   pub const fn cccd(self) -> u16 {
      self as u16 + 1
   }
}

pub fn encode_read(handle: u16) -> Packet {
   let [lsb, msb] = handle.to_le_bytes();
   Packet::from_slice(&[pdu::READ_REQUEST, lsb, msb])
}

pub fn encode_write(handle: u16, value: &[u8]) -> Packet {
   let [lsb, msb] = handle.to_le_bytes();
   let mut packet = Packet::from_slice(&[pdu::WRITE_REQUEST, lsb, msb]);
   packet.extend_from_slice(value);
   packet
}

/// Splits a handle-value notification into handle and value. Returns `None`
/// for any other PDU.
pub fn decode_notification(data: &[u8]) -> Option<(u16, &[u8])> {
   if data.len() < 3 || data[0] != pdu::HANDLE_VALUE_NTF {
      return None;
   }
   Some((u16::from_le_bytes([data[1], data[2]]), &data[3..]))
}
