//! Audio personalization blobs.
//!
//! Both characteristics carry the same 25-float little-endian body: a global
//! enable, then per-ear EQ, amplification, tone, conversation boost and
//! ambient noise reduction. Transparency starts at byte 0 with an optional
//! own-voice float at the end; the hearing-aid blob prepends a 4-byte header
//! and always carries own-voice.

/// Transparency blob without the trailing own-voice float.
pub const TRANSPARENCY_BASE_LEN: usize = 100;
/// Transparency blob with own-voice.
pub const TRANSPARENCY_FULL_LEN: usize = 104;
/// Hearing-aid blob, header included.
pub const HEARING_AID_LEN: usize = 104;

fn read_f32(data: &[u8], at: usize) -> f32 {
   f32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn write_f32(data: &mut [u8], at: usize, value: f32) {
   data[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// One ear's worth of tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EarProfile {
   pub eq: [f32; 8],
   pub amplification: f32,
   pub tone: f32,
   pub conversation_boost: bool,
   pub ambient_noise_reduction: f32,
}

impl EarProfile {
   const PACKED_LEN: usize = 48;

   fn unpack(data: &[u8], at: usize) -> Self {
      let mut eq = [0.0f32; 8];
      for (i, band) in eq.iter_mut().enumerate() {
         *band = read_f32(data, at + i * 4);
      }
      Self {
         eq,
         amplification: read_f32(data, at + 32),
         tone: read_f32(data, at + 36),
         conversation_boost: read_f32(data, at + 40) > 0.5,
         ambient_noise_reduction: read_f32(data, at + 44),
      }
   }

   fn pack(&self, data: &mut [u8], at: usize) {
      for (i, band) in self.eq.iter().enumerate() {
         write_f32(data, at + i * 4, *band);
      }
      write_f32(data, at + 32, self.amplification);
      write_f32(data, at + 36, self.tone);
      write_f32(data, at + 40, if self.conversation_boost { 1.0 } else { 0.0 });
      write_f32(data, at + 44, self.ambient_noise_reduction);
   }
}

/// Transparency-mode personalization settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransparencySettings {
   pub enabled: bool,
   pub left: EarProfile,
   pub right: EarProfile,
   pub own_voice_amplification: Option<f32>,
}

impl TransparencySettings {
   /// Decodes a transparency blob. Blobs shorter than the 100-byte base
   /// layout decode to `None`; the device sends these while its settings
   /// store is still warming up after a reconnect.
   pub fn unpack(data: &[u8]) -> Option<Self> {
      if data.len() < TRANSPARENCY_BASE_LEN {
         return None;
      }
      Some(Self {
         enabled: read_f32(data, 0) > 0.5,
         left: EarProfile::unpack(data, 4),
         right: EarProfile::unpack(data, 4 + EarProfile::PACKED_LEN),
         own_voice_amplification: (data.len() >= TRANSPARENCY_FULL_LEN)
            .then(|| read_f32(data, 100)),
      })
   }

   pub fn pack(&self) -> Vec<u8> {
      let len = if self.own_voice_amplification.is_some() {
         TRANSPARENCY_FULL_LEN
      } else {
         TRANSPARENCY_BASE_LEN
      };
      let mut data = vec![0u8; len];
      write_f32(&mut data, 0, if self.enabled { 1.0 } else { 0.0 });
      self.left.pack(&mut data, 4);
      self.right.pack(&mut data, 4 + EarProfile::PACKED_LEN);
      if let Some(own_voice) = self.own_voice_amplification {
         write_f32(&mut data, 100, own_voice);
      }
      data
   }

   /// Mean of the per-ear amplifications, clamped to the UI domain.
   pub fn net_amplification(&self) -> f32 {
      ((self.left.amplification + self.right.amplification) / 2.0).clamp(-1.0, 1.0)
   }

   /// Right-minus-left amplification, clamped to the UI domain.
   pub fn balance(&self) -> f32 {
      (self.right.amplification - self.left.amplification).clamp(-1.0, 1.0)
   }

   /// Resolves a (net, balance) pair back into per-ear amplifications.
   pub fn set_net_and_balance(&mut self, net: f32, balance: f32) {
      self.left.amplification = net - balance / 2.0;
      self.right.amplification = net + balance / 2.0;
   }
}

/// Hearing-aid personalization settings. Same body as transparency but with
/// a 4-byte header and a mandatory own-voice float.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HearingAidSettings {
   pub left: EarProfile,
   pub right: EarProfile,
   pub own_voice_amplification: f32,
}

impl HearingAidSettings {
   pub fn unpack(data: &[u8]) -> Option<Self> {
      if data.len() < HEARING_AID_LEN {
         return None;
      }
      Some(Self {
         left: EarProfile::unpack(data, 4),
         right: EarProfile::unpack(data, 4 + EarProfile::PACKED_LEN),
         own_voice_amplification: read_f32(data, 100),
      })
   }

   /// Writes the settings into a previously read blob. The header is kept
   /// as the device sent it apart from byte 2, which signals a client-side
   /// adjustment. Blobs shorter than the fixed layout are left untouched.
   pub fn patch_into_blob(&self, blob: &mut [u8]) -> bool {
      if blob.len() < HEARING_AID_LEN {
         return false;
      }
      blob[2] = 0x64;
      self.left.pack(blob, 4);
      self.right.pack(blob, 4 + EarProfile::PACKED_LEN);
      write_f32(blob, 100, self.own_voice_amplification);
      true
   }

   pub fn net_amplification(&self) -> f32 {
      ((self.left.amplification + self.right.amplification) / 2.0).clamp(-1.0, 1.0)
   }

   pub fn balance(&self) -> f32 {
      (self.right.amplification - self.left.amplification).clamp(-1.0, 1.0)
   }

   pub fn set_net_and_balance(&mut self, net: f32, balance: f32) {
      self.left.amplification = net - balance / 2.0;
      self.right.amplification = net + balance / 2.0;
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn ear(amp: f32) -> EarProfile {
      EarProfile {
         eq: [10.0, 15.0, 20.0, 25.0, 30.0, 25.0, 20.0, 15.0],
         amplification: amp,
         tone: 0.25,
         conversation_boost: true,
         ambient_noise_reduction: 0.5,
      }
   }

   #[test]
   fn transparency_round_trip_with_own_voice() {
      let settings = TransparencySettings {
         enabled: true,
         left: ear(0.3),
         right: ear(0.5),
         own_voice_amplification: Some(0.8),
      };
      let blob = settings.pack();
      assert_eq!(blob.len(), TRANSPARENCY_FULL_LEN);
      assert_eq!(TransparencySettings::unpack(&blob).unwrap(), settings);
   }

   #[test]
   fn transparency_base_layout_has_no_own_voice() {
      let settings = TransparencySettings {
         enabled: false,
         left: ear(-0.2),
         right: ear(0.2),
         own_voice_amplification: None,
      };
      let blob = settings.pack();
      assert_eq!(blob.len(), TRANSPARENCY_BASE_LEN);
      let back = TransparencySettings::unpack(&blob).unwrap();
      assert!(back.own_voice_amplification.is_none());
      assert!(!back.enabled);
   }

   #[test]
   fn short_blob_decodes_to_none() {
      assert!(TransparencySettings::unpack(&[0u8; 96]).is_none());
      assert!(HearingAidSettings::unpack(&[0u8; 100]).is_none());
   }

   #[test]
   fn net_and_balance_derivation() {
      let settings = TransparencySettings {
         enabled: true,
         left: ear(0.2),
         right: ear(0.6),
         own_voice_amplification: None,
      };
      assert!((settings.net_amplification() - 0.4).abs() < 1e-6);
      assert!((settings.balance() - 0.4).abs() < 1e-6);

      // extremes clamp rather than overflow the UI domain
      let loud = TransparencySettings {
         left: ear(2.0),
         right: ear(2.0),
         ..settings
      };
      assert_eq!(loud.net_amplification(), 1.0);
   }

   #[test]
   fn set_net_and_balance_round_trips() {
      let mut settings = TransparencySettings {
         enabled: true,
         left: ear(0.0),
         right: ear(0.0),
         own_voice_amplification: None,
      };
      settings.set_net_and_balance(0.5, -0.3);
      assert!((settings.net_amplification() - 0.5).abs() < 1e-6);
      assert!((settings.balance() + 0.3).abs() < 1e-6);
   }

   #[test]
   fn hearing_aid_patch_preserves_header() {
      let mut blob = vec![0u8; HEARING_AID_LEN];
      blob[0] = 0xAB;
      blob[1] = 0xCD;
      blob[3] = 0xEF;

      let settings = HearingAidSettings {
         left: ear(0.1),
         right: ear(0.3),
         own_voice_amplification: 0.7,
      };
      assert!(settings.patch_into_blob(&mut blob));
      assert_eq!(blob[0], 0xAB);
      assert_eq!(blob[1], 0xCD);
      assert_eq!(blob[2], 0x64);
      assert_eq!(blob[3], 0xEF);
      assert_eq!(HearingAidSettings::unpack(&blob).unwrap(), settings);

      let mut short = vec![0u8; 50];
      assert!(!settings.patch_into_blob(&mut short));
   }
}
