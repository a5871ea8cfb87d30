use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

use crate::constants::RTP_HEADER_SIZE;
use crate::error::{Result, VoiceError};

pub const NONCE_SIZE: usize = 24;
pub const NONCE_SUFFIX_SIZE: usize = 4;
pub const SECRET_KEY_SIZE: usize = 32;

/// Transport encryption suites this client can speak.
///
/// Negotiation picks the first server-advertised mode with a matching
/// variant; unknown suites fail at negotiation time, not at send time.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
#[non_exhaustive]
pub enum EncryptionMode {
  AeadXChaCha20Poly1305RtpSize
}

impl EncryptionMode {
  pub fn as_str(self) -> &'static str {
    match self {
      EncryptionMode::AeadXChaCha20Poly1305RtpSize => "aead_xchacha20_poly1305_rtpsize"
    }
  }

  pub fn from_name(name: &str) -> Option<Self> {
    match name {
      "aead_xchacha20_poly1305_rtpsize" => Some(EncryptionMode::AeadXChaCha20Poly1305RtpSize),
      _ => None
    }
  }

  /// Picks the first supported mode in server-advertised order.
  pub fn negotiate(modes: &[String]) -> Result<Self> {
    modes
      .iter()
      .find_map(|mode| Self::from_name(mode))
      .ok_or(VoiceError::EncryptionModeNotSupported)
  }
}

/// Session cipher derived from the `SessionDescription` secret key.
pub struct Cipher {
  mode: EncryptionMode,
  cipher: XChaCha20Poly1305
}

impl Cipher {
  pub fn new(mode: EncryptionMode, secret_key: &[u8]) -> Result<Self> {
    if secret_key.len() != SECRET_KEY_SIZE {
      return Err(VoiceError::Gateway(format!(
        "secret key must be {} bytes, got {}",
        SECRET_KEY_SIZE,
        secret_key.len()
      )));
    }

    Ok(Self {
      mode,
      cipher: XChaCha20Poly1305::new(Key::from_slice(secret_key))
    })
  }

  pub fn mode(&self) -> EncryptionMode {
    self.mode
  }

  /// Seals one RTP payload, producing the full wire packet:
  /// `header ‖ ciphertext ‖ tag ‖ nonce prefix (4 bytes)`.
  ///
  /// The nonce is the 4-byte big-endian packet counter padded with zeroes to
  /// 24 bytes; the 12-byte RTP header doubles as associated data.
  pub fn seal(&self, header: &[u8; RTP_HEADER_SIZE], audio: &[u8], nonce_counter: u32) -> Result<Vec<u8>> {
    match self.mode {
      EncryptionMode::AeadXChaCha20Poly1305RtpSize => {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..NONCE_SUFFIX_SIZE].copy_from_slice(&nonce_counter.to_be_bytes());

        let sealed = self
          .cipher
          .encrypt(XNonce::from_slice(&nonce), Payload { msg: audio, aad: header })
          .map_err(|_| VoiceError::Encryption)?;

        let mut packet = Vec::with_capacity(RTP_HEADER_SIZE + sealed.len() + NONCE_SUFFIX_SIZE);
        packet.extend_from_slice(header);
        packet.extend_from_slice(&sealed);
        packet.extend_from_slice(&nonce[..NONCE_SUFFIX_SIZE]);
        Ok(packet)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use chacha20poly1305::aead::{Aead, KeyInit, Payload};
  use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

  use super::*;

  #[test]
  fn negotiation_takes_first_supported_in_server_order() {
    let modes = vec![
      "aead_aes256_gcm_rtpsize".to_owned(),
      "aead_xchacha20_poly1305_rtpsize".to_owned(),
      "xsalsa20_poly1305".to_owned(),
    ];
    assert_eq!(
      EncryptionMode::negotiate(&modes).unwrap(),
      EncryptionMode::AeadXChaCha20Poly1305RtpSize
    );
  }

  #[test]
  fn negotiation_fails_without_intersection() {
    let modes = vec!["xsalsa20_poly1305_lite".to_owned()];
    assert!(matches!(
      EncryptionMode::negotiate(&modes),
      Err(VoiceError::EncryptionModeNotSupported)
    ));
  }

  #[test]
  fn rejects_short_secret_key() {
    assert!(Cipher::new(EncryptionMode::AeadXChaCha20Poly1305RtpSize, &[0u8; 16]).is_err());
  }

  #[test]
  fn sealed_packet_decrypts_back_to_payload() {
    let key = [7u8; SECRET_KEY_SIZE];
    let cipher = Cipher::new(EncryptionMode::AeadXChaCha20Poly1305RtpSize, &key).unwrap();

    let header = [0x80, 0x78, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3];
    let audio = b"not really opus";
    let packet = cipher.seal(&header, audio, 41).unwrap();

    assert_eq!(&packet[..RTP_HEADER_SIZE], &header);
    assert_eq!(&packet[packet.len() - NONCE_SUFFIX_SIZE..], &41u32.to_be_bytes());

    // Reconstruct the nonce from the trailing prefix and open the box.
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..NONCE_SUFFIX_SIZE].copy_from_slice(&packet[packet.len() - NONCE_SUFFIX_SIZE..]);

    let opened = XChaCha20Poly1305::new(Key::from_slice(&key))
      .decrypt(
        XNonce::from_slice(&nonce),
        Payload {
          msg: &packet[RTP_HEADER_SIZE..packet.len() - NONCE_SUFFIX_SIZE],
          aad: &header
        }
      )
      .unwrap();

    assert_eq!(opened, audio);
  }

  #[test]
  fn tampered_header_fails_authentication() {
    let key = [9u8; SECRET_KEY_SIZE];
    let cipher = Cipher::new(EncryptionMode::AeadXChaCha20Poly1305RtpSize, &key).unwrap();

    let header = [0x80, 0x78, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
    let packet = cipher.seal(&header, b"payload", 0).unwrap();

    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..NONCE_SUFFIX_SIZE].copy_from_slice(&packet[packet.len() - NONCE_SUFFIX_SIZE..]);

    let mut forged = header;
    forged[3] ^= 1;

    assert!(XChaCha20Poly1305::new(Key::from_slice(&key))
      .decrypt(
        XNonce::from_slice(&nonce),
        Payload {
          msg: &packet[RTP_HEADER_SIZE..packet.len() - NONCE_SUFFIX_SIZE],
          aad: &forged
        }
      )
      .is_err());
  }
}
