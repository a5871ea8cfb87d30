use std::fmt;

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Close codes issued by the voice gateway (4001..4016).
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum GatewayCloseCode {
  UnknownOpcode,
  FailedToDecodePayload,
  NotAuthenticated,
  AuthenticationFailed,
  AlreadyAuthenticated,
  SessionNoLongerValid,
  SessionTimeout,
  ServerNotFound,
  UnknownProtocol,
  Disconnected,
  VoiceServerCrashed,
  UnknownEncryptionMode,
  Unknown(u16)
}

impl GatewayCloseCode {
  /// Whether the session may be resumed with the existing ssrc and secret
  /// key instead of running a fresh handshake.
  pub fn can_resume(self) -> bool {
    matches!(self, GatewayCloseCode::VoiceServerCrashed)
  }

  pub fn as_u16(self) -> u16 {
    use GatewayCloseCode::*;
    match self {
      UnknownOpcode => 4001,
      FailedToDecodePayload => 4002,
      NotAuthenticated => 4003,
      AuthenticationFailed => 4004,
      AlreadyAuthenticated => 4005,
      SessionNoLongerValid => 4006,
      SessionTimeout => 4009,
      ServerNotFound => 4011,
      UnknownProtocol => 4012,
      Disconnected => 4014,
      VoiceServerCrashed => 4015,
      UnknownEncryptionMode => 4016,
      Unknown(code) => code
    }
  }

  pub fn from_u16(code: u16) -> Self {
    use GatewayCloseCode::*;
    match code {
      4001 => UnknownOpcode,
      4002 => FailedToDecodePayload,
      4003 => NotAuthenticated,
      4004 => AuthenticationFailed,
      4005 => AlreadyAuthenticated,
      4006 => SessionNoLongerValid,
      4009 => SessionTimeout,
      4011 => ServerNotFound,
      4012 => UnknownProtocol,
      4014 => Disconnected,
      4015 => VoiceServerCrashed,
      4016 => UnknownEncryptionMode,
      _ => Unknown(code)
    }
  }
}

impl fmt::Display for GatewayCloseCode {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}", self.as_u16())
  }
}

impl From<u16> for GatewayCloseCode {
  fn from(code: u16) -> GatewayCloseCode {
    GatewayCloseCode::from_u16(code)
  }
}

impl From<GatewayCloseCode> for u16 {
  fn from(code: GatewayCloseCode) -> u16 {
    code.as_u16()
  }
}

impl From<CloseCode> for GatewayCloseCode {
  fn from(code: CloseCode) -> GatewayCloseCode {
    Into::<u16>::into(code).into()
  }
}

#[cfg(test)]
mod tests {
  use super::GatewayCloseCode;

  #[test]
  fn known_codes_round_trip() {
    for code in [4001, 4002, 4003, 4004, 4005, 4006, 4009, 4011, 4012, 4014, 4015, 4016] {
      assert_eq!(GatewayCloseCode::from_u16(code).as_u16(), code);
    }
  }

  #[test]
  fn only_server_crash_is_resumable() {
    assert!(GatewayCloseCode::VoiceServerCrashed.can_resume());
    assert!(!GatewayCloseCode::SessionNoLongerValid.can_resume());
    assert!(!GatewayCloseCode::Disconnected.can_resume());
    assert!(!GatewayCloseCode::Unknown(1000).can_resume());
  }
}
