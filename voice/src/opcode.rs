use serde::{Deserialize, Serialize};

/// Voice gateway operation codes (protocol v8).
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum GatewayOpcode {
  Identify,
  SelectProtocol,
  Ready,
  Heartbeat,
  SessionDescription,
  Speaking,
  HeartbeatAck,
  Resume,
  Hello,
  Resumed,
  ClientDisconnect,
  Unknown(u8)
}

impl GatewayOpcode {
  pub fn as_u8(self) -> u8 {
    use GatewayOpcode::*;
    match self {
      Identify => 0,
      SelectProtocol => 1,
      Ready => 2,
      Heartbeat => 3,
      SessionDescription => 4,
      Speaking => 5,
      HeartbeatAck => 6,
      Resume => 7,
      Hello => 8,
      Resumed => 9,
      ClientDisconnect => 13,
      Unknown(code) => code
    }
  }

  pub fn from_u8(code: u8) -> Self {
    use GatewayOpcode::*;
    match code {
      0 => Identify,
      1 => SelectProtocol,
      2 => Ready,
      3 => Heartbeat,
      4 => SessionDescription,
      5 => Speaking,
      6 => HeartbeatAck,
      7 => Resume,
      8 => Hello,
      9 => Resumed,
      13 => ClientDisconnect,
      _ => Unknown(code)
    }
  }
}

impl From<GatewayOpcode> for u8 {
  fn from(opcode: GatewayOpcode) -> u8 {
    opcode.as_u8()
  }
}

impl From<u8> for GatewayOpcode {
  fn from(code: u8) -> GatewayOpcode {
    GatewayOpcode::from_u8(code)
  }
}

impl Serialize for GatewayOpcode {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer
  {
    serializer.serialize_u8(self.as_u8())
  }
}

impl<'de> Deserialize<'de> for GatewayOpcode {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>
  {
    Ok(u8::deserialize(deserializer)?.into())
  }
}
