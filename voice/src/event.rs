use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::VoiceError;
use crate::opcode::GatewayOpcode;

/// Wire envelope for every voice gateway message: `{"op": u8, "d": ..., "s": u64?}`.
///
/// The `s` field carries the server-assigned sequence number on v8
/// server-to-client messages and is echoed back in heartbeats.
#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayPacket {
  #[serde(rename = "op")]
  pub opcode: GatewayOpcode,
  #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
  #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
  pub sequence: Option<u64>
}

impl GatewayPacket {
  pub fn new<T>(opcode: GatewayOpcode, data: T) -> Self
  where
    T: Into<Option<Value>>
  {
    Self {
      opcode,
      data: data.into(),
      sequence: None
    }
  }
}

#[derive(Clone, Debug)]
pub enum GatewayEvent {
  Identify(Identify),
  SelectProtocol(SelectProtocol),
  Ready(Ready),
  Heartbeat(Heartbeat),
  SessionDescription(SessionDescription),
  Speaking(Speaking),
  HeartbeatAck(HeartbeatAck),
  Resume(Resume),
  Hello(Hello),
  Resumed,
  ClientDisconnect
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Identify {
  pub server_id: u64,
  pub user_id: u64,
  pub session_id: String,
  pub token: String
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectProtocol {
  pub protocol: String,
  pub data: SelectProtocolData
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectProtocolData {
  pub address: IpAddr,
  pub port: u16,
  pub mode: String
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ready {
  pub ssrc: u32,
  pub ip: String,
  pub port: u16,
  pub modes: Vec<String>
}

/// Client heartbeat: `t` is the wall-clock send time in milliseconds,
/// `seq_ack` the latest server sequence seen (`0` if none).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Heartbeat {
  pub t: u64,
  pub seq_ack: u64
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatAck {
  pub t: u64
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionDescription {
  pub mode: String,
  pub secret_key: Vec<u8>
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Speaking {
  pub speaking: u8,
  pub delay: u32,
  pub ssrc: u32
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Resume {
  pub server_id: u64,
  pub session_id: String,
  pub token: String,
  pub seq_ack: u64
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hello {
  pub heartbeat_interval: f64
}

impl From<&GatewayEvent> for GatewayOpcode {
  fn from(event: &GatewayEvent) -> GatewayOpcode {
    use GatewayEvent::*;
    match event {
      Identify(_) => GatewayOpcode::Identify,
      SelectProtocol(_) => GatewayOpcode::SelectProtocol,
      Ready(_) => GatewayOpcode::Ready,
      Heartbeat(_) => GatewayOpcode::Heartbeat,
      SessionDescription(_) => GatewayOpcode::SessionDescription,
      Speaking(_) => GatewayOpcode::Speaking,
      HeartbeatAck(_) => GatewayOpcode::HeartbeatAck,
      Resume(_) => GatewayOpcode::Resume,
      Hello(_) => GatewayOpcode::Hello,
      Resumed => GatewayOpcode::Resumed,
      ClientDisconnect => GatewayOpcode::ClientDisconnect
    }
  }
}

impl TryFrom<GatewayPacket> for GatewayEvent {
  type Error = VoiceError;

  fn try_from(packet: GatewayPacket) -> Result<GatewayEvent, Self::Error> {
    use serde_json::from_value;
    use GatewayOpcode::*;

    let data = packet
      .data
      .ok_or_else(|| VoiceError::Gateway(format!("no payload data for opcode {}", packet.opcode.as_u8())));

    match packet.opcode {
      Identify => Ok(GatewayEvent::Identify(from_value(data?)?)),
      SelectProtocol => Ok(GatewayEvent::SelectProtocol(from_value(data?)?)),
      Ready => Ok(GatewayEvent::Ready(from_value(data?)?)),
      Heartbeat => Ok(GatewayEvent::Heartbeat(from_value(data?)?)),
      SessionDescription => Ok(GatewayEvent::SessionDescription(from_value(data?)?)),
      Speaking => Ok(GatewayEvent::Speaking(from_value(data?)?)),
      HeartbeatAck => Ok(GatewayEvent::HeartbeatAck(from_value(data?)?)),
      Resume => Ok(GatewayEvent::Resume(from_value(data?)?)),
      Hello => Ok(GatewayEvent::Hello(from_value(data?)?)),
      Resumed => Ok(GatewayEvent::Resumed),
      ClientDisconnect => Ok(GatewayEvent::ClientDisconnect),
      Unknown(code) => Err(VoiceError::Gateway(format!("unsupported opcode: {code}")))
    }
  }
}

impl TryFrom<GatewayEvent> for GatewayPacket {
  type Error = VoiceError;

  fn try_from(event: GatewayEvent) -> Result<GatewayPacket, Self::Error> {
    use GatewayEvent::*;

    let opcode = (&event).into();
    let data = match event {
      Identify(identify) => Some(serde_json::to_value(identify)?),
      SelectProtocol(select_protocol) => Some(serde_json::to_value(select_protocol)?),
      Ready(ready) => Some(serde_json::to_value(ready)?),
      Heartbeat(heartbeat) => Some(serde_json::to_value(heartbeat)?),
      SessionDescription(session_description) => Some(serde_json::to_value(session_description)?),
      Speaking(speaking) => Some(serde_json::to_value(speaking)?),
      HeartbeatAck(ack) => Some(serde_json::to_value(ack)?),
      Resume(resume) => Some(serde_json::to_value(resume)?),
      Hello(hello) => Some(serde_json::to_value(hello)?),
      Resumed | ClientDisconnect => None
    };

    Ok(GatewayPacket {
      opcode,
      data,
      sequence: None
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn heartbeat_encodes_op_and_payload() {
    let packet: GatewayPacket = GatewayEvent::Heartbeat(Heartbeat { t: 1700000000000, seq_ack: 10 })
      .try_into()
      .unwrap();
    let json: serde_json::Value = serde_json::to_value(&packet).unwrap();

    assert_eq!(json["op"], 3);
    assert_eq!(json["d"]["t"], 1700000000000u64);
    assert_eq!(json["d"]["seq_ack"], 10);
    assert!(json.get("s").is_none());
  }

  #[test]
  fn server_sequence_is_decoded() {
    let packet: GatewayPacket =
      serde_json::from_str(r#"{"op":5,"d":{"speaking":1,"delay":0,"ssrc":5},"s":3}"#).unwrap();

    assert_eq!(packet.opcode, GatewayOpcode::Speaking);
    assert_eq!(packet.sequence, Some(3));
    assert!(matches!(packet.try_into().unwrap(), GatewayEvent::Speaking(_)));
  }

  #[test]
  fn ready_payload_decodes() {
    let packet: GatewayPacket = serde_json::from_str(
      r#"{"op":2,"d":{"ssrc":1,"ip":"127.0.0.1","port":1234,"modes":["aead_xchacha20_poly1305_rtpsize"],"heartbeat_interval":1}}"#
    )
    .unwrap();

    let GatewayEvent::Ready(ready) = packet.try_into().unwrap() else {
      panic!("expected ready event");
    };
    assert_eq!(ready.ssrc, 1);
    assert_eq!(ready.port, 1234);
  }

  #[test]
  fn unknown_opcode_is_rejected() {
    let packet: GatewayPacket = serde_json::from_str(r#"{"op":18,"d":{}}"#).unwrap();
    assert!(GatewayEvent::try_from(packet).is_err());
  }
}
