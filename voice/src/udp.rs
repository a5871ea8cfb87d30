use std::io;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Instant;

use discortp::discord::{IpDiscoveryPacket, IpDiscoveryType, MutableIpDiscoveryPacket, MutableKeepalivePacket};
use discortp::wrap::{Wrap16, Wrap32};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use crate::constants::{IP_DISCOVERY_TIMEOUT, UDP_KEEPALIVE_INTERVAL};
use crate::error::{Result, VoiceError};

#[derive(Debug, Clone)]
pub struct IpDiscoveryResult {
  pub address: IpAddr,
  pub port: u16
}

/// Connected datagram endpoint towards the voice server, carrying the RTP
/// counters for the whole session.
///
/// The counters deliberately survive track changes: the receiver sees one
/// continuous RTP stream per session.
#[derive(Debug)]
pub struct UdpVoiceConnection {
  pub socket: UdpSocket,
  keepalive_time: Instant,

  pub sequence: Wrap16,
  pub timestamp: Wrap32,
  pub nonce: u32
}

impl UdpVoiceConnection {
  pub async fn connect(ip: &str, port: u16) -> Result<Self> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((ip, port)).await?;

    Ok(Self {
      socket,
      keepalive_time: Instant::now(),

      sequence: 0u16.into(),
      timestamp: 0u32.into(),
      nonce: 0
    })
  }

  /// Runs the 74-byte IP discovery round trip, yielding the external
  /// address the voice server sees. Datagrams that are not a discovery
  /// response are skipped; the whole exchange times out after 5 seconds.
  pub async fn discover_ip(&mut self, ssrc: u32) -> Result<IpDiscoveryResult> {
    let mut buffer = [0u8; IpDiscoveryPacket::const_packet_size()];
    {
      let mut view = MutableIpDiscoveryPacket::new(&mut buffer).unwrap(); // buffer is exactly one packet
      view.set_pkt_type(IpDiscoveryType::Request);
      view.set_length(70);
      view.set_ssrc(ssrc);
    }
    self.socket.send(&buffer).await?;

    timeout(IP_DISCOVERY_TIMEOUT, self.await_discovery_response(&mut buffer))
      .await
      .map_err(|_| VoiceError::IpDiscoveryTimeout)?
  }

  async fn await_discovery_response(
    &self,
    buffer: &mut [u8; IpDiscoveryPacket::const_packet_size()]
  ) -> Result<IpDiscoveryResult> {
    loop {
      let (length, _address) = self.socket.recv_from(buffer).await?;
      if length != IpDiscoveryPacket::const_packet_size() {
        continue;
      }

      let view = IpDiscoveryPacket::new(&buffer[..length]).unwrap(); // length checked above
      if view.get_pkt_type() != IpDiscoveryType::Response {
        continue;
      }

      let address_raw = view.get_address_raw();
      let terminator = address_raw.iter().position(|&byte| byte == 0).unwrap_or(address_raw.len());
      let address = std::str::from_utf8(&address_raw[..terminator])
        .ok()
        .and_then(|address| IpAddr::from_str(address).ok())
        .ok_or_else(|| {
          VoiceError::Server(io::Error::new(io::ErrorKind::InvalidData, "malformed ip discovery address"))
        })?;

      return Ok(IpDiscoveryResult {
        address,
        port: view.get_port()
      });
    }
  }

  /// NAT keepalive, sent at most once per interval. Call it from the send
  /// path; it is a no-op while the interval has not elapsed.
  pub async fn send_keepalive_if_due(&mut self, ssrc: u32) -> Result<()> {
    if Instant::now() < self.keepalive_time + UDP_KEEPALIVE_INTERVAL {
      return Ok(());
    }

    let mut buffer = [0u8; MutableKeepalivePacket::minimum_packet_size()];
    let mut view = MutableKeepalivePacket::new(&mut buffer).unwrap(); // buffer is exactly one packet
    view.set_ssrc(ssrc);

    self.keepalive_time = Instant::now();
    self.socket.send(&buffer).await?;
    debug!("sent udp keepalive");

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use tokio::net::UdpSocket;

  use super::*;

  fn discovery_response(address: &str, port: u16) -> [u8; 74] {
    let mut response = [0u8; 74];
    response[0..2].copy_from_slice(&0x0002u16.to_be_bytes());
    response[2..4].copy_from_slice(&70u16.to_be_bytes());
    response[8..8 + address.len()].copy_from_slice(address.as_bytes());
    response[72..74].copy_from_slice(&port.to_be_bytes());
    response
  }

  #[tokio::test]
  async fn discovery_round_trip_parses_address_and_port() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_address = server.local_addr().unwrap();

    let responder = tokio::spawn(async move {
      let mut buffer = [0u8; 74];
      let (length, client) = server.recv_from(&mut buffer).await.unwrap();

      // Validate the request shape before answering.
      assert_eq!(length, 74);
      assert_eq!(u16::from_be_bytes([buffer[0], buffer[1]]), 0x0001);
      assert_eq!(u16::from_be_bytes([buffer[2], buffer[3]]), 70);
      assert_eq!(u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]), 0xDEAD);

      // Noise first: too-short datagrams must be skipped.
      server.send_to(b"junk", client).await.unwrap();
      server.send_to(&discovery_response("1.2.3.4", 50000), client).await.unwrap();
    });

    let mut connection = UdpVoiceConnection::connect("127.0.0.1", server_address.port()).await.unwrap();
    let discovered = connection.discover_ip(0xDEAD).await.unwrap();

    assert_eq!(discovered.address.to_string(), "1.2.3.4");
    assert_eq!(discovered.port, 50000);
    responder.await.unwrap();
  }

  #[tokio::test]
  async fn discovery_times_out_without_a_response() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();

    let mut connection = UdpVoiceConnection::connect("127.0.0.1", port).await.unwrap();
    assert!(matches!(
      connection.discover_ip(1).await,
      Err(VoiceError::IpDiscoveryTimeout)
    ));
  }
}
