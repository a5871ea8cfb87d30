pub mod close_code;
pub mod config;
pub mod connection;
pub mod constants;
pub mod crypto;
pub mod encoder;
pub mod error;
pub mod event;
pub mod opcode;
pub mod player;
pub mod source;
pub mod store;
pub mod udp;
pub mod ws;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use discortp::rtp::{MutableRtpPacket, RtpType};
use tokio::select;
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, info, warn};
use utils::state_flow::StateFlow;

pub use crate::config::VoiceConfig;
pub use crate::connection::{Connection, PendingConnection};
pub use crate::crypto::EncryptionMode;
pub use crate::error::{Result, VoiceError};
pub use crate::event::*;
pub use crate::opcode::*;
pub use crate::player::{AudioPlayer, PlayState, PlayerEvent, PlayerEventKind};
pub use crate::source::{AudioSource, Volume};

use crate::close_code::GatewayCloseCode;
use crate::constants::{
  OPUS_SILENCE_FRAME, OPUS_SILENCE_FRAMES, RTP_HEADER_SIZE, RTP_PAYLOAD_TYPE, SAMPLES_PER_FRAME,
  SPEAKING_MICROPHONE, SPEAKING_NONE
};
use crate::crypto::Cipher;
use crate::udp::{IpDiscoveryResult, UdpVoiceConnection};
use crate::ws::WebSocketVoiceConnection;

#[derive(Debug, Clone)]
pub struct VoiceConnectionOptions {
  pub user_id: u64,
  pub guild_id: u64,

  pub endpoint: String,
  pub token: String,
  pub session_id: String
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum VoiceConnectionState {
  Disconnected,
  Connecting,
  Identified,
  Ready,
  IpDiscovering,
  ProtocolSelected,
  SessionReady,
  Closed
}

/// One authenticated voice session: control-plane WebSocket, data-plane UDP
/// transport and the negotiated session cipher.
///
/// [`connect`](Self::connect) drives the whole handshake and returns once
/// the session key arrived; afterwards [`run_ws_loop`](Self::run_ws_loop)
/// keeps heartbeats and server events flowing.
pub struct VoiceConnection {
  pub ws: RwLock<Option<WebSocketVoiceConnection>>,
  pub udp: Mutex<Option<UdpVoiceConnection>>,
  pub(crate) cipher: Mutex<Option<Cipher>>,

  pub state: StateFlow<VoiceConnectionState>,
  /// Cleared after two consecutive unacknowledged heartbeats.
  pub healthy: StateFlow<bool>,
  pub(crate) ready_to_send: StateFlow<bool>,

  options: StdMutex<Option<VoiceConnectionOptions>>,
  ssrc: AtomicU32,
  mode: StdMutex<Option<EncryptionMode>>,
  external_address: StdMutex<Option<IpDiscoveryResult>>,
  heartbeat_interval: StdMutex<Option<Duration>>,
  server_sequence: Arc<AtomicU64>,
  running: AtomicBool,
  speaking: AtomicBool
}

impl VoiceConnection {
  pub fn new() -> Self {
    Self {
      ws: RwLock::new(None),
      udp: Mutex::new(None),
      cipher: Mutex::new(None),

      state: StateFlow::new(VoiceConnectionState::Disconnected),
      healthy: StateFlow::new(true),
      ready_to_send: StateFlow::new(false),

      options: StdMutex::new(None),
      ssrc: AtomicU32::new(0),
      mode: StdMutex::new(None),
      external_address: StdMutex::new(None),
      heartbeat_interval: StdMutex::new(None),
      server_sequence: Arc::new(AtomicU64::new(0)),
      running: AtomicBool::new(false),
      speaking: AtomicBool::new(false)
    }
  }

  pub fn ssrc(&self) -> u32 {
    self.ssrc.load(Ordering::Acquire)
  }

  pub fn is_connected(&self) -> bool {
    !matches!(
      self.state.get(),
      VoiceConnectionState::Disconnected | VoiceConnectionState::Closed
    )
  }

  /// External address the voice server sees for us, once discovered.
  pub fn external_address(&self) -> Option<IpDiscoveryResult> {
    self.external_address.lock().unwrap().clone()
  }

  pub async fn latency(&self) -> Option<Duration> {
    self.ws.read().await.as_ref().and_then(|ws| ws.latency())
  }

  pub(crate) async fn wait_until_ready(&self) {
    self.ready_to_send.wait_for(|ready| *ready).await;
  }

  /// Runs the full handshake: identify, hello/ready, IP discovery, protocol
  /// selection. Returns once the session description delivered the secret
  /// key and audio may flow.
  pub async fn connect(&self, options: VoiceConnectionOptions) -> Result<()> {
    self.state.set(VoiceConnectionState::Connecting);
    self.running.store(true, Ordering::Release);

    debug!("connecting to voice gateway {}", options.endpoint);
    let ws = WebSocketVoiceConnection::connect(&options.endpoint, self.server_sequence.clone()).await?;

    ws.send(
      GatewayEvent::Identify(Identify {
        server_id: options.guild_id,
        user_id: options.user_id,
        session_id: options.session_id.clone(),
        token: options.token.clone()
      })
      .try_into()?
    )
    .await?;
    self.state.set(VoiceConnectionState::Identified);

    let (hello, ready) = Self::await_hello_and_ready(&ws).await?;
    *self.heartbeat_interval.lock().unwrap() =
      Some(Duration::from_millis(hello.heartbeat_interval.round() as u64));
    self.ssrc.store(ready.ssrc, Ordering::Release);

    let mode = EncryptionMode::negotiate(&ready.modes)?;
    *self.mode.lock().unwrap() = Some(mode);
    self.state.set(VoiceConnectionState::Ready);

    debug!("connecting to voice udp {}:{}", ready.ip, ready.port);
    self.state.set(VoiceConnectionState::IpDiscovering);
    let mut udp = UdpVoiceConnection::connect(&ready.ip, ready.port).await?;
    let discovered = udp.discover_ip(ready.ssrc).await?;
    debug!("external address discovered: {}:{}", discovered.address, discovered.port);

    *self.udp.lock().await = Some(udp);
    *self.external_address.lock().unwrap() = Some(discovered.clone());

    ws.send(
      GatewayEvent::SelectProtocol(SelectProtocol {
        protocol: "udp".to_owned(),
        data: SelectProtocolData {
          address: discovered.address,
          port: discovered.port,
          mode: mode.as_str().to_owned()
        }
      })
      .try_into()?
    )
    .await?;
    self.state.set(VoiceConnectionState::ProtocolSelected);

    let description = loop {
      // Undocumented opcodes show up here; skip anything undecodable.
      let event: GatewayEvent = match ws.receive().await?.try_into() {
        Ok(event) => event,
        Err(_) => continue
      };

      match event {
        GatewayEvent::SessionDescription(description) => break description,
        GatewayEvent::HeartbeatAck(_) | GatewayEvent::Speaking(_) | GatewayEvent::ClientDisconnect => continue,
        other => {
          warn!("expected SessionDescription packet, got: {:?}", other);
          return Err(VoiceError::Gateway("unexpected packet during protocol selection".to_owned()));
        }
      }
    };
    *self.cipher.lock().await = Some(Cipher::new(mode, &description.secret_key)?);

    *self.ws.write().await = Some(ws);
    *self.options.lock().unwrap() = Some(options);

    self.state.set(VoiceConnectionState::SessionReady);
    self.ready_to_send.set(true);
    self.healthy.set(true);

    Ok(())
  }

  async fn await_hello_and_ready(ws: &WebSocketVoiceConnection) -> Result<(Hello, Ready)> {
    let mut hello = None;
    let mut ready = None;

    while hello.is_none() || ready.is_none() {
      let event: GatewayEvent = match ws.receive().await?.try_into() {
        Ok(event) => event,
        Err(_) => continue
      };

      match event {
        GatewayEvent::Hello(it) => hello = Some(it),
        GatewayEvent::Ready(it) => ready = Some(it),
        other => {
          warn!("expected Ready / Hello packet, got: {:?}", other);
          return Err(VoiceError::Gateway("unexpected packet during handshake".to_owned()));
        }
      }
    }

    Ok((hello.unwrap(), ready.unwrap()))
  }

  /// Reconnects the gateway and resumes the existing session: same ssrc,
  /// same secret key, no IP discovery.
  pub async fn resume(&self) -> Result<()> {
    let options = self.options.lock().unwrap().clone().ok_or(VoiceError::Closed)?;

    let mut ws_lock = self.ws.write().await;
    debug!("resuming voice gateway session");
    let ws = WebSocketVoiceConnection::connect(&options.endpoint, self.server_sequence.clone()).await?;

    ws.send(
      GatewayEvent::Resume(Resume {
        server_id: options.guild_id,
        session_id: options.session_id.clone(),
        token: options.token.clone(),
        seq_ack: ws.last_sequence()
      })
      .try_into()?
    )
    .await?;

    *ws_lock = Some(ws);
    Ok(())
  }

  pub async fn set_speaking(&self, speaking: bool) -> Result<()> {
    let ws = self.ws.read().await;
    let Some(ws) = ws.as_ref() else {
      return Ok(());
    };

    ws.send(
      GatewayEvent::Speaking(Speaking {
        speaking: if speaking { SPEAKING_MICROPHONE } else { SPEAKING_NONE },
        delay: 0,
        ssrc: self.ssrc()
      })
      .try_into()?
    )
    .await?;

    self.speaking.store(speaking, Ordering::Release);
    debug!("set speaking to {}", speaking);
    Ok(())
  }

  /// Builds, seals and sends one RTP packet, then advances the session
  /// counters. This is the only writer of the UDP socket.
  pub async fn send_audio_frame(&self, opus: &[u8]) -> Result<()> {
    let mut udp_guard = self.udp.lock().await;
    let udp = udp_guard.as_mut().ok_or(VoiceError::Closed)?;
    let cipher_guard = self.cipher.lock().await;
    let cipher = cipher_guard.as_ref().ok_or(VoiceError::Closed)?;
    let ssrc = self.ssrc();

    let mut header = [0u8; RTP_HEADER_SIZE];
    {
      let mut view = MutableRtpPacket::new(&mut header).unwrap(); // buffer is exactly one header
      view.set_version(2);
      view.set_payload_type(RtpType::Unassigned(RTP_PAYLOAD_TYPE));
      view.set_sequence(udp.sequence);
      view.set_timestamp(udp.timestamp);
      view.set_ssrc(ssrc);
    }

    let packet = cipher.seal(&header, opus, udp.nonce)?;
    udp.socket.send(&packet).await?;

    udp.sequence += 1;
    udp.timestamp += SAMPLES_PER_FRAME;
    udp.nonce = udp.nonce.wrapping_add(1);

    udp.send_keepalive_if_due(ssrc).await?;
    Ok(())
  }

  /// Five raw silence frames, marking an audio gap for the receiver.
  pub async fn send_silence_frames(&self) -> Result<()> {
    let udp_guard = self.udp.lock().await;
    let udp = udp_guard.as_ref().ok_or(VoiceError::Closed)?;

    for _ in 0..OPUS_SILENCE_FRAMES {
      udp.socket.send(&OPUS_SILENCE_FRAME).await?;
    }
    Ok(())
  }

  /// Dispatches server events arriving outside the handshake.
  async fn handle_packet(&self, packet: GatewayPacket) {
    match GatewayEvent::try_from(packet) {
      Ok(GatewayEvent::HeartbeatAck(_)) => {
        if let Some(ws) = self.ws.read().await.as_ref() {
          ws.handle_heartbeat_ack();
        }
        self.healthy.set(true);
      }

      Ok(GatewayEvent::Resumed) => {
        debug!("voice gateway session resumed");
        self.state.set(VoiceConnectionState::SessionReady);
        self.ready_to_send.set(true);
        self.healthy.set(true);

        // The server forgets the speaking flag across a resume.
        if self.speaking.load(Ordering::Acquire) {
          if let Err(error) = self.set_speaking(true).await {
            warn!("failed to re-assert speaking state after resume: {error}");
          }
        }
      }

      Ok(GatewayEvent::SessionDescription(description)) => {
        let mode = *self.mode.lock().unwrap();
        let mode = mode.unwrap_or(EncryptionMode::AeadXChaCha20Poly1305RtpSize);
        match Cipher::new(mode, &description.secret_key) {
          Ok(cipher) => *self.cipher.lock().await = Some(cipher),
          Err(error) => warn!("rejected mid-session key update: {error}")
        }
      }

      Ok(GatewayEvent::Speaking(_)) | Ok(GatewayEvent::ClientDisconnect) => {}

      Ok(other) => {
        debug!("unhandled gateway event: {:?}", other);
      }

      Err(error) => {
        debug!("failed to decode gateway event: {error}");
      }
    }
  }

  /// Heartbeat and event loop for one gateway socket.
  ///
  /// Returns `Ok(true)` after transparently resuming (run it again) and
  /// `Ok(false)` once the session is over.
  pub async fn run_ws_loop(me: Weak<Self>) -> Result<bool> {
    let (read, close_rx, interval) = {
      let me = me.upgrade().ok_or(VoiceError::Closed)?;
      let ws = me.ws.read().await;
      let ws = ws.as_ref().ok_or(VoiceError::Closed)?;

      let interval = me.heartbeat_interval.lock().unwrap().ok_or(VoiceError::Closed)?;
      (ws.read.clone(), ws.close_rx.clone(), interval)
    };

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
      let Some(me) = me.upgrade() else {
        return Ok(false);
      };
      if !me.running.load(Ordering::Acquire) {
        return Ok(false);
      }

      select! {
        packet = read.recv_async() => {
          match packet {
            Ok(packet) => me.handle_packet(packet).await,
            Err(_) => break
          }
        }

        _ = ticker.tick() => {
          let ws = me.ws.read().await;
          let Some(ws) = ws.as_ref() else { break };

          if let Err(error) = ws.send_heartbeat().await {
            debug!("websocket send heartbeat error: {:?}", error);
            break;
          }
          if !ws.is_healthy() {
            warn!("voice gateway missed two heartbeat acks, flagging session");
            me.healthy.set(false);
          }
        }
      }
    }

    let Some(me) = me.upgrade() else {
      return Ok(false);
    };
    if !me.running.load(Ordering::Acquire) {
      return Ok(false);
    }

    let frame = close_rx.recv_async().await.ok().flatten();
    info!(?frame, "voice gateway closed");

    if let Some(frame) = frame {
      let code: GatewayCloseCode = u16::from(frame.code).into();
      if code.can_resume() {
        me.resume().await?;
        return Ok(true);
      }
    }

    me.ready_to_send.set(false);
    me.healthy.set(false);
    me.state.set(VoiceConnectionState::Closed);
    Ok(false)
  }

  /// Closes the gateway and transport. In-flight sends drop without error.
  pub async fn close(&self) -> Result<()> {
    self.running.store(false, Ordering::Release);
    self.ready_to_send.set(false);

    let mut ws_lock = self.ws.write().await;
    if let Some(ws) = ws_lock.take() {
      if !ws.is_closed() {
        ws.close(CloseFrame {
          code: CloseCode::Normal,
          reason: "".into()
        })
        .await
        .ok();
      }
    }
    drop(ws_lock);

    *self.udp.lock().await = None;
    *self.cipher.lock().await = None;

    self.state.set(VoiceConnectionState::Closed);
    Ok(())
  }

  #[cfg(test)]
  pub(crate) fn set_session_ready(&self, ssrc: u32) {
    self.ssrc.store(ssrc, Ordering::Release);
    self.state.set(VoiceConnectionState::SessionReady);
    self.ready_to_send.set(true);
  }
}

#[cfg(test)]
pub(crate) mod test_gateway {
  use flume::Receiver;
  use futures_util::{SinkExt, StreamExt};
  use tokio::net::{TcpListener, TcpStream, UdpSocket};
  use tokio_tungstenite::tungstenite::Message;
  use tokio_tungstenite::WebSocketStream;

  use crate::event::*;
  use crate::opcode::GatewayOpcode;

  pub const MOCK_SSRC: u32 = 0xABCD1234;
  pub const MOCK_SECRET_KEY: [u8; 32] = [3u8; 32];

  /// In-process voice server good enough for the client handshake: answers
  /// IP discovery with `1.2.3.4:50000`, acknowledges heartbeats and
  /// collects everything sent over RTP.
  pub struct MockGateway {
    pub endpoint: String,
    pub udp_port: u16,
    pub select_protocol: Receiver<SelectProtocolData>,
    pub rtp: Receiver<Vec<u8>>
  }

  async fn send_event(socket: &mut WebSocketStream<TcpStream>, event: GatewayEvent) {
    let packet: GatewayPacket = event.try_into().unwrap();
    socket
      .send(Message::Text(serde_json::to_string(&packet).unwrap()))
      .await
      .unwrap();
  }

  async fn recv_event(socket: &mut WebSocketStream<TcpStream>) -> Option<GatewayEvent> {
    loop {
      match socket.next().await?.ok()? {
        Message::Text(json) => {
          let packet: GatewayPacket = serde_json::from_str(&json).ok()?;
          if let Ok(event) = GatewayEvent::try_from(packet) {
            return Some(event);
          }
        }
        Message::Close(_) => return None,
        _ => continue
      }
    }
  }

  pub async fn spawn(heartbeat_interval: f64, modes: Vec<String>) -> MockGateway {
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let udp_port = udp.local_addr().unwrap().port();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());

    let (select_tx, select_rx) = flume::unbounded();
    let (rtp_tx, rtp_rx) = flume::unbounded();

    tokio::spawn(async move {
      let mut buffer = [0u8; 1500];
      let mut discovered = false;
      loop {
        let Ok((length, client)) = udp.recv_from(&mut buffer).await else { break };

        if !discovered && length == 74 && buffer[..2] == [0x00, 0x01] {
          discovered = true;
          let mut response = [0u8; 74];
          response[0..2].copy_from_slice(&0x0002u16.to_be_bytes());
          response[2..4].copy_from_slice(&70u16.to_be_bytes());
          response[4..8].copy_from_slice(&MOCK_SSRC.to_be_bytes());
          response[8..15].copy_from_slice(b"1.2.3.4");
          response[72..74].copy_from_slice(&50000u16.to_be_bytes());
          let _ = udp.send_to(&response, client).await;
        } else if rtp_tx.send_async(buffer[..length].to_vec()).await.is_err() {
          break;
        }
      }
    });

    tokio::spawn(async move {
      let Ok((stream, _)) = listener.accept().await else { return };
      let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else { return };

      let Some(GatewayEvent::Identify(_)) = recv_event(&mut socket).await else {
        return;
      };

      send_event(&mut socket, GatewayEvent::Hello(Hello { heartbeat_interval })).await;
      send_event(
        &mut socket,
        GatewayEvent::Ready(Ready {
          ssrc: MOCK_SSRC,
          ip: "127.0.0.1".to_owned(),
          port: udp_port,
          modes
        })
      )
      .await;

      loop {
        match recv_event(&mut socket).await {
          Some(GatewayEvent::SelectProtocol(select)) => {
            let _ = select_tx.send_async(select.data).await;
            break;
          }
          Some(_) => continue,
          None => return
        }
      }

      send_event(
        &mut socket,
        GatewayEvent::SessionDescription(SessionDescription {
          mode: "aead_xchacha20_poly1305_rtpsize".to_owned(),
          secret_key: MOCK_SECRET_KEY.to_vec()
        })
      )
      .await;

      // Acknowledge heartbeats until the client goes away.
      while let Some(Ok(message)) = socket.next().await {
        let Message::Text(json) = message else { continue };
        let Ok(packet) = serde_json::from_str::<GatewayPacket>(&json) else { continue };

        if packet.opcode == GatewayOpcode::Heartbeat {
          let t = packet
            .data
            .as_ref()
            .and_then(|data| data["t"].as_u64())
            .unwrap_or(0);
          send_event(&mut socket, GatewayEvent::HeartbeatAck(HeartbeatAck { t })).await;
        }
      }
    });

    MockGateway {
      endpoint,
      udp_port,
      select_protocol: select_rx,
      rtp: rtp_rx
    }
  }

  pub fn supported_modes() -> Vec<String> {
    vec![
      "aead_aes256_gcm_rtpsize".to_owned(),
      "aead_xchacha20_poly1305_rtpsize".to_owned(),
      "xsalsa20_poly1305".to_owned(),
    ]
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::time::Duration;

  use super::test_gateway::{self, MOCK_SSRC};
  use super::*;

  fn options(endpoint: &str) -> VoiceConnectionOptions {
    VoiceConnectionOptions {
      user_id: 1,
      guild_id: 2,
      endpoint: endpoint.to_owned(),
      token: "token".to_owned(),
      session_id: "session".to_owned()
    }
  }

  #[tokio::test]
  async fn handshake_reaches_session_ready() {
    let mock = test_gateway::spawn(45000.0, test_gateway::supported_modes()).await;

    let connection = Arc::new(VoiceConnection::new());
    connection.connect(options(&mock.endpoint)).await.unwrap();

    assert_eq!(connection.state.get(), VoiceConnectionState::SessionReady);
    assert_eq!(connection.ssrc(), MOCK_SSRC);

    // The discovered external address flows into SelectProtocol verbatim,
    // with the first mutually supported mode.
    let select = mock.select_protocol.recv_async().await.unwrap();
    assert_eq!(select.address.to_string(), "1.2.3.4");
    assert_eq!(select.port, 50000);
    assert_eq!(select.mode, "aead_xchacha20_poly1305_rtpsize");

    let external = connection.external_address().unwrap();
    assert_eq!(external.port, 50000);

    connection.close().await.unwrap();
    assert_eq!(connection.state.get(), VoiceConnectionState::Closed);
  }

  #[tokio::test]
  async fn handshake_fails_without_common_encryption_mode() {
    let mock = test_gateway::spawn(45000.0, vec!["xsalsa20_poly1305_lite".to_owned()]).await;

    let connection = VoiceConnection::new();
    assert!(matches!(
      connection.connect(options(&mock.endpoint)).await,
      Err(VoiceError::EncryptionModeNotSupported)
    ));
  }

  #[tokio::test]
  async fn heartbeat_loop_measures_latency() {
    let mock = test_gateway::spawn(120.0, test_gateway::supported_modes()).await;

    let connection = Arc::new(VoiceConnection::new());
    connection.connect(options(&mock.endpoint)).await.unwrap();

    let run = tokio::spawn(VoiceConnection::run_ws_loop(Arc::downgrade(&connection)));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(connection.latency().await.is_some());
    assert!(connection.healthy.get());

    connection.close().await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(2), run).await;
  }
}
