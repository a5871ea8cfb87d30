use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime};

use flume::{Receiver, Sender};
use futures_util::{SinkExt, StreamExt};
use tokio::select;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::constants::GATEWAY_VERSION;
use crate::error::{Result, VoiceError};
use crate::event::{GatewayEvent, GatewayPacket, Heartbeat};

/// Unacknowledged heartbeats after which the session counts as unhealthy.
const MISSED_ACK_LIMIT: u32 = 2;

#[derive(Default)]
struct HeartbeatState {
  sent_at: Option<Instant>,
  outstanding: bool,
  missed: u32,
  latency: Option<Duration>
}

/// Voice gateway socket plus its IO task.
///
/// The socket itself lives in a spawned task; callers talk to it through
/// channels, which keeps a single writer on the wire no matter how many
/// tasks send. Incoming packets update the shared server sequence before
/// they are handed to the reader.
pub struct WebSocketVoiceConnection {
  pub read: Receiver<GatewayPacket>,
  write: Sender<GatewayPacket>,
  close_tx: Sender<CloseFrame<'static>>,
  pub close_rx: Receiver<Option<CloseFrame<'static>>>,

  closed: Arc<AtomicBool>,
  server_sequence: Arc<AtomicU64>,
  heartbeat: StdMutex<HeartbeatState>
}

impl WebSocketVoiceConnection {
  /// Opens the socket to `wss://{endpoint}/?v=8`. No handshake traffic is
  /// sent; the caller drives identify/resume.
  pub async fn connect(endpoint: &str, server_sequence: Arc<AtomicU64>) -> Result<Self> {
    let url = if endpoint.contains("://") {
      format!("{endpoint}/?v={GATEWAY_VERSION}")
    } else {
      format!("wss://{endpoint}/?v={GATEWAY_VERSION}")
    };

    let (mut socket, _) = connect_async(url).await?;
    debug!("voice gateway connected");

    let (read_tx, read_rx) = flume::unbounded();
    let (write_tx, write_rx) = flume::unbounded::<GatewayPacket>();
    let (close_tx_tx, close_tx_rx) = flume::bounded::<CloseFrame<'static>>(1);
    let (close_rx_tx, close_rx_rx) = flume::unbounded();

    let closed = Arc::new(AtomicBool::new(false));
    let sequence = server_sequence.clone();

    let task_closed = closed.clone();
    tokio::spawn(async move {
      loop {
        select! {
          message = socket.next() => {
            match message {
              Some(Ok(Message::Text(json))) => {
                debug!("< {}", json);
                match serde_json::from_str::<GatewayPacket>(&json) {
                  Ok(packet) => {
                    if let Some(value) = packet.sequence {
                      sequence.store(value, Ordering::Release);
                    }
                    if read_tx.send_async(packet).await.is_err() {
                      break;
                    }
                  }
                  Err(error) => warn!("failed to decode gateway payload: {error}")
                }
              }

              Some(Ok(Message::Close(frame))) => {
                debug!("voice gateway closed with {:?}", frame);
                let _ = close_rx_tx.send_async(frame).await;
                break;
              }

              Some(Ok(other)) => {
                warn!("unknown voice gateway frame {:?}", other);
              }

              Some(Err(error)) => {
                debug!("voice gateway read error: {:?}", error);
                let _ = close_rx_tx.send_async(None).await;
                break;
              }

              None => {
                let _ = close_rx_tx.send_async(None).await;
                break;
              }
            }
          }

          packet = write_rx.recv_async() => {
            let Ok(packet) = packet else { break };
            let json = match serde_json::to_string(&packet) {
              Ok(json) => json,
              Err(error) => {
                warn!("failed to encode gateway packet: {error}");
                continue;
              }
            };
            debug!("> {}", json);

            if socket.send(Message::Text(json)).await.is_err() {
              let _ = close_rx_tx.send_async(None).await;
              break;
            }
            let _ = socket.flush().await;
          }

          frame = close_tx_rx.recv_async() => {
            let Ok(frame) = frame else { break };
            let _ = socket.close(Some(frame)).await;
          }
        }
      }

      task_closed.store(true, Ordering::Release);
    });

    Ok(Self {
      read: read_rx,
      write: write_tx,
      close_tx: close_tx_tx,
      close_rx: close_rx_rx,

      closed,
      server_sequence,
      heartbeat: StdMutex::new(HeartbeatState::default())
    })
  }

  pub async fn send(&self, packet: GatewayPacket) -> Result<()> {
    self.write.send_async(packet).await.map_err(|_| VoiceError::Closed)
  }

  pub async fn receive(&self) -> Result<GatewayPacket> {
    self.read.recv_async().await.map_err(|_| VoiceError::Closed)
  }

  /// Sends a heartbeat carrying the wall-clock time and the latest server
  /// sequence (`0` if none was seen yet).
  pub async fn send_heartbeat(&self) -> Result<()> {
    let t = SystemTime::now()
      .duration_since(SystemTime::UNIX_EPOCH)
      .unwrap_or_default()
      .as_millis() as u64;

    {
      let mut heartbeat = self.heartbeat.lock().unwrap();
      if heartbeat.outstanding {
        heartbeat.missed += 1;
        warn!("voice gateway heartbeat unacknowledged ({} missed)", heartbeat.missed);
      }
      heartbeat.outstanding = true;
      heartbeat.sent_at = Some(Instant::now());
    }

    self
      .send(
        GatewayEvent::Heartbeat(Heartbeat {
          t,
          seq_ack: self.last_sequence()
        })
        .try_into()?
      )
      .await?;
    debug!("sent gateway heartbeat");

    Ok(())
  }

  pub fn handle_heartbeat_ack(&self) {
    let mut heartbeat = self.heartbeat.lock().unwrap();
    if let Some(sent_at) = heartbeat.sent_at {
      heartbeat.latency = Some(sent_at.elapsed());
    }
    heartbeat.outstanding = false;
    heartbeat.missed = 0;
  }

  /// Round-trip time of the last acknowledged heartbeat.
  pub fn latency(&self) -> Option<Duration> {
    self.heartbeat.lock().unwrap().latency
  }

  /// False once [`MISSED_ACK_LIMIT`] heartbeats went unacknowledged; the
  /// caller is expected to reconnect.
  pub fn is_healthy(&self) -> bool {
    self.heartbeat.lock().unwrap().missed < MISSED_ACK_LIMIT
  }

  pub fn last_sequence(&self) -> u64 {
    self.server_sequence.load(Ordering::Acquire)
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  pub async fn close(&self, frame: CloseFrame<'_>) -> Result<()> {
    self
      .close_tx
      .send_async(frame.into_owned())
      .await
      .map_err(|_| VoiceError::Closed)
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicU64;
  use std::sync::Arc;

  use futures_util::{SinkExt, StreamExt};
  use tokio::net::TcpListener;
  use tokio_tungstenite::tungstenite::Message;

  use super::*;
  use crate::event::Speaking;
  use crate::opcode::GatewayOpcode;

  async fn local_gateway() -> (String, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    (endpoint, listener)
  }

  #[tokio::test]
  async fn tracks_server_sequence_and_relays_packets() {
    let (endpoint, listener) = local_gateway().await;

    let server = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();

      socket
        .send(Message::Text(
          r#"{"op":5,"d":{"speaking":1,"delay":0,"ssrc":9},"s":5}"#.to_owned()
        ))
        .await
        .unwrap();

      // Expect one speaking packet back from the client.
      loop {
        match socket.next().await.unwrap().unwrap() {
          Message::Text(json) => break serde_json::from_str::<GatewayPacket>(&json).unwrap(),
          _ => continue
        }
      }
    });

    let connection = WebSocketVoiceConnection::connect(&endpoint, Arc::new(AtomicU64::new(0)))
      .await
      .unwrap();

    let packet = connection.receive().await.unwrap();
    assert_eq!(packet.opcode, GatewayOpcode::Speaking);
    assert_eq!(connection.last_sequence(), 5);

    connection
      .send(
        GatewayEvent::Speaking(Speaking {
          speaking: 1,
          delay: 0,
          ssrc: 1
        })
        .try_into()
        .unwrap()
      )
      .await
      .unwrap();

    let echoed = server.await.unwrap();
    assert_eq!(echoed.opcode, GatewayOpcode::Speaking);
  }

  #[tokio::test]
  async fn heartbeat_health_degrades_after_two_missed_acks() {
    let (endpoint, listener) = local_gateway().await;

    let server = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
      let mut heartbeats = Vec::new();
      while let Some(Ok(Message::Text(json))) = socket.next().await {
        heartbeats.push(serde_json::from_str::<GatewayPacket>(&json).unwrap());
        if heartbeats.len() == 4 {
          break;
        }
      }
      heartbeats
    });

    let connection = WebSocketVoiceConnection::connect(&endpoint, Arc::new(AtomicU64::new(7)))
      .await
      .unwrap();

    connection.send_heartbeat().await.unwrap();
    assert!(connection.is_healthy());

    connection.handle_heartbeat_ack();
    assert!(connection.latency().is_some());
    assert!(connection.is_healthy());

    // Two heartbeats in a row without acknowledgement.
    connection.send_heartbeat().await.unwrap();
    connection.send_heartbeat().await.unwrap();
    assert!(connection.is_healthy());
    connection.send_heartbeat().await.unwrap();
    assert!(!connection.is_healthy());

    let heartbeats = server.await.unwrap();
    assert_eq!(heartbeats[0].opcode, GatewayOpcode::Heartbeat);
    assert_eq!(heartbeats[0].data.as_ref().unwrap()["seq_ack"], 7);
  }
}
