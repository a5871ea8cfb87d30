use std::io;

use thiserror::Error;

use crate::close_code::GatewayCloseCode;

/// Everything that can go wrong inside the voice subsystem.
///
/// Handshake-phase values surface out of [`VoiceConnection::connect`];
/// mid-session gateway failures close the socket and leave recovery to the
/// caller, encoder failures terminate the current track only.
///
/// [`VoiceConnection::connect`]: crate::VoiceConnection::connect
#[derive(Debug, Error)]
pub enum VoiceError {
  #[error("voice gateway error: {0}")]
  Gateway(String),

  #[error("voice gateway closed: {0}")]
  GatewayClosed(GatewayCloseCode),

  #[error("voice server error")]
  Server(#[from] io::Error),

  #[error("no supported encryption mode was advertised")]
  EncryptionModeNotSupported,

  #[error("ip discovery timed out")]
  IpDiscoveryTimeout,

  #[error("failed to spawn transcoder process")]
  TranscoderSpawnFailed(#[source] io::Error),

  #[error("unexpected transcoder output: {0}")]
  TranscoderUnexpectedOutput(&'static str),

  #[error("audio source type is not supported: {0}")]
  SourceTypeUnsupported(String),

  #[error("audio source does not exist: {0}")]
  SourceNotFound(String),

  #[error("packet encryption failed")]
  Encryption,

  #[error("websocket error")]
  WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

  #[error("malformed gateway payload")]
  Payload(#[from] serde_json::Error),

  #[error("connection is closed")]
  Closed
}

pub type Result<T> = std::result::Result<T, VoiceError>;
