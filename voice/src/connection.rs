use std::sync::{Arc, Mutex as StdMutex};

use flume::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::VoiceConfig;
use crate::encoder::EncoderPool;
use crate::error::Result;
use crate::player::{AudioPlayer, PlayerEvent};
use crate::source::AudioSource;
use crate::{VoiceConnection, VoiceConnectionOptions, VoiceConnectionState};

/// Rendezvous for the two gateway events that precede a voice connection.
///
/// The host forwards its own voice state update (session id) and the voice
/// server update (endpoint + token); once both halves are present the
/// connection can be activated.
#[derive(Debug, Default, Clone)]
pub struct PendingConnection {
  pub endpoint: Option<String>,
  pub session_id: Option<String>,
  pub token: Option<String>
}

impl PendingConnection {
  pub fn is_complete(&self) -> bool {
    self.endpoint.is_some() && self.session_id.is_some() && self.token.is_some()
  }
}

/// Binds one guild to a voice session, an encoder pool and a player.
pub struct Connection {
  pub user_id: u64,
  pub guild_id: u64,
  pub channel_id: u64,

  pub voice: Arc<VoiceConnection>,
  pub pool: Arc<EncoderPool>,
  player: Arc<AudioPlayer>,

  pending: StdMutex<PendingConnection>,
  ws_task: StdMutex<Option<JoinHandle<()>>>,

  /// Begin/end notifications for every track this connection plays.
  pub events: Receiver<PlayerEvent>
}

impl Connection {
  pub fn new(config: VoiceConfig, user_id: u64, guild_id: u64, channel_id: u64) -> Arc<Self> {
    let config = Arc::new(config);
    let (events_tx, events_rx) = flume::unbounded();

    let voice = Arc::new(VoiceConnection::new());
    let pool = Arc::new(EncoderPool::new(config.clone()));
    let player = Arc::new(AudioPlayer::new(
      voice.clone(),
      pool.clone(),
      config,
      guild_id,
      channel_id,
      events_tx
    ));

    Arc::new(Self {
      user_id,
      guild_id,
      channel_id,

      voice,
      pool,
      player,

      pending: StdMutex::new(PendingConnection::default()),
      ws_task: StdMutex::new(None),

      events: events_rx
    })
  }

  /// Host callback: our own voice state update arrived on the main gateway.
  pub async fn on_voice_state_update(self: &Arc<Self>, session_id: String) -> Result<()> {
    let pending = {
      let mut pending = self.pending.lock().unwrap();
      pending.session_id = Some(session_id);
      pending.clone()
    };
    self.try_activate(pending).await
  }

  /// Host callback: the voice server rendezvous arrived on the main gateway.
  pub async fn on_voice_server_update(self: &Arc<Self>, endpoint: String, token: String) -> Result<()> {
    let pending = {
      let mut pending = self.pending.lock().unwrap();
      pending.endpoint = Some(endpoint);
      pending.token = Some(token);
      pending.clone()
    };
    self.try_activate(pending).await
  }

  async fn try_activate(self: &Arc<Self>, pending: PendingConnection) -> Result<()> {
    if !pending.is_complete() || self.voice.is_connected() {
      return Ok(());
    }

    self
      .connect(
        pending.endpoint.as_deref().unwrap(),
        pending.session_id.as_deref().unwrap(),
        pending.token.as_deref().unwrap()
      )
      .await
  }

  /// Drives the gateway handshake and opens the transport, blocking until
  /// the session description arrived. The heartbeat loop keeps running in
  /// the background afterwards.
  pub async fn connect(self: &Arc<Self>, endpoint: &str, session_id: &str, token: &str) -> Result<()> {
    let options = VoiceConnectionOptions {
      user_id: self.user_id,
      guild_id: self.guild_id,
      endpoint: endpoint.to_owned(),
      token: token.to_owned(),
      session_id: session_id.to_owned()
    };

    self.voice.connect(options).await?;
    debug!("voice session ready for guild {}", self.guild_id);

    let weak = Arc::downgrade(&self.voice);
    let task = tokio::spawn(async move {
      loop {
        match VoiceConnection::run_ws_loop(weak.clone()).await {
          Ok(true) => continue,
          Ok(false) => break,
          Err(error) => {
            warn!("voice ws loop error: {error}");
            break;
          }
        }
      }
    });
    *self.ws_task.lock().unwrap() = Some(task);

    Ok(())
  }

  pub fn player(&self) -> &Arc<AudioPlayer> {
    &self.player
  }

  /// Plays [source] immediately, preempting whatever is on air.
  pub async fn play(&self, source: AudioSource) {
    self.player.play(source).await;
  }

  pub fn state(&self) -> VoiceConnectionState {
    self.voice.state.get()
  }

  /// Stops playback, tears down the encoder pool, the heartbeat task, the
  /// WebSocket and the transport.
  pub async fn close(&self) -> Result<()> {
    self.player.stop().await;
    self.pool.stop().await;

    if let Some(task) = self.ws_task.lock().unwrap().take() {
      task.abort();
    }

    self.voice.close().await
  }
}
