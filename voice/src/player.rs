use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::select;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use utils::state_flow::StateFlow;

use crate::config::VoiceConfig;
use crate::constants::FRAME_DURATION;
use crate::encoder::EncoderPool;
use crate::error::Result;
use crate::source::AudioSource;
use crate::store::FrameStore;
use crate::VoiceConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEventKind {
  AudioBegin,
  AudioEnd
}

/// Emitted around every track, including tracks that errored: observers rely
/// on begin/end pairing.
#[derive(Debug, Clone)]
pub struct PlayerEvent {
  pub kind: PlayerEventKind,
  pub guild_id: u64,
  pub channel_id: u64,
  pub source: AudioSource
}

/// Control state of the track currently on air, guarded by the player lock
/// and waited on through the flow latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
  Running,
  Paused,
  Skipping,
  Ended
}

#[derive(Default)]
struct PlayerQueues {
  queue: VecDeque<AudioSource>,
  history: VecDeque<AudioSource>,
  direct: Option<AudioSource>,
  current: Option<AudioSource>
}

/// Pulls Opus frames out of a track's frame store and paces them onto the
/// UDP transport at one frame per 20 ms against a monotonic clock.
///
/// Tracks come from an ordered queue, a one-shot direct slot (immediate
/// playback) and a bounded history ring. RTP counters live on the transport
/// and are never reset between tracks.
pub struct AudioPlayer {
  connection: Arc<VoiceConnection>,
  pool: Arc<EncoderPool>,
  config: Arc<VoiceConfig>,
  guild_id: u64,
  channel_id: u64,

  state: StateFlow<PlayState>,
  track_completed: AtomicBool,
  queues: Mutex<PlayerQueues>,
  task: StdMutex<Option<JoinHandle<()>>>,
  events: flume::Sender<PlayerEvent>,
  store_id: AtomicU64
}

impl AudioPlayer {
  pub fn new(
    connection: Arc<VoiceConnection>,
    pool: Arc<EncoderPool>,
    config: Arc<VoiceConfig>,
    guild_id: u64,
    channel_id: u64,
    events: flume::Sender<PlayerEvent>
  ) -> Self {
    Self {
      connection,
      pool,
      config,
      guild_id,
      channel_id,

      state: StateFlow::new(PlayState::Ended),
      track_completed: AtomicBool::new(false),
      queues: Mutex::new(PlayerQueues::default()),
      task: StdMutex::new(None),
      events,
      store_id: AtomicU64::new(0)
    }
  }

  /// Appends a source to the back of the queue, starting playback if idle.
  pub async fn add_queue(self: &Arc<Self>, source: AudioSource) {
    {
      let mut queues = self.queues.lock().await;
      queues.queue.push_back(source);
    }
    self.ensure_task();
  }

  /// Removes the first queued source equal to [source], if any.
  pub async fn remove_queue(self: &Arc<Self>, source: &AudioSource) {
    let mut queues = self.queues.lock().await;
    if let Some(position) = queues.queue.iter().position(|queued| queued == source) {
      queues.queue.remove(position);
    }
  }

  pub async fn clear_queue(self: &Arc<Self>) {
    self.queues.lock().await.queue.clear();
  }

  /// Plays [source] immediately, preempting the current track. The skipped
  /// track still lands in history.
  pub async fn play(self: &Arc<Self>, source: AudioSource) {
    {
      let mut queues = self.queues.lock().await;
      queues.direct = Some(source);
      if queues.current.is_some() {
        self.state.set(PlayState::Skipping);
      }
    }
    self.ensure_task();
  }

  /// Skips the current track and advances the queue.
  pub async fn next(self: &Arc<Self>) {
    let queues = self.queues.lock().await;
    if queues.current.is_some() {
      self.state.set(PlayState::Skipping);
    }
  }

  /// Re-queues the most recent history entry at the front and skips to it.
  pub async fn previous(self: &Arc<Self>) {
    {
      let mut queues = self.queues.lock().await;
      let Some(previous) = queues.history.pop_back() else {
        return;
      };
      queues.queue.push_front(previous);
      if queues.current.is_some() {
        self.state.set(PlayState::Skipping);
      }
    }
    self.ensure_task();
  }

  /// Pauses playback. The track emits a silence burst and holds its RTP
  /// counters until [`resume`](Self::resume).
  pub async fn pause(self: &Arc<Self>) {
    if self.state.get() == PlayState::Running {
      self.state.set(PlayState::Paused);
    }

    if let Err(error) = self.connection.set_speaking(false).await {
      warn!("failed to clear speaking state on pause: {error}");
    }
  }

  pub async fn resume(self: &Arc<Self>) {
    if let Err(error) = self.connection.set_speaking(true).await {
      warn!("failed to set speaking state on resume: {error}");
    }

    if self.state.get() == PlayState::Paused {
      self.state.set(PlayState::Running);
    }
  }

  /// Stops playback and clears the queue, direct slot and current track.
  /// The stopped track is not recorded in history.
  pub async fn stop(self: &Arc<Self>) {
    {
      let mut queues = self.queues.lock().await;
      queues.queue.clear();
      queues.direct = None;
      queues.current = None;
    }
    self.state.set(PlayState::Ended);

    if let Err(error) = self.connection.set_speaking(false).await {
      warn!("failed to clear speaking state on stop: {error}");
    }
  }

  pub async fn queue(&self) -> Vec<AudioSource> {
    self.queues.lock().await.queue.iter().cloned().collect()
  }

  pub async fn history(&self) -> Vec<AudioSource> {
    self.queues.lock().await.history.iter().cloned().collect()
  }

  pub async fn current(&self) -> Option<AudioSource> {
    self.queues.lock().await.current.clone()
  }

  fn ensure_task(self: &Arc<Self>) {
    let mut task = self.task.lock().unwrap();
    let running = task.as_ref().map_or(false, |task| !task.is_finished());
    if !running {
      let player = self.clone();
      *task = Some(tokio::spawn(async move {
        player.run_queue_loop().await;
      }));
    }
  }

  async fn run_queue_loop(self: Arc<Self>) {
    loop {
      let source = {
        let mut queues = self.queues.lock().await;
        let source = match queues.direct.take() {
          Some(direct) => Some(direct),
          None => queues.queue.pop_front()
        };

        let Some(source) = source else {
          queues.current = None;
          return;
        };
        queues.current = Some(source.clone());
        source
      };

      let result = self.play_track(&source).await;
      if let Err(error) = &result {
        warn!("error during playback: {error}");
      }

      let state = self.state.get();
      {
        let mut queues = self.queues.lock().await;
        self.emit(PlayerEventKind::AudioEnd, source.clone());

        let completed = result.is_ok() && self.track_completed.load(Ordering::Acquire);
        let skipped = state == PlayState::Skipping;
        if completed || skipped {
          queues.history.push_back(source);
          while queues.history.len() > self.config.player.max_history {
            queues.history.pop_front();
          }
        }
      }
    }
  }

  async fn play_track(&self, source: &AudioSource) -> Result<()> {
    self.state.set(PlayState::Running);
    self.track_completed.store(false, Ordering::Release);

    self.connection.wait_until_ready().await;

    let result = self.stream_frames(source).await;

    // Flush silence and drop the speaking flag even for a failed track.
    if let Err(error) = self.connection.send_silence_frames().await {
      warn!("failed to send trailing silence: {error}");
    }
    if let Err(error) = self.connection.set_speaking(false).await {
      warn!("failed to clear speaking state: {error}");
    }

    result
  }

  async fn stream_frames(&self, source: &AudioSource) -> Result<()> {
    self.connection.set_speaking(true).await?;

    let store = Arc::new(FrameStore::new(&self.config.frame_store, self.spill_dir()));
    self.pool.submit(source.clone(), store.clone()).await?;

    self.emit(PlayerEventKind::AudioBegin, source.clone());

    let mut start_time = Instant::now();
    let mut frame_count: u32 = 0;

    loop {
      match self.state.get() {
        PlayState::Skipping | PlayState::Ended => break,
        PlayState::Paused => {
          self.connection.send_silence_frames().await?;
          self.state.wait_for(|state| *state != PlayState::Paused).await;

          // Re-anchor the clock so resume does not burst to catch up.
          start_time = Instant::now();
          frame_count = 0;
          continue;
        }
        PlayState::Running => {}
      }

      let frame = select! {
        frame = store.fetch_frame() => frame,
        _ = self.state.wait_for(|state| matches!(state, PlayState::Skipping | PlayState::Ended)) => continue
      };

      let Some(opus) = frame else {
        self.track_completed.store(true, Ordering::Release);
        break;
      };

      self.connection.send_audio_frame(&opus).await?;
      frame_count += 1;

      let target = start_time + FRAME_DURATION * frame_count;
      let now = Instant::now();
      if now < target {
        spin_sleep::sleep(target - now);
      } else if now - target > FRAME_DURATION {
        debug!("frame {} is {:?} behind schedule", frame_count, now - target);
      }
    }

    Ok(())
  }

  /// Every track gets a private spill directory; chunk indices are only
  /// unique within one store.
  fn spill_dir(&self) -> PathBuf {
    let id = self.store_id.fetch_add(1, Ordering::Relaxed);
    self.config.cache_dir.join(format!("{}-{}", self.guild_id, id))
  }

  fn emit(&self, kind: PlayerEventKind, source: AudioSource) {
    let _ = self.events.try_send(PlayerEvent {
      kind,
      guild_id: self.guild_id,
      channel_id: self.channel_id,
      source
    });
  }
}
