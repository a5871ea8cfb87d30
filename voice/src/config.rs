use std::path::PathBuf;

use serde::Deserialize;

/// Tunables for one voice client instance.
///
/// Deserializable so hosts can load it from their own config files; every
/// field falls back to the defaults below.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
  /// Channel count passed to the transcoder.
  pub audio_channels: u8,
  /// Opus bitrate string passed to the transcoder, e.g. `96k`.
  pub audio_bitrate: String,
  /// Binary the encoder pool spawns. Anything with ffmpeg-compatible
  /// arguments works.
  pub transcoder_path: String,
  pub encoder: EncoderConfig,
  pub frame_store: FrameStoreConfig,
  pub player: PlayerConfig,
  /// Base directory for frame spill files. Every store claims a private
  /// subdirectory underneath it.
  pub cache_dir: PathBuf
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
  /// Transcoder processes allowed per logical CPU core.
  pub max_per_core: usize,
  /// Absolute cap on concurrent transcoder processes.
  pub max_global: usize,
  /// Idle workers kept alive after a job finishes. Zero destroys workers
  /// as soon as they return.
  pub min_idle: usize
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FrameStoreConfig {
  /// Spill frames beyond the memory watermarks to disk.
  pub disk: bool,
  /// Seconds of audio kept in memory when spilling; also sizes the spill
  /// chunks. Spill stays off without it.
  pub duration: Option<u64>
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
  /// Capacity of the played-tracks history ring.
  pub max_history: usize
}

impl Default for VoiceConfig {
  fn default() -> Self {
    Self {
      audio_channels: 2,
      audio_bitrate: "96k".to_owned(),
      transcoder_path: "ffmpeg".to_owned(),
      encoder: EncoderConfig::default(),
      frame_store: FrameStoreConfig::default(),
      player: PlayerConfig::default(),
      cache_dir: PathBuf::from("wavecache")
    }
  }
}

impl Default for EncoderConfig {
  fn default() -> Self {
    Self {
      max_per_core: 2,
      max_global: 16,
      min_idle: 0
    }
  }
}

impl Default for FrameStoreConfig {
  fn default() -> Self {
    Self {
      disk: false,
      duration: None
    }
  }
}

impl Default for PlayerConfig {
  fn default() -> Self {
    Self { max_history: 20 }
  }
}
