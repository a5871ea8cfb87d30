use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use crate::error::{Result, VoiceError};

/// Volume override handed to the transcoder's `volume=` filter.
///
/// Either a linear factor (`0.5`, `2.0`) or a decibel string (`"-3dB"`).
#[derive(Debug, Clone, PartialEq)]
pub enum Volume {
  Factor(f64),
  Decibels(String)
}

impl fmt::Display for Volume {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Volume::Factor(factor) => write!(f, "{factor}"),
      Volume::Decibels(decibels) => write!(f, "{decibels}")
    }
  }
}

/// Where the audio bytes come from.
///
/// Buffers are piped into the transcoder over stdin, files and URLs are
/// passed as its input URI. Equality and hashing consider the payload only,
/// so a renamed or re-volumed source still matches its queue entry.
#[derive(Debug, Clone)]
pub enum AudioSource {
  Buffer {
    data: Vec<u8>,
    name: Option<String>,
    volume: Option<Volume>
  },
  File {
    path: PathBuf,
    name: Option<String>,
    volume: Option<Volume>
  },
  Url {
    url: String,
    name: Option<String>,
    volume: Option<Volume>
  }
}

impl AudioSource {
  pub fn buffer(data: impl Into<Vec<u8>>) -> Self {
    AudioSource::Buffer {
      data: data.into(),
      name: None,
      volume: None
    }
  }

  /// Creates a file source, verifying the path exists up front.
  pub fn file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    if !path.exists() {
      return Err(VoiceError::SourceNotFound(path.display().to_string()));
    }

    Ok(AudioSource::File {
      path: path.to_owned(),
      name: None,
      volume: None
    })
  }

  pub fn url(url: impl Into<String>) -> Self {
    AudioSource::Url {
      url: url.into(),
      name: None,
      volume: None
    }
  }

  pub fn with_name(mut self, value: impl Into<String>) -> Self {
    match &mut self {
      AudioSource::Buffer { name, .. } | AudioSource::File { name, .. } | AudioSource::Url { name, .. } => {
        *name = Some(value.into())
      }
    }
    self
  }

  pub fn with_volume(mut self, value: Volume) -> Self {
    match &mut self {
      AudioSource::Buffer { volume, .. } | AudioSource::File { volume, .. } | AudioSource::Url { volume, .. } => {
        *volume = Some(value)
      }
    }
    self
  }

  pub fn name(&self) -> Option<&str> {
    match self {
      AudioSource::Buffer { name, .. } | AudioSource::File { name, .. } | AudioSource::Url { name, .. } => {
        name.as_deref()
      }
    }
  }

  pub fn volume(&self) -> Option<&Volume> {
    match self {
      AudioSource::Buffer { volume, .. } | AudioSource::File { volume, .. } | AudioSource::Url { volume, .. } => {
        volume.as_ref()
      }
    }
  }
}

impl PartialEq for AudioSource {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (AudioSource::Buffer { data: a, .. }, AudioSource::Buffer { data: b, .. }) => a == b,
      (AudioSource::File { path: a, .. }, AudioSource::File { path: b, .. }) => a == b,
      (AudioSource::Url { url: a, .. }, AudioSource::Url { url: b, .. }) => a == b,
      _ => false
    }
  }
}

impl Eq for AudioSource {}

impl Hash for AudioSource {
  fn hash<H: Hasher>(&self, state: &mut H) {
    match self {
      AudioSource::Buffer { data, .. } => {
        0u8.hash(state);
        data.hash(state);
      }
      AudioSource::File { path, .. } => {
        1u8.hash(state);
        path.hash(state);
      }
      AudioSource::Url { url, .. } => {
        2u8.hash(state);
        url.hash(state);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::collections::hash_map::DefaultHasher;
  use std::hash::{Hash, Hasher};

  use super::*;

  fn hash_of(source: &AudioSource) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
  }

  #[test]
  fn equality_ignores_name_and_volume() {
    let plain = AudioSource::url("https://example.com/a.ogg");
    let decorated = AudioSource::url("https://example.com/a.ogg")
      .with_name("a")
      .with_volume(Volume::Factor(0.5));

    assert_eq!(plain, decorated);
    assert_eq!(hash_of(&plain), hash_of(&decorated));
  }

  #[test]
  fn different_variants_never_compare_equal() {
    let buffer = AudioSource::buffer(b"abc".to_vec());
    let url = AudioSource::url("abc");
    assert_ne!(buffer, url);
  }

  #[test]
  fn missing_file_is_rejected() {
    assert!(matches!(
      AudioSource::file("/definitely/not/here.ogg"),
      Err(VoiceError::SourceNotFound(_))
    ));
  }

  #[test]
  fn volume_renders_for_the_filter_argument() {
    assert_eq!(Volume::Factor(0.5).to_string(), "0.5");
    assert_eq!(Volume::Decibels("-3dB".to_owned()).to_string(), "-3dB");
  }
}
