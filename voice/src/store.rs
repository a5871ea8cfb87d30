use std::collections::VecDeque;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use byteorder::{BigEndian, ReadBytesExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use utils::state_flow::StateFlow;

use crate::config::FrameStoreConfig;
use crate::constants::FRAMES_PER_SECOND;
use crate::error::Result;

/// Frames pushed to the live buffer between cooperative yields of a refill.
const REFILL_YIELD_INTERVAL: usize = 100;

/// Bounded FIFO of Opus packets decoupling the encoder from the paced
/// sender.
///
/// A frame is `Some(bytes)`; `None` is the end-of-stream sentinel. Without
/// disk spill every frame lands in the in-memory buffer. With spill enabled,
/// frames beyond the high watermark are length-prefixed into chunk files
/// under a store-private directory and read back when the live buffer drains
/// to the low watermark. Insertion order is preserved across both paths and
/// chunk files are deleted once fully consumed.
pub struct FrameStore {
  live: StdMutex<VecDeque<Option<Vec<u8>>>>,

  disk: bool,
  dir: PathBuf,
  memory_limit: usize,
  low_mark: usize,
  high_mark: usize,

  /// Serializes refills against end-of-stream placement.
  read_lock: Mutex<()>,
  chunk: Mutex<ChunkState>,
  disk_queue: StdMutex<VecDeque<u64>>,
  refilling: AtomicBool,
  eos_written: AtomicBool,

  /// Mutation counter; consumers wait on it instead of polling.
  version: StateFlow<u64>
}

struct ChunkState {
  buffer: Vec<u8>,
  frame_count: usize,
  file_index: u64
}

impl FrameStore {
  /// Creates a store spilling into [dir]. The directory must not be shared
  /// with another store; chunk indices are only unique within one store.
  pub fn new(config: &FrameStoreConfig, dir: PathBuf) -> Self {
    let memory_limit = match (config.disk, config.duration) {
      (true, Some(duration)) => duration as usize * FRAMES_PER_SECOND,
      _ => 0
    };

    Self {
      live: StdMutex::new(VecDeque::new()),

      disk: memory_limit > 0,
      dir,
      memory_limit,
      low_mark: memory_limit / 4,
      high_mark: memory_limit,

      read_lock: Mutex::new(()),
      chunk: Mutex::new(ChunkState {
        buffer: Vec::new(),
        frame_count: 0,
        file_index: 0
      }),
      disk_queue: StdMutex::new(VecDeque::new()),
      refilling: AtomicBool::new(false),
      eos_written: AtomicBool::new(false),

      version: StateFlow::new(0)
    }
  }

  /// Appends one frame, or the end-of-stream sentinel (`None`).
  ///
  /// Callers must not store anything after the sentinel.
  pub async fn store_frame(&self, frame: Option<Vec<u8>>) -> Result<()> {
    if !self.disk {
      self.live.lock().unwrap().push_back(frame);
      self.bump();
      return Ok(());
    }

    let Some(frame) = frame else {
      self.eos_written.store(true, Ordering::Release);

      {
        let mut chunk = self.chunk.lock().await;
        self.flush_chunk(&mut chunk).await?;
      }

      // The read lock keeps the sentinel from overtaking frames a refill is
      // still reading back.
      let _guard = self.read_lock.lock().await;
      if self.disk_queue.lock().unwrap().is_empty() {
        self.live.lock().unwrap().push_back(None);
      }
      self.bump();
      return Ok(());
    };

    let mut chunk = self.chunk.lock().await;
    // Read the disk queue before the refill flag: a refill raises the flag
    // before it pops the queue, so this order cannot miss pending frames.
    let spill_pending =
      !self.disk_queue.lock().unwrap().is_empty() || self.refilling.load(Ordering::Acquire) || chunk.frame_count > 0;

    if !spill_pending && self.live.lock().unwrap().len() < self.high_mark {
      drop(chunk);
      self.live.lock().unwrap().push_back(Some(frame));
      self.bump();
      return Ok(());
    }

    chunk.buffer.extend_from_slice(&(frame.len() as u16).to_be_bytes());
    chunk.buffer.extend_from_slice(&frame);
    chunk.frame_count += 1;

    if chunk.frame_count >= self.memory_limit {
      self.flush_chunk(&mut chunk).await?;
      self.bump();
    }

    Ok(())
  }

  /// Pops the next frame in insertion order, suspending while the store is
  /// empty but still open. Returns `None` once after the stream is fully
  /// drained (and on every call thereafter).
  pub async fn fetch_frame(self: &Arc<Self>) -> Option<Vec<u8>> {
    loop {
      let seen = self.version.get();

      let popped = self.live.lock().unwrap().pop_front();
      if let Some(frame) = popped {
        if frame.is_some() {
          self.maybe_refill();
        }
        return frame;
      }

      if self.eos_written.load(Ordering::Acquire)
        && self.disk_queue.lock().unwrap().is_empty()
        && !self.refilling.load(Ordering::Acquire)
      {
        return None;
      }

      self.maybe_refill();
      self.version.wait_for(|version| *version != seen).await;
    }
  }

  fn bump(&self) {
    self.version.update(|version| *version = version.wrapping_add(1));
  }

  fn chunk_path(&self, index: u64) -> PathBuf {
    self.dir.join(format!("{index}.wcf"))
  }

  async fn flush_chunk(&self, chunk: &mut ChunkState) -> Result<()> {
    if chunk.buffer.is_empty() {
      return Ok(());
    }

    chunk.file_index += 1;
    let index = chunk.file_index;

    tokio::fs::create_dir_all(&self.dir).await?;
    tokio::fs::write(self.chunk_path(index), &chunk.buffer).await?;

    self.disk_queue.lock().unwrap().push_back(index);
    debug!("spilled {} frames to chunk {}", chunk.frame_count, index);

    chunk.buffer.clear();
    chunk.frame_count = 0;
    Ok(())
  }

  /// Kicks off a background refill when the live buffer has drained to the
  /// low watermark and chunks are pending. At most one refill runs at a time.
  fn maybe_refill(self: &Arc<Self>) {
    if !self.disk {
      return;
    }
    if self.live.lock().unwrap().len() > self.low_mark {
      return;
    }
    if self.disk_queue.lock().unwrap().is_empty() {
      return;
    }
    if self.refilling.swap(true, Ordering::AcqRel) {
      return;
    }

    let store = self.clone();
    tokio::spawn(async move {
      if let Err(error) = store.refill().await {
        warn!("frame store refill failed: {error}");
        store.refilling.store(false, Ordering::Release);
        store.bump();
      }
    });
  }

  async fn refill(self: &Arc<Self>) -> Result<()> {
    let _guard = self.read_lock.lock().await;

    let index = self.disk_queue.lock().unwrap().pop_front();
    let Some(index) = index else {
      self.refilling.store(false, Ordering::Release);
      self.bump();
      return Ok(());
    };

    let path = self.chunk_path(index);
    let bytes = tokio::fs::read(&path).await?;
    let mut cursor = Cursor::new(bytes.as_slice());

    let mut pushed = 0usize;
    while let Ok(length) = cursor.read_u16::<BigEndian>() {
      let mut frame = vec![0u8; length as usize];
      cursor.read_exact(&mut frame)?;

      self.live.lock().unwrap().push_back(Some(frame));
      pushed += 1;

      if pushed % REFILL_YIELD_INTERVAL == 0 {
        self.bump();
        tokio::task::yield_now().await;
      }
    }

    tokio::fs::remove_file(&path).await?;
    debug!("refilled {} frames from chunk {}", pushed, index);

    if self.eos_written.load(Ordering::Acquire) && self.disk_queue.lock().unwrap().is_empty() {
      self.live.lock().unwrap().push_back(None);
    }

    self.refilling.store(false, Ordering::Release);
    self.bump();
    Ok(())
  }
}

impl Drop for FrameStore {
  fn drop(&mut self) {
    // Chunks of an abandoned track would otherwise linger.
    if self.disk {
      let _ = std::fs::remove_dir_all(&self.dir);
    }
  }
}
