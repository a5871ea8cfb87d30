use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_channel::{Receiver, Sender};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::select;
use tracing::{debug, warn};
use utils::state_flow::StateFlow;

use crate::config::VoiceConfig;
use crate::constants::{FRAME_DURATION, SAMPLE_RATE};
use crate::error::{Result, VoiceError};
use crate::source::AudioSource;
use crate::store::FrameStore;

const OGG_MAGIC: &[u8; 4] = b"OggS";
const OGG_PAGE_HEADER_SIZE: usize = 27;

/// Wraps one transcoder subprocess for the duration of a job.
///
/// The transcoder receives its input either over stdin (buffer sources) or
/// as an input URI, and produces an Ogg-Opus stream on stdout which is
/// unpacked into the output frame store packet by packet.
pub struct EncoderWorker {
  process: Option<Child>
}

impl EncoderWorker {
  fn new() -> Self {
    Self { process: None }
  }

  async fn encode(&mut self, config: &VoiceConfig, source: &AudioSource, output: &Arc<FrameStore>) -> Result<()> {
    let result = self.encode_inner(config, source, output).await;

    // The stream always terminates, even after a spawn or parse error, so
    // the consumer can advance past the broken track.
    let _ = output.store_frame(None).await;
    self.stop().await;
    result
  }

  async fn encode_inner(&mut self, config: &VoiceConfig, source: &AudioSource, output: &Arc<FrameStore>) -> Result<()> {
    let input = match source {
      AudioSource::Buffer { .. } => "pipe:0".to_owned(),
      AudioSource::File { path, .. } => path.display().to_string(),
      AudioSource::Url { url, .. } => url.clone()
    };
    let volume = source.volume().map(|volume| volume.to_string()).unwrap_or_else(|| "1.0".to_owned());

    let mut command = Command::new(&config.transcoder_path);
    command
      .arg("-i")
      .arg(&input)
      .args(["-map", "0:a"])
      .arg("-af")
      .arg(format!("volume={volume}"))
      .args(["-acodec", "libopus", "-f", "opus"])
      .args(["-ar", &SAMPLE_RATE.to_string()])
      .args(["-ac", &config.audio_channels.to_string()])
      .args(["-b:a", &config.audio_bitrate])
      .args(["-application", "audio"])
      .args(["-frame_duration", &FRAME_DURATION.as_millis().to_string()])
      .args(["-loglevel", "warning", "pipe:1"])
      .stdin(if matches!(source, AudioSource::Buffer { .. }) {
        Stdio::piped()
      } else {
        Stdio::null()
      })
      .stdout(Stdio::piped())
      .stderr(Stdio::null())
      .kill_on_drop(true);

    let mut child = command.spawn().map_err(VoiceError::TranscoderSpawnFailed)?;

    if let AudioSource::Buffer { data, .. } = source {
      if let Some(mut stdin) = child.stdin.take() {
        let data = data.clone();
        tokio::spawn(async move {
          if let Err(error) = stdin.write_all(&data).await {
            debug!("transcoder stdin write failed: {error}");
          }
          // Dropping the handle closes the pipe so the transcoder sees EOF.
        });
      }
    }

    let mut stdout = child
      .stdout
      .take()
      .ok_or(VoiceError::TranscoderUnexpectedOutput("no stdout pipe"))?;
    self.process = Some(child);

    parse_ogg_stream(&mut stdout, output).await
  }

  async fn stop(&mut self) {
    if let Some(mut process) = self.process.take() {
      if let Err(error) = process.kill().await {
        debug!("failed to kill transcoder: {error}");
      }
    }
  }
}

/// Splits an Ogg stream into Opus packets and feeds them to [output].
///
/// Header (`OpusHead`) and comment (`OpusTags`) packets are dropped. A short
/// read anywhere ends the stream; packets may span page boundaries.
async fn parse_ogg_stream<R>(reader: &mut R, output: &Arc<FrameStore>) -> Result<()>
where
  R: AsyncRead + Unpin
{
  let mut header = [0u8; OGG_PAGE_HEADER_SIZE];
  let mut packet: Vec<u8> = Vec::new();

  'stream: loop {
    if !read_exact_or_eof(reader, &mut header).await? {
      break;
    }
    if &header[..4] != OGG_MAGIC {
      return Err(VoiceError::TranscoderUnexpectedOutput("missing OggS page magic"));
    }

    let segment_count = header[26] as usize;
    let mut lacing_table = vec![0u8; segment_count];
    if !read_exact_or_eof(reader, &mut lacing_table).await? {
      break;
    }

    for &lacing in &lacing_table {
      let mut segment = vec![0u8; lacing as usize];
      if !read_exact_or_eof(reader, &mut segment).await? {
        break 'stream;
      }
      packet.extend_from_slice(&segment);

      // A lacing value below 255 terminates the packet.
      if lacing < 255 {
        if packet.starts_with(b"OpusHead") || packet.starts_with(b"OpusTags") {
          packet.clear();
        } else {
          output.store_frame(Some(std::mem::take(&mut packet))).await?;
        }
      }
    }
  }

  Ok(())
}

async fn read_exact_or_eof<R>(reader: &mut R, buffer: &mut [u8]) -> Result<bool>
where
  R: AsyncRead + Unpin
{
  match reader.read_exact(buffer).await {
    Ok(_) => Ok(true),
    Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
    Err(error) => Err(error.into())
  }
}

/// Bounded pool of transcoder workers.
///
/// Capacity is `min(max_global, cpu_count * max_per_core)`. A submission
/// either grabs an idle worker, spawns a fresh one below the cap, or waits
/// for a return. Workers beyond `min_idle` are destroyed when their job
/// finishes.
pub struct EncoderPool {
  config: Arc<VoiceConfig>,
  enabled: AtomicBool,
  max: usize,
  total: StdMutex<usize>,
  available_tx: Sender<EncoderWorker>,
  available_rx: Receiver<EncoderWorker>,
  shutdown: StateFlow<bool>,
  active: StateFlow<usize>
}

impl EncoderPool {
  pub fn new(config: Arc<VoiceConfig>) -> Self {
    let cores = std::thread::available_parallelism().map(|cores| cores.get()).unwrap_or(1);
    let max = config
      .encoder
      .max_global
      .min(cores * config.encoder.max_per_core)
      .max(1);
    let (available_tx, available_rx) = async_channel::unbounded();

    Self {
      config,
      enabled: AtomicBool::new(true),
      max,
      total: StdMutex::new(0),
      available_tx,
      available_rx,
      shutdown: StateFlow::new(false),
      active: StateFlow::new(0)
    }
  }

  /// Number of workers currently alive, idle ones included.
  pub fn total(&self) -> usize {
    *self.total.lock().unwrap()
  }

  /// Schedules [source] for transcoding into [output].
  ///
  /// Waits for a worker when the pool is saturated. On a stopped pool the
  /// stream is terminated immediately so consumers do not hang.
  pub async fn submit(self: &Arc<Self>, source: AudioSource, output: Arc<FrameStore>) -> Result<()> {
    if !self.enabled.load(Ordering::Acquire) {
      output.store_frame(None).await?;
      return Ok(());
    }

    let mut worker = self.acquire_worker().await?;
    self.active.update(|active| *active += 1);

    let pool = self.clone();
    tokio::spawn(async move {
      select! {
        result = worker.encode(&pool.config, &source, &output) => {
          if let Err(error) = result {
            warn!("transcode of {} failed: {error}", source.name().unwrap_or("<unnamed source>"));
          }
        }

        _ = pool.shutdown.wait_for(|stop| *stop) => {
          debug!("transcode cancelled by pool shutdown");
          let _ = output.store_frame(None).await;
        }
      }

      worker.stop().await;
      pool.release_worker(worker);
      pool.active.update(|active| *active -= 1);
    });

    Ok(())
  }

  /// Disables submissions, kills every in-flight transcoder and drains the
  /// idle workers.
  pub async fn stop(&self) {
    self.enabled.store(false, Ordering::Release);
    self.shutdown.set(true);

    self.active.wait_for(|active| *active == 0).await;

    while self.available_rx.try_recv().is_ok() {}
    *self.total.lock().unwrap() = 0;
  }

  async fn acquire_worker(&self) -> Result<EncoderWorker> {
    let spawn_new = {
      let mut total = self.total.lock().unwrap();
      if self.available_rx.is_empty() && *total < self.max {
        *total += 1;
        true
      } else {
        false
      }
    };

    if spawn_new {
      return Ok(EncoderWorker::new());
    }
    self.available_rx.recv().await.map_err(|_| VoiceError::Closed)
  }

  fn release_worker(&self, worker: EncoderWorker) {
    let mut total = self.total.lock().unwrap();
    if !self.enabled.load(Ordering::Acquire) || *total > self.config.encoder.min_idle {
      *total -= 1;
    } else {
      let _ = self.available_tx.try_send(worker);
    }
  }
}
