use std::time::Duration;

pub const CHANNEL_COUNT: usize = 2;
pub const SAMPLE_RATE: usize = 48000;
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
pub const FRAMES_PER_SECOND: usize = 1000 / FRAME_DURATION.as_millis() as usize;
pub const SAMPLES_PER_FRAME: u32 = (SAMPLE_RATE / FRAMES_PER_SECOND) as u32;

pub const GATEWAY_VERSION: u8 = 8;

pub const OPUS_SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];
pub const OPUS_SILENCE_FRAMES: u8 = 5;

pub const SPEAKING_MICROPHONE: u8 = 1;
pub const SPEAKING_NONE: u8 = 0;

pub const RTP_HEADER_SIZE: usize = 12;
pub const RTP_PAYLOAD_TYPE: u8 = 0x78;

pub const IP_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
pub const UDP_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(5000);
