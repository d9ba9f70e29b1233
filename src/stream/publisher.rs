//! Publisher boundary
//!
//! A publisher owns one network connection to a media server. The streaming
//! session drives it: `connect` once, `send` from the publishing task, `close`
//! on teardown.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use super::endpoint::{Protocol, StreamingEndpoint};
use super::rtmp::RtmpPublisher;
use super::udp::UdpPublisher;
use crate::config::AppConfig;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// H.264 access unit in Annex-B framing
    Video,
    /// Raw AAC frame
    Audio,
    /// AAC AudioSpecificConfig, sent once before audio frames
    AudioConfig,
}

/// One encoded unit handed from the encoder to the publisher
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub kind: PacketKind,
    pub data: Bytes,
    /// Presentation time in milliseconds
    pub pts_ms: u64,
    /// Decode time in milliseconds
    pub dts_ms: u64,
    pub keyframe: bool,
}

impl MediaPacket {
    pub fn video(data: impl Into<Bytes>, pts_ms: u64, keyframe: bool) -> Self {
        Self {
            kind: PacketKind::Video,
            data: data.into(),
            pts_ms,
            dts_ms: pts_ms,
            keyframe,
        }
    }

    pub fn audio(data: impl Into<Bytes>, pts_ms: u64) -> Self {
        Self {
            kind: PacketKind::Audio,
            data: data.into(),
            pts_ms,
            dts_ms: pts_ms,
            keyframe: false,
        }
    }

    pub fn audio_config(config: impl Into<Bytes>) -> Self {
        Self {
            kind: PacketKind::AudioConfig,
            data: config.into(),
            pts_ms: 0,
            dts_ms: 0,
            keyframe: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// What the server said about a successful connect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOutcome {
    /// Credentials were presented and accepted
    pub authenticated: bool,
}

/// Stream parameters announced to the server
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub connect_timeout: Duration,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub video_bitrate_bps: u64,
    pub audio: Option<AudioParams>,
}

#[derive(Debug, Clone, Copy)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub stereo: bool,
    pub bitrate_bps: u64,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            width: 1920,
            height: 1080,
            fps: 30,
            video_bitrate_bps: 5_000_000,
            audio: None,
        }
    }
}

impl PublishOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        let audio = config.audio.enabled.then(|| AudioParams {
            sample_rate: config.audio.sample_rate,
            stereo: config.audio.stereo,
            bitrate_bps: config.audio.bitrate_kbps as u64 * 1000,
        });
        Self {
            connect_timeout: Duration::from_secs(config.stream.connect_timeout_secs),
            width: config.camera.width,
            height: config.camera.height,
            fps: config.camera.fps,
            video_bitrate_bps: config.stream.video_bitrate_kbps as u64 * 1000,
            audio,
        }
    }
}

#[async_trait]
pub trait Publisher: Send {
    /// Open the connection and negotiate publishing
    ///
    /// Credential rejection is reported as `AppError::Auth`.
    async fn connect(&mut self, endpoint: &StreamingEndpoint) -> Result<ConnectOutcome>;

    /// Write one packet, returning the bytes put on the wire
    async fn send(&mut self, packet: &MediaPacket) -> Result<usize>;

    /// Release the connection. Safe to call more than once.
    async fn close(&mut self);
}

/// Creates a publisher for a protocol
pub trait PublisherFactory: Send + Sync {
    fn create(&self, protocol: Protocol) -> Result<Box<dyn Publisher>>;
}

/// RTMP and UDP over real sockets
#[derive(Debug, Clone, Default)]
pub struct NetworkPublisherFactory {
    options: PublishOptions,
}

impl NetworkPublisherFactory {
    pub fn new(options: PublishOptions) -> Self {
        Self { options }
    }
}

impl PublisherFactory for NetworkPublisherFactory {
    fn create(&self, protocol: Protocol) -> Result<Box<dyn Publisher>> {
        match protocol {
            Protocol::Rtmp => Ok(Box::new(RtmpPublisher::new(self.options.clone()))),
            Protocol::Udp => Ok(Box::new(UdpPublisher::new())),
            other => Err(AppError::Connection(format!(
                "unsupported protocol {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_rejects_unsupported_protocols() {
        let factory = NetworkPublisherFactory::default();
        for protocol in [Protocol::Rtmps, Protocol::Rtsp, Protocol::Rtsps, Protocol::Srt] {
            let err = factory.create(protocol).err().unwrap();
            assert!(matches!(err, AppError::Connection(_)));
            assert!(err.to_string().contains("unsupported protocol"));
        }
        assert!(factory.create(Protocol::Rtmp).is_ok());
        assert!(factory.create(Protocol::Udp).is_ok());
    }

    #[test]
    fn test_options_from_config() {
        let mut config = AppConfig::default();
        config.audio.enabled = false;
        config.stream.video_bitrate_kbps = 2500;

        let options = PublishOptions::from_config(&config);
        assert_eq!(options.video_bitrate_bps, 2_500_000);
        assert_eq!((options.width, options.height, options.fps), (1920, 1080, 30));
        assert!(options.audio.is_none());
    }
}
