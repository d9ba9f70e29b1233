use serde::{Deserialize, Serialize};

use crate::video::format::Facing;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Camera capture settings
    pub camera: CameraConfig,
    /// Streaming settings
    pub stream: StreamConfig,
    /// Audio encoder settings handed to the publisher
    pub audio: AudioConfig,
}

/// Camera capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    /// Which camera to open first
    pub facing: Facing,
    /// External device id (e.g. /dev/video0), used when facing is external
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Output rotation in degrees (0, 90, 180, 270)
    pub rotation: u32,
    /// Base exposure time used for EV compensation when neither a manual
    /// exposure nor an auto-exposure measurement is available
    pub fallback_exposure_ns: u64,
    /// Enable face detection when the session starts
    pub face_detection: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            facing: Facing::Back,
            device: None,
            width: 1920,
            height: 1080,
            fps: 30,
            rotation: 0,
            fallback_exposure_ns: 16_666_667,
            face_detection: false,
        }
    }
}

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Base URL, e.g. rtmp://a.rtmp.youtube.com/live2
    pub url: String,
    /// Stream key appended to the URL
    pub key: String,
    /// Initial video bitrate in kbps
    pub video_bitrate_kbps: u32,
    /// Lower bound for adaptive bitrate in kbps
    pub min_bitrate_kbps: u32,
    /// Enable bitrate adaptation from send-side samples
    pub adaptive_bitrate: bool,
    /// Packets buffered between encoder and network before dropping the oldest
    pub queue_capacity: usize,
    /// Handshake timeout
    pub connect_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            key: String::new(),
            video_bitrate_kbps: 5000,
            min_bitrate_kbps: 500,
            adaptive_bitrate: true,
            queue_capacity: 60,
            connect_timeout_secs: 10,
        }
    }
}

/// Audio configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    pub sample_rate: u32,
    pub stereo: bool,
    pub bitrate_kbps: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 48_000,
            stereo: true,
            bitrate_kbps: 128,
        }
    }
}
