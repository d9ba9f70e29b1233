//! livecast - camera capture and live streaming
//!
//! Camera control with a state-machine driven capture session, V4L2 capture
//! for USB cameras, and RTMP/UDP publishing with adaptive bitrate.

pub mod config;
pub mod error;
pub mod events;
pub mod stream;
pub mod utils;
pub mod video;

pub use error::{AppError, Result};
