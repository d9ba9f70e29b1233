//! Live streaming
//!
//! Encoded packets go from the encoder into a [`StreamingSession`], which
//! queues them and feeds a [`Publisher`] for the endpoint's protocol.
//!
//! # Components
//!
//! - `StreamingSession` - connect/publish state machine and callbacks
//! - `StreamingEndpoint` - URL and stream key validation
//! - `RtmpPublisher` / `UdpPublisher` - protocol implementations
//! - `BitrateAdapter` - send-side bitrate control

pub mod bitrate;
pub mod endpoint;
pub mod publisher;
pub mod queue;
pub mod rtmp;
pub mod session;
pub mod udp;

#[cfg(test)]
pub(crate) mod testing;

pub use bitrate::{BitrateAdapter, BitrateSample};
pub use endpoint::{Protocol, StreamingEndpoint};
pub use publisher::{
    AudioParams, ConnectOutcome, MediaPacket, NetworkPublisherFactory, PacketKind, PublishOptions,
    Publisher, PublisherFactory,
};
pub use queue::PacketQueue;
pub use rtmp::RtmpPublisher;
pub use session::{
    ConnectChecker, ConnectionState, LoggingChecker, SessionOptions, StreamingSession,
};
pub use udp::UdpPublisher;
