//! Raw UDP publisher
//!
//! Packets are written as-is, cut into datagrams of seven MPEG-TS packets so
//! that they fit a standard Ethernet MTU.

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use super::endpoint::StreamingEndpoint;
use super::publisher::{ConnectOutcome, MediaPacket, Publisher};
use crate::error::{AppError, Result};

/// 7 x 188 byte TS packets
pub const DATAGRAM_SIZE: usize = 1316;

#[derive(Default)]
pub struct UdpPublisher {
    socket: Option<UdpSocket>,
}

impl UdpPublisher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Publisher for UdpPublisher {
    async fn connect(&mut self, endpoint: &StreamingEndpoint) -> Result<ConnectOutcome> {
        let bind = if endpoint.host.contains(':') {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let socket = UdpSocket::bind(bind).await?;
        socket
            .connect(endpoint.address())
            .await
            .map_err(|e| AppError::Connection(format!("{}: {}", endpoint.address(), e)))?;
        info!("UDP output to {}", endpoint);
        self.socket = Some(socket);
        Ok(ConnectOutcome::default())
    }

    async fn send(&mut self, packet: &MediaPacket) -> Result<usize> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| AppError::InvalidState("UDP publisher not connected".to_string()))?;

        let mut sent = 0;
        for datagram in packet.data.chunks(DATAGRAM_SIZE) {
            sent += socket
                .send(datagram)
                .await
                .map_err(|e| AppError::Connection(format!("UDP send failed: {}", e)))?;
        }
        Ok(sent)
    }

    async fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("UDP publisher closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_large_packet_is_split_into_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let endpoint = StreamingEndpoint::parse(&format!("udp://127.0.0.1:{}", port), "k").unwrap();

        let mut publisher = UdpPublisher::new();
        publisher.connect(&endpoint).await.unwrap();
        let sent = publisher
            .send(&MediaPacket::video(vec![7u8; 3000], 0, true))
            .await
            .unwrap();
        assert_eq!(sent, 3000);

        let mut buf = [0u8; 2048];
        let mut sizes = Vec::new();
        for _ in 0..3 {
            sizes.push(receiver.recv(&mut buf).await.unwrap());
        }
        assert_eq!(sizes, vec![1316, 1316, 368]);

        publisher.close().await;
        publisher.close().await;
        assert!(publisher
            .send(&MediaPacket::video(vec![1u8], 0, false))
            .await
            .is_err());
    }
}
