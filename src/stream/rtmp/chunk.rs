//! RTMP chunk stream framing
//!
//! Outgoing messages are always written with a full (type 0) header followed
//! by type 3 continuation chunks. Incoming chunks may use any of the four
//! header formats; per chunk stream state is kept so that compressed headers
//! can be expanded.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{AppError, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 128;
/// Chunk size announced once the connection is up
pub const OUTGOING_CHUNK_SIZE: usize = 4096;

const EXTENDED_TIMESTAMP: u32 = 0x00FF_FFFF;
const MAX_CHUNK_SIZE: usize = 0x7FFF_FFFF;

pub mod msg_type {
    pub const SET_CHUNK_SIZE: u8 = 1;
    pub const ABORT: u8 = 2;
    pub const ACKNOWLEDGEMENT: u8 = 3;
    pub const USER_CONTROL: u8 = 4;
    pub const WINDOW_ACK_SIZE: u8 = 5;
    pub const SET_PEER_BANDWIDTH: u8 = 6;
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const DATA_AMF0: u8 = 18;
    pub const COMMAND_AMF0: u8 = 20;
}

/// Chunk stream ids used by the publisher
pub mod csid {
    pub const PROTOCOL: u32 = 2;
    pub const COMMAND: u32 = 3;
    pub const AUDIO: u32 = 4;
    pub const VIDEO: u32 = 6;
    pub const DATA: u32 = 5;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpMessage {
    pub csid: u32,
    pub timestamp: u32,
    pub type_id: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl RtmpMessage {
    pub fn new(csid: u32, type_id: u8, stream_id: u32, timestamp: u32, payload: Bytes) -> Self {
        Self {
            csid,
            timestamp,
            type_id,
            stream_id,
            payload,
        }
    }

    /// Protocol control message on chunk stream 2, message stream 0
    pub fn control(type_id: u8, value: u32) -> Self {
        Self::new(
            csid::PROTOCOL,
            type_id,
            0,
            0,
            Bytes::copy_from_slice(&value.to_be_bytes()),
        )
    }
}

fn put_basic_header(out: &mut BytesMut, fmt: u8, csid: u32) {
    match csid {
        2..=63 => out.put_u8((fmt << 6) | csid as u8),
        64..=319 => {
            out.put_u8(fmt << 6);
            out.put_u8((csid - 64) as u8);
        }
        _ => {
            let rel = csid - 64;
            out.put_u8((fmt << 6) | 1);
            out.put_u8((rel & 0xff) as u8);
            out.put_u8((rel >> 8) as u8);
        }
    }
}

fn put_u24(out: &mut BytesMut, value: u32) {
    out.put_u8((value >> 16) as u8);
    out.put_u8((value >> 8) as u8);
    out.put_u8(value as u8);
}

/// Splits messages into chunks
#[derive(Debug)]
pub struct ChunkWriter {
    chunk_size: usize,
}

impl Default for ChunkWriter {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ChunkWriter {
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Takes effect for the next encoded message. The peer must have been
    /// told with a Set Chunk Size message first.
    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
    }

    pub fn encode(&self, msg: &RtmpMessage, out: &mut BytesMut) {
        let extended = msg.timestamp >= EXTENDED_TIMESTAMP;
        let header_ts = if extended {
            EXTENDED_TIMESTAMP
        } else {
            msg.timestamp
        };

        put_basic_header(out, 0, msg.csid);
        put_u24(out, header_ts);
        put_u24(out, msg.payload.len() as u32);
        out.put_u8(msg.type_id);
        out.put_u32_le(msg.stream_id);
        if extended {
            out.put_u32(msg.timestamp);
        }

        let mut chunks = msg.payload.chunks(self.chunk_size);
        if let Some(first) = chunks.next() {
            out.put_slice(first);
        }
        for chunk in chunks {
            put_basic_header(out, 3, msg.csid);
            if extended {
                out.put_u32(msg.timestamp);
            }
            out.put_slice(chunk);
        }
    }
}

#[derive(Debug, Default)]
struct ChunkStreamState {
    initialized: bool,
    timestamp: u32,
    delta: u32,
    length: usize,
    type_id: u8,
    stream_id: u32,
    extended: bool,
    partial: BytesMut,
}

/// Reassembles incoming chunks into messages
#[derive(Debug)]
pub struct ChunkReader {
    chunk_size: usize,
    streams: HashMap<u32, ChunkStreamState>,
    bytes_read: u64,
}

impl Default for ChunkReader {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            bytes_read: 0,
        }
    }
}

impl ChunkReader {
    pub fn set_chunk_size(&mut self, size: usize) -> Result<()> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(AppError::Connection(format!("invalid peer chunk size {}", size)));
        }
        self.chunk_size = size;
        Ok(())
    }

    /// Drop a partially received message (Abort message)
    pub fn abort(&mut self, csid: u32) {
        if let Some(state) = self.streams.get_mut(&csid) {
            state.partial.clear();
        }
    }

    /// Total bytes consumed from the peer, for acknowledgements
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    async fn read_u8<R: AsyncRead + Unpin>(&mut self, r: &mut R) -> Result<u8> {
        let b = r.read_u8().await?;
        self.bytes_read += 1;
        Ok(b)
    }

    async fn read_exact<R: AsyncRead + Unpin>(&mut self, r: &mut R, buf: &mut [u8]) -> Result<()> {
        r.read_exact(buf).await?;
        self.bytes_read += buf.len() as u64;
        Ok(())
    }

    async fn read_u32<R: AsyncRead + Unpin>(&mut self, r: &mut R) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(r, &mut buf).await?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Read chunks until one message is complete
    pub async fn read_message<R: AsyncRead + Unpin>(&mut self, r: &mut R) -> Result<RtmpMessage> {
        loop {
            if let Some(msg) = self.read_chunk(r).await? {
                return Ok(msg);
            }
        }
    }

    async fn read_chunk<R: AsyncRead + Unpin>(&mut self, r: &mut R) -> Result<Option<RtmpMessage>> {
        let b0 = self.read_u8(r).await?;
        let fmt = b0 >> 6;
        let csid = match b0 & 0x3f {
            0 => 64 + self.read_u8(r).await? as u32,
            1 => {
                let lo = self.read_u8(r).await? as u32;
                let hi = self.read_u8(r).await? as u32;
                64 + lo + (hi << 8)
            }
            n => n as u32,
        };

        let mut header = [0u8; 11];
        let header_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        self.read_exact(r, &mut header[..header_len]).await?;

        let (initialized, previously_extended) = self
            .streams
            .get(&csid)
            .map(|s| (s.initialized, s.extended))
            .unwrap_or((false, false));
        if fmt != 0 && !initialized {
            return Err(AppError::Connection(format!(
                "chunk type {} on unknown chunk stream {}",
                fmt, csid
            )));
        }

        let ts_field = u32::from_be_bytes([0, header[0], header[1], header[2]]);
        let extended = match fmt {
            0..=2 => ts_field == EXTENDED_TIMESTAMP,
            _ => previously_extended,
        };
        let ext_value = if extended {
            Some(self.read_u32(r).await?)
        } else {
            None
        };

        let chunk_size = self.chunk_size;
        let state = self.streams.entry(csid).or_default();
        let starting = state.partial.is_empty();
        match fmt {
            0 => {
                state.timestamp = ext_value.unwrap_or(ts_field);
                state.delta = 0;
                state.length = u32::from_be_bytes([0, header[3], header[4], header[5]]) as usize;
                state.type_id = header[6];
                state.stream_id = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
            }
            1 => {
                state.delta = ext_value.unwrap_or(ts_field);
                state.length = u32::from_be_bytes([0, header[3], header[4], header[5]]) as usize;
                state.type_id = header[6];
            }
            2 => {
                state.delta = ext_value.unwrap_or(ts_field);
            }
            _ => {}
        }
        if fmt != 0 && starting {
            state.timestamp = state.timestamp.wrapping_add(state.delta);
        }
        state.initialized = true;
        state.extended = extended;

        let remaining = state.length.saturating_sub(state.partial.len());
        let take = remaining.min(chunk_size);
        let start = state.partial.len();
        state.partial.resize(start + take, 0);
        r.read_exact(&mut state.partial[start..]).await?;
        self.bytes_read += take as u64;

        if state.partial.len() < state.length {
            return Ok(None);
        }
        let payload = state.partial.split().freeze();
        Ok(Some(RtmpMessage {
            csid,
            timestamp: state.timestamp,
            type_id: state.type_id,
            stream_id: state.stream_id,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(len: usize, timestamp: u32) -> RtmpMessage {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        RtmpMessage::new(csid::VIDEO, msg_type::VIDEO, 1, timestamp, payload.into())
    }

    #[test]
    fn test_writer_splits_at_chunk_size() {
        let writer = ChunkWriter::default();
        let mut out = BytesMut::new();
        writer.encode(&message(300, 40), &mut out);

        // 12 byte header, 128, 1 + 128, 1 + 44
        assert_eq!(out.len(), 12 + 128 + 1 + 128 + 1 + 44);
        assert_eq!(out[0], 0x06);
        assert_eq!(&out[4..7], &[0x00, 0x01, 0x2c]);
        assert_eq!(out[7], msg_type::VIDEO);
        assert_eq!(&out[8..12], &[1, 0, 0, 0]);
        assert_eq!(out[12 + 128], 0xc6);
    }

    #[tokio::test]
    async fn test_reader_reassembles_writer_output() {
        let mut writer = ChunkWriter::default();
        let mut out = BytesMut::new();
        writer.encode(&message(300, 40), &mut out);
        writer.set_chunk_size(4096);
        writer.encode(&message(5000, 0x0100_0000), &mut out);

        let mut reader = ChunkReader::default();
        let mut input = &out[..];
        let first = reader.read_message(&mut input).await.unwrap();
        assert_eq!(first, message(300, 40));

        reader.set_chunk_size(4096).unwrap();
        let second = reader.read_message(&mut input).await.unwrap();
        assert_eq!(second, message(5000, 0x0100_0000));
        assert_eq!(reader.bytes_read(), out.len() as u64);
    }

    #[tokio::test]
    async fn test_compressed_headers_accumulate_deltas() {
        let mut input = BytesMut::new();
        // type 0: ts 1000, len 2, command, stream 0
        input.put_slice(&[0x03, 0x00, 0x03, 0xe8, 0x00, 0x00, 0x02, 20, 0, 0, 0, 0]);
        input.put_slice(b"ab");
        // type 2: delta 10
        input.put_slice(&[0x83, 0x00, 0x00, 0x0a]);
        input.put_slice(b"cd");
        // type 3: same delta again
        input.put_slice(&[0xc3]);
        input.put_slice(b"ef");

        let mut reader = ChunkReader::default();
        let mut r = &input[..];
        let stamps: Vec<u32> = [
            reader.read_message(&mut r).await.unwrap(),
            reader.read_message(&mut r).await.unwrap(),
            reader.read_message(&mut r).await.unwrap(),
        ]
        .iter()
        .map(|m| m.timestamp)
        .collect();
        assert_eq!(stamps, vec![1000, 1010, 1020]);
    }

    #[tokio::test]
    async fn test_compressed_header_on_unknown_stream() {
        let input = [0x43u8, 0, 0, 0, 0, 0, 1, 20];
        let mut reader = ChunkReader::default();
        assert!(reader.read_message(&mut &input[..]).await.is_err());
    }

    #[test]
    fn test_control_message_payload() {
        let msg = RtmpMessage::control(msg_type::SET_CHUNK_SIZE, 4096);
        assert_eq!(msg.csid, 2);
        assert_eq!(&msg.payload[..], &[0, 0, 0x10, 0]);
    }
}
