//! RTMP publishing client
//!
//! Connection setup runs request/response on the whole socket: handshake,
//! `connect`, `createStream`, `publish`. Once the server accepts the
//! publish, the socket is split. A reader task keeps draining the server
//! (chunk size changes, pings, acknowledgement windows) and queues any
//! replies; the send path flushes those replies ahead of the next media
//! message.

pub mod amf0;
pub mod chunk;
pub mod flv;
pub mod handshake;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use self::amf0::{decode_all, encode_command, Amf0Value};
use self::chunk::{csid, msg_type, ChunkReader, ChunkWriter, RtmpMessage, OUTGOING_CHUNK_SIZE};
use self::flv::ParameterSets;
use super::endpoint::StreamingEndpoint;
use super::publisher::{ConnectOutcome, MediaPacket, PacketKind, PublishOptions, Publisher};
use crate::error::{AppError, Result};

const FLASH_VERSION: &str = "FMLE/3.0 (compatible; livecast)";

const USER_CONTROL_PING_REQUEST: u16 = 6;
const USER_CONTROL_PING_RESPONSE: u16 = 7;

fn is_control(type_id: u8) -> bool {
    matches!(
        type_id,
        msg_type::SET_CHUNK_SIZE
            | msg_type::ABORT
            | msg_type::ACKNOWLEDGEMENT
            | msg_type::USER_CONTROL
            | msg_type::WINDOW_ACK_SIZE
            | msg_type::SET_PEER_BANDWIDTH
    )
}

fn payload_u32(payload: &[u8]) -> Result<u32> {
    payload
        .get(..4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| AppError::Connection("short protocol control message".to_string()))
}

/// Protocol control bookkeeping shared by setup and the reader task
#[derive(Debug, Default)]
struct ControlState {
    window: u32,
    last_ack: u64,
}

impl ControlState {
    /// Apply a control message, returning a reply if one is owed
    fn handle(&mut self, reader: &mut ChunkReader, msg: &RtmpMessage) -> Result<Option<RtmpMessage>> {
        match msg.type_id {
            msg_type::SET_CHUNK_SIZE => {
                let size = payload_u32(&msg.payload)? & 0x7fff_ffff;
                debug!("Peer chunk size {}", size);
                reader.set_chunk_size(size as usize)?;
            }
            msg_type::ABORT => reader.abort(payload_u32(&msg.payload)?),
            msg_type::WINDOW_ACK_SIZE => {
                self.window = payload_u32(&msg.payload)?;
                debug!("Peer acknowledgement window {}", self.window);
            }
            msg_type::USER_CONTROL if msg.payload.len() >= 6 => {
                let event = u16::from_be_bytes([msg.payload[0], msg.payload[1]]);
                if event == USER_CONTROL_PING_REQUEST {
                    let mut reply = BytesMut::with_capacity(6);
                    reply.extend_from_slice(&USER_CONTROL_PING_RESPONSE.to_be_bytes());
                    reply.extend_from_slice(&msg.payload[2..6]);
                    return Ok(Some(RtmpMessage::new(
                        csid::PROTOCOL,
                        msg_type::USER_CONTROL,
                        0,
                        0,
                        reply.freeze(),
                    )));
                }
            }
            other => trace!("Ignoring control message type {}", other),
        }
        Ok(None)
    }

    fn ack_due(&mut self, reader: &ChunkReader) -> Option<RtmpMessage> {
        let read = reader.bytes_read();
        if self.window == 0 || read - self.last_ack < self.window as u64 {
            return None;
        }
        self.last_ack = read;
        Some(RtmpMessage::control(msg_type::ACKNOWLEDGEMENT, read as u32))
    }
}

/// Map an `_error` or failing `onStatus` to an error kind
fn status_error(values: &[Amf0Value]) -> AppError {
    let info = values.iter().find(|v| v.get("code").is_some());
    let code = info
        .and_then(|v| v.get("code"))
        .and_then(Amf0Value::as_str)
        .unwrap_or("unknown");
    let description = info
        .and_then(|v| v.get("description"))
        .and_then(Amf0Value::as_str)
        .unwrap_or("");
    let text = if description.is_empty() {
        code.to_string()
    } else {
        format!("{}: {}", code, description)
    };

    let lower = text.to_ascii_lowercase();
    if code == "NetConnection.Connect.Rejected" || lower.contains("auth") {
        AppError::Auth(text)
    } else {
        AppError::Connection(text)
    }
}

/// Application name and tcUrl, with credentials in the query when present
fn app_and_tc_url(endpoint: &StreamingEndpoint) -> (String, String) {
    let app = match &endpoint.credentials {
        Some((user, pass)) => format!("{}?user={}&pass={}", endpoint.path, user, pass),
        None => endpoint.path.clone(),
    };
    let tc_url = format!("{}://{}/{}", endpoint.protocol, endpoint.address(), app);
    (app, tc_url)
}

/// Setup phase: exclusive request/response use of the socket
struct Negotiation<S> {
    stream: S,
    reader: ChunkReader,
    writer: ChunkWriter,
    control: ControlState,
    out: BytesMut,
}

impl<S> Negotiation<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn send(&mut self, msg: &RtmpMessage) -> Result<()> {
        self.writer.encode(msg, &mut self.out);
        self.stream.write_all(&self.out).await?;
        self.stream.flush().await?;
        self.out.clear();
        Ok(())
    }

    async fn command(&mut self, stream_id: u32, name: &str, txn: f64, args: &[Amf0Value]) -> Result<()> {
        let body = encode_command(name, txn, args).freeze();
        self.send(&RtmpMessage::new(csid::COMMAND, msg_type::COMMAND_AMF0, stream_id, 0, body))
            .await
    }

    /// Next command message, handling control traffic on the way
    async fn next_command(&mut self) -> Result<Vec<Amf0Value>> {
        loop {
            let msg = self.reader.read_message(&mut self.stream).await?;
            if let Some(ack) = self.control.ack_due(&self.reader) {
                self.send(&ack).await?;
            }
            if is_control(msg.type_id) {
                if let Some(reply) = self.control.handle(&mut self.reader, &msg)? {
                    self.send(&reply).await?;
                }
            } else if msg.type_id == msg_type::COMMAND_AMF0 {
                return decode_all(&msg.payload);
            } else {
                trace!("Ignoring message type {} during setup", msg.type_id);
            }
        }
    }

    /// Wait for `_result`/`_error` of a transaction
    async fn expect_result(&mut self, txn: f64) -> Result<Vec<Amf0Value>> {
        loop {
            let values = self.next_command().await?;
            let name = values.first().and_then(Amf0Value::as_str).unwrap_or("");
            let id = values.get(1).and_then(Amf0Value::as_number);
            match (name, id) {
                ("_result", Some(id)) if id == txn => return Ok(values),
                ("_error", Some(id)) if id == txn => return Err(status_error(&values)),
                _ => trace!("Skipping {} while waiting for transaction {}", name, txn),
            }
        }
    }

    async fn wait_publish_start(&mut self, txn: f64) -> Result<()> {
        loop {
            let values = self.next_command().await?;
            let name = values.first().and_then(Amf0Value::as_str).unwrap_or("");
            match name {
                "onStatus" => {
                    let info = values.get(3);
                    let code = info
                        .and_then(|v| v.get("code"))
                        .and_then(Amf0Value::as_str)
                        .unwrap_or("");
                    let level = info
                        .and_then(|v| v.get("level"))
                        .and_then(Amf0Value::as_str)
                        .unwrap_or("");
                    if code == "NetStream.Publish.Start" {
                        return Ok(());
                    }
                    if level == "error" {
                        return Err(status_error(&values));
                    }
                    debug!("onStatus {}", code);
                }
                "_error" if values.get(1).and_then(Amf0Value::as_number) == Some(txn) => {
                    return Err(status_error(&values));
                }
                _ => trace!("Skipping {} while waiting for publish", name),
            }
        }
    }
}

async fn read_loop<R>(
    mut rd: R,
    mut reader: ChunkReader,
    mut control: ControlState,
    replies: mpsc::UnboundedSender<RtmpMessage>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let msg = match reader.read_message(&mut rd).await {
            Ok(msg) => msg,
            Err(e) => {
                debug!("RTMP reader stopped: {}", e);
                return;
            }
        };

        if is_control(msg.type_id) {
            match control.handle(&mut reader, &msg) {
                Ok(Some(reply)) => {
                    if replies.send(reply).is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Bad control message from server: {}", e);
                    return;
                }
            }
        } else if msg.type_id == msg_type::COMMAND_AMF0 {
            if let Ok(values) = decode_all(&msg.payload) {
                let name = values.first().and_then(Amf0Value::as_str).unwrap_or("");
                if name == "onStatus" {
                    let code = values
                        .get(3)
                        .and_then(|v| v.get("code"))
                        .and_then(Amf0Value::as_str)
                        .unwrap_or("");
                    info!("Server status: {}", code);
                }
            }
        }

        if let Some(ack) = control.ack_due(&reader) {
            if replies.send(ack).is_err() {
                return;
            }
        }
    }
}

/// An RTMP connection in the publishing state
pub struct RtmpClient<S> {
    wr: WriteHalf<S>,
    writer: ChunkWriter,
    out: BytesMut,
    stream_id: u32,
    replies: mpsc::UnboundedReceiver<RtmpMessage>,
    reader_task: JoinHandle<()>,
    params: ParameterSets,
    sequence_header_sent: bool,
    waiting_keyframe: bool,
    base_ms: Option<u64>,
    stereo: bool,
    closed: bool,
}

impl<S> RtmpClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Handshake, connect and start publishing `endpoint.key`
    pub async fn connect(
        stream: S,
        endpoint: &StreamingEndpoint,
        options: &PublishOptions,
    ) -> Result<(Self, ConnectOutcome)> {
        let mut nego = Negotiation {
            stream,
            reader: ChunkReader::default(),
            writer: ChunkWriter::default(),
            control: ControlState::default(),
            out: BytesMut::with_capacity(OUTGOING_CHUNK_SIZE + 64),
        };
        handshake::client_handshake(&mut nego.stream).await?;
        debug!("RTMP handshake complete with {}", endpoint);

        nego.send(&RtmpMessage::control(
            msg_type::SET_CHUNK_SIZE,
            OUTGOING_CHUNK_SIZE as u32,
        ))
        .await?;
        nego.writer.set_chunk_size(OUTGOING_CHUNK_SIZE);

        let (app, tc_url) = app_and_tc_url(endpoint);
        let connect_obj = Amf0Value::Object(vec![
            ("app".to_string(), Amf0Value::string(app)),
            ("type".to_string(), Amf0Value::string("nonprivate")),
            ("flashVer".to_string(), Amf0Value::string(FLASH_VERSION)),
            ("tcUrl".to_string(), Amf0Value::string(tc_url)),
        ]);
        nego.command(0, "connect", 1.0, &[connect_obj]).await?;
        nego.expect_result(1.0).await?;
        let outcome = ConnectOutcome {
            authenticated: endpoint.credentials.is_some(),
        };

        let key = Amf0Value::string(endpoint.key.clone());
        nego.command(0, "releaseStream", 2.0, &[Amf0Value::Null, key.clone()])
            .await?;
        nego.command(0, "FCPublish", 3.0, &[Amf0Value::Null, key.clone()])
            .await?;
        nego.command(0, "createStream", 4.0, &[Amf0Value::Null]).await?;
        let result = nego.expect_result(4.0).await?;
        let stream_id = result
            .get(3)
            .and_then(Amf0Value::as_number)
            .ok_or_else(|| AppError::Connection("createStream returned no stream id".to_string()))?
            as u32;

        nego.command(
            stream_id,
            "publish",
            5.0,
            &[Amf0Value::Null, key, Amf0Value::string("live")],
        )
        .await?;
        nego.wait_publish_start(5.0).await?;
        info!("Publishing to {} (stream id {})", endpoint, stream_id);

        nego.send(&RtmpMessage::new(
            csid::DATA,
            msg_type::DATA_AMF0,
            stream_id,
            0,
            flv::metadata(options),
        ))
        .await?;

        let Negotiation {
            stream,
            reader,
            writer,
            control,
            out,
        } = nego;
        let (rd, wr): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
        let (tx, replies) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_loop(rd, reader, control, tx));

        let client = Self {
            wr,
            writer,
            out,
            stream_id,
            replies,
            reader_task,
            params: ParameterSets::default(),
            sequence_header_sent: false,
            waiting_keyframe: true,
            base_ms: None,
            stereo: options.audio.map(|a| a.stereo).unwrap_or(true),
            closed: false,
        };
        Ok((client, outcome))
    }

    fn relative_ts(&mut self, ms: u64) -> u32 {
        let base = *self.base_ms.get_or_insert(ms);
        ms.saturating_sub(base) as u32
    }

    fn queue_replies(&mut self) -> Result<()> {
        loop {
            match self.replies.try_recv() {
                Ok(msg) => self.writer.encode(&msg, &mut self.out),
                Err(mpsc::error::TryRecvError::Empty) => return Ok(()),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(AppError::Connection(
                        "server closed the connection".to_string(),
                    ))
                }
            }
        }
    }

    fn queue_media(&mut self, csid: u32, type_id: u8, timestamp: u32, payload: Bytes) {
        let msg = RtmpMessage::new(csid, type_id, self.stream_id, timestamp, payload);
        self.writer.encode(&msg, &mut self.out);
    }

    async fn flush(&mut self) -> Result<usize> {
        let written = self.out.len();
        if written > 0 {
            self.wr.write_all(&self.out).await?;
            self.wr.flush().await?;
            self.out.clear();
        }
        Ok(written)
    }

    fn queue_video(&mut self, packet: &MediaPacket) -> Result<()> {
        let nals = flv::split_annexb(&packet.data);

        let mut header = None;
        if self.params.update(&nals) {
            if let (Some(sps), Some(pps)) = (&self.params.sps, &self.params.pps) {
                header = Some(flv::avc_sequence_header(sps, pps)?);
                self.sequence_header_sent = true;
            }
        }
        let deliver = self.sequence_header_sent && (packet.keyframe || !self.waiting_keyframe);
        if header.is_none() && !deliver {
            trace!("Dropping video before SPS/PPS and first keyframe");
            return Ok(());
        }

        // timeline starts at the first packet that reaches the wire
        let ts = self.relative_ts(packet.dts_ms);
        if let Some(header) = header {
            self.queue_media(csid::VIDEO, msg_type::VIDEO, ts, header);
        }
        if !deliver {
            return Ok(());
        }
        self.waiting_keyframe = false;

        let cts = packet.pts_ms.saturating_sub(packet.dts_ms) as i32;
        if let Some(tag) = flv::avc_nalu_tag(&nals, packet.keyframe, cts) {
            self.queue_media(csid::VIDEO, msg_type::VIDEO, ts, tag);
        }
        Ok(())
    }

    /// Send one packet; returns bytes written (0 when the packet was held back)
    pub async fn send(&mut self, packet: &MediaPacket) -> Result<usize> {
        if self.closed {
            return Err(AppError::Connection("connection closed".to_string()));
        }
        self.queue_replies()?;
        match packet.kind {
            PacketKind::Video => self.queue_video(packet)?,
            PacketKind::AudioConfig => {
                let tag = flv::aac_sequence_header(&packet.data, self.stereo);
                self.queue_media(csid::AUDIO, msg_type::AUDIO, 0, tag);
            }
            PacketKind::Audio => {
                let ts = self.relative_ts(packet.dts_ms);
                let tag = flv::aac_frame(&packet.data, self.stereo);
                self.queue_media(csid::AUDIO, msg_type::AUDIO, ts, tag);
            }
        }
        self.flush().await
    }

    /// Unpublish and shut the socket down. Errors are ignored.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let commands = [
            ("FCUnpublish", 6.0, vec![Amf0Value::Null]),
            (
                "deleteStream",
                7.0,
                vec![Amf0Value::Null, Amf0Value::Number(self.stream_id as f64)],
            ),
        ];
        for (name, txn, args) in commands {
            let body = encode_command(name, txn, &args).freeze();
            let msg = RtmpMessage::new(csid::COMMAND, msg_type::COMMAND_AMF0, 0, 0, body);
            self.writer.encode(&msg, &mut self.out);
        }
        if let Err(e) = self.flush().await {
            debug!("Unpublish not delivered: {}", e);
        }
        let _ = self.wr.shutdown().await;
        self.reader_task.abort();
    }
}

impl<S> Drop for RtmpClient<S> {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// RTMP over TCP
pub struct RtmpPublisher {
    options: PublishOptions,
    client: Option<RtmpClient<TcpStream>>,
}

impl RtmpPublisher {
    pub fn new(options: PublishOptions) -> Self {
        Self {
            options,
            client: None,
        }
    }
}

#[async_trait]
impl Publisher for RtmpPublisher {
    async fn connect(&mut self, endpoint: &StreamingEndpoint) -> Result<ConnectOutcome> {
        if let Some(mut old) = self.client.take() {
            old.close().await;
        }

        let address = endpoint.address();
        let tcp = tokio::time::timeout(self.options.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| AppError::Connection(format!("timed out connecting to {}", address)))?
            .map_err(|e| AppError::Connection(format!("connect to {} failed: {}", address, e)))?;
        let _ = tcp.set_nodelay(true);

        let (client, outcome) = RtmpClient::connect(tcp, endpoint, &self.options).await?;
        self.client = Some(client);
        Ok(outcome)
    }

    async fn send(&mut self, packet: &MediaPacket) -> Result<usize> {
        match self.client.as_mut() {
            Some(client) => client.send(packet).await,
            None => Err(AppError::InvalidState("RTMP publisher not connected".to_string())),
        }
    }

    async fn close(&mut self) {
        if let Some(mut client) = self.client.take() {
            client.close().await;
        }
    }
}
