//! Redis pub/sub subscriber over raw RESP2 over a tokio `TcpStream`.
//!
//! Only what a subscriber needs: send `SUBSCRIBE <topic>`, wait for the
//! confirmation, then turn every `message` push into a payload. A background
//! task owns the connection; read failures are forwarded as transport errors
//! and the task reconnects after a fixed delay. Dropping the subscription
//! stops the task and closes the socket.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::stream::{InboundStream, Subscription};

/// Connect timeout for each attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the server has to confirm a SUBSCRIBE.
const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between reconnect attempts after a transport failure.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Buffered payloads between the socket task and the consumer.
const CHANNEL_CAPACITY: usize = 64;

/// Largest bulk string accepted from the server.
const MAX_BULK_LEN: usize = 16 * 1024 * 1024;

/// Redis pub/sub inbound stream.
pub struct RedisStream {
    addr: String,
    reconnect_delay: Duration,
    subscribe_timeout: Duration,
}

impl RedisStream {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }
}

#[async_trait]
impl InboundStream for RedisStream {
    fn name(&self) -> &str {
        "redis"
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, StreamError> {
        let conn = connect_and_subscribe(&self.addr, topic, self.subscribe_timeout).await?;
        info!(addr = %self.addr, topic = %topic, "Subscribed to Redis channel");

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(pump(
            self.addr.clone(),
            topic.to_string(),
            conn,
            tx,
            self.reconnect_delay,
            self.subscribe_timeout,
        ));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

type Connection = BufReader<TcpStream>;
type Item = Result<Vec<u8>, StreamError>;

/// Open a connection, send SUBSCRIBE and wait for the server's confirmation.
async fn connect_and_subscribe(
    addr: &str,
    topic: &str,
    ack_timeout: Duration,
) -> Result<Connection, StreamError> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| StreamError::Connect {
            addr: addr.to_string(),
            reason: format!("timed out after {CONNECT_TIMEOUT:?}"),
        })?
        .map_err(|e| StreamError::Connect {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

    let mut conn = BufReader::new(stream);
    conn.get_mut()
        .write_all(&encode_command(&["SUBSCRIBE", topic]))
        .await?;
    conn.get_mut().flush().await?;

    let reply = tokio::time::timeout(ack_timeout, read_frame(&mut conn))
        .await
        .map_err(|_| StreamError::SubscribeFailed {
            topic: topic.to_string(),
            reason: format!("no confirmation within {ack_timeout:?}"),
        })??;

    match reply {
        Frame::Array(Some(items)) if is_subscribe_ack(&items, topic) => Ok(conn),
        Frame::Error(reason) => Err(StreamError::SubscribeFailed {
            topic: topic.to_string(),
            reason,
        }),
        other => Err(StreamError::SubscribeFailed {
            topic: topic.to_string(),
            reason: format!("unexpected reply: {other:?}"),
        }),
    }
}

/// Socket task: forward payloads until the subscriber goes away.
async fn pump(
    addr: String,
    topic: String,
    mut conn: Connection,
    tx: mpsc::Sender<Item>,
    reconnect_delay: Duration,
    ack_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            _ = tx.closed() => {
                debug!(topic = %topic, "Subscription released, closing Redis connection");
                return;
            }
            frame = read_frame(&mut conn) => frame,
        };

        match frame {
            Ok(frame) => {
                if let Some(payload) = message_payload(frame)
                    && tx.send(Ok(payload)).await.is_err()
                {
                    return;
                }
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "Redis connection lost");
                if tx.send(Err(e)).await.is_err() {
                    return;
                }
                conn = loop {
                    tokio::select! {
                        _ = tx.closed() => return,
                        _ = tokio::time::sleep(reconnect_delay) => {}
                    }
                    let attempt = tokio::select! {
                        _ = tx.closed() => return,
                        attempt = connect_and_subscribe(&addr, &topic, ack_timeout) => attempt,
                    };
                    match attempt {
                        Ok(c) => {
                            info!(addr = %addr, topic = %topic, "Resubscribed to Redis channel");
                            break c;
                        }
                        Err(e) => {
                            if tx.send(Err(e)).await.is_err() {
                                return;
                            }
                        }
                    }
                };
            }
        }
    }
}

// ── RESP2 ───────────────────────────────────────────────────────────

/// A RESP2 reply. Arrays hold scalars only; pub/sub never nests.
#[derive(Debug, Clone, PartialEq)]
enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Frame>>),
}

/// Encode a command as a RESP array of bulk strings.
fn encode_command(parts: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len()).into_bytes();
    for part in parts {
        out.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
        out.extend_from_slice(part.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Read one header line without its CRLF.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, StreamError> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(StreamError::Transport("connection closed by server".into()));
    }
    if !buf.ends_with(b"\r\n") {
        return Err(StreamError::Protocol("line not terminated by CRLF".into()));
    }
    buf.truncate(buf.len() - 2);
    String::from_utf8(buf).map_err(|_| StreamError::Protocol("non UTF-8 header line".into()))
}

fn parse_len(raw: &str) -> Result<i64, StreamError> {
    raw.parse()
        .map_err(|_| StreamError::Protocol(format!("invalid length '{raw}'")))
}

async fn read_bulk<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    len: i64,
) -> Result<Option<Vec<u8>>, StreamError> {
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if len > MAX_BULK_LEN {
        return Err(StreamError::Protocol(format!("bulk string of {len} bytes too large")));
    }
    let mut data = vec![0u8; len + 2];
    reader.read_exact(&mut data).await?;
    if !data.ends_with(b"\r\n") {
        return Err(StreamError::Protocol("bulk string not terminated by CRLF".into()));
    }
    data.truncate(len);
    Ok(Some(data))
}

async fn read_scalar<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &str,
) -> Result<Frame, StreamError> {
    let (kind, rest) = line.split_at(line.len().min(1));
    match kind {
        "+" => Ok(Frame::Simple(rest.to_string())),
        "-" => Ok(Frame::Error(rest.to_string())),
        ":" => Ok(Frame::Integer(parse_len(rest)?)),
        "$" => Ok(Frame::Bulk(read_bulk(reader, parse_len(rest)?).await?)),
        _ => Err(StreamError::Protocol(format!("unexpected frame '{line}'"))),
    }
}

/// Read one frame from the connection.
async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Frame, StreamError> {
    let line = read_line(reader).await?;
    let Some(count) = line.strip_prefix('*') else {
        return read_scalar(reader, &line).await;
    };

    let count = parse_len(count)?;
    if count < 0 {
        return Ok(Frame::Array(None));
    }
    let mut items = Vec::with_capacity(count.min(16) as usize);
    for _ in 0..count {
        let line = read_line(reader).await?;
        if line.starts_with('*') {
            return Err(StreamError::Protocol("nested arrays are not supported".into()));
        }
        items.push(read_scalar(reader, &line).await?);
    }
    Ok(Frame::Array(Some(items)))
}

fn bulk_text(frame: &Frame) -> Option<&[u8]> {
    match frame {
        Frame::Bulk(Some(data)) => Some(data),
        Frame::Simple(s) => Some(s.as_bytes()),
        _ => None,
    }
}

fn is_subscribe_ack(items: &[Frame], topic: &str) -> bool {
    matches!(
        items,
        [kind, channel, Frame::Integer(_)]
            if bulk_text(kind) == Some(b"subscribe".as_slice())
                && bulk_text(channel) == Some(topic.as_bytes())
    )
}

/// Payload of a `message`/`pmessage` push; `None` for anything else.
fn message_payload(frame: Frame) -> Option<Vec<u8>> {
    let Frame::Array(Some(mut items)) = frame else {
        return None;
    };
    let kind = items.first().and_then(bulk_text)?;
    let expected_len = match kind {
        b"message" => 3,
        b"pmessage" => 4,
        _ => return None,
    };
    if items.len() != expected_len {
        return None;
    }
    match items.pop() {
        Some(Frame::Bulk(Some(payload))) => Some(payload),
        _ => None,
    }
}
