//! Newline-delimited JSON framing.
//!
//! One [`Message`] per line. Serialized JSON never contains a raw newline, so
//! framing is a plain split on `\n`. Reads are bounded by a maximum line
//! length; an oversized line is skipped and reported without closing the
//! stream.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::protocol::message::{Message, MessageType};

pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("Message {0} requires an authenticated session")]
    AuthRequired(MessageType),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Errors after which the stream can still be read.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Malformed(_) | ProtocolError::LineTooLong { .. } | ProtocolError::AuthRequired(_)
        )
    }
}

pub struct MessageReader {
    inner: BufReader<BoxedRead>,
    buf: Vec<u8>,
    max_line_bytes: usize,
}

impl MessageReader {
    pub fn new<R>(reader: R, max_line_bytes: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            inner: BufReader::new(Box::new(reader)),
            buf: Vec::new(),
            max_line_bytes,
        }
    }

    /// Read the next message. Blank lines are skipped.
    pub async fn read_message(&mut self) -> Result<Message, ProtocolError> {
        loop {
            self.buf.clear();
            let limit = self.max_line_bytes as u64 + 1;
            let read = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;
            if read == 0 {
                return Err(ProtocolError::ConnectionClosed);
            }
            if self.buf.last() != Some(&b'\n') && self.buf.len() > self.max_line_bytes {
                self.skip_rest_of_line().await?;
                return Err(ProtocolError::LineTooLong {
                    limit: self.max_line_bytes,
                });
            }

            let line = self.buf.trim_ascii();
            if line.is_empty() {
                continue;
            }
            return Ok(Message::from_slice(line)?);
        }
    }

    async fn skip_rest_of_line(&mut self) -> Result<(), ProtocolError> {
        loop {
            let (consumed, done) = {
                let available = self.inner.fill_buf().await?;
                if available.is_empty() {
                    return Ok(());
                }
                match available.iter().position(|b| *b == b'\n') {
                    Some(pos) => (pos + 1, true),
                    None => (available.len(), false),
                }
            };
            self.inner.consume(consumed);
            if done {
                return Ok(());
            }
        }
    }
}

pub struct MessageWriter {
    inner: BoxedWrite,
}

impl MessageWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Box::new(writer),
        }
    }

    pub async fn write_message(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.inner.write_all(&line).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Pass `message` through if the session may carry it: handshake messages
/// always, everything else only once authenticated.
pub fn authorize(message: Message, authenticated: bool) -> Result<Message, ProtocolError> {
    if authenticated || message.kind.is_handshake() {
        Ok(message)
    } else {
        Err(ProtocolError::AuthRequired(message.kind))
    }
}

/// Split a duplex stream into framed halves.
pub fn framed<S>(stream: S, max_line_bytes: usize) -> (MessageReader, MessageWriter)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read, write) = tokio::io::split(stream);
    (MessageReader::new(read, max_line_bytes), MessageWriter::new(write))
}
