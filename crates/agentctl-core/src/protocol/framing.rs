//! Byte-level framing: container log demultiplexing and the message
//! codecs the JSON-RPC client reads and writes through.
//!
//! Container backends deliver logs framed as
//! `[type:1][0:3][size:4 big-endian][payload:size]` with type 0 = stdin,
//! 1 = stdout, 2 = stderr. The demultiplexer concatenates stdout and
//! stderr payloads onto a single pipe the JSON-RPC reader consumes.
//!
//! Some backends instead prefix each line with an RFC3339 timestamp; the
//! newline codec strips any leading non-`{` prefix up to the first `{`.
//! This heuristic is best-effort: a legitimately non-JSON line with an
//! embedded `{` will be mis-parsed, logged, and skipped downstream.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Initial read-buffer size.
pub const INITIAL_BUF_SIZE: usize = 64 * 1024;

/// Hard cap on a single message; larger frames are transport errors.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Strip a leading non-JSON prefix (e.g. an RFC3339 timestamp) from a
/// line, returning the slice starting at the first `{`.
pub fn strip_to_json_start(line: &str) -> Option<&str> {
    line.find('{').map(|idx| &line[idx..])
}

fn oversized(size: usize) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("message of {size} bytes exceeds the {MAX_MESSAGE_SIZE} byte cap"),
    )
}

// ---------------------------------------------------------------------------
// Container log demux
// ---------------------------------------------------------------------------

/// Demultiplex a framed container log stream onto a single output pipe.
///
/// Consumes 8-byte headers followed by exactly `size` payload bytes.
/// Stdout (1) and stderr (2) payloads are written through in arrival
/// order; stdin echo frames (0) and unknown types are skipped. Returns
/// the number of payload bytes written once the input reaches EOF.
pub async fn demux_container_stream<R, W>(mut reader: R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; 8];
    let mut written: u64 = 0;

    loop {
        // A clean EOF may only occur on a frame boundary.
        let n = reader.read(&mut header[..1]).await?;
        if n == 0 {
            break;
        }
        reader.read_exact(&mut header[1..]).await?;

        let stream_type = header[0];
        let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if size > MAX_MESSAGE_SIZE {
            return Err(oversized(size));
        }

        let mut payload = vec![0u8; size];
        reader.read_exact(&mut payload).await?;

        match stream_type {
            1 | 2 => {
                writer.write_all(&payload).await?;
                written += size as u64;
            }
            0 => {
                tracing::trace!(size, "skipping stdin echo frame");
            }
            other => {
                tracing::warn!(stream_type = other, size, "skipping unknown log frame type");
            }
        }
    }

    writer.flush().await?;
    Ok(written)
}

/// Frame a payload in the container log format (for tests and loopbacks).
pub fn encode_log_frame(stream_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.push(stream_type);
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

// ---------------------------------------------------------------------------
// Message codecs
// ---------------------------------------------------------------------------

/// Reader half of a message codec.
///
/// `Newline` is the ACP dialect (one JSON object per line, prefix-stripped);
/// `LengthPrefixed` is the app-server dialect (4-byte big-endian length).
pub enum FrameReader<R: AsyncRead + Unpin> {
    Newline(BufReader<R>),
    LengthPrefixed(BufReader<R>),
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn newline(reader: R) -> Self {
        Self::Newline(BufReader::with_capacity(INITIAL_BUF_SIZE, reader))
    }

    pub fn length_prefixed(reader: R) -> Self {
        Self::LengthPrefixed(BufReader::with_capacity(INITIAL_BUF_SIZE, reader))
    }

    /// Read the next message, or `None` at EOF.
    ///
    /// Newline mode skips blank lines and strips leading non-`{` prefixes;
    /// a line that never reaches a `{` is returned as-is so the caller can
    /// log and skip it.
    pub async fn read_message(&mut self) -> std::io::Result<Option<String>> {
        match self {
            Self::Newline(reader) => loop {
                let mut buf = Vec::new();
                let n = reader.read_until(b'\n', &mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                if buf.len() > MAX_MESSAGE_SIZE {
                    return Err(oversized(buf.len()));
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let stripped = strip_to_json_start(line).unwrap_or(line);
                return Ok(Some(stripped.to_string()));
            },
            Self::LengthPrefixed(reader) => {
                let mut len_buf = [0u8; 4];
                let n = reader.read(&mut len_buf[..1]).await?;
                if n == 0 {
                    return Ok(None);
                }
                reader.read_exact(&mut len_buf[1..]).await?;
                let size = u32::from_be_bytes(len_buf) as usize;
                if size > MAX_MESSAGE_SIZE {
                    return Err(oversized(size));
                }
                let mut payload = vec![0u8; size];
                reader.read_exact(&mut payload).await?;
                let text = String::from_utf8(payload).map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
                })?;
                Ok(Some(text))
            }
        }
    }
}

/// Writer half of a message codec.
pub enum FrameWriter<W: AsyncWrite + Unpin> {
    Newline(W),
    LengthPrefixed(W),
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn newline(writer: W) -> Self {
        Self::Newline(writer)
    }

    pub fn length_prefixed(writer: W) -> Self {
        Self::LengthPrefixed(writer)
    }

    pub async fn write_message(&mut self, payload: &str) -> std::io::Result<()> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(oversized(payload.len()));
        }
        match self {
            Self::Newline(writer) => {
                writer.write_all(payload.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            }
            Self::LengthPrefixed(writer) => {
                writer
                    .write_all(&(payload.len() as u32).to_be_bytes())
                    .await?;
                writer.write_all(payload.as_bytes()).await?;
                writer.flush().await
            }
        }
    }

    /// Close the underlying stream (EOF to the agent's stdin).
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Self::Newline(writer) | Self::LengthPrefixed(writer) => writer.shutdown().await,
        }
    }
}
