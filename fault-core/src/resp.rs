// fault-core/src/resp.rs
// RESP wire codec: command arrays in, opaque replies out
//
// Command format: `*<n>\r\n` followed by n bulk strings `$<len>\r\n<bytes>\r\n`.
// Whitespace separated inline commands (`PING\r\n`) are accepted as well.
// Replies are framed but never interpreted: the proxy relays them byte-for-byte.

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Maximum bulk string length accepted from a peer (512MB, same as Redis).
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Maximum number of elements in a command array or reply aggregate.
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Maximum length of a header or inline line, terminator included.
pub const MAX_LINE_LEN: usize = 64 * 1024;

pub const OK_REPLY: &[u8] = b"+OK\r\n";

/// Wire format error types.
#[derive(Debug, Error)]
pub enum WireError {
    /// Peer closed the stream cleanly between two frames.
    #[error("connection closed by peer")]
    Closed,

    /// Stream ended in the middle of a frame.
    #[error("unexpected end of stream inside a frame")]
    UnexpectedEof,

    /// First byte of a reply is not a known RESP type marker.
    #[error("invalid frame prefix: {0:#04x}")]
    InvalidPrefix(u8),

    /// Length header is not a valid integer, or a bulk lacks its terminator.
    #[error("invalid length header: {0}")]
    InvalidLength(String),

    /// Declared size exceeds the configured maximum.
    #[error("frame too large: {size} (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("line exceeds {} bytes", MAX_LINE_LEN)]
    LineTooLong,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One decoded client command together with the exact bytes it arrived as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Vec<u8>>,
    raw: Vec<u8>,
}

impl Command {
    /// Upper-cased command name.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_ascii_uppercase()
    }

    /// Arguments after the command name.
    pub fn params(&self) -> &[Vec<u8>] {
        &self.args[1..]
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Interpretation of a reply's leading line, used by control-plane clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyKind {
    Status(String),
    Error(String),
    Other(u8),
}

/// One complete reply frame, kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    raw: Vec<u8>,
}

impl Reply {
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }

    pub fn kind(&self) -> ReplyKind {
        let first_line = self
            .raw
            .split(|b| *b == b'\n')
            .next()
            .unwrap_or_default();
        let text = String::from_utf8_lossy(&first_line[1.min(first_line.len())..])
            .trim_end_matches('\r')
            .to_string();
        match self.raw.first() {
            Some(b'+') => ReplyKind::Status(text),
            Some(b'-') => ReplyKind::Error(text),
            Some(other) => ReplyKind::Other(*other),
            None => ReplyKind::Other(0),
        }
    }
}

/// Buffered frame reader over one direction of a connection.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    max_bulk: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_bulk(inner, MAX_BULK_LEN)
    }

    pub fn with_max_bulk(inner: R, max_bulk: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            max_bulk,
        }
    }

    /// Read the next command. Empty arrays and blank inline lines are skipped.
    pub async fn read_command(&mut self) -> Result<Command, WireError> {
        loop {
            let mut raw = Vec::new();
            let line = match self.read_line(&mut raw).await? {
                Some(line) => line,
                None => return Err(WireError::Closed),
            };

            if line.first() == Some(&b'*') {
                let count = parse_length(&line[1..])?;
                if count <= 0 {
                    continue;
                }
                let count = checked_size(count, MAX_ARRAY_LEN)?;

                let mut args = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let header = self
                        .read_line(&mut raw)
                        .await?
                        .ok_or(WireError::UnexpectedEof)?;
                    if header.first() != Some(&b'$') {
                        return Err(WireError::InvalidLength(format!(
                            "expected bulk string, got {:?}",
                            String::from_utf8_lossy(&header)
                        )));
                    }
                    let len = parse_length(&header[1..])?;
                    if len < 0 {
                        return Err(WireError::InvalidLength(len.to_string()));
                    }
                    let len = checked_size(len, self.max_bulk)?;
                    let payload = self.read_bulk_body(len, &mut raw).await?;
                    args.push(payload);
                }
                return Ok(Command { args, raw });
            }

            let args: Vec<Vec<u8>> = line
                .split(|b| b.is_ascii_whitespace())
                .filter(|part| !part.is_empty())
                .map(|part| part.to_vec())
                .collect();
            if args.is_empty() {
                continue;
            }
            return Ok(Command { args, raw });
        }
    }

    /// Read exactly one reply frame, descending into aggregates.
    pub async fn read_reply(&mut self) -> Result<Reply, WireError> {
        let mut raw = Vec::new();
        // Number of frames still owed by open aggregates, starting with the reply itself.
        let mut pending: usize = 1;
        let mut first = true;

        while pending > 0 {
            pending -= 1;
            let line = match self.read_line(&mut raw).await? {
                Some(line) => line,
                None if first => return Err(WireError::Closed),
                None => return Err(WireError::UnexpectedEof),
            };
            first = false;

            let (&prefix, body) = line
                .split_first()
                .ok_or_else(|| WireError::InvalidLength("empty reply line".to_string()))?;
            match prefix {
                b'+' | b'-' | b':' | b'_' | b',' | b'#' | b'(' => {}
                b'$' | b'=' | b'!' => {
                    let len = parse_length(body)?;
                    if len >= 0 {
                        let len = checked_size(len, self.max_bulk)?;
                        self.read_bulk_body(len, &mut raw).await?;
                    }
                }
                b'*' | b'~' | b'>' => {
                    let count = parse_length(body)?;
                    if count > 0 {
                        pending += checked_size(count, MAX_ARRAY_LEN)?;
                    }
                }
                b'%' => {
                    let count = parse_length(body)?;
                    if count > 0 {
                        pending += 2 * checked_size(count, MAX_ARRAY_LEN)?;
                    }
                }
                // Attributes precede the reply they annotate.
                b'|' => {
                    let count = parse_length(body)?;
                    pending += 2 * checked_size(count.max(0), MAX_ARRAY_LEN)? + 1;
                }
                other => return Err(WireError::InvalidPrefix(other)),
            }
        }

        Ok(Reply { raw })
    }

    /// Read one `\n`-terminated line into `raw`, returning it without the line ending.
    /// `None` means the stream ended before any byte of the line was read.
    async fn read_line(&mut self, raw: &mut Vec<u8>) -> Result<Option<Vec<u8>>, WireError> {
        let mut line = Vec::new();
        let limit = (MAX_LINE_LEN + 1) as u64;
        let n = (&mut self.inner).take(limit).read_until(b'\n', &mut line).await?;

        if n == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            return Err(if line.len() > MAX_LINE_LEN {
                WireError::LineTooLong
            } else {
                WireError::UnexpectedEof
            });
        }

        raw.extend_from_slice(&line);
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    async fn read_bulk_body(&mut self, len: usize, raw: &mut Vec<u8>) -> Result<Vec<u8>, WireError> {
        // Grow with the data actually received instead of trusting the declared length.
        let mut body = Vec::with_capacity((len + 2).min(64 * 1024));
        (&mut self.inner)
            .take((len + 2) as u64)
            .read_to_end(&mut body)
            .await?;
        if body.len() < len + 2 {
            return Err(WireError::UnexpectedEof);
        }
        if &body[len..] != b"\r\n" {
            return Err(WireError::InvalidLength(format!(
                "bulk string of {} bytes is not CRLF terminated",
                len
            )));
        }
        raw.extend_from_slice(&body);
        body.truncate(len);
        Ok(body)
    }
}

fn parse_length(digits: &[u8]) -> Result<i64, WireError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| WireError::InvalidLength(String::from_utf8_lossy(digits).into_owned()))
}

fn checked_size(value: i64, max: usize) -> Result<usize, WireError> {
    let size = usize::try_from(value).map_err(|_| WireError::InvalidLength(value.to_string()))?;
    if size > max {
        return Err(WireError::TooLarge { size, max });
    }
    Ok(size)
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        let arg = arg.as_ref();
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Encode an error reply; `message` should start with an error code such as `ERR`.
pub fn error_reply(message: &str) -> Vec<u8> {
    format!("-{}\r\n", message.replace(['\r', '\n'], " ")).into_bytes()
}
