// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! RESP frame decoder and encoder.
//!
//! The decoder is written against `AsyncBufRead` so it can consume the
//! snapshot pipe, the replication stream and target reply streams alike.
//! It understands the five classic frame types plus two quirks of
//! replication links:
//!
//! - bare `\n` keepalive bytes between frames are skipped;
//! - inline (non-array) commands are split on whitespace.
//!
//! Binary payloads are kept as `Vec<u8>` end to end; only verbs are
//! required to be ASCII.

use crate::error::{RelayError, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

/// Upper bound for a single bulk payload (the standard 512 MiB proto limit).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Upper bound for array arity.
const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// A decoded RESP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK` style status line.
    Status(Vec<u8>),
    /// `-ERR ...` error line.
    Error(String),
    /// `:42` integer.
    Integer(i64),
    /// `$n` bulk payload.
    Bulk(Vec<u8>),
    /// `$-1` null bulk.
    Nil,
    /// `*n` array.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Whether this frame is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Status line as UTF-8, if this is a status frame.
    pub fn as_status(&self) -> Option<&str> {
        match self {
            RespValue::Status(s) => std::str::from_utf8(s).ok(),
            _ => None,
        }
    }
}

/// A command pulled off the replication stream: a case-normalized verb
/// plus its argument payloads. Consumed exactly once by the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Verb, lowercased at parse time (comparison is case-insensitive).
    pub verb: String,
    /// Ordered argument byte-slices.
    pub args: Vec<Vec<u8>>,
}

impl Command {
    /// Build a command, normalizing the verb.
    pub fn new(verb: &str, args: Vec<Vec<u8>>) -> Self {
        Self {
            verb: verb.to_ascii_lowercase(),
            args,
        }
    }

    /// Total payload length (verb plus argument bytes), used by the
    /// sender's flush accounting.
    pub fn wire_len(&self) -> u64 {
        self.verb.len() as u64 + self.args.iter().map(|a| a.len() as u64).sum::<u64>()
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.verb)?;
        for arg in &self.args {
            write!(f, " {}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

fn eof() -> RelayError {
    RelayError::network_msg("stream", "unexpected end of stream")
}

/// Read one CRLF-terminated line, excluding the terminator. Binary safe.
pub async fn read_line<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let n = r
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| RelayError::network("stream", e))?;
    if n == 0 {
        return Err(eof());
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(line)
}

async fn read_byte<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    match r.read_exact(&mut b).await {
        Ok(_) => Ok(b[0]),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(eof()),
        Err(e) => Err(RelayError::network("stream", e)),
    }
}

fn parse_decimal(line: &[u8], what: &str) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            RelayError::Parse(format!(
                "invalid {what} length {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}

async fn read_bulk_body<R: AsyncBufRead + Unpin>(r: &mut R, len: i64) -> Result<RespValue> {
    if len == -1 {
        return Ok(RespValue::Nil);
    }
    if len < 0 || len > MAX_BULK_LEN {
        return Err(RelayError::Parse(format!("bulk length {len} out of range")));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)
        .await
        .map_err(|e| RelayError::network("stream", e))?;
    // consume trailing CRLF
    let mut crlf = [0u8; 2];
    r.read_exact(&mut crlf)
        .await
        .map_err(|e| RelayError::network("stream", e))?;
    if &crlf != b"\r\n" {
        return Err(RelayError::Parse("bulk payload missing CRLF".to_string()));
    }
    Ok(RespValue::Bulk(buf))
}

/// Decode one RESP reply frame.
pub async fn read_value<R: AsyncBufRead + Unpin + Send>(r: &mut R) -> Result<RespValue> {
    let first = read_byte(r).await?;
    match first {
        b'+' => Ok(RespValue::Status(read_line(r).await?)),
        b'-' => {
            let line = read_line(r).await?;
            Ok(RespValue::Error(
                String::from_utf8_lossy(&line).into_owned(),
            ))
        }
        b':' => {
            let line = read_line(r).await?;
            Ok(RespValue::Integer(parse_decimal(&line, "integer")?))
        }
        b'$' => {
            let len = parse_decimal(&read_line(r).await?, "bulk")?;
            read_bulk_body(r, len).await
        }
        b'*' => {
            let len = parse_decimal(&read_line(r).await?, "array")?;
            if len == -1 {
                return Ok(RespValue::Nil);
            }
            if len < 0 || len > MAX_ARRAY_LEN {
                return Err(RelayError::Parse(format!("array length {len} out of range")));
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(read_value_boxed(r).await?);
            }
            Ok(RespValue::Array(items))
        }
        other => Err(RelayError::Parse(format!(
            "unexpected frame type byte 0x{other:02x}"
        ))),
    }
}

/// Type-erased recursion point for nested arrays.
fn read_value_boxed<'a, R: AsyncBufRead + Unpin + Send>(
    r: &'a mut R,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<RespValue>> + Send + 'a>> {
    Box::pin(read_value(r))
}

/// Decode one command from the replication stream.
///
/// Skips bare newline keepalives, accepts array framing and falls back to
/// inline (whitespace-split) parsing for anything else.
pub async fn read_command<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Command> {
    loop {
        let first = read_byte(r).await?;
        match first {
            b'\n' | b'\r' => continue, // keepalive padding between frames
            b'*' => {
                let len = parse_decimal(&read_line(r).await?, "array")?;
                if len <= 0 || len > MAX_ARRAY_LEN {
                    return Err(RelayError::Parse(format!(
                        "command array length {len} out of range"
                    )));
                }
                let mut parts = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    let b = read_byte(r).await?;
                    if b != b'$' {
                        return Err(RelayError::Parse(format!(
                            "command element is not a bulk (0x{b:02x})"
                        )));
                    }
                    let blen = parse_decimal(&read_line(r).await?, "bulk")?;
                    match read_bulk_body(r, blen).await? {
                        RespValue::Bulk(data) => parts.push(data),
                        _ => {
                            return Err(RelayError::Parse(
                                "null bulk inside command array".to_string(),
                            ))
                        }
                    }
                }
                let verb = String::from_utf8_lossy(&parts[0]).to_ascii_lowercase();
                return Ok(Command {
                    verb,
                    args: parts.split_off(1),
                });
            }
            other => {
                // inline command: the already-consumed byte starts the line
                let mut line = vec![other];
                line.extend(read_line(r).await?);
                let mut parts = line
                    .split(|b| b.is_ascii_whitespace())
                    .filter(|p| !p.is_empty())
                    .map(|p| p.to_vec());
                let verb = match parts.next() {
                    Some(v) => String::from_utf8_lossy(&v).to_ascii_lowercase(),
                    None => continue, // blank line
                };
                return Ok(Command {
                    verb,
                    args: parts.collect(),
                });
            }
        }
    }
}

/// Encode a command in array framing.
pub fn encode_command(verb: &str, args: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", args.len() + 1).as_bytes());
    out.extend_from_slice(format!("${}\r\n", verb.len()).as_bytes());
    out.extend_from_slice(verb.as_bytes());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Encode and write a command, without flushing.
pub async fn write_command<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    verb: &str,
    args: &[&[u8]],
) -> std::io::Result<()> {
    w.write_all(&encode_command(verb, args)).await
}
