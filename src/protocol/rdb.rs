// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot (RDB) record parser.
//!
//! Walks the dump stream opcode by opcode and re-frames every key's
//! serialized value as an opaque payload a target will accept from a single
//! atomic `RESTORE`: the original value-type byte and encoding bytes are
//! captured verbatim, then a format-version word and a CRC-64 footer are
//! appended. Nothing is decoded that does not have to be — only keys (for
//! filtering) and container lengths (to find the end of each value).
//!
//! Aux fields, resize hints and expiry opcodes are consumed and dropped.
//! Value encodings that cannot be skipped safely (modules, streams) are a
//! parse error: forwarding a mis-framed payload would corrupt the target.

use crate::error::{RelayError, Result};
use crate::protocol::crc64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Bound of the record channel between the parser and the restorer pool.
pub const RECORD_PIPE_SIZE: usize = 1024;

// Opcodes above the value-type range.
const OP_EOF: u8 = 0xff;
const OP_SELECTDB: u8 = 0xfe;
const OP_EXPIRETIME: u8 = 0xfd;
const OP_EXPIRETIME_MS: u8 = 0xfc;
const OP_RESIZEDB: u8 = 0xfb;
const OP_AUX: u8 = 0xfa;
const OP_FREQ: u8 = 0xf9;
const OP_IDLE: u8 = 0xf8;

// Value types we know how to re-frame.
const T_STRING: u8 = 0;
const T_LIST: u8 = 1;
const T_SET: u8 = 2;
const T_ZSET: u8 = 3;
const T_HASH: u8 = 4;
const T_ZSET_2: u8 = 5;
const T_HASH_ZIPMAP: u8 = 9;
const T_LIST_ZIPLIST: u8 = 10;
const T_SET_INTSET: u8 = 11;
const T_ZSET_ZIPLIST: u8 = 12;
const T_HASH_ZIPLIST: u8 = 13;
const T_LIST_QUICKLIST: u8 = 14;
const T_HASH_LISTPACK: u8 = 16;
const T_ZSET_LISTPACK: u8 = 17;
const T_LIST_QUICKLIST_2: u8 = 18;
const T_SET_LISTPACK: u8 = 20;

/// One restorable unit extracted from the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Database index the record belongs to.
    pub db: u32,
    /// Key bytes, decoded (integer-encoded and compressed keys included).
    pub key: Vec<u8>,
    /// `RESTORE`-ready payload: type byte + encoded value + version + CRC-64.
    pub payload: Vec<u8>,
}

/// Streaming parser over the snapshot portion of the replication link.
pub struct RdbLoader<'a, R> {
    r: &'a mut R,
    /// Bytes consumed so far, mirrored into the shared counter.
    consumed: u64,
    rbytes: Arc<AtomicU64>,
    /// Running checksum of everything consumed except the footer itself.
    crc: u64,
    /// Format version from the header; decides footer handling.
    version: u32,
    current_db: u32,
    started: bool,
    finished: bool,
    /// Capture buffer for the value bytes of the record being parsed.
    capture: Option<Vec<u8>>,
}

impl<'a, R: AsyncRead + Unpin> RdbLoader<'a, R> {
    /// Create a loader over `r`, mirroring consumed bytes into `rbytes`.
    pub fn new(r: &'a mut R, rbytes: Arc<AtomicU64>) -> Self {
        Self {
            r,
            consumed: 0,
            rbytes,
            crc: 0,
            version: 0,
            current_db: 0,
            started: false,
            finished: false,
            capture: None,
        }
    }

    /// Total snapshot bytes consumed so far.
    pub fn bytes_consumed(&self) -> u64 {
        self.consumed
    }

    /// Format version parsed from the header.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Pull the next record, or `None` once the end-of-file opcode (and
    /// footer checksum, when present) has been consumed.
    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        if self.finished {
            return Ok(None);
        }
        if !self.started {
            self.read_header().await?;
            self.started = true;
        }

        loop {
            let op = self.read_u8().await?;
            match op {
                OP_EOF => {
                    if self.version >= 5 {
                        // Footer checksum covers every byte before it.
                        let expect = self.crc;
                        let mut footer = [0u8; 8];
                        self.read_exact(&mut footer).await?;
                        let stored = u64::from_le_bytes(footer);
                        // All-zero means checksumming was disabled at dump time.
                        if stored != 0 && stored != expect {
                            return Err(RelayError::Parse(format!(
                                "snapshot checksum mismatch: stored {stored:#018x}, computed {expect:#018x}"
                            )));
                        }
                    }
                    self.finished = true;
                    return Ok(None);
                }
                OP_SELECTDB => {
                    let (db, _) = self.read_length().await?;
                    self.current_db = db as u32;
                }
                OP_RESIZEDB => {
                    self.read_length().await?;
                    self.read_length().await?;
                }
                OP_AUX => {
                    self.skip_string().await?;
                    self.skip_string().await?;
                }
                OP_EXPIRETIME => {
                    let mut buf = [0u8; 4];
                    self.read_exact(&mut buf).await?;
                }
                OP_EXPIRETIME_MS => {
                    let mut buf = [0u8; 8];
                    self.read_exact(&mut buf).await?;
                }
                OP_FREQ => {
                    self.read_u8().await?;
                }
                OP_IDLE => {
                    self.read_length().await?;
                }
                value_type => {
                    let key = self.read_key().await?;
                    let payload = self.read_value_payload(value_type).await?;
                    return Ok(Some(Record {
                        db: self.current_db,
                        key,
                        payload,
                    }));
                }
            }
        }
    }

    async fn read_header(&mut self) -> Result<()> {
        let mut header = [0u8; 9];
        self.read_exact(&mut header).await?;
        if &header[..5] != b"REDIS" {
            return Err(RelayError::Parse("snapshot missing REDIS header".to_string()));
        }
        let version = std::str::from_utf8(&header[5..])
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| RelayError::Parse("snapshot header version not numeric".to_string()))?;
        self.version = version;
        Ok(())
    }

    /// Capture `value_type` and the raw value encoding, then frame them as
    /// a restore payload with version word and checksum footer.
    async fn read_value_payload(&mut self, value_type: u8) -> Result<Vec<u8>> {
        self.capture = Some(vec![value_type]);
        let skipped = self.skip_value(value_type).await;
        let mut payload = self.capture.take().unwrap_or_default();
        skipped?;

        // Footer: 2-byte version, then CRC-64 of payload + version.
        let footer_version = self.version.min(u16::MAX as u32) as u16;
        payload.extend_from_slice(&footer_version.to_le_bytes());
        let crc = crc64::checksum(&payload);
        payload.extend_from_slice(&crc.to_le_bytes());
        Ok(payload)
    }

    async fn skip_value(&mut self, value_type: u8) -> Result<()> {
        match value_type {
            T_STRING => self.skip_string().await?,
            T_LIST | T_SET => {
                let (n, _) = self.read_length().await?;
                for _ in 0..n {
                    self.skip_string().await?;
                }
            }
            T_ZSET => {
                let (n, _) = self.read_length().await?;
                for _ in 0..n {
                    self.skip_string().await?;
                    self.skip_legacy_double().await?;
                }
            }
            T_HASH => {
                let (n, _) = self.read_length().await?;
                for _ in 0..n {
                    self.skip_string().await?;
                    self.skip_string().await?;
                }
            }
            T_ZSET_2 => {
                let (n, _) = self.read_length().await?;
                for _ in 0..n {
                    self.skip_string().await?;
                    let mut d = [0u8; 8];
                    self.read_exact(&mut d).await?;
                }
            }
            // Single-string container encodings.
            T_HASH_ZIPMAP | T_LIST_ZIPLIST | T_SET_INTSET | T_ZSET_ZIPLIST | T_HASH_ZIPLIST
            | T_HASH_LISTPACK | T_ZSET_LISTPACK | T_SET_LISTPACK => self.skip_string().await?,
            T_LIST_QUICKLIST => {
                let (n, _) = self.read_length().await?;
                for _ in 0..n {
                    self.skip_string().await?;
                }
            }
            T_LIST_QUICKLIST_2 => {
                let (n, _) = self.read_length().await?;
                for _ in 0..n {
                    // container kind (plain or packed), then the node
                    self.read_length().await?;
                    self.skip_string().await?;
                }
            }
            other => {
                return Err(RelayError::Parse(format!(
                    "unsupported snapshot value type {other}"
                )))
            }
        }
        Ok(())
    }

    /// Legacy zset score: one length byte then that many ASCII digits,
    /// with 253/254/255 marking nan/+inf/-inf.
    async fn skip_legacy_double(&mut self) -> Result<()> {
        let len = self.read_u8().await?;
        if len < 253 {
            let mut buf = vec![0u8; len as usize];
            self.read_exact(&mut buf).await?;
        }
        Ok(())
    }

    /// Read a key string, decoding integer and compressed forms.
    async fn read_key(&mut self) -> Result<Vec<u8>> {
        debug_assert!(self.capture.is_none());
        let (len, encoded) = self.read_length().await?;
        if !encoded {
            let mut buf = vec![0u8; len as usize];
            self.read_exact(&mut buf).await?;
            return Ok(buf);
        }
        match len {
            0 => {
                let v = self.read_u8().await? as i8;
                Ok(v.to_string().into_bytes())
            }
            1 => {
                let mut b = [0u8; 2];
                self.read_exact(&mut b).await?;
                Ok(i16::from_le_bytes(b).to_string().into_bytes())
            }
            2 => {
                let mut b = [0u8; 4];
                self.read_exact(&mut b).await?;
                Ok(i32::from_le_bytes(b).to_string().into_bytes())
            }
            3 => {
                let (clen, _) = self.read_length().await?;
                let (ulen, _) = self.read_length().await?;
                let mut compressed = vec![0u8; clen as usize];
                self.read_exact(&mut compressed).await?;
                lzf_decompress(&compressed, ulen as usize)
            }
            other => Err(RelayError::Parse(format!(
                "unknown string encoding {other}"
            ))),
        }
    }

    /// Consume one string field without decoding it.
    async fn skip_string(&mut self) -> Result<()> {
        let (len, encoded) = self.read_length().await?;
        if !encoded {
            self.skip_bytes(len as usize).await?;
            return Ok(());
        }
        match len {
            0 => self.skip_bytes(1).await?,
            1 => self.skip_bytes(2).await?,
            2 => self.skip_bytes(4).await?,
            3 => {
                let (clen, _) = self.read_length().await?;
                self.read_length().await?; // uncompressed length
                self.skip_bytes(clen as usize).await?;
            }
            other => {
                return Err(RelayError::Parse(format!(
                    "unknown string encoding {other}"
                )))
            }
        }
        Ok(())
    }

    /// Length encoding: top two bits of the first byte select the form.
    async fn read_length(&mut self) -> Result<(u64, bool)> {
        let b0 = self.read_u8().await?;
        match b0 >> 6 {
            0b00 => Ok(((b0 & 0x3f) as u64, false)),
            0b01 => {
                let b1 = self.read_u8().await?;
                Ok(((((b0 & 0x3f) as u64) << 8) | b1 as u64, false))
            }
            0b10 => match b0 {
                0x80 => {
                    let mut b = [0u8; 4];
                    self.read_exact(&mut b).await?;
                    Ok((u32::from_be_bytes(b) as u64, false))
                }
                0x81 => {
                    let mut b = [0u8; 8];
                    self.read_exact(&mut b).await?;
                    Ok((u64::from_be_bytes(b), false))
                }
                other => Err(RelayError::Parse(format!(
                    "invalid length marker 0x{other:02x}"
                ))),
            },
            _ => Ok((((b0 & 0x3f) as u64), true)),
        }
    }

    async fn skip_bytes(&mut self, mut n: usize) -> Result<()> {
        let mut buf = [0u8; 4096];
        while n > 0 {
            let take = n.min(buf.len());
            self.read_exact(&mut buf[..take]).await?;
            n -= take;
        }
        Ok(())
    }

    async fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b).await?;
        Ok(b[0])
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.r.read_exact(buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                RelayError::Parse("snapshot truncated".to_string())
            } else {
                RelayError::network("source snapshot", e)
            }
        })?;
        self.consumed += buf.len() as u64;
        self.rbytes.fetch_add(buf.len() as u64, Ordering::Relaxed);
        self.crc = crc64::update(self.crc, buf);
        if let Some(capture) = self.capture.as_mut() {
            capture.extend_from_slice(buf);
        }
        Ok(())
    }
}

/// LZF decompression for compressed string fields.
fn lzf_decompress(input: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    let mut i = 0usize;
    while i < input.len() {
        let ctrl = input[i] as usize;
        i += 1;
        if ctrl < 32 {
            // literal run of ctrl + 1 bytes
            let run = ctrl + 1;
            if i + run > input.len() {
                return Err(RelayError::Parse("lzf literal run truncated".to_string()));
            }
            out.extend_from_slice(&input[i..i + run]);
            i += run;
        } else {
            let mut len = ctrl >> 5;
            if len == 7 {
                if i >= input.len() {
                    return Err(RelayError::Parse("lzf length byte truncated".to_string()));
                }
                len += input[i] as usize;
                i += 1;
            }
            if i >= input.len() {
                return Err(RelayError::Parse("lzf back-reference truncated".to_string()));
            }
            let distance = ((ctrl & 0x1f) << 8) + input[i] as usize + 1;
            i += 1;
            if distance > out.len() {
                return Err(RelayError::Parse("lzf back-reference out of range".to_string()));
            }
            let start = out.len() - distance;
            // copies may overlap their own output, so go byte by byte
            for k in 0..len + 2 {
                let b = out[start + k];
                out.push(b);
            }
        }
    }
    if out.len() != expected_len {
        return Err(RelayError::Parse(format!(
            "lzf expanded to {} bytes, expected {expected_len}",
            out.len()
        )));
    }
    Ok(out)
}
