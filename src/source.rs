// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source replication link: handshake, snapshot demux and reopen loop.
//!
//! The source side is modeled as a byte producer whose concrete connection
//! can be swapped underneath: the demux task owns the link (both socket
//! halves) and writes one continuous byte stream into the snapshot pipe
//! across reconnects. Downstream consumers never observe a reopen.
//!
//! # Connection Lifecycle
//!
//! ```text
//! handshake ──→ snapshot copy ──→ stream copy ──→ (error) reopen loop
//!                    │                 ↑                    │
//!                    │ 1 Hz ACK 0      │ 1 Hz ACK offset    │ resume at
//!                    └─────────────────┴────────────────────┘ (runid, offset)
//! ```
//!
//! A connection generation is closed exactly once: the demux task is the
//! only owner, and replacing the link drops the previous socket.

use crate::config::{AuthType, READER_BUFFER_SIZE};
use crate::error::{RelayError, Result};
use crate::pipe::PipeWriter;
use crate::protocol::resp::{self, RespValue};
use crate::status::{StatusCell, SyncStatus};
use crate::syncer::SyncerShared;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How the source endpoint is reached and authenticated.
#[derive(Debug, Clone)]
pub struct SourceEndpoint {
    pub addr: String,
    pub auth_type: AuthType,
    pub password: String,
    /// Port advertised via `REPLCONF listening-port`.
    pub listening_port: u16,
}

impl SourceEndpoint {
    fn label(&self) -> String {
        format!("source {}", self.addr)
    }
}

/// An open replication connection to the source.
#[derive(Debug)]
pub struct SourceLink {
    endpoint: SourceEndpoint,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SourceLink {
    /// Dial and authenticate.
    pub async fn open(endpoint: &SourceEndpoint) -> Result<Self> {
        let stream = TcpStream::connect(&endpoint.addr)
            .await
            .map_err(|e| RelayError::network(endpoint.label(), e))?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let mut link = Self {
            endpoint: endpoint.clone(),
            reader: BufReader::with_capacity(READER_BUFFER_SIZE, read_half),
            writer: write_half,
        };
        if !endpoint.password.is_empty() {
            let reply = link
                .call(endpoint.auth_type.verb(), &[endpoint.password.as_bytes()])
                .await?;
            match reply {
                RespValue::Status(_) => {}
                RespValue::Error(msg) => {
                    return Err(RelayError::Auth {
                        endpoint: endpoint.label(),
                        message: msg,
                    })
                }
                other => {
                    return Err(RelayError::protocol(
                        "source auth",
                        format!("unexpected reply {other:?}"),
                    ))
                }
            }
        }
        Ok(link)
    }

    async fn call(&mut self, verb: &str, args: &[&[u8]]) -> Result<RespValue> {
        self.write_command(verb, args).await?;
        resp::read_value(&mut self.reader).await
    }

    async fn write_command(&mut self, verb: &str, args: &[&[u8]]) -> Result<()> {
        self.writer
            .write_all(&resp::encode_command(verb, args))
            .await
            .map_err(|e| RelayError::network(self.endpoint.label(), e))
    }

    /// Advertise our listening port so the source lists this replica.
    pub async fn advertise_port(&mut self) -> Result<()> {
        let port = self.endpoint.listening_port.to_string();
        let reply = self
            .call("replconf", &[b"listening-port", port.as_bytes()])
            .await?;
        match reply {
            RespValue::Status(_) => Ok(()),
            other => Err(RelayError::protocol(
                "replconf listening-port",
                format!("unexpected reply {other:?}"),
            )),
        }
    }

    /// Split into raw halves for the demux loop.
    fn into_parts(self) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        (self.reader, self.writer)
    }

    /// Wait for the snapshot-size announcement (`$<N>` header), tolerating
    /// newline keepalives and logging liveness at one-second cadence.
    ///
    /// Accumulates bytes across poll timeouts so a header split over a
    /// timeout boundary is never lost.
    async fn wait_snapshot_size(&mut self, syncer_id: usize) -> Result<u64> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match timeout(Duration::from_secs(1), self.reader.read_exact(&mut byte)).await {
                Err(_) => {
                    debug!(syncer_id, "waiting for snapshot size");
                    continue;
                }
                Ok(Err(e)) => return Err(RelayError::network(self.endpoint.label(), e)),
                Ok(Ok(_)) => {}
            }
            if byte[0] != b'\n' {
                line.push(byte[0]);
                continue;
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                debug!(syncer_id, "source keepalive while dump in progress");
                continue;
            }
            if line[0] != b'$' {
                return Err(RelayError::protocol(
                    "snapshot size",
                    format!("expected bulk header, got {:?}", String::from_utf8_lossy(&line)),
                ));
            }
            let body = &line[1..];
            if body.starts_with(b"EOF:") {
                return Err(RelayError::protocol(
                    "snapshot size",
                    "diskless EOF-delimited dump is not supported".to_string(),
                ));
            }
            return std::str::from_utf8(body)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| {
                    RelayError::protocol(
                        "snapshot size",
                        format!("bad length {:?}", String::from_utf8_lossy(body)),
                    )
                });
        }
    }
}

/// Result of a completed handshake: a link positioned at the first
/// snapshot byte, plus resume coordinates.
#[derive(Debug)]
pub struct Handshake {
    pub link: SourceLink,
    pub snapshot_size: u64,
    /// Replication history id; `None` in classic mode.
    pub runid: Option<String>,
    /// Starting replication offset; `0` in classic mode.
    pub offset: i64,
}

/// Classic handshake: `SYNC`, then poll for the size announcement.
pub async fn handshake_sync(endpoint: &SourceEndpoint, syncer_id: usize) -> Result<Handshake> {
    let mut link = SourceLink::open(endpoint).await?;
    link.write_command("sync", &[]).await?;
    let snapshot_size = link.wait_snapshot_size(syncer_id).await?;
    info!(syncer_id, size = snapshot_size, "classic sync negotiated");
    Ok(Handshake {
        link,
        snapshot_size,
        runid: None,
        offset: 0,
    })
}

/// Partial handshake: advertise the listening port, request a full resync
/// with the `(?, -1)` sentinel and collect `(runid, offset, size)`.
pub async fn handshake_psync(endpoint: &SourceEndpoint, syncer_id: usize) -> Result<Handshake> {
    let mut link = SourceLink::open(endpoint).await?;
    link.advertise_port().await?;
    link.write_command("psync", &[b"?", b"-1"]).await?;

    // +FULLRESYNC <runid> <offset>, possibly preceded by keepalives.
    let (runid, offset) = loop {
        let line = resp::read_line(&mut link.reader).await?;
        if line.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        let mut parts = text.trim_start_matches('+').split_ascii_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(word), Some(runid), Some(offset)) if word.eq_ignore_ascii_case("fullresync") => {
                let offset: i64 = offset.parse().map_err(|_| {
                    RelayError::protocol("psync", format!("bad offset in {text:?}"))
                })?;
                break (runid.to_string(), offset);
            }
            _ => {
                return Err(RelayError::protocol(
                    "psync",
                    format!("expected +FULLRESYNC, got {text:?}"),
                ))
            }
        }
    };

    let snapshot_size = link.wait_snapshot_size(syncer_id).await?;
    info!(
        syncer_id,
        runid = %runid,
        offset,
        size = snapshot_size,
        "partial resync negotiated, full sync"
    );
    Ok(Handshake {
        link,
        snapshot_size,
        runid: Some(runid),
        offset,
    })
}

/// Run the snapshot demux and stream copy.
///
/// Copies exactly `snapshot_size` bytes of dump, then keeps pumping the
/// command stream into the same pipe. A 1 Hz ACK ticker reports offset `0`
/// until snapshot-done, then `start offset + streamed bytes`. Source errors
/// after snapshot completion enter the reopen loop (psync only); before
/// completion they are fatal.
pub async fn run_demux(
    link: SourceLink,
    mut pipe: PipeWriter,
    snapshot_size: u64,
    runid: Option<String>,
    shared: Arc<SyncerShared>,
    status: Arc<StatusCell>,
) -> Result<()> {
    let endpoint = link.endpoint.clone();
    let psync = runid.is_some();
    let (mut reader, mut writer) = link.into_parts();
    let mut remaining_snapshot = snapshot_size;
    let mut ack_timer = tokio::time::interval(Duration::from_secs(1));
    ack_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            _ = ack_timer.tick() => {
                if psync {
                    let offset = if shared.snapshot_done() {
                        shared.applied_offset()
                    } else {
                        0
                    };
                    if let Err(e) = write_ack(&mut writer, offset).await {
                        // the read side will surface the broken link next
                        debug!(syncer_id = shared.id, error = %e, "ack write failed");
                    }
                }
            }
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        let link = reopen_or_fail(
                            &endpoint,
                            &runid,
                            remaining_snapshot,
                            &shared,
                            &status,
                            RelayError::network_msg(endpoint.label(), "replication stream closed"),
                        ).await?;
                        (reader, writer) = link.into_parts();
                    }
                    Ok(n) => {
                        if pipe.write_all(&buf[..n]).await.is_err() {
                            return Err(RelayError::Internal(
                                "snapshot pipe closed by consumer".to_string(),
                            ));
                        }
                        let snap = (n as u64).min(remaining_snapshot);
                        remaining_snapshot -= snap;
                        let streamed = n as u64 - snap;
                        if streamed > 0 {
                            let applied = shared.add_applied_offset(streamed as i64);
                            crate::metrics::set_target_offset(shared.id, applied);
                        }
                    }
                    Err(e) => {
                        let link = reopen_or_fail(
                            &endpoint,
                            &runid,
                            remaining_snapshot,
                            &shared,
                            &status,
                            RelayError::network(endpoint.label(), e),
                        ).await?;
                        (reader, writer) = link.into_parts();
                    }
                }
            }
        }
    }
}

/// Write a replication ACK carrying `offset`. No reply is expected.
async fn write_ack(writer: &mut OwnedWriteHalf, offset: i64) -> std::io::Result<()> {
    let offset = offset.to_string();
    writer
        .write_all(&resp::encode_command("replconf", &[b"ack", offset.as_bytes()]))
        .await
}

/// Enter the reopen loop, or bail out when resume is not possible.
///
/// Resume requires psync mode and a fully transferred snapshot. The pipe
/// and applied offset are untouched; the new link continues the byte
/// stream exactly where the old one broke.
async fn reopen_or_fail(
    endpoint: &SourceEndpoint,
    runid: &Option<String>,
    remaining_snapshot: u64,
    shared: &Arc<SyncerShared>,
    status: &Arc<StatusCell>,
    cause: RelayError,
) -> Result<SourceLink> {
    let runid = match runid {
        Some(runid) if !cause.is_fatal(remaining_snapshot == 0) => runid.clone(),
        _ => return Err(cause),
    };

    warn!(syncer_id = shared.id, error = %cause, "source link broken, entering reopen loop");
    status.set(SyncStatus::Reopen);

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        match try_resume(endpoint, &runid, shared.applied_offset()).await {
            Ok(link) => {
                crate::metrics::record_source_reopen(shared.id, true);
                info!(
                    syncer_id = shared.id,
                    offset = shared.applied_offset(),
                    "source connection reopened, resume accepted"
                );
                status.set(SyncStatus::Incr);
                return Ok(link);
            }
            Err(e) => {
                crate::metrics::record_source_reopen(shared.id, false);
                // Only network errors are worth retrying; a source that
                // answers but refuses the resume will never accept it.
                if e.is_fatal(true) {
                    return Err(e);
                }
                warn!(syncer_id = shared.id, error = %e, "source reopen failed, retrying");
            }
        }
    }
}

async fn try_resume(
    endpoint: &SourceEndpoint,
    runid: &str,
    offset: i64,
) -> Result<SourceLink> {
    let mut link = SourceLink::open(endpoint).await?;
    link.advertise_port().await?;
    let offset_arg = offset.to_string();
    link.write_command("psync", &[runid.as_bytes(), offset_arg.as_bytes()])
        .await?;

    let line = resp::read_line(&mut link.reader).await?;
    let text = String::from_utf8_lossy(&line).into_owned();
    if text.trim_start_matches('+').to_ascii_lowercase().starts_with("continue") {
        Ok(link)
    } else {
        Err(RelayError::protocol(
            "psync resume",
            format!("expected +CONTINUE, got {text:?}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn endpoint(addr: &str) -> SourceEndpoint {
        SourceEndpoint {
            addr: addr.to_string(),
            auth_type: AuthType::Auth,
            password: String::new(),
            listening_port: 21345,
        }
    }

    /// Script a fake source for the psync handshake.
    async fn spawn_psync_source(
        preamble: &'static [u8],
    ) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut seen = Vec::new();

            // replconf listening-port
            let cmd = resp::read_command(&mut reader).await.unwrap();
            seen.push(cmd.to_string());
            write_half.write_all(b"+OK\r\n").await.unwrap();

            // psync ? -1
            let cmd = resp::read_command(&mut reader).await.unwrap();
            seen.push(cmd.to_string());
            write_half.write_all(preamble).await.unwrap();
            seen
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn psync_handshake_parses_fullresync() {
        let (addr, server) =
            spawn_psync_source(b"+FULLRESYNC abcdef0123456789 100\r\n$42\r\n").await;
        let hs = handshake_psync(&endpoint(&addr), 0).await.unwrap();

        assert_eq!(hs.snapshot_size, 42);
        assert_eq!(hs.runid.as_deref(), Some("abcdef0123456789"));
        assert_eq!(hs.offset, 100);

        let seen = server.await.unwrap();
        assert_eq!(seen[0], "replconf listening-port 21345");
        assert_eq!(seen[1], "psync ? -1");
    }

    #[tokio::test]
    async fn psync_handshake_tolerates_keepalives_before_size() {
        let (addr, _server) =
            spawn_psync_source(b"+FULLRESYNC runid1 0\r\n\n\n\n$7\r\n").await;
        let hs = handshake_psync(&endpoint(&addr), 0).await.unwrap();
        assert_eq!(hs.snapshot_size, 7);
    }

    #[tokio::test]
    async fn psync_handshake_rejects_error_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let _ = resp::read_command(&mut reader).await.unwrap();
            write_half.write_all(b"+OK\r\n").await.unwrap();
            let _ = resp::read_command(&mut reader).await.unwrap();
            write_half
                .write_all(b"-ERR unsupported\r\n")
                .await
                .unwrap();
        });

        let err = handshake_psync(&endpoint(&addr), 0).await.unwrap_err();
        assert!(matches!(err, RelayError::Protocol { .. }));
    }

    #[tokio::test]
    async fn classic_handshake_reads_size() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let cmd = resp::read_command(&mut reader).await.unwrap();
            // dump "in progress": two keepalives before the size
            write_half.write_all(b"\n\n$18\r\n").await.unwrap();
            cmd.to_string()
        });

        let hs = handshake_sync(&endpoint(&addr), 0).await.unwrap();
        assert_eq!(hs.snapshot_size, 18);
        assert!(hs.runid.is_none());
        assert_eq!(hs.offset, 0);
        assert_eq!(server.await.unwrap(), "sync");
    }

    #[tokio::test]
    async fn classic_handshake_accepts_zero_size() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let _ = resp::read_command(&mut reader).await.unwrap();
            write_half.write_all(b"$0\r\n").await.unwrap();
            // keep the socket open briefly
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let hs = handshake_sync(&endpoint(&addr), 0).await.unwrap();
        assert_eq!(hs.snapshot_size, 0);
    }

    #[tokio::test]
    async fn diskless_eof_dump_is_protocol_error() {
        let (addr, _server) = spawn_psync_source(
            b"+FULLRESYNC runid1 0\r\n$EOF:0123456789012345678901234567890123456789\r\n",
        )
        .await;
        let err = handshake_psync(&endpoint(&addr), 0).await.unwrap_err();
        assert!(matches!(err, RelayError::Protocol { .. }));
    }

    #[tokio::test]
    async fn source_auth_failure_is_auth_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let _ = resp::read_command(&mut reader).await.unwrap();
            write_half.write_all(b"-NOAUTH bad password\r\n").await.unwrap();
        });

        let mut ep = endpoint(&addr);
        ep.password = "wrong".to_string();
        let err = SourceLink::open(&ep).await.unwrap_err();
        assert!(matches!(err, RelayError::Auth { .. }));
    }
}
