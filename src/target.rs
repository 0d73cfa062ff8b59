//! Target connection: pipelined RESP client over a plain TCP stream.
//!
//! The multiplexed client used for auxiliary traffic cannot expose explicit
//! `send`/`flush`/`receive` framing, so the replication path drives the
//! target with its own buffered connection.
//!
//! # Ownership invariant
//!
//! During the stream phase the connection is split once along the
//! read/write axis: the sender exclusively owns `send` + `flush`, the
//! receiver exclusively owns `receive`. The split is full-duplex and never
//! rejoined. Restore workers use the unsplit request/response form.

use crate::config::{AuthType, TARGET_IO_DEADLINE};
use crate::error::{RelayError, Result};
use crate::protocol::resp::{self, RespValue};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

async fn with_deadline<T>(
    endpoint: &str,
    what: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match timeout(TARGET_IO_DEADLINE, fut).await {
        Ok(res) => res,
        Err(_) => Err(RelayError::network_msg(
            endpoint.to_string(),
            format!("{what} timed out after {TARGET_IO_DEADLINE:?}"),
        )),
    }
}

/// A connection to the target store.
#[derive(Debug)]
pub struct TargetConn {
    endpoint: String,
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

/// Write-exclusive half used by the sender for pipelining.
pub struct TargetWriteHalf {
    endpoint: String,
    writer: BufWriter<OwnedWriteHalf>,
}

/// Read-exclusive half used by the receiver.
pub struct TargetReadHalf {
    endpoint: String,
    reader: BufReader<OwnedReadHalf>,
}

impl TargetConn {
    /// Dial and authenticate, honoring the target I/O deadline.
    pub async fn connect(addr: &str, auth_type: AuthType, password: &str) -> Result<Self> {
        let endpoint = format!("target {addr}");
        let stream = with_deadline(&endpoint, "dial", async {
            TcpStream::connect(addr)
                .await
                .map_err(|e| RelayError::network(endpoint.clone(), e))
        })
        .await?;
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let mut conn = Self {
            endpoint: endpoint.clone(),
            reader: BufReader::with_capacity(crate::config::READER_BUFFER_SIZE, read_half),
            writer: BufWriter::with_capacity(crate::config::WRITER_BUFFER_SIZE, write_half),
        };

        if !password.is_empty() {
            conn.send(auth_type.verb(), &[password.as_bytes()]).await?;
            conn.flush().await?;
            match conn.receive().await? {
                RespValue::Status(_) => {}
                RespValue::Error(msg) => {
                    return Err(RelayError::Auth {
                        endpoint,
                        message: msg,
                    })
                }
                other => {
                    return Err(RelayError::protocol(
                        "target auth",
                        format!("unexpected reply {other:?}"),
                    ))
                }
            }
        }
        debug!(endpoint = %endpoint, "target connection established");
        Ok(conn)
    }

    /// Queue a command into the write buffer without flushing.
    pub async fn send(&mut self, verb: &str, args: &[&[u8]]) -> Result<()> {
        resp::write_command(&mut self.writer, verb, args)
            .await
            .map_err(|e| RelayError::network(self.endpoint.clone(), e))
    }

    /// Flush buffered commands to the socket.
    pub async fn flush(&mut self) -> Result<()> {
        let endpoint = self.endpoint.clone();
        with_deadline(&endpoint, "flush", async {
            self.writer
                .flush()
                .await
                .map_err(|e| RelayError::network(endpoint.clone(), e))
        })
        .await
    }

    /// Read one reply frame.
    pub async fn receive(&mut self) -> Result<RespValue> {
        let endpoint = self.endpoint.clone();
        with_deadline(&endpoint, "receive", resp::read_value(&mut self.reader)).await
    }

    /// Request/response round trip; error replies become `TargetRejection`.
    pub async fn call(&mut self, verb: &str, args: &[&[u8]]) -> Result<RespValue> {
        self.send(verb, args).await?;
        self.flush().await?;
        match self.receive().await? {
            RespValue::Error(msg) => Err(RelayError::TargetRejection(msg)),
            reply => Ok(reply),
        }
    }

    /// Issue `SELECT db`.
    pub async fn select_db(&mut self, db: u32) -> Result<()> {
        self.call("select", &[db.to_string().as_bytes()]).await?;
        Ok(())
    }

    /// Split into write-exclusive and read-exclusive halves for the
    /// stream-phase sender/receiver pair.
    pub fn into_split(self) -> (TargetWriteHalf, TargetReadHalf) {
        (
            TargetWriteHalf {
                endpoint: self.endpoint.clone(),
                writer: self.writer,
            },
            TargetReadHalf {
                endpoint: self.endpoint,
                reader: self.reader,
            },
        )
    }
}

impl TargetWriteHalf {
    /// Queue a command into the write buffer without flushing.
    pub async fn send(&mut self, verb: &str, args: &[&[u8]]) -> Result<()> {
        resp::write_command(&mut self.writer, verb, args)
            .await
            .map_err(|e| RelayError::network(self.endpoint.clone(), e))
    }

    /// Flush buffered commands to the socket.
    pub async fn flush(&mut self) -> Result<()> {
        let endpoint = self.endpoint.clone();
        with_deadline(&endpoint, "flush", async {
            self.writer
                .flush()
                .await
                .map_err(|e| RelayError::network(endpoint.clone(), e))
        })
        .await
    }
}

impl TargetReadHalf {
    /// Read one reply frame. Blocks until a reply or the I/O deadline.
    pub async fn receive(&mut self) -> Result<RespValue> {
        let endpoint = self.endpoint.clone();
        with_deadline(&endpoint, "receive", resp::read_value(&mut self.reader)).await
    }

    /// Read one reply frame with a caller-supplied timeout (tests).
    pub async fn receive_timeout(&mut self, limit: Duration) -> Result<Option<RespValue>> {
        match timeout(limit, resp::read_value(&mut self.reader)).await {
            Ok(res) => res.map(Some),
            Err(_) => Ok(None),
        }
    }
}
