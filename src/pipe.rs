//! Bounded byte pipe between the snapshot demux and its consumers.
//!
//! The demux writes raw bytes from the source link into one end; the
//! snapshot parser (and later the command decoder) reads from the other.
//! Two flavors:
//!
//! - **Memory** (default): a bounded in-process duplex sized to the reader
//!   buffer. Backpressure is the duplex filling up.
//! - **File spill**: a fixed-size on-disk ring holds the backlog, pumped
//!   into a small duplex for the consumer. Lets a dump larger than RAM be
//!   taken while restorers lag behind the source.
//!
//! Reopens on the source side never touch the pipe: downstream consumers
//! observe one continuous byte stream across connection generations.

use crate::config::{SwapConfig, READER_BUFFER_SIZE};
use crate::error::{RelayError, Result};
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

/// Consumer end of the snapshot pipe.
pub type PipeReader = DuplexStream;

/// Producer end of the snapshot pipe.
pub enum PipeWriter {
    Memory(DuplexStream),
    File(FileRingWriter),
}

impl PipeWriter {
    /// Write the whole buffer, waiting for pipe space as needed.
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            PipeWriter::Memory(w) => w.write_all(buf).await,
            PipeWriter::File(w) => w.write_all(buf).await,
        }
    }

    /// Signal end of stream to the consumer.
    pub async fn shutdown(&mut self) {
        match self {
            PipeWriter::Memory(w) => {
                let _ = w.shutdown().await;
            }
            PipeWriter::File(w) => w.close().await,
        }
    }
}

/// Build the snapshot pipe for a syncer.
///
/// With `swap.file_name` set the pipe spills through an on-disk ring;
/// otherwise it is purely in-memory.
pub fn snapshot_pipe(syncer_id: usize, swap: &SwapConfig) -> Result<(PipeWriter, PipeReader)> {
    match &swap.file_name {
        None => {
            let (producer, consumer) = tokio::io::duplex(READER_BUFFER_SIZE);
            Ok((PipeWriter::Memory(producer), consumer))
        }
        Some(path) => {
            // Per-syncer suffix so concurrent syncers do not share a ring.
            let path = format!("{path}.{syncer_id}");
            let (ring_writer, mut ring_reader) = file_ring(&path, swap.file_size)
                .map_err(|e| RelayError::Config(format!("cannot open swap file {path}: {e}")))?;
            debug!(syncer_id, path = %path, size = swap.file_size, "snapshot spilling through swap file");

            let (mut pump_side, consumer) = tokio::io::duplex(READER_BUFFER_SIZE);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match ring_reader.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if pump_side.write_all(&buf[..n]).await.is_err() {
                                break; // consumer went away
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "swap file read failed, closing pipe");
                            break;
                        }
                    }
                }
                let _ = pump_side.shutdown().await;
            });

            Ok((PipeWriter::File(ring_writer), consumer))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// On-disk ring
// ═══════════════════════════════════════════════════════════════════════════════

struct RingState {
    file: std::fs::File,
    cap: u64,
    rpos: u64,
    wpos: u64,
    len: u64,
    closed: bool,
}

struct RingShared {
    state: Mutex<RingState>,
    readable: Notify,
    writable: Notify,
}

/// Producer half of the on-disk ring.
pub struct FileRingWriter {
    shared: Arc<RingShared>,
}

/// Consumer half of the on-disk ring.
pub struct FileRingReader {
    shared: Arc<RingShared>,
}

/// Open (and size) a spill file as a bounded byte ring.
pub fn file_ring(path: &str, size: u64) -> io::Result<(FileRingWriter, FileRingReader)> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(size)?;

    let shared = Arc::new(RingShared {
        state: Mutex::new(RingState {
            file,
            cap: size,
            rpos: 0,
            wpos: 0,
            len: 0,
            closed: false,
        }),
        readable: Notify::new(),
        writable: Notify::new(),
    });

    Ok((
        FileRingWriter {
            shared: Arc::clone(&shared),
        },
        FileRingReader { shared },
    ))
}

impl FileRingWriter {
    /// Write the whole buffer, waiting while the ring is full.
    pub async fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let written = {
                let mut st = self.shared.state.lock().await;
                if st.closed {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "ring closed"));
                }
                let space = st.cap - st.len;
                if space == 0 {
                    drop(st);
                    self.shared.writable.notified().await;
                    continue;
                }
                let at = st.wpos;
                let contiguous = (st.cap - at).min(space).min(buf.len() as u64) as usize;
                st.file.write_all_at(&buf[..contiguous], at)?;
                st.wpos = (at + contiguous as u64) % st.cap;
                st.len += contiguous as u64;
                contiguous
            };
            self.shared.readable.notify_one();
            buf = &buf[written..];
        }
        Ok(())
    }

    /// Mark end of stream; the reader drains what is buffered then sees EOF.
    pub async fn close(&mut self) {
        let mut st = self.shared.state.lock().await;
        st.closed = true;
        drop(st);
        self.shared.readable.notify_one();
    }
}

impl FileRingReader {
    /// Read up to `buf.len()` bytes; `Ok(0)` only after close and drain.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let read = {
                let mut st = self.shared.state.lock().await;
                if st.len == 0 {
                    if st.closed {
                        return Ok(0);
                    }
                    drop(st);
                    self.shared.readable.notified().await;
                    continue;
                }
                let at = st.rpos;
                let contiguous = (st.cap - at).min(st.len).min(buf.len() as u64) as usize;
                st.file.read_exact_at(&mut buf[..contiguous], at)?;
                st.rpos = (at + contiguous as u64) % st.cap;
                st.len -= contiguous as u64;
                contiguous
            };
            self.shared.writable.notify_one();
            return Ok(read);
        }
    }
}
