// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-pair syncer: owns the replication state machine for one
//! (source, target) pair.
//!
//! A syncer runs `waitfull → full → incr`, with `incr ↔ reopen` churn on
//! source hiccups. Its tasks communicate exclusively through bounded
//! queues and atomic counters:
//!
//! ```text
//! handshake ──→ demux(+ack) ──→ [snapshot pipe] ──→ rdb parse ──→ restorer pool
//!                                      │
//!                                      └──(after snapshot-done)──→ parser ──→ sender/receiver
//! ```
//!
//! Fatal errors log one structured event (syncer id, event, error text)
//! and surface through [`run()`](Syncer::run); the embedding daemon is
//! expected to exit so its supervisor restarts with a fresh full resync.

use crate::config::{RelayConfig, READER_BUFFER_SIZE};
use crate::delay::{delay_queue, DelaySender};
use crate::error::{RelayError, Result};
use crate::filter::Filters;
use crate::forward::{self, ParserContext};
use crate::pipe::snapshot_pipe;
use crate::protocol::resp::Command;
use crate::restore::{run_snapshot_restore, RestoreContext};
use crate::source::{handshake_psync, handshake_sync, run_demux, SourceEndpoint};
use crate::status::{StatusCell, StatusView, SyncStatus};
use crate::target::TargetConn;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Counter snapshot used by logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncerStat {
    pub rbytes: u64,
    pub wbytes: u64,
    pub nentry: u64,
    pub ignore: u64,
    pub forward: u64,
    pub nbypass: u64,
}

/// State shared across a syncer's tasks: counters, offsets and the
/// snapshot-done signal. Everything here is owned by exactly one syncer.
#[derive(Debug)]
pub struct SyncerShared {
    pub id: usize,
    pub source: String,
    pub target: String,

    /// Snapshot bytes consumed by the dump parser.
    rbytes: Arc<AtomicU64>,
    /// Payload bytes written to the target.
    wbytes: AtomicU64,
    /// Records restored during the full phase.
    nentry: AtomicU64,
    /// Records dropped by filters during the full phase.
    ignore: AtomicU64,
    /// Commands forwarded to the target.
    forward: AtomicU64,
    /// Commands dropped by policy.
    nbypass: AtomicU64,

    /// Applied target-side offset: start offset + streamed bytes.
    applied_offset: AtomicI64,
    /// Offset the source believes this replica has acknowledged.
    source_offset: AtomicI64,

    /// Fires exactly once, before the first command-forward enqueue.
    done_tx: watch::Sender<bool>,

    /// Depth observers for `Info()`, installed when the incremental
    /// pipeline spins up.
    cmd_handle: OnceLock<mpsc::WeakSender<Command>>,
    delay_handle: OnceLock<Arc<DelaySender>>,
}

impl SyncerShared {
    pub fn new(id: usize, source: &str, target: &str) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            id,
            source: source.to_string(),
            target: target.to_string(),
            rbytes: Arc::new(AtomicU64::new(0)),
            wbytes: AtomicU64::new(0),
            nentry: AtomicU64::new(0),
            ignore: AtomicU64::new(0),
            forward: AtomicU64::new(0),
            nbypass: AtomicU64::new(0),
            applied_offset: AtomicI64::new(0),
            source_offset: AtomicI64::new(0),
            done_tx,
            cmd_handle: OnceLock::new(),
            delay_handle: OnceLock::new(),
        }
    }

    /// Counter snapshot.
    pub fn stat(&self) -> SyncerStat {
        SyncerStat {
            rbytes: self.rbytes.load(Ordering::Relaxed),
            wbytes: self.wbytes.load(Ordering::Relaxed),
            nentry: self.nentry.load(Ordering::Relaxed),
            ignore: self.ignore.load(Ordering::Relaxed),
            forward: self.forward.load(Ordering::Relaxed),
            nbypass: self.nbypass.load(Ordering::Relaxed),
        }
    }

    /// Handle the dump parser mirrors its byte count into.
    pub fn rbytes_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.rbytes)
    }

    pub fn bump_entry(&self) {
        self.nentry.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_entry_restored(self.id);
    }

    pub fn bump_ignore(&self) {
        self.ignore.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_entry_ignored(self.id);
    }

    pub fn bump_bypass(&self) {
        self.nbypass.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_bypass_cmd(self.id, 1);
    }

    /// Account one forwarded command of `wire_len` payload bytes.
    pub fn bump_forward(&self, wire_len: u64) {
        self.forward.fetch_add(1, Ordering::Relaxed);
        self.wbytes.fetch_add(wire_len, Ordering::Relaxed);
        crate::metrics::record_push_cmd(self.id, 1);
        crate::metrics::record_network_flow(self.id, wire_len);
    }

    pub fn applied_offset(&self) -> i64 {
        self.applied_offset.load(Ordering::Acquire)
    }

    /// Set the starting offset returned by the handshake.
    pub fn set_applied_offset(&self, offset: i64) {
        self.applied_offset.store(offset, Ordering::Release);
    }

    /// Advance the applied offset by `delta` streamed bytes.
    pub fn add_applied_offset(&self, delta: i64) -> i64 {
        self.applied_offset.fetch_add(delta, Ordering::AcqRel) + delta
    }

    pub fn source_offset(&self) -> i64 {
        self.source_offset.load(Ordering::Acquire)
    }

    pub fn set_source_offset(&self, offset: i64) {
        self.source_offset.store(offset, Ordering::Release);
    }

    /// Whether the snapshot phase has completed.
    pub fn snapshot_done(&self) -> bool {
        *self.done_tx.borrow()
    }

    /// Fire the snapshot-done signal. Idempotent, but the state machine
    /// only ever calls it once.
    pub fn mark_snapshot_done(&self) {
        self.done_tx.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        });
    }

    /// Watch the snapshot-done signal.
    pub fn subscribe_snapshot_done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    fn install_handles(&self, cmd: mpsc::WeakSender<Command>, delay: Arc<DelaySender>) {
        let _ = self.cmd_handle.set(cmd);
        let _ = self.delay_handle.set(delay);
    }

    /// Pending commands in the send buffer.
    pub fn send_buf_len(&self) -> usize {
        self.cmd_handle
            .get()
            .and_then(|weak| weak.upgrade())
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    /// Pending samples in the delay queue.
    pub fn delay_queue_len(&self) -> usize {
        self.delay_handle.get().map(|d| d.depth()).unwrap_or(0)
    }
}

/// Per-syncer view exposed by `Engine::info()`.
#[derive(Debug, Clone, Serialize)]
pub struct SyncerInfo {
    pub source: String,
    pub target: String,
    pub sender_buf_len: usize,
    pub delay_queue_len: usize,
    pub target_offset: i64,
    pub source_offset: i64,
    pub status: SyncStatus,
}

/// One replication pair. Created at startup, never torn down in normal
/// operation; terminal only on fatal error.
#[derive(Debug)]
pub struct Syncer {
    config: Arc<RelayConfig>,
    shared: Arc<SyncerShared>,
    status_cell: Arc<StatusCell>,
    status_view: StatusView,
    filters: Arc<Filters>,
}

impl Syncer {
    /// Build a syncer for one pair, compiling its filters.
    pub fn new(
        id: usize,
        source_addr: String,
        target_addr: String,
        config: Arc<RelayConfig>,
    ) -> Result<Self> {
        let filters = Arc::new(Filters::compile(&config.filter)?);
        let shared = Arc::new(SyncerShared::new(id, &source_addr, &target_addr));
        let (status_cell, status_view) = StatusCell::new(id);
        Ok(Self {
            config,
            shared,
            status_cell: Arc::new(status_cell),
            status_view,
            filters,
        })
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn shared(&self) -> &Arc<SyncerShared> {
        &self.shared
    }

    pub fn status(&self) -> SyncStatus {
        self.status_view.get()
    }

    /// Watch for the snapshot-done signal.
    pub fn subscribe_snapshot_done(&self) -> watch::Receiver<bool> {
        self.shared.subscribe_snapshot_done()
    }

    /// Current info snapshot for tooling.
    pub fn info(&self) -> SyncerInfo {
        SyncerInfo {
            source: self.shared.source.clone(),
            target: self.shared.target.clone(),
            sender_buf_len: self.shared.send_buf_len(),
            delay_queue_len: self.shared.delay_queue_len(),
            target_offset: self.shared.applied_offset(),
            source_offset: self.shared.source_offset(),
            status: self.status(),
        }
    }

    /// Run the pair to (non-)completion. Never returns `Ok` in normal
    /// operation; a return is always a fatal, already-logged error.
    pub async fn run(&self) -> Result<()> {
        match self.run_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(
                    syncer_id = self.shared.id,
                    event = event_name(&e),
                    error = %e,
                    "syncer failed"
                );
                Err(e)
            }
        }
    }

    async fn run_inner(&self) -> Result<()> {
        let config = &self.config;
        let shared = &self.shared;

        self.status_cell.set(SyncStatus::WaitFull);
        info!(
            syncer_id = shared.id,
            source = %shared.source,
            target = %shared.target,
            psync = config.psync,
            "syncer starting"
        );

        let endpoint = SourceEndpoint {
            addr: shared.source.clone(),
            auth_type: config.source.auth_type,
            password: config.source.password_raw.clone(),
            listening_port: config.listening_port,
        };

        let handshake = if config.psync {
            handshake_psync(&endpoint, shared.id).await?
        } else {
            handshake_sync(&endpoint, shared.id).await?
        };
        shared.set_applied_offset(handshake.offset);
        crate::metrics::set_target_offset(shared.id, handshake.offset);
        info!(
            syncer_id = shared.id,
            size = handshake.snapshot_size,
            "snapshot size announced"
        );

        let (pipe_writer, pipe_reader) = snapshot_pipe(shared.id, &config.swap)?;
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        let runid = handshake.runid.clone();
        tasks.spawn(run_demux(
            handshake.link,
            pipe_writer,
            handshake.snapshot_size,
            runid,
            Arc::clone(shared),
            Arc::clone(&self.status_cell),
        ));

        if config.heartbeat.url.is_some() {
            tasks.spawn(crate::heartbeat::run_heartbeat(
                config.heartbeat.clone(),
                Arc::clone(shared),
                self.status_view.clone(),
            ));
        }

        let mut reader = BufReader::with_capacity(READER_BUFFER_SIZE, pipe_reader);

        // ── full phase ────────────────────────────────────────────────────
        self.status_cell.set(SyncStatus::Full);
        let restore_ctx = Arc::new(RestoreContext {
            shared: Arc::clone(shared),
            filters: Arc::clone(&self.filters),
            target_addr: shared.target.clone(),
            auth_type: config.target.auth_type,
            password: config.target.password_raw.clone(),
            target_db: config.target.db,
            rewrite: config.rewrite,
        });
        supervise(
            run_snapshot_restore(
                &mut reader,
                handshake.snapshot_size,
                config.target.parallel,
                restore_ctx,
            ),
            &mut tasks,
        )
        .await?;

        shared.mark_snapshot_done();
        self.status_cell.set(SyncStatus::Incr);
        info!(syncer_id = shared.id, "full sync done, switching to incremental");

        // ── incremental phase ─────────────────────────────────────────────
        let target = TargetConn::connect(
            &shared.target,
            config.target.auth_type,
            &config.target.password_raw,
        )
        .await?;
        let (write_half, read_half) = target.into_split();

        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(config.sender.count);
        let (delay_tx, delay_rx) = delay_queue(shared.id, config.sender.delay_channel_size);
        let delay_tx = Arc::new(delay_tx);
        shared.install_handles(cmd_tx.downgrade(), Arc::clone(&delay_tx));

        tasks.spawn(forward::run_sender(
            cmd_rx,
            write_half,
            delay_tx,
            Arc::clone(shared),
            config.sender.clone(),
            config.metric,
        ));
        tasks.spawn(forward::run_receiver(
            read_half,
            delay_rx,
            Arc::clone(shared),
            config.metric,
        ));
        if config.psync {
            tasks.spawn(forward::run_offset_probe(
                shared.source.clone(),
                config.source.auth_type,
                config.source.password_raw.clone(),
                config.listening_port,
                Arc::clone(shared),
            ));
        } else {
            warn!(
                syncer_id = shared.id,
                "fake-slave offset probe disabled without psync"
            );
        }
        tasks.spawn(forward::run_stats_logger(Arc::clone(shared)));

        let parser_ctx = ParserContext {
            shared: Arc::clone(shared),
            filters: Arc::clone(&self.filters),
            target_db: config.target.db,
        };
        supervise(forward::run_parser(&mut reader, cmd_tx, parser_ctx), &mut tasks).await
    }
}

/// Drive `fut` while watching the spawned task set: the first task error
/// (or panic) preempts and becomes the syncer's fatal error. Benign task
/// completions are ignored.
async fn supervise<F>(fut: F, tasks: &mut JoinSet<Result<()>>) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::pin!(fut);
    loop {
        tokio::select! {
            result = &mut fut => return result,
            Some(joined) = tasks.join_next() => match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(RelayError::Internal(format!("syncer task panicked: {e}"))),
            },
        }
    }
}

fn event_name(err: &RelayError) -> &'static str {
    match err {
        RelayError::Network { .. } => "NetError",
        RelayError::Protocol { .. } => "ProtocolError",
        RelayError::Auth { .. } => "AuthFail",
        RelayError::Parse(_) => "ParseError",
        RelayError::TargetRejection(_) => "ErrorReply",
        RelayError::InvariantViolation(_) => "InvariantViolation",
        RelayError::Config(_) => "ConfigError",
        RelayError::Internal(_) => "InternalError",
    }
}
