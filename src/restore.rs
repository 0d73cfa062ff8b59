//! Snapshot restore: record fan-out onto a pool of target connections.
//!
//! The snapshot parser runs in the caller's task and feeds a bounded
//! record channel; `target.parallel` workers each own one target
//! connection and drain it. Record ordering across workers is not
//! preserved — the source guarantees each key appears once in the dump,
//! so per-key ordering is moot.
//!
//! A 1 Hz progress task reports `bytes/total` percent plus restored and
//! ignored counts until every worker has drained.

use crate::config::AuthType;
use crate::error::{RelayError, Result};
use crate::filter::Filters;
use crate::protocol::rdb::{RdbLoader, Record, RECORD_PIPE_SIZE};
use crate::syncer::SyncerShared;
use crate::target::TargetConn;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Everything a restore worker needs to reach and filter the target.
pub struct RestoreContext {
    pub shared: Arc<SyncerShared>,
    pub filters: Arc<Filters>,
    pub target_addr: String,
    pub auth_type: AuthType,
    pub password: String,
    /// Destination db override (`target.db`).
    pub target_db: Option<u32>,
    /// Append `REPLACE` so existing keys are overwritten.
    pub rewrite: bool,
}

/// Drive the snapshot phase to completion: parse `snapshot_size` bytes of
/// dump from `reader`, restoring records through `parallel` workers.
///
/// Returns once the dump is fully parsed and every worker has drained.
/// A zero-size snapshot is a no-op.
pub async fn run_snapshot_restore<R: AsyncRead + Unpin>(
    reader: &mut R,
    snapshot_size: u64,
    parallel: usize,
    ctx: Arc<RestoreContext>,
) -> Result<()> {
    let shared = Arc::clone(&ctx.shared);
    if snapshot_size == 0 {
        info!(syncer_id = shared.id, "empty snapshot, nothing to restore");
        crate::metrics::set_fullsync_progress(shared.id, 100);
        return Ok(());
    }

    let (tx, rx) = mpsc::channel::<Record>(RECORD_PIPE_SIZE);
    let rx = Arc::new(Mutex::new(rx));

    let mut workers: JoinSet<Result<()>> = JoinSet::new();
    for _ in 0..parallel.max(1) {
        workers.spawn(restore_worker(Arc::clone(&rx), Arc::clone(&ctx)));
    }

    let progress = tokio::spawn(progress_loop(Arc::clone(&shared), snapshot_size));

    // Parse in this task; workers apply concurrently.
    let mut loader = RdbLoader::new(reader, shared.rbytes_handle());
    let parse_result = async {
        while let Some(record) = loader.next_record().await? {
            if tx.send(record).await.is_err() {
                // every worker died; their errors surface below
                break;
            }
        }
        Ok::<(), RelayError>(())
    }
    .await;
    drop(tx);

    // Drain workers even when parsing failed, so their (possibly more
    // precise) errors are not lost.
    let mut first_err: Option<RelayError> = parse_result.err();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => first_err = first_err.or(Some(e)),
            Err(e) => {
                first_err =
                    first_err.or(Some(RelayError::Internal(format!("restore worker panicked: {e}"))))
            }
        }
    }
    progress.abort();

    if let Some(err) = first_err {
        return Err(err);
    }

    let stat = shared.stat();
    crate::metrics::set_fullsync_progress(shared.id, 100);
    info!(
        syncer_id = shared.id,
        entries = stat.nentry,
        ignored = stat.ignore,
        bytes = stat.rbytes,
        "sync rdb done"
    );
    Ok(())
}

async fn restore_worker(
    rx: Arc<Mutex<mpsc::Receiver<Record>>>,
    ctx: Arc<RestoreContext>,
) -> Result<()> {
    let shared = &ctx.shared;
    let mut conn = TargetConn::connect(&ctx.target_addr, ctx.auth_type, &ctx.password).await?;
    let mut lastdb: Option<u32> = Some(0); // fresh connections sit at db 0

    loop {
        let record = { rx.lock().await.recv().await };
        let record = match record {
            Some(record) => record,
            None => return Ok(()),
        };

        if !ctx.filters.accept_db(record.db) {
            shared.bump_ignore();
            continue;
        }

        // pick destination db, coalescing consecutive SELECTs
        let destination = ctx.target_db.unwrap_or(record.db);
        if lastdb != Some(destination) {
            conn.select_db(destination).await?;
            lastdb = Some(destination);
        }

        if !ctx.filters.accept_record_key(&record.key) {
            shared.bump_ignore();
            continue;
        }

        let mut args: Vec<&[u8]> = vec![record.key.as_slice(), b"0", record.payload.as_slice()];
        if ctx.rewrite {
            args.push(b"replace");
        }
        conn.call("restore", &args).await?;
        shared.bump_entry();
        debug!(
            syncer_id = shared.id,
            key = %String::from_utf8_lossy(&record.key),
            db = record.db,
            "record restored"
        );
    }
}

async fn progress_loop(shared: Arc<SyncerShared>, total: u64) {
    let mut timer = tokio::time::interval(Duration::from_secs(1));
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        timer.tick().await;
        let stat = shared.stat();
        let percent = (100 * stat.rbytes / total).min(100);
        crate::metrics::set_fullsync_progress(shared.id, percent);
        if stat.ignore == 0 {
            info!(
                syncer_id = shared.id,
                total,
                bytes = stat.rbytes,
                percent,
                entries = stat.nentry,
                "full sync progress"
            );
        } else {
            info!(
                syncer_id = shared.id,
                total,
                bytes = stat.rbytes,
                percent,
                entries = stat.nentry,
                ignored = stat.ignore,
                "full sync progress"
            );
        }
    }
}
