// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine dispatcher.
//!
//! Pairs sources to targets round-robin, bounds concurrent full syncs by
//! `source.parallel`, and keeps every syncer's forwarding loop running
//! until the first fatal error.
//!
//! # Lifecycle
//!
//! 1. [`Engine::new`] validates the config and constructs one [`Syncer`]
//!    per source (targets are reused round-robin).
//! 2. [`Engine::run`] starts them, gated by a semaphore so at most
//!    `min(source.parallel, len(sources))` full syncs run at once — a
//!    syncer holds its permit until its snapshot-done signal fires.
//! 3. After every snapshot completes the engine keeps blocking while
//!    command forwarding continues; it returns only the first fatal
//!    syncer error. Failures during construction are fatal; the engine
//!    does not restart syncers.

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::status::{self, SyncStatus};
use crate::syncer::{Syncer, SyncerInfo};
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::info;

/// The replication engine: one syncer per configured source.
#[derive(Debug)]
pub struct Engine {
    config: Arc<RelayConfig>,
    syncers: Arc<DashMap<usize, Arc<Syncer>>>,
}

impl Engine {
    /// Validate the config and construct every syncer.
    pub fn new(config: RelayConfig) -> Result<Self> {
        config.validate().map_err(RelayError::Config)?;
        let config = Arc::new(config);

        let syncers = Arc::new(DashMap::new());
        let targets = &config.target.address_list;
        for (id, source) in config.source.address_list.iter().enumerate() {
            // round-robin pick; targets may be reused
            let target = targets[id % targets.len()].clone();
            let syncer = Syncer::new(id, source.clone(), target, Arc::clone(&config))?;
            syncers.insert(id, Arc::new(syncer));
        }

        Ok(Self { config, syncers })
    }

    /// Number of configured pairs.
    pub fn len(&self) -> usize {
        self.syncers.len()
    }

    /// Whether the engine has no pairs (only possible before `new`
    /// validation, kept for the `len` pairing).
    pub fn is_empty(&self) -> bool {
        self.syncers.is_empty()
    }

    /// Per-syncer info snapshots, ordered by syncer id.
    pub fn info(&self) -> Vec<SyncerInfo> {
        let mut ids: Vec<usize> = self.syncers.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids.iter()
            .filter_map(|id| self.syncers.get(id).map(|s| s.info()))
            .collect()
    }

    /// Aggregated status across all syncers (least-progressed wins).
    pub fn status(&self) -> SyncStatus {
        status::aggregate(self.syncers.iter().map(|e| e.value().status()))
    }

    /// Run every pair. Blocks until the first fatal syncer error; in
    /// normal operation that is forever.
    pub async fn run(&self) -> Result<()> {
        let pair_count = self.syncers.len();
        let full_sync_slots = self.config.source.parallel.min(pair_count).max(1);
        let gate = Arc::new(Semaphore::new(full_sync_slots));

        info!(
            pairs = pair_count,
            full_sync_slots,
            psync = self.config.psync,
            "engine dispatching syncers"
        );

        let mut ids: Vec<usize> = self.syncers.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        for id in &ids {
            let syncer = Arc::clone(self.syncers.get(id).unwrap().value());
            let gate = Arc::clone(&gate);
            tasks.spawn(run_gated(syncer, gate));
        }

        // Log the moment every pair has finished its full sync.
        let done_waits: Vec<_> = ids
            .iter()
            .map(|id| {
                let mut rx = self
                    .syncers
                    .get(id)
                    .unwrap()
                    .subscribe_snapshot_done();
                async move {
                    let _ = rx.wait_for(|done| *done).await;
                }
            })
            .collect();
        let all_done = tokio::spawn(async move {
            join_all(done_waits).await;
            info!("all syncers finished full sync, forwarding continues");
        });

        let result = loop {
            match tasks.join_next().await {
                None => break Ok(()),
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(e))) => break Err(e),
                Some(Err(e)) => break Err(RelayError::Internal(format!("syncer panicked: {e}"))),
            }
        };
        all_done.abort();
        result
    }
}

/// Hold a full-sync permit from start until snapshot-done, then keep the
/// syncer's forwarding loop on foot.
async fn run_gated(syncer: Arc<Syncer>, gate: Arc<Semaphore>) -> Result<()> {
    let permit = gate
        .acquire_owned()
        .await
        .map_err(|_| RelayError::Internal("full-sync gate closed".to_string()))?;

    let runner = Arc::clone(&syncer);
    let mut handle = tokio::spawn(async move { runner.run().await });

    let mut done = syncer.subscribe_snapshot_done();
    tokio::select! {
        _ = done.wait_for(|done| *done) => {
            drop(permit); // next pair may begin its full sync
        }
        result = &mut handle => {
            // failed before snapshot completion
            return result.map_err(|e| RelayError::Internal(format!("syncer panicked: {e}")))?;
        }
    }

    match handle.await {
        Ok(result) => result,
        Err(e) => Err(RelayError::Internal(format!("syncer panicked: {e}"))),
    }
}
