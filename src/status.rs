// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Syncer status types.
//!
//! Each syncer publishes its replication phase through a watch channel;
//! the engine aggregates these into a single read-only view for tooling.
//!
//! # State Transitions
//!
//! ```text
//!               size known          snapshot done
//! WaitFull ───────────────→ Full ───────────────→ Incr ←──────────┐
//!                                                   │             │
//!                                  source stream    │   resume    │
//!                                      error        ↓   accepted  │
//!                                                 Reopen ─────────┘
//! ```
//!
//! There is no terminal state: fatal errors tear the syncer down instead
//! of parking it in a status.

use serde::Serialize;
use tokio::sync::watch;

/// Replication phase of a single syncer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Handshaking; waiting for the source to announce a snapshot size.
    WaitFull,
    /// Receiving and restoring the snapshot.
    Full,
    /// Forwarding the incremental command stream.
    Incr,
    /// Source link dropped; reconnect loop running with offset resume.
    Reopen,
}

impl SyncStatus {
    /// The wire/tooling string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::WaitFull => "waitfull",
            SyncStatus::Full => "full",
            SyncStatus::Incr => "incr",
            SyncStatus::Reopen => "reopen",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publisher side of a syncer's status.
///
/// Updates are broadcast to every [`StatusView`] and mirrored to the
/// status gauge.
#[derive(Debug)]
pub struct StatusCell {
    syncer_id: usize,
    tx: watch::Sender<SyncStatus>,
}

/// Read-only view of a syncer's status.
#[derive(Clone, Debug)]
pub struct StatusView {
    rx: watch::Receiver<SyncStatus>,
}

impl StatusCell {
    /// Create a status cell starting in [`SyncStatus::WaitFull`].
    pub fn new(syncer_id: usize) -> (Self, StatusView) {
        let (tx, rx) = watch::channel(SyncStatus::WaitFull);
        (Self { syncer_id, tx }, StatusView { rx })
    }

    /// Publish a new status.
    pub fn set(&self, status: SyncStatus) {
        crate::metrics::set_syncer_status(self.syncer_id, status.as_str());
        let _ = self.tx.send(status);
    }

    /// Current status.
    pub fn get(&self) -> SyncStatus {
        *self.tx.borrow()
    }
}

impl StatusView {
    /// Current status.
    pub fn get(&self) -> SyncStatus {
        *self.rx.borrow()
    }

    /// Wait until the status equals `want`.
    pub async fn wait_for(&mut self, want: SyncStatus) {
        // Closed sender means the syncer died; callers time out on their own.
        let _ = self.rx.wait_for(|s| *s == want).await;
    }
}

/// Aggregate many syncer statuses into one view: the least-progressed
/// phase wins, with `reopen` outranking `incr` so a degraded link is
/// visible. An empty set reports `incr` (nothing is behind).
pub fn aggregate(statuses: impl IntoIterator<Item = SyncStatus>) -> SyncStatus {
    let mut agg = SyncStatus::Incr;
    for s in statuses {
        agg = match (agg, s) {
            (_, SyncStatus::WaitFull) | (SyncStatus::WaitFull, _) => SyncStatus::WaitFull,
            (_, SyncStatus::Full) | (SyncStatus::Full, _) => SyncStatus::Full,
            (_, SyncStatus::Reopen) | (SyncStatus::Reopen, _) => SyncStatus::Reopen,
            _ => SyncStatus::Incr,
        };
    }
    agg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings() {
        assert_eq!(SyncStatus::WaitFull.as_str(), "waitfull");
        assert_eq!(SyncStatus::Full.as_str(), "full");
        assert_eq!(SyncStatus::Incr.as_str(), "incr");
        assert_eq!(SyncStatus::Reopen.as_str(), "reopen");
        assert_eq!(SyncStatus::Reopen.to_string(), "reopen");
    }

    #[test]
    fn cell_starts_waitfull() {
        let (cell, view) = StatusCell::new(0);
        assert_eq!(cell.get(), SyncStatus::WaitFull);
        assert_eq!(view.get(), SyncStatus::WaitFull);
    }

    #[test]
    fn cell_broadcasts_to_views() {
        let (cell, view) = StatusCell::new(0);
        let view2 = view.clone();

        cell.set(SyncStatus::Full);
        assert_eq!(view.get(), SyncStatus::Full);
        assert_eq!(view2.get(), SyncStatus::Full);

        cell.set(SyncStatus::Incr);
        assert_eq!(view.get(), SyncStatus::Incr);
    }

    #[tokio::test]
    async fn view_wait_for_status() {
        let (cell, mut view) = StatusCell::new(0);

        let waiter = tokio::spawn(async move {
            view.wait_for(SyncStatus::Incr).await;
            view.get()
        });

        cell.set(SyncStatus::Full);
        cell.set(SyncStatus::Incr);

        let got = waiter.await.unwrap();
        assert_eq!(got, SyncStatus::Incr);
    }

    #[test]
    fn aggregate_empty_is_incr() {
        assert_eq!(aggregate([]), SyncStatus::Incr);
    }

    #[test]
    fn aggregate_least_progressed_wins() {
        use SyncStatus::*;
        assert_eq!(aggregate([Incr, Incr]), Incr);
        assert_eq!(aggregate([Incr, Reopen]), Reopen);
        assert_eq!(aggregate([Reopen, Full, Incr]), Full);
        assert_eq!(aggregate([Full, WaitFull, Incr]), WaitFull);
        assert_eq!(aggregate([WaitFull]), WaitFull);
    }

    #[test]
    fn aggregate_reopen_outranks_incr_only() {
        use SyncStatus::*;
        assert_eq!(aggregate([Reopen, Incr, Incr]), Reopen);
        assert_eq!(aggregate([Reopen, Full]), Full);
    }
}
