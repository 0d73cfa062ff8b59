// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Incremental phase: command parsing, filtering, pipelined forwarding.
//!
//! Four independent tasks cooperate through bounded queues:
//!
//! ```text
//! pipe ──→ parser ──→ [command queue] ──→ sender ──→ target (write half)
//!                                            │
//!                                            └──→ [delay queue] ──→ receiver ←── target (read half)
//! ```
//!
//! - **parser** decodes the stream, applies the bypass/filter decision
//!   table and coalesces `SELECT`s;
//! - **sender** drains the queue, pipelining writes and flushing when the
//!   batch, the byte budget or an empty queue says so;
//! - **receiver** consumes replies in strict FIFO order and resolves
//!   sampled delay nodes;
//! - **offset probe** asks the source every 10 s which offset it believes
//!   this replica has acknowledged (monitoring only).

use crate::config::{AuthType, SenderConfig};
use crate::delay::{DelayReceiver, DelaySender};
use crate::error::{RelayError, Result};
use crate::filter::Filters;
use crate::protocol::commands;
use crate::protocol::resp::{self, Command, RespValue};
use crate::syncer::SyncerShared;
use crate::target::{TargetReadHalf, TargetWriteHalf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Probe cadence for the fake-slave offset query.
const OFFSET_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Settings shared by the parser task.
pub struct ParserContext {
    pub shared: Arc<SyncerShared>,
    pub filters: Arc<Filters>,
    /// Destination db override (`target.db`).
    pub target_db: Option<u32>,
}

/// Decode commands from the (post-snapshot) byte stream, apply the
/// decision table and enqueue survivors in decoder order.
///
/// Decision table:
/// - `ping` passes unconditionally;
/// - `select <n>` flips the bypass flag via the db filter, is translated
///   when a target-db override is set, and is coalesced against the last
///   emitted destination db either way;
/// - `opinfo` is an internal marker and is dropped;
/// - anything else is dropped while bypassed, or when a key-prefix filter
///   is configured and none of the command's key arguments match.
///
/// Decode failures are fatal: the replication stream is corrupt.
pub async fn run_parser<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    tx: mpsc::Sender<Command>,
    ctx: ParserContext,
) -> Result<()> {
    let shared = &ctx.shared;
    let mut lastdb: i64 = 0;
    let mut bypass = false;

    info!(syncer_id = shared.id, "incremental sync started");

    loop {
        let mut cmd = resp::read_command(reader).await?;
        crate::metrics::record_pull_cmd(shared.id, 1);

        let mut ignorecmd = false;
        let mut isselect = false;

        if cmd.verb != "ping" {
            if cmd.verb == "select" {
                if cmd.args.len() != 1 {
                    return Err(RelayError::Parse(format!(
                        "select arrived with {} arguments",
                        cmd.args.len()
                    )));
                }
                let db: u32 = std::str::from_utf8(&cmd.args[0])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        RelayError::Parse(format!(
                            "select argument {:?} is not a db index",
                            String::from_utf8_lossy(&cmd.args[0])
                        ))
                    })?;
                bypass = !ctx.filters.accept_db(db);
                isselect = true;
            } else if cmd.verb == "opinfo" {
                ignorecmd = true;
            }
            if bypass || ignorecmd {
                shared.bump_bypass();
                continue;
            }
        }

        if ctx.filters.has_key_filter() {
            let matched = match commands::lookup(&cmd.verb) {
                Some(spec) if !cmd.args.is_empty() => commands::keys(spec, &cmd.args)
                    .iter()
                    .any(|key| ctx.filters.match_key(key)),
                // unknown verbs with arguments pass through unfiltered
                _ => true,
            };
            if !matched {
                shared.bump_bypass();
                continue;
            }
        }

        if isselect {
            let destination = match ctx.target_db {
                Some(db) => db as i64,
                None => {
                    // verbatim select, still coalesced against lastdb
                    std::str::from_utf8(&cmd.args[0])
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                        .unwrap_or(0)
                }
            };
            if destination == lastdb {
                shared.bump_bypass();
                continue;
            }
            lastdb = destination;
            cmd = Command::new("select", vec![destination.to_string().into_bytes()]);
        }

        if tx.send(cmd).await.is_err() {
            // sender died; its own error is the authoritative one
            return Err(RelayError::Internal("command queue closed".to_string()));
        }
    }
}

/// Drain the command queue onto the target, pipelining writes.
///
/// Flush fires when any of these holds: more than `sender.count` unflushed
/// commands, more than `sender.size` accumulated payload bytes, or the
/// queue is empty (opportunistic flush for interactive latency). Flush and
/// send failures are fatal: the pair is broken.
pub async fn run_sender(
    mut rx: mpsc::Receiver<Command>,
    mut target: TargetWriteHalf,
    delay: Arc<DelaySender>,
    shared: Arc<SyncerShared>,
    config: SenderConfig,
    metric: bool,
) -> Result<()> {
    let mut send_id: u64 = 0;
    let mut no_flush_count: usize = 0;
    let mut cached_size: u64 = 0;

    while let Some(cmd) = rx.recv().await {
        let args: Vec<&[u8]> = cmd.args.iter().map(|a| a.as_slice()).collect();
        target.send(&cmd.verb, &args).await?;

        let length = cmd.wire_len();
        no_flush_count += 1;
        cached_size += length;
        send_id += 1;

        shared.bump_forward(length);
        if metric {
            delay.maybe_push(send_id);
        }

        if no_flush_count > config.count || cached_size > config.size || rx.is_empty() {
            target.flush().await?;
            no_flush_count = 0;
            cached_size = 0;
        }
    }

    // parser side closed; push out whatever is still buffered
    target.flush().await?;
    Ok(())
}

/// Consume replies in strict order, resolving sampled delay nodes.
///
/// Every reply advances `recv_id`; an error reply or a broken target
/// stream is fatal. A delay node whose id is behind `recv_id` means the
/// send/receive accounting diverged, which is an invariant violation.
pub async fn run_receiver(
    mut target: TargetReadHalf,
    mut delay: DelayReceiver,
    shared: Arc<SyncerShared>,
    metric: bool,
) -> Result<()> {
    let mut recv_id: u64 = 0;
    let mut pending: Option<crate::delay::DelayNode> = None;

    loop {
        // a broken reply stream is a failure too, not just an error reply
        let reply = match target.receive().await {
            Ok(reply) => reply,
            Err(e) => {
                crate::metrics::record_fail_reply(shared.id);
                return Err(e);
            }
        };
        recv_id += 1;
        debug!(syncer_id = shared.id, recv_id, "received target reply");

        if let RespValue::Error(msg) = reply {
            crate::metrics::record_fail_reply(shared.id);
            return Err(RelayError::TargetRejection(msg));
        }
        crate::metrics::record_success_reply(shared.id);

        if !metric {
            continue;
        }

        if pending.is_none() {
            pending = delay.try_pop();
        }
        if let Some(node) = pending {
            if node.id == recv_id {
                crate::metrics::record_delay(shared.id, node.sent_at.elapsed());
                pending = None;
            } else if node.id < recv_id {
                return Err(RelayError::InvariantViolation(format!(
                    "delay node id {} < receive id {}",
                    node.id, recv_id
                )));
            }
            // node.id > recv_id: keep it for a future reply
        }
    }
}

/// Extract the acknowledged offset of the replica listening on `port`
/// from an `INFO replication` payload.
pub fn parse_fake_slave_offset(info: &str, port: u16) -> Option<i64> {
    let port_field = format!("port={port}");
    for line in info.lines() {
        let line = line.trim();
        if !line.starts_with("slave") {
            continue;
        }
        let fields: Vec<&str> = line.split_once(':')?.1.split(',').collect();
        if !fields.iter().any(|f| *f == port_field) {
            continue;
        }
        return fields
            .iter()
            .find_map(|f| f.strip_prefix("offset="))
            .and_then(|v| v.parse().ok());
    }
    None
}

/// Every 10 s, ask the source which offset it believes this replica has
/// acknowledged and store it for lag monitoring. Best-effort: errors log
/// at warn and the managed connection reconnects on a later tick.
pub async fn run_offset_probe(
    source_addr: String,
    auth_type: AuthType,
    password: String,
    listening_port: u16,
    shared: Arc<SyncerShared>,
) -> Result<()> {
    let client = redis::Client::open(format!("redis://{source_addr}"))
        .map_err(|e| RelayError::Config(format!("bad source address {source_addr}: {e}")))?;

    let mut conn: Option<redis::aio::ConnectionManager> = None;
    let mut timer = tokio::time::interval(OFFSET_PROBE_INTERVAL);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        timer.tick().await;

        if conn.is_none() {
            match client.get_connection_manager().await {
                Ok(manager) => conn = Some(manager),
                Err(e) => {
                    warn!(syncer_id = shared.id, error = %e, "offset probe connect failed");
                    continue;
                }
            }
        }
        let manager = conn.as_mut().unwrap();

        if !password.is_empty() {
            let auth: redis::RedisResult<String> = redis::cmd(auth_type.verb())
                .arg(&password)
                .query_async(manager)
                .await;
            if let Err(e) = auth {
                warn!(syncer_id = shared.id, error = %e, "offset probe auth failed");
                conn = None;
                continue;
            }
        }

        let info: redis::RedisResult<String> = redis::cmd("INFO")
            .arg("replication")
            .query_async(manager)
            .await;
        match info {
            Ok(info) => match parse_fake_slave_offset(&info, listening_port) {
                Some(offset) => {
                    shared.set_source_offset(offset);
                    crate::metrics::set_source_offset(shared.id, offset);
                }
                None => {
                    debug!(
                        syncer_id = shared.id,
                        listening_port, "replica not listed in source replication info"
                    );
                }
            },
            Err(e) => {
                warn!(syncer_id = shared.id, error = %e, "offset probe query failed");
                conn = None; // reconnect next tick
            }
        }
    }
}

/// 1 Hz per-syncer stats line for the incremental phase.
pub async fn run_stats_logger(shared: Arc<SyncerShared>) -> Result<()> {
    let mut timer = tokio::time::interval(Duration::from_secs(1));
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last = shared.stat();

    loop {
        timer.tick().await;
        let now = shared.stat();
        info!(
            syncer_id = shared.id,
            forward = now.forward - last.forward,
            nbypass = now.nbypass - last.nbypass,
            nbytes = now.wbytes - last.wbytes,
            "incremental sync"
        );
        last = now;
    }
}
