//! End-to-end scenarios against in-process fake source and target servers.
//!
//! Each test drives a real syncer (or engine) over loopback TCP: the fake
//! source serves a scripted handshake, dump and command stream; the fake
//! target records every command it is asked to apply.

mod common;

use common::{build_dump, stream_of, wait_until, FakeSource, FakeSourceScript, FakeTarget};
use resp_relay::config::RelayConfig;
use resp_relay::protocol::resp;
use resp_relay::status::SyncStatus;
use resp_relay::syncer::Syncer;
use resp_relay::{Engine, RelayError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

fn test_config(source: &str, target: &str) -> RelayConfig {
    let mut config = RelayConfig::for_testing(source, target);
    config.metric = true;
    config
}

fn spawn_syncer(syncer: Arc<Syncer>) -> tokio::task::JoinHandle<resp_relay::Result<()>> {
    tokio::spawn(async move { syncer.run().await })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scenario 1: classic fullsync of an empty db
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn classic_fullsync_of_empty_db() {
    let stream = stream_of(&[&[b"SET", b"k", b"v"]]);
    let source = FakeSource::spawn(FakeSourceScript::classic(Vec::new(), stream)).await;
    let target = FakeTarget::spawn().await;

    let mut config = test_config(source.addr(), target.addr());
    config.psync = false;

    let syncer = Arc::new(
        Syncer::new(0, source.addr().into(), target.addr().into(), Arc::new(config)).unwrap(),
    );
    let shared = Arc::clone(syncer.shared());
    let handle = spawn_syncer(Arc::clone(&syncer));

    // size 0 means snapshot-done fires immediately
    wait_until("snapshot done", Duration::from_secs(5), || {
        shared.snapshot_done()
    })
    .await;

    wait_until("command forwarded", Duration::from_secs(5), || {
        target.commands() == vec!["set k v"]
    })
    .await;

    let stat = shared.stat();
    assert_eq!(stat.nentry, 0);
    assert_eq!(stat.forward, 1);
    assert_eq!(syncer.status(), SyncStatus::Incr);

    handle.abort();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scenario 2: partial sync, full then incremental
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partial_sync_full_then_incr() {
    let dump = build_dump(&[(0, b"a", b"1")]);
    let stream = stream_of(&[
        &[b"SELECT", b"0"],
        &[b"SET", b"b", b"2"],
        &[b"PING"],
    ]);
    let stream_len = stream.len() as i64;

    let source = FakeSource::spawn(FakeSourceScript::psync("abc", 100, dump, stream)).await;
    let target = FakeTarget::spawn().await;

    let config = test_config(source.addr(), target.addr());
    let syncer = Arc::new(
        Syncer::new(0, source.addr().into(), target.addr().into(), Arc::new(config)).unwrap(),
    );
    let shared = Arc::clone(syncer.shared());
    let handle = spawn_syncer(Arc::clone(&syncer));

    wait_until("restore and forward", Duration::from_secs(5), || {
        target.command_heads() == vec!["restore a", "set b 2", "ping"]
    })
    .await;

    // snapshot record restored, one command forwarded, select coalesced away
    let stat = shared.stat();
    assert_eq!(stat.nentry, 1);
    assert_eq!(stat.ignore, 0);
    assert_eq!(stat.nbypass, 1); // the suppressed SELECT 0

    // applied offset = handshake offset + streamed bytes
    wait_until("offset advanced", Duration::from_secs(5), || {
        shared.applied_offset() == 100 + stream_len
    })
    .await;

    // the 1 Hz ack loop reports the applied offset back to the source
    wait_until("ack carries offset", Duration::from_secs(5), || {
        source.last_ack() == 100 + stream_len
    })
    .await;

    handle.abort();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scenario 3: destination db override with SELECT coalescing
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn db_override_coalesces_selects() {
    let stream = stream_of(&[
        &[b"SELECT", b"0"],
        &[b"SET", b"a", b"1"],
        &[b"SELECT", b"3"],
        &[b"SET", b"b", b"2"],
    ]);
    let source = FakeSource::spawn(FakeSourceScript::psync("rid1", 0, build_dump(&[]), stream)).await;
    let target = FakeTarget::spawn().await;

    let mut config = test_config(source.addr(), target.addr());
    config.target.db = Some(7);

    let syncer = Arc::new(
        Syncer::new(0, source.addr().into(), target.addr().into(), Arc::new(config)).unwrap(),
    );
    let handle = spawn_syncer(Arc::clone(&syncer));

    // exactly one SELECT 7; the SELECT 3 maps to the same override
    wait_until("override forwarded", Duration::from_secs(5), || {
        target.commands() == vec!["select 7", "set a 1", "set b 2"]
    })
    .await;

    handle.abort();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scenario 4: key-prefix filter on the command stream
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn key_prefix_filter_drops_unmatched() {
    let stream = stream_of(&[
        &[b"SET", b"user:1", b"x"],
        &[b"SET", b"order:1", b"y"],
    ]);
    let source = FakeSource::spawn(FakeSourceScript::psync("rid2", 0, build_dump(&[]), stream)).await;
    let target = FakeTarget::spawn().await;

    let mut config = test_config(source.addr(), target.addr());
    config.filter.key = vec!["user:".to_string()];

    let syncer = Arc::new(
        Syncer::new(0, source.addr().into(), target.addr().into(), Arc::new(config)).unwrap(),
    );
    let shared = Arc::clone(syncer.shared());
    let handle = spawn_syncer(Arc::clone(&syncer));

    wait_until("filtered forward", Duration::from_secs(5), || {
        target.commands() == vec!["set user:1 x"]
    })
    .await;
    wait_until("bypass counted", Duration::from_secs(5), || {
        shared.stat().nbypass == 1
    })
    .await;

    handle.abort();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scenario 5: source reopen with offset resume
// ═══════════════════════════════════════════════════════════════════════════════

/// A source that drops the replication link after the first burst, then
/// accepts a resume and serves a second burst. Auxiliary (probe) client
/// connections get generic `+OK` service so they cannot be mistaken for
/// the replication link.
async fn spawn_reopening_source(
    offset: i64,
    dump: Vec<u8>,
    part1: Vec<u8>,
    part2: Vec<u8>,
) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let resumes: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let seen_resumes = Arc::clone(&resumes);
    tokio::spawn(async move {
        let mut replication_conns = 0usize;
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);

            let first = match resp::read_command(&mut reader).await {
                Ok(cmd) => cmd,
                Err(_) => continue,
            };
            if first.verb != "replconf" {
                // auxiliary client (offset probe): serve it generically
                tokio::spawn(async move {
                    let _ = write_half.write_all(b"+OK\r\n").await;
                    while resp::read_command(&mut reader).await.is_ok() {
                        if write_half.write_all(b"+OK\r\n").await.is_err() {
                            return;
                        }
                    }
                });
                continue;
            }

            write_half.write_all(b"+OK\r\n").await.unwrap();
            let psync = resp::read_command(&mut reader).await.unwrap();
            assert_eq!(psync.verb, "psync");
            replication_conns += 1;

            if replication_conns == 1 {
                let header = format!("+FULLRESYNC reopenrid {offset}\r\n");
                write_half.write_all(header.as_bytes()).await.unwrap();
                write_half
                    .write_all(format!("${}\r\n", dump.len()).as_bytes())
                    .await
                    .unwrap();
                write_half.write_all(&dump).await.unwrap();
                write_half.write_all(&part1).await.unwrap();
                write_half.flush().await.unwrap();
                // give the relay a moment to drain, then drop the link
                tokio::time::sleep(Duration::from_millis(200)).await;
                drop(write_half);
                drop(reader);
            } else {
                seen_resumes.lock().unwrap().push(psync.to_string());
                write_half.write_all(b"+CONTINUE\r\n").await.unwrap();
                write_half.write_all(&part2).await.unwrap();
                // hold the resumed link open, draining acks
                while resp::read_command(&mut reader).await.is_ok() {}
            }
        }
    });

    (addr, resumes)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn source_reopen_resumes_at_offset() {
    let dump = build_dump(&[]);
    let part1 = stream_of(&[&[b"SET", b"k1", b"v1"], &[b"SET", b"k2", b"v2"]]);
    let part2 = stream_of(&[&[b"SET", b"k3", b"v3"]]);
    let part1_len = part1.len() as i64;
    let part2_len = part2.len() as i64;

    let (source_addr, resumes) = spawn_reopening_source(100, dump, part1, part2).await;
    let target = FakeTarget::spawn().await;

    let config = test_config(&source_addr, target.addr());
    let syncer = Arc::new(
        Syncer::new(0, source_addr.clone(), target.addr().into(), Arc::new(config)).unwrap(),
    );
    let shared = Arc::clone(syncer.shared());
    let handle = spawn_syncer(Arc::clone(&syncer));

    // the break is observable as the reopen status
    wait_until("reopen entered", Duration::from_secs(5), || {
        syncer.status() == SyncStatus::Reopen
    })
    .await;

    // resume accepted, back to incremental
    wait_until("incr resumed", Duration::from_secs(5), || {
        syncer.status() == SyncStatus::Incr && !resumes.lock().unwrap().is_empty()
    })
    .await;

    // PSYNC CONTINUE carried the offset reached before the break
    let resume = resumes.lock().unwrap()[0].clone();
    assert_eq!(resume, format!("psync reopenrid {}", 100 + part1_len));

    // no duplicated or lost commands across the reopen
    wait_until("all commands applied once", Duration::from_secs(5), || {
        target.commands() == vec!["set k1 v1", "set k2 v2", "set k3 v3"]
    })
    .await;

    wait_until("offset spans both bursts", Duration::from_secs(5), || {
        shared.applied_offset() == 100 + part1_len + part2_len
    })
    .await;

    handle.abort();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Target rejection is fatal
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn target_error_reply_is_fatal() {
    let stream = stream_of(&[&[b"SET", b"good", b"1"], &[b"SET", b"bad", b"2"]]);
    let source = FakeSource::spawn(FakeSourceScript::psync("rid3", 0, build_dump(&[]), stream)).await;

    // target that rejects writes to the key "bad"
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                while let Ok(cmd) = resp::read_command(&mut reader).await {
                    let reply: &[u8] =
                        if cmd.args.first().map(|a| a.as_slice()) == Some(b"bad".as_slice()) {
                            b"-ERR key is protected\r\n"
                        } else {
                            b"+OK\r\n"
                        };
                    if write_half.write_all(reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    let config = test_config(source.addr(), &target_addr);
    let syncer = Arc::new(
        Syncer::new(0, source.addr().into(), target_addr.clone(), Arc::new(config)).unwrap(),
    );
    let handle = spawn_syncer(Arc::clone(&syncer));

    let err = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("syncer should fail fast")
        .expect("task must not panic")
        .expect_err("target rejection must be fatal");
    assert!(matches!(err, RelayError::TargetRejection(_)));
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine-level dispatch
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_runs_pair_and_reports_info() {
    let dump = build_dump(&[(0, b"seed", b"s")]);
    let stream = stream_of(&[&[b"SET", b"x", b"1"]]);
    let stream_len = stream.len() as i64;
    let source = FakeSource::spawn(FakeSourceScript::psync("engine1", 500, dump, stream)).await;
    let target = FakeTarget::spawn().await;

    let config = test_config(source.addr(), target.addr());
    let engine = Arc::new(Engine::new(config).unwrap());
    assert_eq!(engine.status(), SyncStatus::WaitFull);

    let runner = Arc::clone(&engine);
    let handle = tokio::spawn(async move { runner.run().await });

    wait_until("engine reaches incr", Duration::from_secs(5), || {
        engine.status() == SyncStatus::Incr
    })
    .await;
    wait_until("offset visible in info", Duration::from_secs(5), || {
        engine.info()[0].target_offset == 500 + stream_len
    })
    .await;

    let info = engine.info();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].source, source.addr());
    assert_eq!(info[0].target, target.addr());
    assert_eq!(info[0].status, SyncStatus::Incr);

    wait_until("both phases applied", Duration::from_secs(5), || {
        target.command_heads() == vec!["restore seed", "set x 1"]
    })
    .await;

    handle.abort();
}
