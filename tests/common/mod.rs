//! Shared test fixtures: in-process fake source and target servers.
//!
//! The fakes speak just enough of the replication protocol to drive a
//! syncer end to end over loopback TCP: the source serves a scripted
//! handshake, dump and command stream; the target answers every command
//! with a canned reply and records what it saw.

#![allow(dead_code)]

use resp_relay::protocol::crc64;
use resp_relay::protocol::resp::{self, Command};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

// ═══════════════════════════════════════════════════════════════════════════════
// Dump construction
// ═══════════════════════════════════════════════════════════════════════════════

pub fn enc_len(n: u64) -> Vec<u8> {
    if n < 64 {
        vec![n as u8]
    } else if n < 16384 {
        vec![0x40 | (n >> 8) as u8, (n & 0xff) as u8]
    } else {
        let mut v = vec![0x80];
        v.extend_from_slice(&(n as u32).to_be_bytes());
        v
    }
}

pub fn enc_string(s: &[u8]) -> Vec<u8> {
    let mut v = enc_len(s.len() as u64);
    v.extend_from_slice(s);
    v
}

/// Build a version-6 dump containing string records `(db, key, value)`.
pub fn build_dump(entries: &[(u64, &[u8], &[u8])]) -> Vec<u8> {
    let mut bytes = b"REDIS0006".to_vec();
    let mut current_db = u64::MAX;
    for (db, key, value) in entries {
        if *db != current_db {
            bytes.push(0xfe); // SELECTDB
            bytes.extend(enc_len(*db));
            current_db = *db;
        }
        bytes.push(0); // string type
        bytes.extend(enc_string(key));
        bytes.extend(enc_string(value));
    }
    bytes.push(0xff); // EOF
    let crc = crc64::checksum(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
    bytes
}

/// Encode a sequence of commands in replication-stream framing.
pub fn stream_of(cmds: &[&[&[u8]]]) -> Vec<u8> {
    let mut out = Vec::new();
    for cmd in cmds {
        let verb = std::str::from_utf8(cmd[0]).unwrap();
        out.extend(resp::encode_command(verb, &cmd[1..]));
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fake target
// ═══════════════════════════════════════════════════════════════════════════════

/// Records every command any connection delivered, in arrival order.
pub struct FakeTarget {
    addr: String,
    commands: Arc<Mutex<Vec<Command>>>,
}

impl FakeTarget {
    /// Spawn a target that answers `+OK` (`+PONG` to pings) forever.
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let commands: Arc<Mutex<Vec<Command>>> = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&commands);
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut reader = BufReader::new(read_half);
                    while let Ok(cmd) = resp::read_command(&mut reader).await {
                        let reply: &[u8] = if cmd.verb == "ping" {
                            b"+PONG\r\n"
                        } else {
                            b"+OK\r\n"
                        };
                        log.lock().unwrap().push(cmd);
                        if write_half.write_all(reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        Self { addr, commands }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Commands seen so far, rendered as display strings.
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.to_string())
            .collect()
    }

    /// Commands excluding restore payload noise: `restore <key>`.
    pub fn command_heads(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|c| {
                if c.verb == "restore" {
                    format!("restore {}", String::from_utf8_lossy(&c.args[0]))
                } else {
                    c.to_string()
                }
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fake source
// ═══════════════════════════════════════════════════════════════════════════════

/// Script for a single-connection fake source.
pub struct FakeSourceScript {
    pub psync: bool,
    pub runid: String,
    pub offset: i64,
    pub dump: Vec<u8>,
    pub stream: Vec<u8>,
}

impl FakeSourceScript {
    pub fn psync(runid: &str, offset: i64, dump: Vec<u8>, stream: Vec<u8>) -> Self {
        Self {
            psync: true,
            runid: runid.to_string(),
            offset,
            dump,
            stream,
        }
    }

    pub fn classic(dump: Vec<u8>, stream: Vec<u8>) -> Self {
        Self {
            psync: false,
            runid: String::new(),
            offset: 0,
            dump,
            stream,
        }
    }
}

/// Serves one replication session then keeps the socket open, recording
/// the ACK offsets the relay reports back.
pub struct FakeSource {
    addr: String,
    last_ack: Arc<AtomicI64>,
}

impl FakeSource {
    pub async fn spawn(script: FakeSourceScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let last_ack = Arc::new(AtomicI64::new(-1));

        let ack = Arc::clone(&last_ack);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);

            if script.psync {
                // replconf listening-port
                let _ = resp::read_command(&mut reader).await.unwrap();
                write_half.write_all(b"+OK\r\n").await.unwrap();
                // psync ? -1
                let _ = resp::read_command(&mut reader).await.unwrap();
                let header = format!("+FULLRESYNC {} {}\r\n", script.runid, script.offset);
                write_half.write_all(header.as_bytes()).await.unwrap();
            } else {
                // sync
                let _ = resp::read_command(&mut reader).await.unwrap();
            }

            let size_header = format!("${}\r\n", script.dump.len());
            write_half.write_all(size_header.as_bytes()).await.unwrap();
            write_half.write_all(&script.dump).await.unwrap();
            write_half.write_all(&script.stream).await.unwrap();

            // hold the link open, recording acks
            while let Ok(cmd) = resp::read_command(&mut reader).await {
                if cmd.verb == "replconf" && cmd.args.first().map(|a| a.as_slice()) == Some(b"ack")
                {
                    if let Some(offset) = cmd
                        .args
                        .get(1)
                        .and_then(|a| std::str::from_utf8(a).ok())
                        .and_then(|s| s.parse::<i64>().ok())
                    {
                        ack.store(offset, Ordering::SeqCst);
                    }
                }
            }
        });

        Self { addr, last_ack }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Last `REPLCONF ACK` offset observed, or -1 if none yet.
    pub fn last_ack(&self) -> i64 {
        self.last_ack.load(Ordering::SeqCst)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Polling helper
// ═══════════════════════════════════════════════════════════════════════════════

/// Poll `cond` every 10 ms until it holds, panicking after `limit`.
pub async fn wait_until(what: &str, limit: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > limit {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
