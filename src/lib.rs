//! # resp-relay
//!
//! A replication relay for RESP-family key-value stores. For every
//! (source, target) pair it impersonates a replica of the source,
//! restores the point-in-time dump into the target, then forwards the
//! ongoing command stream so the target tracks the source with bounded
//! lag.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                                 resp-relay                                │
//! │                                                                           │
//! │  ┌────────────┐   ┌──────────────────┐   ┌─────────────────────────────┐  │
//! │  │  Engine    │──►│ Syncer (per pair)│──►│ demux ─ pipe ─ rdb/commands │  │
//! │  │ (dispatch) │   │ waitfull→full→   │   │   restorer pool / sender    │  │
//! │  └────────────┘   │   incr ↔ reopen  │   │   receiver / ack / probe    │  │
//! │        │          └──────────────────┘   └─────────────────────────────┘  │
//! │        ▼                    │                          │                  │
//! │  ┌────────────┐    ┌───────────────┐        ┌────────────────────┐        │
//! │  │ Info()/    │    │ delay sampling│        │ source ←─ REPLCONF │        │
//! │  │ status agg │    │ (latency ms)  │        │ ACK / offset probe │        │
//! │  └────────────┘    └───────────────┘        └────────────────────┘        │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Phases
//!
//! 1. **Handshake**: authenticate, advertise the listening port, request
//!    partial resync (`PSYNC ? -1`) or classic `SYNC`, collect
//!    `(runid, offset, size)`.
//! 2. **Full sync**: demux exactly `size` snapshot bytes into a bounded
//!    pipe (optionally spilling to disk) while ACKing the source at 1 Hz;
//!    parse records and restore them through a worker pool with
//!    key/slot/db filtering.
//! 3. **Incremental**: decode the continuing command stream, filter and
//!    coalesce, pipeline to the target with flow control, measure sampled
//!    end-to-end latency, and resume with `PSYNC <runid> <offset>` after
//!    source hiccups.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use resp_relay::{Engine, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = RelayConfig::default();
//!     config.source.address_list = vec!["127.0.0.1:6379".into()];
//!     config.target.address_list = vec!["127.0.0.1:6380".into()];
//!
//!     let engine = Engine::new(config).expect("invalid configuration");
//!     // Blocks while forwarding; returns only the first fatal error.
//!     if let Err(e) = engine.run().await {
//!         eprintln!("replication failed: {e}");
//!         std::process::exit(1);
//!     }
//! }
//! ```

pub mod config;
pub mod delay;
pub mod engine;
pub mod error;
pub mod filter;
pub mod forward;
pub mod heartbeat;
pub mod metrics;
pub mod pipe;
pub mod protocol;
pub mod restore;
pub mod source;
pub mod status;
pub mod syncer;
pub mod target;

// Re-exports for convenience
pub use config::{AuthType, RelayConfig};
pub use engine::Engine;
pub use error::{RelayError, Result};
pub use status::SyncStatus;
pub use syncer::{Syncer, SyncerInfo, SyncerShared};
