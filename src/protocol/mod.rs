//! Wire codec collaborators.
//!
//! Everything under this module is protocol plumbing the replication core
//! depends on but treats as a black box:
//!
//! - [`resp`] — RESP frame decoder/encoder for replies and inline commands
//! - [`rdb`] — snapshot record parser producing restorable payloads
//! - [`commands`] — registry mapping verbs to their key argument positions
//! - [`keyslot`] — cluster slot hash (CRC16 with hashtag rule)
//! - [`crc64`] — checksum used by restore payload framing

pub mod commands;
pub mod crc64;
pub mod keyslot;
pub mod rdb;
pub mod resp;
