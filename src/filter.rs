//! Inclusion filters compiled from configuration.
//!
//! Filters decide which snapshot records are restored and which forwarded
//! commands are bypassed. Priority at apply time: key prefixes first, then
//! slots, then pass-through. The db filter is independent of both and
//! drives `SELECT` acceptance.

use crate::config::FilterConfig;
use crate::error::{RelayError, Result};
use crate::protocol::keyslot;
use std::collections::HashSet;

/// Compiled filter set, built once per syncer.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    prefixes: Vec<Vec<u8>>,
    slots: HashSet<u16>,
    db: Option<u32>,
}

impl Filters {
    /// Compile a [`FilterConfig`], validating slot and db strings.
    pub fn compile(config: &FilterConfig) -> Result<Self> {
        let mut slots = HashSet::with_capacity(config.slot.len());
        for raw in &config.slot {
            let slot: u16 = raw
                .parse()
                .map_err(|_| RelayError::Config(format!("filter.slot entry {raw:?} is not a number")))?;
            if slot >= keyslot::SLOT_COUNT {
                return Err(RelayError::Config(format!(
                    "filter.slot entry {slot} out of range (max {})",
                    keyslot::SLOT_COUNT - 1
                )));
            }
            slots.insert(slot);
        }

        let db = match &config.db {
            Some(raw) => Some(raw.parse::<u32>().map_err(|_| {
                RelayError::Config(format!("filter.db entry {raw:?} is not a number"))
            })?),
            None => None,
        };

        Ok(Self {
            prefixes: config.key.iter().map(|p| p.as_bytes().to_vec()).collect(),
            slots,
            db,
        })
    }

    /// Whether commands routed to `db` should be applied.
    pub fn accept_db(&self, db: u32) -> bool {
        match self.db {
            Some(want) => want == db,
            None => true,
        }
    }

    /// Whether a key-prefix filter is configured.
    pub fn has_key_filter(&self) -> bool {
        !self.prefixes.is_empty()
    }

    /// Whether `key` starts with any configured prefix.
    pub fn match_key(&self, key: &[u8]) -> bool {
        self.prefixes.iter().any(|p| key.starts_with(p))
    }

    /// Whether a snapshot record with this key should be restored.
    ///
    /// Key prefixes take priority over slots; with neither configured
    /// every record passes.
    pub fn accept_record_key(&self, key: &[u8]) -> bool {
        if !self.prefixes.is_empty() {
            return self.match_key(key);
        }
        if !self.slots.is_empty() {
            return self.slots.contains(&keyslot::key_to_slot(key));
        }
        true
    }
}
