//! Correlation table: the authoritative record of which probes are outstanding.
//!
//! Entries are only ever inserted or removed, never modified in place. All three
//! mutators (register, resolve, sweep) are expected to run on a single task, so a
//! resolve is a single remove and cannot race with a sweep.

use std::collections::HashMap;

use thiserror::Error;

/// Errors raised by the correlation table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    /// The identifier is already outstanding. Unreachable with a sound id source.
    #[error("Probe id {0} is already registered")]
    DuplicateId(String),
}

/// State kept per in-flight probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingProbe {
    /// Send time (T1) in milliseconds.
    pub send_time: i64,
}

/// An entry removed by [`CorrelationTable::sweep_expired`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredProbe {
    pub id: String,
    pub send_time: i64,
}

/// Mapping from probe id to in-flight state.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: HashMap<String, PendingProbe>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new in-flight probe.
    pub fn register(&mut self, id: &str, send_time: i64) -> Result<(), CorrelationError> {
        if self.pending.contains_key(id) {
            return Err(CorrelationError::DuplicateId(id.to_string()));
        }
        self.pending
            .insert(id.to_string(), PendingProbe { send_time });
        Ok(())
    }

    /// Removes the entry for `id` and returns its send time.
    ///
    /// Resolving an id twice returns `None` the second time.
    pub fn resolve(&mut self, id: &str) -> Option<i64> {
        self.pending.remove(id).map(|p| p.send_time)
    }

    /// Returns `true` when `id` is outstanding, without removing it.
    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Removes and returns every entry older than `timeout_ms` at `now`.
    ///
    /// An entry exactly `timeout_ms` old is kept. Results are ordered by send time.
    pub fn sweep_expired(&mut self, now: i64, timeout_ms: i64) -> Vec<ExpiredProbe> {
        let expired_ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now - p.send_time > timeout_ms)
            .map(|(id, _)| id.clone())
            .collect();

        let mut expired: Vec<ExpiredProbe> = expired_ids
            .into_iter()
            .filter_map(|id| {
                self.pending
                    .remove(&id)
                    .map(|p| ExpiredProbe {
                        id,
                        send_time: p.send_time,
                    })
            })
            .collect();
        expired.sort_by(|a, b| a.send_time.cmp(&b.send_time).then_with(|| a.id.cmp(&b.id)));
        expired
    }

    /// Removes every entry, returning how many were outstanding.
    pub fn clear(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
