//! Reaper: evicts probes that outlived the timeout.

use crate::correlation::CorrelationTable;

/// A probe evicted without a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostProbe {
    pub id: String,
    pub send_time: i64,
    /// Age at eviction in milliseconds.
    pub age_ms: i64,
}

/// Periodic sweep of the correlation table.
pub struct Reaper {
    timeout_ms: i64,
    lost: u64,
}

impl Reaper {
    pub fn new(timeout_ms: i64) -> Self {
        Reaper { timeout_ms, lost: 0 }
    }

    /// Evicts every probe older than the timeout at `now`.
    ///
    /// Evicted probes are gone for good: a response arriving later finds nothing to
    /// resolve and is dropped.
    pub fn sweep(&mut self, table: &mut CorrelationTable, now: i64) -> Vec<LostProbe> {
        let lost: Vec<LostProbe> = table
            .sweep_expired(now, self.timeout_ms)
            .into_iter()
            .map(|expired| LostProbe {
                age_ms: now - expired.send_time,
                id: expired.id,
                send_time: expired.send_time,
            })
            .collect();

        for probe in &lost {
            log::warn!(
                "Probe {} lost: no response after {} ms",
                probe.id,
                probe.age_ms
            );
        }
        self.lost += lost.len() as u64;
        lost
    }

    pub fn timeout_ms(&self) -> i64 {
        self.timeout_ms
    }

    /// Total probes evicted so far.
    pub fn lost(&self) -> u64 {
        self.lost
    }
}
