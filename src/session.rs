use std::sync::atomic::{AtomicU32, Ordering};

use uuid::Uuid;

/// Produces probe identifiers. Identifiers handed out by one source are never reused.
pub trait IdSource {
    /// Returns a fresh identifier. `now_millis` is the probe's send time.
    fn next_id(&self, now_millis: i64) -> String;
}

/// Collision-resistant identifiers of the form `msg_<millis>_<random>`.
///
/// The random part is taken from a v4 UUID.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIdSource;

impl IdSource for RandomIdSource {
    fn next_id(&self, now_millis: i64) -> String {
        let random = Uuid::new_v4().simple().to_string();
        format!("msg_{}_{}", now_millis, &random[..12])
    }
}

/// Sequential identifiers `<prefix><n>` starting at 1.
pub struct SequentialIdSource {
    prefix: String,
    curr_seq: AtomicU32,
}

impl SequentialIdSource {
    pub fn new(prefix: &str) -> SequentialIdSource {
        SequentialIdSource {
            prefix: prefix.to_string(),
            curr_seq: AtomicU32::new(1),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl IdSource for SequentialIdSource {
    fn next_id(&self, _now_millis: i64) -> String {
        let seq = self.curr_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.prefix, seq)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_random_ids_are_unique() {
        let ids = RandomIdSource;
        let generated: HashSet<String> = (0..1000).map(|_| ids.next_id(1_000)).collect();
        assert_eq!(generated.len(), 1000);
    }

    #[test]
    fn test_random_id_shape() {
        let id = RandomIdSource.next_id(1_700_000_000_000);
        assert!(id.starts_with("msg_1700000000000_"));
        assert_eq!(id.len(), "msg_1700000000000_".len() + 12);
    }

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIdSource::new("p");
        assert_eq!(ids.prefix(), "p");
        assert_eq!(ids.next_id(0), "p1");
        assert_eq!(ids.next_id(0), "p2");
        assert_eq!(ids.next_id(99), "p3");
    }
}
