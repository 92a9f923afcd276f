//! TSval observation index.
//!
//! Maps (directional flow, TSval) to the first capture time that value
//! was seen. Matched entries are not removed; their time is negated and
//! the slot is retained until age expiry. TSval generators may pause or
//! wrap on time scales longer than the RTT, so a deleted entry could be
//! recreated by a later packet carrying the same TSval and then matched
//! by an ECR from the earlier incarnation, yielding a gross RTT
//! underestimate. Retention until age expiry blocks that.

use std::collections::HashMap;

use crate::flow::FlowKey;

/// (flow, TSval) composite key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TsKey {
    pub flow: FlowKey,
    pub tsval: u32,
}

/// One TSval observation.
///
/// `t` is sign-encoded: positive means unmatched, negative means the
/// entry has been consumed by a reverse-direction match.
#[derive(Debug)]
pub struct TsEntry {
    pub t: f64,
    /// The observing flow's `bytes_sent` when the entry was created.
    pub f_bytes: u64,
    /// The observing flow's `bytes_departed` when the entry was created.
    pub d_bytes: u64,
}

impl TsEntry {
    pub fn new(t: f64, f_bytes: u64, d_bytes: u64) -> Self {
        Self { t, f_bytes, d_bytes }
    }

    /// Mark the entry matched. Idempotent.
    pub fn consume(&mut self) {
        if self.t > 0.0 {
            self.t = -self.t;
        }
    }

    #[allow(dead_code)]
    pub fn consumed(&self) -> bool {
        self.t < 0.0
    }
}

#[derive(Default)]
pub struct TsvalTable {
    entries: HashMap<TsKey, TsEntry>,
}

impl TsvalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Insert only if the key is absent, preserving the oldest
    /// observation of a TSval. A later duplicate could only decrease
    /// the observed RTT, which underestimates; overestimating is the
    /// acceptable direction.
    pub fn insert_if_absent(&mut self, key: TsKey, entry: TsEntry) -> bool {
        match self.entries.entry(key) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
            std::collections::hash_map::Entry::Occupied(_) => false,
        }
    }

    pub fn lookup_mut(&mut self, key: &TsKey) -> Option<&mut TsEntry> {
        self.entries.get_mut(key)
    }

    /// Remove entries older than `max_age`, matched or not. Returns how
    /// many were removed.
    pub fn sweep(&mut self, now: f64, max_age: f64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| now - e.t.abs() <= max_age);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn ts_key(tsval: u32) -> TsKey {
        TsKey {
            flow: FlowKey::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                1000,
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                80,
            ),
            tsval,
        }
    }

    #[test]
    fn oldest_observation_wins() {
        let mut table = TsvalTable::new();
        assert!(table.insert_if_absent(ts_key(100), TsEntry::new(1.0, 60, 0)));
        assert!(!table.insert_if_absent(ts_key(100), TsEntry::new(2.0, 120, 0)));

        let entry = table.lookup_mut(&ts_key(100)).unwrap();
        assert_eq!(entry.t, 1.0);
        assert_eq!(entry.f_bytes, 60);
    }

    #[test]
    fn consume_is_idempotent_and_blocks_reuse() {
        let mut table = TsvalTable::new();
        table.insert_if_absent(ts_key(100), TsEntry::new(1.5, 60, 0));

        let entry = table.lookup_mut(&ts_key(100)).unwrap();
        entry.consume();
        assert!(entry.consumed());
        assert_eq!(entry.t, -1.5);
        entry.consume();
        assert_eq!(entry.t, -1.5);

        // The slot survives and keeps blocking re-insertion.
        assert!(!table.insert_if_absent(ts_key(100), TsEntry::new(3.0, 60, 0)));
    }

    #[test]
    fn zero_time_entry_is_never_match_eligible() {
        let mut table = TsvalTable::new();
        table.insert_if_absent(ts_key(100), TsEntry::new(0.0, 60, 0));

        // consume() cannot sign-flip a 0.0, so the entry never reads as
        // consumed; match eligibility must be the strict t > 0.0 check,
        // or every later duplicate ECR would match this entry again.
        let entry = table.lookup_mut(&ts_key(100)).unwrap();
        entry.consume();
        assert!(!entry.consumed());
        assert_eq!(entry.t, 0.0);
        assert!(!(entry.t > 0.0));
    }

    #[test]
    fn sweep_ages_out_matched_and_unmatched_entries() {
        let mut table = TsvalTable::new();
        table.insert_if_absent(ts_key(1), TsEntry::new(0.0, 0, 0));
        table.insert_if_absent(ts_key(2), TsEntry::new(5.0, 0, 0));
        table.lookup_mut(&ts_key(2)).unwrap().consume();
        table.insert_if_absent(ts_key(3), TsEntry::new(12.0, 0, 0));

        // max_age 10 at now=16: |0.0| and |-5.0| are stale, 12.0 is not.
        let removed = table.sweep(16.0, 10.0);
        assert_eq!(removed, 2);
        assert_eq!(table.len(), 1);
        assert!(table.lookup_mut(&ts_key(3)).is_some());
    }
}
