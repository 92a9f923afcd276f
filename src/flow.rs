use std::{collections::HashMap, fmt, net::IpAddr};

/// An (address, port) pair; one side of a directional flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Directional flow key: the ordered (source, destination) endpoint pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: Endpoint,
    pub dst: Endpoint,
}

impl FlowKey {
    pub fn new(src_addr: IpAddr, src_port: u16, dst_addr: IpAddr, dst_port: u16) -> Self {
        Self {
            src: Endpoint {
                addr: src_addr,
                port: src_port,
            },
            dst: Endpoint {
                addr: dst_addr,
                port: dst_port,
            },
        }
    }

    /// The opposite direction of this flow.
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst.clone(),
            dst: self.src.clone(),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.src, self.dst)
    }
}

/// Per-flow aggregate state.
#[derive(Debug)]
pub struct FlowRecord {
    /// Capture time of the most recent packet on this flow.
    pub last_seen: f64,
    /// Smallest RTT observed for packets departing from this flow's
    /// source side.
    pub min_rtt: f64,
    /// Cumulative bytes on this flow through the capture point.
    pub bytes_sent: u64,
    /// `bytes_sent` at the last RTT emission on this flow.
    pub last_bytes_sent: u64,
    /// The reverse flow's `bytes_sent` at the instant a matching TSval
    /// entry was recorded in that direction.
    pub bytes_departed: u64,
    /// True once the reverse flow has been observed at least once.
    pub bi_directional: bool,
}

impl FlowRecord {
    fn new(last_seen: f64) -> Self {
        Self {
            last_seen,
            min_rtt: f64::INFINITY,
            bytes_sent: 0,
            last_bytes_sent: 0,
            bytes_departed: 0,
            bi_directional: false,
        }
    }
}

/// Directional flow table with a hard capacity cap.
pub struct FlowTable {
    flows: HashMap<FlowKey, FlowRecord>,
    max_flows: usize,
}

impl FlowTable {
    pub fn new(max_flows: usize) -> Self {
        Self {
            flows: HashMap::new(),
            max_flows,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Look up or create the record for `key`. Returns the record and
    /// whether it was created, or `None` when the table is at capacity
    /// and the key is new (the caller drops the packet; no state is
    /// created). On creation, if the reverse key is already present,
    /// both records are marked bi-directional.
    pub fn get_or_create(&mut self, key: &FlowKey, now: f64) -> Option<(&mut FlowRecord, bool)> {
        let created = !self.flows.contains_key(key);
        if created {
            if self.flows.len() >= self.max_flows {
                return None;
            }
            let mut rec = FlowRecord::new(now);
            if let Some(rev) = self.flows.get_mut(&key.reversed()) {
                rev.bi_directional = true;
                rec.bi_directional = true;
            }
            self.flows.insert(key.clone(), rec);
        }
        let rec = self.flows.get_mut(key).expect("record present after insert");
        Some((rec, created))
    }

    pub fn get_mut(&mut self, key: &FlowKey) -> Option<&mut FlowRecord> {
        self.flows.get_mut(key)
    }

    /// Remove flows idle longer than `max_idle`. Returns how many were
    /// removed.
    pub fn sweep_idle(&mut self, now: f64, max_idle: f64) -> usize {
        let before = self.flows.len();
        self.flows.retain(|_, rec| now - rec.last_seen <= max_idle);
        before - self.flows.len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn key(a: u8, ap: u16, b: u8, bp: u16) -> FlowKey {
        FlowKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, a)),
            ap,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, b)),
            bp,
        )
    }

    #[test]
    fn renders_original_string_forms() {
        let k = key(1, 1000, 2, 80);
        assert_eq!(k.to_string(), "10.0.0.1:1000+10.0.0.2:80");
        assert_eq!(k.reversed().to_string(), "10.0.0.2:80+10.0.0.1:1000");
    }

    #[test]
    fn creation_marks_both_directions_bi_directional() {
        let mut table = FlowTable::new(10);
        let fwd = key(1, 1000, 2, 80);

        let (rec, created) = table.get_or_create(&fwd, 0.0).unwrap();
        assert!(created);
        assert!(!rec.bi_directional);

        let (rev, created) = table.get_or_create(&fwd.reversed(), 0.1).unwrap();
        assert!(created);
        assert!(rev.bi_directional);
        assert!(table.get_mut(&fwd).unwrap().bi_directional);
    }

    #[test]
    fn refuses_new_keys_at_capacity() {
        let mut table = FlowTable::new(2);
        table.get_or_create(&key(1, 1, 2, 2), 0.0).unwrap();
        table.get_or_create(&key(3, 3, 4, 4), 0.0).unwrap();

        assert!(table.get_or_create(&key(5, 5, 6, 6), 0.0).is_none());
        assert_eq!(table.len(), 2);

        // Existing keys are still served at capacity.
        let (_, created) = table.get_or_create(&key(1, 1, 2, 2), 1.0).unwrap();
        assert!(!created);
    }

    #[test]
    fn sweep_removes_only_idle_flows() {
        let mut table = FlowTable::new(10);
        table.get_or_create(&key(1, 1, 2, 2), 0.0).unwrap();
        table.get_or_create(&key(3, 3, 4, 4), 90.0).unwrap();

        let removed = table.sweep_idle(100.0, 30.0);
        assert_eq!(removed, 1);
        assert_eq!(table.len(), 1);
        assert!(table.get_mut(&key(3, 3, 4, 4)).is_some());
    }

    #[test]
    fn capacity_frees_up_after_sweep() {
        let mut table = FlowTable::new(1);
        table.get_or_create(&key(1, 1, 2, 2), 0.0).unwrap();
        assert!(table.get_or_create(&key(3, 3, 4, 4), 50.0).is_none());

        table.sweep_idle(100.0, 30.0);
        assert!(table.get_or_create(&key(3, 3, 4, 4), 100.0).is_some());
    }
}
