use pcap::{Active, Capture, Offline};

/// Maximum bytes per packet to capture; enough for the link, network,
/// and TCP headers including options.
pub const SNAP_LEN: i32 = 144;

/// Live read timeout so the packet loop can observe the termination
/// flag between packets.
const READ_TIMEOUT_MS: i32 = 250;

/// One captured frame, detached from the capture buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub ts_secs: i64,
    pub ts_usecs: i64,
    pub wire_len: u64,
    pub data: Vec<u8>,
}

/// What the packet loop should do after one read attempt.
pub enum ReadOutcome {
    Frame(Frame),
    /// Live read timeout; nothing arrived.
    Idle,
    /// End of a trace file.
    Done,
}

/// A capture source: live interface or trace file, with the filter
/// already applied.
pub enum PacketSource {
    Live(Capture<Active>),
    File(Capture<Offline>),
}

impl PacketSource {
    pub fn open_live(ifname: &str, filter: &str) -> Result<Self, pcap::Error> {
        let mut cap = Capture::from_device(ifname)?
            .promisc(false)
            .snaplen(SNAP_LEN)
            .timeout(READ_TIMEOUT_MS)
            .open()?;
        cap.filter(filter, true)?;
        Ok(Self::Live(cap))
    }

    pub fn open_file(path: &std::path::Path, filter: &str) -> Result<Self, pcap::Error> {
        let mut cap = Capture::from_file(path)?;
        cap.filter(filter, true)?;
        Ok(Self::File(cap))
    }

    pub fn read_next(&mut self) -> Result<ReadOutcome, pcap::Error> {
        let next = match self {
            Self::Live(cap) => cap.next_packet(),
            Self::File(cap) => cap.next_packet(),
        };
        match next {
            Ok(pkt) => Ok(ReadOutcome::Frame(Frame {
                ts_secs: pkt.header.ts.tv_sec as i64,
                ts_usecs: pkt.header.ts.tv_usec as i64,
                wire_len: pkt.header.len as u64,
                data: pkt.data.to_vec(),
            })),
            Err(pcap::Error::TimeoutExpired) => Ok(ReadOutcome::Idle),
            Err(pcap::Error::NoMorePackets) => Ok(ReadOutcome::Done),
            Err(e) => Err(e),
        }
    }
}

/// Conjoin the base `tcp` filter with a user expression.
pub fn build_filter(extra: Option<&str>) -> String {
    match extra {
        Some(expr) => format!("tcp and ({expr})"),
        None => "tcp".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_defaults_to_tcp() {
        assert_eq!(build_filter(None), "tcp");
    }

    #[test]
    fn filter_conjoins_user_expression() {
        assert_eq!(
            build_filter(Some("net 74.125.0.0/16 or 45.57.0.0/17")),
            "tcp and (net 74.125.0.0/16 or 45.57.0.0/17)"
        );
    }
}
