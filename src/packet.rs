use std::net::IpAddr;

use etherparse::{NetSlice, SlicedPacket, TcpOptionElement, TransportSlice};

/// Everything the correlation engine needs from one captured frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketMeta {
    pub ts_secs: i64,
    pub ts_usecs: i64,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub tsval: u32,
    pub ecr: u32,
    /// On-wire packet size reported by the capture layer.
    pub wire_len: u64,
}

/// Why a captured frame was rejected before correlation.
///
/// Variant order matches the classification order: the TCP layer is
/// checked first, then the timestamp option, then the zero rule, then
/// the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotTcp,
    NoTimestamp,
    ZeroTimestamp,
    NotV4Or6,
}

/// Decode one Ethernet frame into the fields the engine consumes.
pub fn decode(
    ts_secs: i64,
    ts_usecs: i64,
    wire_len: u64,
    data: &[u8],
) -> Result<PacketMeta, Rejection> {
    let sliced = SlicedPacket::from_ethernet(data).map_err(|_| Rejection::NotTcp)?;

    let tcp = match sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => tcp,
        _ => return Err(Rejection::NotTcp),
    };

    let mut timestamp = None;
    for opt in tcp.options_iterator() {
        if let Ok(TcpOptionElement::Timestamp(tsval, ecr)) = opt {
            timestamp = Some((tsval, ecr));
            break;
        }
    }
    let (tsval, ecr) = timestamp.ok_or(Rejection::NoTimestamp)?;

    // A zero ECR is tolerated only on a pure SYN; a SYN-ACK does not
    // qualify.
    let syn_only = tcp.syn()
        && !tcp.ack()
        && !tcp.fin()
        && !tcp.rst()
        && !tcp.psh()
        && !tcp.urg();
    if tsval == 0 || (ecr == 0 && !syn_only) {
        return Err(Rejection::ZeroTimestamp);
    }

    let (src_addr, dst_addr) = match &sliced.net {
        Some(NetSlice::Ipv4(ip)) => (
            IpAddr::V4(ip.header().source_addr()),
            IpAddr::V4(ip.header().destination_addr()),
        ),
        Some(NetSlice::Ipv6(ip)) => (
            IpAddr::V6(ip.header().source_addr()),
            IpAddr::V6(ip.header().destination_addr()),
        ),
        _ => return Err(Rejection::NotV4Or6),
    };

    Ok(PacketMeta {
        ts_secs,
        ts_usecs,
        src_addr,
        dst_addr,
        src_port: tcp.source_port(),
        dst_port: tcp.destination_port(),
        tsval,
        ecr,
        wire_len,
    })
}

#[cfg(test)]
mod tests {
    use etherparse::PacketBuilder;

    use super::*;

    fn tcp_frame(tsval: u32, ecr: u32, syn: bool) -> Vec<u8> {
        let mut builder =
            PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
                .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
                .tcp(1000, 80, 42, 65535);
        if syn {
            builder = builder.syn();
        } else {
            builder = builder.ack(7);
        }
        let builder = builder
            .options(&[TcpOptionElement::Timestamp(tsval, ecr)])
            .unwrap();

        let mut frame = Vec::with_capacity(builder.size(0));
        builder.write(&mut frame, &[]).unwrap();
        frame
    }

    #[test]
    fn decodes_timestamped_tcp() {
        let frame = tcp_frame(100, 50, false);
        let meta = decode(1_700_000_000, 250_000, 60, &frame).unwrap();

        assert_eq!(meta.src_addr.to_string(), "10.0.0.1");
        assert_eq!(meta.dst_addr.to_string(), "10.0.0.2");
        assert_eq!(meta.src_port, 1000);
        assert_eq!(meta.dst_port, 80);
        assert_eq!(meta.tsval, 100);
        assert_eq!(meta.ecr, 50);
        assert_eq!(meta.wire_len, 60);
    }

    #[test]
    fn decodes_ipv6() {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv6([1; 16], [2; 16], 64)
            .tcp(1000, 80, 42, 65535)
            .ack(7)
            .options(&[TcpOptionElement::Timestamp(100, 50)])
            .unwrap();
        let mut frame = Vec::with_capacity(builder.size(0));
        builder.write(&mut frame, &[]).unwrap();

        let meta = decode(0, 0, 74, &frame).unwrap();
        assert!(meta.src_addr.is_ipv6());
        assert_eq!(meta.tsval, 100);
    }

    #[test]
    fn rejects_non_tcp() {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(1000, 53);
        let mut frame = Vec::with_capacity(builder.size(0));
        builder.write(&mut frame, &[]).unwrap();

        assert_eq!(decode(0, 0, 40, &frame), Err(Rejection::NotTcp));
        assert_eq!(decode(0, 0, 0, &[]), Err(Rejection::NotTcp));
    }

    #[test]
    fn rejects_missing_timestamp_option() {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(1000, 80, 42, 65535)
            .ack(7);
        let mut frame = Vec::with_capacity(builder.size(0));
        builder.write(&mut frame, &[]).unwrap();

        assert_eq!(decode(0, 0, 60, &frame), Err(Rejection::NoTimestamp));
    }

    #[test]
    fn rejects_zero_tsval() {
        let frame = tcp_frame(0, 50, false);
        assert_eq!(decode(0, 0, 60, &frame), Err(Rejection::ZeroTimestamp));
    }

    #[test]
    fn zero_ecr_allowed_only_on_pure_syn() {
        let syn = tcp_frame(100, 0, true);
        let meta = decode(0, 0, 60, &syn).unwrap();
        assert_eq!(meta.ecr, 0);

        let ack = tcp_frame(100, 0, false);
        assert_eq!(decode(0, 0, 60, &ack), Err(Rejection::ZeroTimestamp));
    }
}
