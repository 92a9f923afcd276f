use std::{
    io::{self, BufWriter, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{Local, TimeZone};
use tokio::sync::broadcast;
use tracing::debug;

use crate::flow::FlowKey;

/// One RTT sample ready for rendering.
pub struct Sample<'a> {
    /// Normalized capture time of the matching packet.
    pub cap_tm: f64,
    /// Clock baseline; `off_tm + cap_tm` is the absolute UNIX time.
    pub off_tm: i64,
    pub rtt: f64,
    pub min_rtt: f64,
    pub f_bytes: u64,
    pub d_bytes: u64,
    pub p_bytes: u64,
    /// Flow of the packet that completed the match.
    pub flow: &'a FlowKey,
}

/// Render a duration in seconds with an SI prefix: two decimals below
/// 10, one below 100, none at or above 100 (padded to keep the column
/// width).
pub fn fmt_time_diff(dt: f64) -> String {
    let (dt, prefix) = if dt < 1e-3 {
        (dt * 1e6, "u")
    } else if dt < 1.0 {
        (dt * 1e3, "m")
    } else {
        (dt, "")
    };
    if dt < 10.0 {
        format!("{dt:.2}{prefix}s")
    } else if dt < 100.0 {
        format!("{dt:.1}{prefix}s")
    } else {
        format!(" {dt:.0}{prefix}s")
    }
}

/// Line-oriented sample sink, shareable with the flush driver.
#[derive(Clone)]
pub struct SampleSink {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
    machine_readable: bool,
}

impl SampleSink {
    pub fn new(out: Box<dyn Write + Send>, machine_readable: bool) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
            machine_readable,
        }
    }

    /// Block-buffered stdout; the flush driver keeps latency bounded.
    pub fn stdout(machine_readable: bool) -> Self {
        Self::new(Box::new(BufWriter::new(io::stdout())), machine_readable)
    }

    pub fn write(&self, s: &Sample<'_>) -> io::Result<()> {
        let mut out = self.out.lock().unwrap();
        if self.machine_readable {
            let secs = s.off_tm + s.cap_tm.floor() as i64;
            let usecs = ((s.cap_tm - s.cap_tm.floor()) * 1e6) as i64;
            writeln!(
                out,
                "{secs}.{usecs:06} {rtt:.6} {min:.6} {f} {d} {p} {flow}",
                rtt = s.rtt,
                min = s.min_rtt,
                f = s.f_bytes,
                d = s.d_bytes,
                p = s.p_bytes,
                flow = s.flow,
            )
        } else {
            let secs = s.off_tm + s.cap_tm.floor() as i64;
            let stamp = Local
                .timestamp_opt(secs, 0)
                .earliest()
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_default();
            writeln!(
                out,
                "{stamp} {rtt} {min} {flow}",
                rtt = fmt_time_diff(s.rtt),
                min = fmt_time_diff(s.min_rtt),
                flow = s.flow,
            )
        }
    }

    pub fn flush(&self) {
        let _ = self.out.lock().unwrap().flush();
    }
}

/// Flush the sink on a short cadence so downstream consumers (tail,
/// analysis scripts) see samples promptly despite block buffering.
pub async fn run_flush_loop(
    sink: SampleSink,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => sink.flush(),
            _ = shutdown_rx.recv() => {
                sink.flush();
                debug!("flush loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct SharedBuf(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl SharedBuf {
    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[cfg(test)]
impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    #[test]
    fn si_prefix_scaling_and_precision() {
        assert_eq!(fmt_time_diff(0.000_05), "50.0us");
        assert_eq!(fmt_time_diff(0.000_003_5), "3.50us");
        assert_eq!(fmt_time_diff(0.0035), "3.50ms");
        assert_eq!(fmt_time_diff(0.050), "50.0ms");
        assert_eq!(fmt_time_diff(0.999), " 999ms");
        assert_eq!(fmt_time_diff(2.5), "2.50s");
        assert_eq!(fmt_time_diff(42.0), "42.0s");
        assert_eq!(fmt_time_diff(150.0), " 150s");
    }

    fn sample_flow() -> FlowKey {
        FlowKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            1000,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            80,
        )
    }

    #[test]
    fn machine_readable_line() {
        let buf = SharedBuf::default();
        let sink = SampleSink::new(Box::new(buf.clone()), true);
        let flow = sample_flow();

        sink.write(&Sample {
            cap_tm: 12.150_000,
            off_tm: 1_700_000_000,
            rtt: 0.05,
            min_rtt: 0.05,
            f_bytes: 120,
            d_bytes: 0,
            p_bytes: 40,
            flow: &flow,
        })
        .unwrap();

        assert_eq!(
            buf.contents(),
            "1700000012.150000 0.050000 0.050000 120 0 40 10.0.0.1:1000+10.0.0.2:80\n"
        );
    }

    #[test]
    fn human_readable_line() {
        let buf = SharedBuf::default();
        let sink = SampleSink::new(Box::new(buf.clone()), false);
        let flow = sample_flow();

        sink.write(&Sample {
            cap_tm: 0.5,
            off_tm: 1_700_000_000,
            rtt: 0.050,
            min_rtt: 0.0035,
            f_bytes: 0,
            d_bytes: 0,
            p_bytes: 0,
            flow: &flow,
        })
        .unwrap();

        let line = buf.contents();
        assert!(line.ends_with(" 50.0ms 3.50ms 10.0.0.1:1000+10.0.0.2:80\n"));
        // HH:MM:SS stamp ahead of the RTT columns.
        assert_eq!(line.split(' ').next().unwrap().len(), 8);
    }
}
