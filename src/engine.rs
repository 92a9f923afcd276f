//! The passive RTT correlation engine.
//!
//! For each incoming packet: classify, update flow state, record the
//! packet's TSval against its directional flow, and try to match the
//! packet's ECR against the reverse direction's TSval index. A match
//! means this packet completes a round trip through the capture point
//! back to its own source, so one RTT sample is emitted for the
//! packet's flow.

use std::{io::Write, net::IpAddr};

use chrono::{Local, TimeZone};
use ipnetwork::IpNetwork;
use tracing::debug;

use crate::{
    capture::Frame,
    clock::CaptureClock,
    flow::{FlowKey, FlowTable},
    metrics,
    output::{Sample, SampleSink},
    packet::{self, PacketMeta, Rejection},
    tsval::{TsEntry, TsKey, TsvalTable},
};

/// Correlation knobs, resolved from the CLI.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Max age in seconds of an unmatched (or consumed) TSval entry.
    pub tsval_max_age: f64,
    /// Flows idle longer than this many seconds are deleted.
    pub flow_max_idle: f64,
    /// Summary report interval in capture seconds; 0 disables reports.
    pub sum_interval: f64,
    pub max_flows: usize,
    /// Stop after this many packets; 0 means no limit.
    pub max_packets: u64,
    /// Stop after this many capture seconds; 0 means no limit.
    pub time_to_run: f64,
    /// Suppress recording of TSvals destined for a local range.
    pub filter_local: bool,
    pub local_ranges: Vec<IpNetwork>,
    /// Print all discard classes in summaries, including zero counts.
    pub verbose: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            tsval_max_age: 10.0,
            flow_max_idle: 300.0,
            sum_interval: 10.0,
            max_flows: 10_000,
            max_packets: 0,
            time_to_run: 0.0,
            filter_local: true,
            local_ranges: Vec::new(),
            verbose: false,
        }
    }
}

/// Packet and discard counts since the last summary report.
#[derive(Debug, Default)]
pub struct Counters {
    pub packets: u64,
    pub not_tcp: u64,
    pub no_ts: u64,
    pub zero_ts: u64,
    pub not_v4or6: u64,
    pub uni_dir: u64,
}

pub struct Engine {
    opts: EngineOptions,
    clock: CaptureClock,
    flows: FlowTable,
    tsvals: TsvalTable,
    counters: Counters,
    /// Cumulative count, untouched by summary resets; drives the
    /// packet limit and the final report.
    total_packets: u64,
    /// Normalized capture time of the most recent usable packet.
    cap_tm: f64,
    start_tm: f64,
    next_summary: f64,
    sink: SampleSink,
    diag: Box<dyn Write + Send>,
}

impl Engine {
    pub fn new(opts: EngineOptions, sink: SampleSink, diag: Box<dyn Write + Send>) -> Self {
        let flows = FlowTable::new(opts.max_flows);
        Self {
            opts,
            clock: CaptureClock::new(),
            flows,
            tsvals: TsvalTable::new(),
            counters: Counters::default(),
            total_packets: 0,
            cap_tm: 0.0,
            start_tm: 0.0,
            next_summary: 0.0,
            sink,
            diag,
        }
    }

    /// Feed one captured frame through classification and correlation.
    pub fn process_frame(&mut self, frame: &Frame) {
        self.counters.packets += 1;
        self.total_packets += 1;
        metrics::record_packet();
        match packet::decode(frame.ts_secs, frame.ts_usecs, frame.wire_len, &frame.data) {
            Ok(meta) => self.correlate(&meta),
            Err(Rejection::NotTcp) => self.counters.not_tcp += 1,
            Err(Rejection::NoTimestamp) => self.counters.no_ts += 1,
            Err(Rejection::ZeroTimestamp) => self.counters.zero_ts += 1,
            Err(Rejection::NotV4Or6) => self.counters.not_v4or6 += 1,
        }
    }

    fn correlate(&mut self, m: &PacketMeta) {
        let first = self.clock.offset().is_none();
        let cap_tm = self.clock.normalize(m.ts_secs, m.ts_usecs);
        self.cap_tm = cap_tm;
        if first {
            self.start_tm = cap_tm;
            if self.opts.sum_interval > 0.0 {
                let stamp = Local
                    .timestamp_opt(m.ts_secs, 0)
                    .earliest()
                    .map(|t| t.format("%c").to_string())
                    .unwrap_or_default();
                let _ = writeln!(self.diag, "First packet at {stamp}");
            }
        }

        let fkey = FlowKey::new(m.src_addr, m.src_port, m.dst_addr, m.dst_port);
        let rkey = fkey.reversed();

        let arr_fwd;
        let fwd_departed;
        let created;
        {
            // Table full and the key is new: drop without creating any
            // flow or TSval state; the reaper restores capacity.
            let Some((fr, was_created)) = self.flows.get_or_create(&fkey, cap_tm) else {
                return;
            };
            created = was_created;
            fr.last_seen = cap_tm;
            if !fr.bi_directional {
                self.counters.uni_dir += 1;
                return;
            }
            arr_fwd = fr.bytes_sent + m.wire_len;
            fr.bytes_sent = arr_fwd;
            fwd_departed = fr.bytes_departed;
        }
        if created {
            metrics::set_flows_active(self.flows.len());
        }

        // Forward-direction recording, unless the destination lies in a
        // local range. Matching below is not suppressed.
        if !(self.opts.filter_local && self.is_local(&m.dst_addr)) {
            self.tsvals.insert_if_absent(
                TsKey {
                    flow: fkey.clone(),
                    tsval: m.tsval,
                },
                TsEntry::new(cap_tm, arr_fwd, fwd_departed),
            );
        }

        // Reverse-direction matching: this packet's ECR against the
        // reverse flow's TSval index.
        let match_key = TsKey {
            flow: rkey.clone(),
            tsval: m.ecr,
        };
        // Strictly positive: consumed entries are negative, and an
        // entry recorded exactly on the clock baseline (t == 0.0) can
        // never be sign-flipped, so it must never become a match.
        let pending = match self.tsvals.lookup_mut(&match_key) {
            Some(e) if e.t > 0.0 => Some((e.t, e.f_bytes, e.d_bytes)),
            _ => None,
        };
        let Some((t_orig, f_bytes, d_bytes)) = pending else {
            return;
        };

        // The reverse record receives the departing-byte context. If it
        // was reaped in the interim (only possible when flow_max_idle
        // is shorter than tsval_max_age) the sample is dropped: RTT
        // emission requires both directions live and bi-directional.
        let Some(rev) = self.flows.get_mut(&rkey) else {
            return;
        };
        rev.bytes_departed = f_bytes;

        let fr = self.flows.get_mut(&fkey).expect("forward flow present");
        let rtt = cap_tm - t_orig;
        if fr.min_rtt > rtt {
            fr.min_rtt = rtt;
        }
        let min_rtt = fr.min_rtt;
        let p_bytes = arr_fwd - fr.last_bytes_sent;
        fr.last_bytes_sent = arr_fwd;

        if let Some(e) = self.tsvals.lookup_mut(&match_key) {
            e.consume();
        }

        let _ = self.sink.write(&Sample {
            cap_tm,
            off_tm: self.clock.offset().unwrap_or(0),
            rtt,
            min_rtt,
            f_bytes,
            d_bytes,
            p_bytes,
            flow: &fkey,
        });
        metrics::observe_rtt(&m.src_addr, &m.dst_addr, m.dst_port, rtt * 1000.0);
        metrics::record_sample();
    }

    fn is_local(&self, addr: &IpAddr) -> bool {
        self.opts.local_ranges.iter().any(|r| r.contains(*addr))
    }

    /// Capture-time-driven summary reporting. The first boundary
    /// crossing only arms the interval.
    pub fn maybe_summarize(&mut self) {
        if self.opts.sum_interval <= 0.0 || self.cap_tm < self.next_summary {
            return;
        }
        if self.next_summary > 0.0 {
            self.write_summary();
            self.counters = Counters::default();
        }
        self.next_summary = self.cap_tm + self.opts.sum_interval;
    }

    fn write_summary(&mut self) {
        let c = &self.counters;
        let mut line = format!("{} flows, {} packets, ", self.flows.len(), c.packets);
        for (count, label) in [
            (c.no_ts, "no TS opt"),
            (c.zero_ts, "zero TSval"),
            (c.uni_dir, "uni-directional"),
            (c.not_tcp, "not TCP"),
            (c.not_v4or6, "not v4 or v6"),
        ] {
            if count > 0 || self.opts.verbose {
                line.push_str(&format!("{count} {label}, "));
            }
        }
        let _ = writeln!(self.diag, "{line}");
    }

    /// True once the packet-count or run-time limit has been reached.
    pub fn limit_reached(&self) -> bool {
        (self.opts.time_to_run > 0.0 && self.cap_tm - self.start_tm >= self.opts.time_to_run)
            || (self.opts.max_packets > 0 && self.total_packets >= self.opts.max_packets)
    }

    /// Final report when a limit stops the run.
    pub fn report_limit_stop(&mut self) {
        self.write_summary();
        let _ = writeln!(
            self.diag,
            "Captured {} packets in {:.6} seconds",
            self.total_packets,
            self.cap_tm - self.start_tm
        );
    }

    /// Sweep expired TSval entries and idle flows at reference time
    /// `now` (same timebase as normalized capture time).
    pub fn sweep(&mut self, now: f64) {
        let ts_removed = self.tsvals.sweep(now, self.opts.tsval_max_age);
        let flows_removed = self.flows.sweep_idle(now, self.opts.flow_max_idle);
        if ts_removed > 0 || flows_removed > 0 {
            debug!(
                ts_removed,
                flows_removed,
                tsvals = self.tsvals.len(),
                flows = self.flows.len(),
                "sweep completed"
            );
        }
        metrics::set_flows_active(self.flows.len());
    }

    /// Retire all remaining state at shutdown.
    pub fn final_sweep(&mut self) {
        let horizon = self.cap_tm + self.opts.tsval_max_age.max(self.opts.flow_max_idle) + 1.0;
        self.sweep(horizon);
    }

    pub fn clock_offset(&self) -> Option<i64> {
        self.clock.offset()
    }

    #[cfg(test)]
    pub(crate) fn flow_count(&self) -> usize {
        self.flows.len()
    }

    #[cfg(test)]
    pub(crate) fn tsval_count(&self) -> usize {
        self.tsvals.len()
    }

    #[cfg(test)]
    pub(crate) fn stats(&self) -> &Counters {
        &self.counters
    }
}
