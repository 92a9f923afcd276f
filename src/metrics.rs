use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_util::MetricKindMask;
use tracing::info;

use crate::error::Result;

/// Quantile summary of per-flow RTT observations, in milliseconds.
pub const RTT_SUMMARY: &str = "pping_service_rtt";

const RTT_QUANTILES: [f64; 3] = [0.5, 0.9, 0.99];

/// Install the Prometheus exporter and register metric descriptions.
///
/// `stale_after` bounds metric cardinality: a label set with no
/// observations for that long is dropped from the scrape output, so
/// reaped flows stop occupying series.
pub fn init(listen: SocketAddr, stale_after: Duration) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .set_quantiles(&RTT_QUANTILES)?
        .idle_timeout(MetricKindMask::HISTOGRAM, Some(stale_after))
        .install()?;

    describe_histogram!(
        RTT_SUMMARY,
        "Per-flow RTT from source IP to a given destination IP/port"
    );
    describe_gauge!("rttmon_flows_active", "Flows currently tracked");
    describe_counter!(
        "rttmon_packets_total",
        "Packets delivered to the correlation engine"
    );
    describe_counter!("rttmon_samples_total", "RTT samples emitted");

    info!(net.listen.address = %listen, "metrics endpoint started");
    Ok(())
}

/// Record one RTT observation in milliseconds.
pub fn observe_rtt(src_ip: &IpAddr, dst_ip: &IpAddr, dst_port: u16, rtt_ms: f64) {
    histogram!(
        RTT_SUMMARY,
        "src_ip" => src_ip.to_string(),
        "dst_ip" => dst_ip.to_string(),
        "dst_port" => dst_port.to_string(),
    )
    .record(rtt_ms);
}

pub fn set_flows_active(count: usize) {
    gauge!("rttmon_flows_active").set(count as f64);
}

pub fn record_packet() {
    counter!("rttmon_packets_total").increment(1);
}

pub fn record_sample() {
    counter!("rttmon_samples_total").increment(1);
}
