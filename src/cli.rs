use std::path::PathBuf;

use clap::{ArgAction, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "rttmon",
    version,
    about = "Passive TCP RTT monitor with a Prometheus scrape endpoint",
    long_about = None
)]
pub struct Cli {
    /// Do live capture from interface <ifname>.
    #[arg(
        short = 'i',
        long = "interface",
        value_name = "ifname",
        conflicts_with = "read",
        required_unless_present = "read"
    )]
    pub interface: Option<String>,

    /// Process capture file <pcap>.
    #[arg(short = 'r', long = "read", value_name = "pcap")]
    pub read: Option<PathBuf>,

    /// pcap filter applied to packets, conjoined with the base "tcp"
    /// filter. E.g. -f 'net 74.125.0.0/16 or 45.57.0.0/17' only shows
    /// traffic to/from youtube or netflix.
    #[arg(short = 'f', long = "filter", value_name = "expr")]
    pub filter: Option<String>,

    /// Stop after capturing <num> packets.
    #[arg(short = 'c', long = "count", value_name = "num", default_value_t = 0)]
    pub count: u64,

    /// Stop after capturing for <num> seconds.
    #[arg(short = 's', long = "seconds", value_name = "num", default_value_t = 0.0)]
    pub seconds: f64,

    /// Don't print summary reports to stderr.
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Print summary reports with every discard class, including zero
    /// counts.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Show RTTs through local host applications.
    #[arg(short = 'l', long = "showLocal")]
    pub show_local: bool,

    /// 'Machine readable' output format suitable for graphing or
    /// post-processing. Timestamps are printed as seconds since the
    /// epoch; RTT and minRTT as seconds with 1us resolution.
    #[arg(short = 'm', long = "machine")]
    pub machine: bool,

    /// Summary report print interval in seconds.
    #[arg(long = "sumInt", value_name = "num", default_value_t = 10.0)]
    pub sum_int: f64,

    /// Max age of an unmatched tsval in seconds.
    #[arg(long = "tsvalMaxAge", value_name = "num", default_value_t = 10.0)]
    pub tsval_max_age: f64,

    /// Flows idle longer than <num> seconds are deleted.
    #[arg(long = "flowMaxIdle", value_name = "num", default_value_t = 300.0)]
    pub flow_max_idle: f64,

    /// HTTP listening address for Prometheus to scrape.
    #[arg(short = 'a', long = "listen", value_name = "addr", default_value = ":9876")]
    pub listen: String,

    /// Local subnet range to ignore, in CIDR format (e.g.
    /// 172.16.0.0/24). Can be specified multiple times. Not considered
    /// when -l is enabled.
    #[arg(
        short = 'L',
        long = "localSubnet",
        value_name = "cidr",
        action = ArgAction::Append
    )]
    pub local_subnet: Vec<String>,
}
