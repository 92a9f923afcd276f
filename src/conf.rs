use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use ipnetwork::{IpNetwork, Ipv4Network};
use thiserror::Error;
use tracing::warn;

use crate::{capture, cli::Cli, engine::EngineOptions};

/// Hard cap on tracked flows; excess packets create no state.
pub const DEFAULT_MAX_FLOWS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Live(String),
    File(PathBuf),
}

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("{0:?} is not valid CIDR notation: {1}")]
    InvalidCidr(String, ipnetwork::IpNetworkError),

    #[error("invalid listen address {0:?}")]
    InvalidListenAddr(String),

    #[error("{0} must be greater than zero")]
    NonPositive(&'static str),
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Conf {
    pub source: Source,
    pub bpf_filter: String,
    pub machine_readable: bool,
    pub listen: SocketAddr,
    pub flush_interval: Duration,
    pub engine: EngineOptions,
}

impl Conf {
    /// Resolve and validate the raw CLI. Fails fast, before any capture
    /// state exists, on malformed CIDR ranges or listen addresses.
    pub fn resolve(cli: Cli) -> Result<Self, ConfError> {
        if cli.tsval_max_age <= 0.0 {
            return Err(ConfError::NonPositive("tsvalMaxAge"));
        }
        if cli.flow_max_idle <= 0.0 {
            return Err(ConfError::NonPositive("flowMaxIdle"));
        }

        let mut local_ranges = Vec::with_capacity(cli.local_subnet.len());
        for range in &cli.local_subnet {
            let net = range
                .parse::<IpNetwork>()
                .map_err(|e| ConfError::InvalidCidr(range.clone(), e))?;
            local_ranges.push(net);
        }

        let listen = parse_listen_addr(&cli.listen)?;

        let source = match (&cli.interface, &cli.read) {
            (Some(ifname), _) => Source::Live(ifname.clone()),
            (None, Some(path)) => Source::File(path.clone()),
            (None, None) => unreachable!("clap requires one of -i/-r"),
        };

        let mut filter_local = !cli.show_local;
        if filter_local {
            if let Source::Live(ifname) = &source {
                match local_ipv4_of(ifname) {
                    Some(ip) => {
                        let net = Ipv4Network::new(ip, 32)
                            .map_err(|e| ConfError::InvalidCidr(format!("{ip}/32"), e))?;
                        local_ranges.push(IpNetwork::V4(net));
                    }
                    None if local_ranges.is_empty() => {
                        warn!("unable to determine local addresses, disabling local filtering");
                        filter_local = false;
                    }
                    None => {}
                }
            }
        }

        // Sub-second flushing matters when piping machine-readable
        // samples from a live capture into an analysis program.
        let live = matches!(source, Source::Live(_));
        let flush_interval = if live && cli.machine {
            Duration::from_millis(1)
        } else {
            Duration::from_secs(1)
        };

        let sum_interval = if cli.quiet { 0.0 } else { cli.sum_int };

        Ok(Self {
            bpf_filter: capture::build_filter(cli.filter.as_deref()),
            source,
            machine_readable: cli.machine,
            listen,
            flush_interval,
            engine: EngineOptions {
                tsval_max_age: cli.tsval_max_age,
                flow_max_idle: cli.flow_max_idle,
                sum_interval,
                max_flows: DEFAULT_MAX_FLOWS,
                max_packets: cli.count,
                time_to_run: cli.seconds,
                filter_local,
                local_ranges,
                verbose: cli.verbose,
            },
        })
    }
}

/// Accept `HOST:PORT`, or the `:PORT` shorthand which binds all
/// interfaces.
fn parse_listen_addr(raw: &str) -> Result<SocketAddr, ConfError> {
    let candidate = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    };
    candidate
        .parse()
        .map_err(|_| ConfError::InvalidListenAddr(raw.to_string()))
}

/// First IPv4 address of the named interface, if any.
fn local_ipv4_of(ifname: &str) -> Option<Ipv4Addr> {
    pnet::datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == ifname)?
        .ips
        .iter()
        .find_map(|ip| match ip.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
}
