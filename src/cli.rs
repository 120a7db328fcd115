use clap::{Arg, ArgAction, ArgMatches, Command};
use std::net::IpAddr;
use std::time::Duration;

use ruicmp::icmp::Family;
use ruicmp::multiping::{MultipingOptions, Strategy};
use ruicmp::ping::PingOptions;
use ruicmp::traceroute::TracerouteOptions;
use ruicmp::utils;

/// Overrides shared by every subcommand. `None` keeps the engine default.
#[derive(Debug, Clone, Default)]
pub struct ProbeArgs {
    pub count: Option<u32>,
    pub interval: Option<u64>,
    pub timeout: Option<u64>,
    pub ttl: Option<u32>,
    pub size: Option<u32>,
    pub tos: Option<u8>,
    pub source_address: Option<IpAddr>,
    pub force_ipv4: bool,
    pub force_ipv6: bool,
    pub unprivileged: bool,
}

impl ProbeArgs {
    pub fn family(&self) -> Option<Family> {
        match (self.force_ipv4, self.force_ipv6) {
            (true, _) => Some(Family::V4),
            (_, true) => Some(Family::V6),
            _ => None,
        }
    }

    fn apply(&self, options: &mut PingOptions) {
        if let Some(count) = self.count {
            options.count = count;
        }
        if let Some(interval) = self.interval {
            options.interval = Duration::from_millis(interval);
        }
        if let Some(timeout) = self.timeout {
            options.timeout = Duration::from_millis(timeout);
        }
        if let Some(ttl) = self.ttl {
            options.ttl = ttl as u8;
        }
        if let Some(size) = self.size {
            options.payload_size = size as usize;
        }
        if let Some(tos) = self.tos {
            options.traffic_class = tos;
        }
        options.source = self.source_address;
        options.privileged = !self.unprivileged;
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.force_ipv4 && self.force_ipv6 {
            return Err(anyhow::anyhow!("Cannot force both IPv4 and IPv6"));
        }
        utils::validate_params(self.count, self.size, self.timeout, self.ttl)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PingArgs {
    pub target: String,
    pub probe: ProbeArgs,
    pub broadcast: bool,
    pub verbose: bool,
}

impl PingArgs {
    pub fn options(&self) -> PingOptions {
        let mut options = PingOptions::default();
        self.probe.apply(&mut options);
        options
    }
}

#[derive(Debug, Clone, Default)]
pub struct MultipingArgs {
    pub targets: Vec<String>,
    pub probe: ProbeArgs,
    pub concurrency: Option<usize>,
    pub strategy: Option<Strategy>,
}

impl MultipingArgs {
    pub fn options(&self) -> MultipingOptions {
        let mut options = MultipingOptions::default();
        self.probe.apply(&mut options.ping);
        if let Some(concurrency) = self.concurrency {
            options.concurrency = concurrency;
        }
        if let Some(strategy) = self.strategy {
            options.strategy = strategy;
        }
        options
    }
}

#[derive(Debug, Clone, Default)]
pub struct TracerouteArgs {
    pub target: String,
    pub probe: ProbeArgs,
    pub first_hop: Option<u8>,
    pub max_hops: Option<u8>,
    pub fast: bool,
    pub resolve_addresses: bool,
}

impl TracerouteArgs {
    pub fn options(&self) -> TracerouteOptions {
        let mut options = TracerouteOptions::default();
        self.probe.apply(&mut options.probe);
        if let Some(first_hop) = self.first_hop {
            options.first_hop = first_hop;
        }
        if let Some(max_hops) = self.max_hops {
            options.max_hops = max_hops;
        }
        options.fast = self.fast;
        options
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    Ping(PingArgs),
    Multiping(MultipingArgs),
    Traceroute(TracerouteArgs),
}

fn probe_args(command: Command, with_ttl: bool) -> Command {
    let command = command
        .arg(
            Arg::new("count")
                .short('c')
                .long("count")
                .help("Number of echo requests to send (per hop for traceroute)")
                .value_name("count")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .long("interval")
                .help("Milliseconds to wait between requests")
                .value_name("ms")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("timeout")
                .short('w')
                .long("timeout")
                .help("Timeout in milliseconds to wait for each reply")
                .value_name("timeout")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .help("Payload size in bytes")
                .value_name("size")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("tos")
                .short('Q')
                .long("tos")
                .help("Type of service (IPv4) or traffic class (IPv6)")
                .value_name("TOS")
                .value_parser(clap::value_parser!(u8)),
        )
        .arg(
            Arg::new("source_address")
                .short('S')
                .long("source")
                .help("Source address to use")
                .value_name("srcaddr")
                .value_parser(clap::value_parser!(IpAddr)),
        )
        .arg(
            Arg::new("force_ipv4")
                .short('4')
                .help("Force using IPv4")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("force_ipv6")
                .short('6')
                .help("Force using IPv6")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("unprivileged")
                .long("unprivileged")
                .help("Use an ICMP datagram socket instead of a raw socket")
                .action(ArgAction::SetTrue),
        );

    if with_ttl {
        command.arg(
            Arg::new("ttl")
                .short('t')
                .long("ttl")
                .help("Time To Live")
                .value_name("TTL")
                .value_parser(clap::value_parser!(u32)),
        )
    } else {
        command
    }
}

pub fn build_cli() -> Command {
    Command::new("ruicmp")
        .version(env!("CARGO_PKG_VERSION"))
        .about("ICMP ping, multiping and traceroute")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            probe_args(Command::new("ping").about("Send echo requests to one host"), true)
                .arg(
                    Arg::new("target")
                        .help("Target hostname or IP address")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::new("broadcast")
                        .short('b')
                        .long("broadcast")
                        .help("Allow pinging an IPv4 broadcast address")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("verbose")
                        .short('v')
                        .long("verbose")
                        .help("Print a line for every request")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            probe_args(Command::new("multiping").about("Ping many hosts concurrently"), true)
                .arg(
                    Arg::new("targets")
                        .help("Target hostnames or IP addresses")
                        .required(true)
                        .num_args(1..)
                        .index(1),
                )
                .arg(
                    Arg::new("concurrency")
                        .long("concurrency")
                        .help("Maximum hosts probed at the same time")
                        .value_name("n")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("strategy")
                        .long("strategy")
                        .help("How concurrent pings are scheduled")
                        .value_parser(["threads", "tasks", "pipelined"]),
                ),
        )
        .subcommand(
            probe_args(Command::new("traceroute").about("Trace the route to a host"), false)
                .arg(
                    Arg::new("target")
                        .help("Target hostname or IP address")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::new("first_hop")
                        .short('f')
                        .long("first-hop")
                        .help("TTL to start from")
                        .value_name("ttl")
                        .value_parser(clap::value_parser!(u8).range(1..)),
                )
                .arg(
                    Arg::new("max_hops")
                        .short('m')
                        .long("max-hops")
                        .help("Maximum number of hops to search for target")
                        .value_name("hops")
                        .value_parser(clap::value_parser!(u8).range(1..)),
                )
                .arg(
                    Arg::new("fast")
                        .long("fast")
                        .help("Move to the next hop after the first answer")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("resolve")
                        .short('a')
                        .help("Resolve hop addresses to hostnames")
                        .action(ArgAction::SetTrue),
                ),
        )
}

fn parse_probe(matches: &ArgMatches, with_ttl: bool) -> anyhow::Result<ProbeArgs> {
    let args = ProbeArgs {
        count: matches.get_one::<u32>("count").copied(),
        interval: matches.get_one::<u64>("interval").copied(),
        timeout: matches.get_one::<u64>("timeout").copied(),
        ttl: if with_ttl {
            matches.get_one::<u32>("ttl").copied()
        } else {
            None
        },
        size: matches.get_one::<u32>("size").copied(),
        tos: matches.get_one::<u8>("tos").copied(),
        source_address: matches.get_one::<IpAddr>("source_address").copied(),
        force_ipv4: matches.get_flag("force_ipv4"),
        force_ipv6: matches.get_flag("force_ipv6"),
        unprivileged: matches.get_flag("unprivileged"),
    };
    args.validate()?;
    Ok(args)
}

fn required(matches: &ArgMatches, id: &str) -> anyhow::Result<String> {
    matches
        .get_one::<String>(id)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("missing <{}>", id))
}

pub fn parse_args() -> anyhow::Result<Action> {
    parse_matches(&build_cli().get_matches())
}

pub fn parse_matches(matches: &ArgMatches) -> anyhow::Result<Action> {
    match matches.subcommand() {
        Some(("ping", matches)) => Ok(Action::Ping(PingArgs {
            target: required(matches, "target")?,
            probe: parse_probe(matches, true)?,
            broadcast: matches.get_flag("broadcast"),
            verbose: matches.get_flag("verbose"),
        })),
        Some(("multiping", matches)) => {
            let strategy = match matches.get_one::<String>("strategy") {
                Some(name) => Some(name.parse::<Strategy>().map_err(|e| anyhow::anyhow!(e))?),
                None => None,
            };
            Ok(Action::Multiping(MultipingArgs {
                targets: matches
                    .get_many::<String>("targets")
                    .map(|targets| targets.cloned().collect())
                    .unwrap_or_default(),
                probe: parse_probe(matches, true)?,
                concurrency: matches.get_one::<usize>("concurrency").copied(),
                strategy,
            }))
        }
        Some(("traceroute", matches)) => {
            let args = TracerouteArgs {
                target: required(matches, "target")?,
                probe: parse_probe(matches, false)?,
                first_hop: matches.get_one::<u8>("first_hop").copied(),
                max_hops: matches.get_one::<u8>("max_hops").copied(),
                fast: matches.get_flag("fast"),
                resolve_addresses: matches.get_flag("resolve"),
            };
            if let (Some(first), Some(max)) = (args.first_hop, args.max_hops) {
                if first > max {
                    return Err(anyhow::anyhow!("First hop {} is beyond max hops {}", first, max));
                }
            }
            Ok(Action::Traceroute(args))
        }
        _ => Err(anyhow::anyhow!("No subcommand given")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Action> {
        let matches = build_cli().try_get_matches_from(args)?;
        parse_matches(&matches)
    }

    #[test]
    fn test_ping_arguments() {
        let Action::Ping(args) =
            parse(&["ruicmp", "ping", "-c", "3", "-w", "500", "-t", "12", "-v", "-6", "::1"]).unwrap()
        else {
            panic!("expected ping");
        };
        assert_eq!(args.target, "::1");
        assert!(args.verbose);
        assert_eq!(args.probe.family(), Some(Family::V6));

        let options = args.options();
        assert_eq!(options.count, 3);
        assert_eq!(options.timeout, Duration::from_millis(500));
        assert_eq!(options.ttl, 12);
        assert!(options.privileged);
        assert_eq!(options.interval, Duration::from_secs(1));
    }

    #[test]
    fn test_multiping_arguments() {
        let Action::Multiping(args) = parse(&[
            "ruicmp",
            "multiping",
            "--strategy",
            "threads",
            "--concurrency",
            "8",
            "--unprivileged",
            "10.0.0.1",
            "10.0.0.2",
        ])
        .unwrap() else {
            panic!("expected multiping");
        };
        assert_eq!(args.targets, vec!["10.0.0.1", "10.0.0.2"]);

        let options = args.options();
        assert_eq!(options.strategy, Strategy::Threads);
        assert_eq!(options.concurrency, 8);
        assert_eq!(options.ping.count, 2);
        assert!(!options.ping.privileged);
    }

    #[test]
    fn test_traceroute_arguments() {
        let Action::Traceroute(args) =
            parse(&["ruicmp", "traceroute", "-f", "3", "-m", "10", "--fast", "example.com"]).unwrap()
        else {
            panic!("expected traceroute");
        };
        let options = args.options();
        assert_eq!(options.first_hop, 3);
        assert_eq!(options.max_hops, 10);
        assert!(options.fast);
        assert_eq!(options.probe.count, 2);
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(parse(&["ruicmp", "ping", "-c", "0", "host"]).is_err());
        assert!(parse(&["ruicmp", "ping", "-t", "300", "host"]).is_err());
        assert!(parse(&["ruicmp", "ping", "-4", "-6", "host"]).is_err());
        assert!(parse(&["ruicmp", "traceroute", "-f", "9", "-m", "4", "host"]).is_err());
        assert!(parse(&["ruicmp", "multiping", "--strategy", "fastest", "host"]).is_err());
    }
}
