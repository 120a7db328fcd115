mod cli;

use std::net::{IpAddr, Ipv4Addr};

use cli::{Action, MultipingArgs, PingArgs, TracerouteArgs};
use ruicmp::icmp::IcmpSocket;
use ruicmp::stats::Host;
use ruicmp::{IcmpError, IdentifierSource, ProbeOutcome, dns, multiping, ping, traceroute, utils};

#[tokio::main]
async fn main() {
    // Enable debug logging if RUST_LOG is set
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    }

    let action = match cli::parse_args() {
        Ok(action) => action,
        Err(e) => utils::exit_with_error(&format!("invalid arguments: {}", e), 2),
    };

    let result = match action {
        Action::Ping(args) => run_ping(args).await,
        Action::Multiping(args) => run_multiping(args).await,
        Action::Traceroute(args) => run_traceroute(args).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            if let Some(IcmpError::Permission) = e.downcast_ref::<IcmpError>() {
                utils::exit_with_error(
                    &format!("{} (run as root, or pass --unprivileged where supported)", e),
                    2,
                );
            }
            utils::exit_with_error(&e.to_string(), 2);
        }
    }
}

fn format_outcome(sequence: u16, outcome: &ProbeOutcome) -> String {
    match outcome {
        ProbeOutcome::Echo { reply, rtt } => match reply.ttl {
            Some(ttl) => format!(
                "{} bytes from {}: icmp_seq={} ttl={} time={:.3} ms",
                reply.bytes_received, reply.source, sequence, ttl, rtt
            ),
            None => format!(
                "{} bytes from {}: icmp_seq={} time={:.3} ms",
                reply.bytes_received, reply.source, sequence, rtt
            ),
        },
        ProbeOutcome::Condition { reply, condition, .. } => {
            format!("From {} icmp_seq={} {}", reply.source, sequence, condition)
        }
        ProbeOutcome::Timeout => format!("Request timeout for icmp_seq {}", sequence),
        ProbeOutcome::SendFailed(e) | ProbeOutcome::ReceiveFailed(e) => {
            format!("icmp_seq={}: {}", sequence, e)
        }
    }
}

async fn run_ping(args: PingArgs) -> anyhow::Result<i32> {
    let options = args.options();
    let id = IdentifierSource::from_process().next();

    if args.broadcast {
        let address: Ipv4Addr = args
            .target
            .parse()
            .map_err(|_| anyhow::anyhow!("Broadcast ping needs an IPv4 address, got '{}'", args.target))?;
        println!("PING {} (broadcast) {} bytes of data.", address, options.payload_size);

        let replies = tokio::task::spawn_blocking(move || ping::broadcast_ping(address, id, &options)).await??;
        for reply in &replies {
            println!(
                "{} bytes from {}: icmp_seq={} time={:.3} ms",
                reply.bytes_received, reply.source, reply.sequence, reply.rtt
            );
        }
        return Ok(if replies.is_empty() { 1 } else { 0 });
    }

    let address = dns::resolve_hostname(&args.target, args.probe.family()).await?;
    println!("PING {} ({}) {} bytes of data.", args.target, address, options.payload_size);

    let host = if args.verbose {
        tokio::task::spawn_blocking(move || -> ruicmp::Result<Host> {
            let socket = IcmpSocket::for_destination(&address, options.source, options.privileged)?;
            Ok(ping::ping_each(&socket, address, id, &options, |sequence, outcome| {
                println!("{}", format_outcome(sequence, outcome));
            }))
        })
        .await??
    } else {
        ping::async_ping(address, id, &options).await?
    };

    print!("{}", host.format_summary());
    Ok(if host.is_alive() { 0 } else { 1 })
}

async fn run_multiping(args: MultipingArgs) -> anyhow::Result<i32> {
    let options = args.options();
    let family = args.probe.family();

    let mut addresses = Vec::with_capacity(args.targets.len());
    for target in &args.targets {
        addresses.push(dns::resolve_hostname(target, family).await?);
    }

    let base_id = IdentifierSource::random().reserve(addresses.len());
    let hosts = multiping::run(addresses, base_id, options).await?;

    for host in &hosts {
        println!("{}", host.format_line());
    }
    Ok(if hosts.iter().any(Host::is_alive) { 0 } else { 1 })
}

async fn run_traceroute(args: TracerouteArgs) -> anyhow::Result<i32> {
    let options = args.options();
    let address = dns::resolve_hostname(&args.target, args.probe.family()).await?;
    let id = IdentifierSource::from_process().next();
    println!(
        "traceroute to {} ({}), {} hops max",
        args.target, address, options.max_hops
    );

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let trace = tokio::task::spawn_blocking(move || -> ruicmp::Result<()> {
        let socket = IcmpSocket::for_destination(&address, options.probe.source, options.probe.privileged)?;
        traceroute::traceroute_each(&socket, address, id, &options, |hop| {
            let _ = tx.send(hop.clone());
        });
        Ok(())
    });

    let mut last: Option<IpAddr> = None;
    while let Some(hop) = rx.recv().await {
        let name = if args.resolve_addresses {
            dns::reverse_lookup(hop.address).await
        } else {
            None
        };
        println!("{}", hop.format_line(name.as_deref()));
        last = Some(hop.address);
    }
    trace.await??;

    Ok(if last == Some(address) { 0 } else { 1 })
}
