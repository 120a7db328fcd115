use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::error::{IcmpError, Result};
use crate::icmp::{AsyncIcmpSocket, BufferedSocket, Family, IcmpSocket, IcmpTransport};
use crate::ping::{self, PingOptions, ProbeOutcome};
use crate::stats::{Host, Tally};

/// How concurrent pings are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// A bounded pool of OS threads, one socket per worker.
    Threads,
    /// A bounded set of tokio tasks, one socket per task.
    #[default]
    Tasks,
    /// One shared socket per family, requests to every address in flight at once.
    Pipelined,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "threads" => Ok(Strategy::Threads),
            "tasks" => Ok(Strategy::Tasks),
            "pipelined" => Ok(Strategy::Pipelined),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultipingOptions {
    pub ping: PingOptions,
    /// Upper bound on workers or tasks holding a socket at the same time.
    pub concurrency: usize,
    pub strategy: Strategy,
}

impl Default for MultipingOptions {
    fn default() -> Self {
        Self {
            ping: PingOptions {
                count: 2,
                interval: Duration::from_millis(500),
                ..PingOptions::default()
            },
            concurrency: 50,
            strategy: Strategy::default(),
        }
    }
}

impl MultipingOptions {
    fn open(&self, address: &IpAddr) -> Result<IcmpSocket> {
        IcmpSocket::for_destination(address, self.ping.source, self.ping.privileged)
    }
}

fn identifier(base_id: u16, index: usize) -> u16 {
    base_id.wrapping_add((index & 0xffff) as u16)
}

/// Runs the configured strategy. Blocking strategies go to tokio's blocking
/// pool.
pub async fn run(addresses: Vec<IpAddr>, base_id: u16, options: MultipingOptions) -> Result<Vec<Host>> {
    match options.strategy {
        Strategy::Tasks => async_multiping(&addresses, base_id, &options).await,
        Strategy::Threads => {
            tokio::task::spawn_blocking(move || multiping(&addresses, base_id, &options))
                .await
                .map_err(|e| IcmpError::Socket(io::Error::other(e)))?
        }
        Strategy::Pipelined => {
            tokio::task::spawn_blocking(move || pipelined_multiping(&addresses, base_id, &options))
                .await
                .map_err(|e| IcmpError::Socket(io::Error::other(e)))?
        }
    }
}

/// Pings every address on a bounded thread pool.
///
/// Results come back in input order. Address `i` uses identifier
/// `base_id + i`.
pub fn multiping(addresses: &[IpAddr], base_id: u16, options: &MultipingOptions) -> Result<Vec<Host>> {
    multiping_with(addresses, base_id, options, |address| options.open(address))
}

/// Thread-pool multiping over transports produced by `open`.
pub fn multiping_with<T, F>(
    addresses: &[IpAddr],
    base_id: u16,
    options: &MultipingOptions,
    open: F,
) -> Result<Vec<Host>>
where
    T: IcmpTransport,
    F: Fn(&IpAddr) -> Result<T> + Sync,
{
    if addresses.is_empty() {
        return Ok(Vec::new());
    }

    let workers = options.concurrency.clamp(1, addresses.len());
    let next = AtomicUsize::new(0);
    let failed = AtomicBool::new(false);
    let (tx, rx) = mpsc::channel();

    log::debug!("Pinging {} addresses on {} threads", addresses.len(), workers);

    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let (next, failed, open) = (&next, &failed, &open);
            scope.spawn(move || {
                while !failed.load(Ordering::Relaxed) {
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    let Some(address) = addresses.get(index) else {
                        break;
                    };
                    let result = open(address).map(|transport| {
                        ping::ping_with(&transport, *address, identifier(base_id, index), &options.ping)
                    });
                    if result.is_err() {
                        failed.store(true, Ordering::Relaxed);
                    }
                    if tx.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(tx);

    let mut slots: Vec<Option<Result<Host>>> = addresses.iter().map(|_| None).collect();
    for (index, result) in rx {
        slots[index] = Some(result);
    }

    // A failure stops the pool early, leaving later slots empty
    let mut hosts = Vec::with_capacity(slots.len());
    for slot in slots {
        match slot {
            Some(result) => hosts.push(result?),
            None => return Err(IcmpError::Unavailable),
        }
    }
    Ok(hosts)
}

/// Pings every address with at most `concurrency` tasks in flight.
pub async fn async_multiping(
    addresses: &[IpAddr],
    base_id: u16,
    options: &MultipingOptions,
) -> Result<Vec<Host>> {
    async_multiping_with(addresses, base_id, options, |address| options.open(address)).await
}

pub async fn async_multiping_with<T, F>(
    addresses: &[IpAddr],
    base_id: u16,
    options: &MultipingOptions,
    open: F,
) -> Result<Vec<Host>>
where
    T: IcmpTransport + 'static,
    F: Fn(&IpAddr) -> Result<T>,
{
    let limit = options.concurrency.max(1);
    let mut tasks = JoinSet::new();
    let mut slots: Vec<Option<Host>> = addresses.iter().map(|_| None).collect();

    for (index, address) in addresses.iter().copied().enumerate() {
        while tasks.len() >= limit {
            harvest(&mut tasks, &mut slots).await?;
        }

        let socket = AsyncIcmpSocket::new(open(&address)?);
        let ping = options.ping.clone();
        let id = identifier(base_id, index);
        tasks.spawn(async move { (index, ping::async_ping_with(&socket, address, id, &ping).await) });
    }

    while !tasks.is_empty() {
        harvest(&mut tasks, &mut slots).await?;
    }

    Ok(slots.into_iter().flatten().collect())
}

async fn harvest(tasks: &mut JoinSet<(usize, Host)>, slots: &mut [Option<Host>]) -> Result<()> {
    match tasks.join_next().await {
        Some(Ok((index, host))) => {
            slots[index] = Some(host);
            Ok(())
        }
        Some(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Some(Err(e)) => Err(IcmpError::Socket(io::Error::other(e))),
        None => Ok(()),
    }
}

/// Pings every address over one demultiplexed socket per family.
///
/// Each round sends one request to every address before collecting any
/// reply, so a round takes about one timeout no matter how many addresses
/// there are.
pub fn pipelined_multiping(
    addresses: &[IpAddr],
    base_id: u16,
    options: &MultipingOptions,
) -> Result<Vec<Host>> {
    let mut sockets = HashMap::new();
    for address in addresses {
        let family = Family::of(address);
        if sockets.contains_key(&family) {
            continue;
        }
        let source = options.ping.source.filter(|source| Family::of(source) == family);
        let socket = IcmpSocket::new(family, source, options.ping.privileged)?;
        sockets.insert(family, BufferedSocket::new(socket)?);
    }

    Ok(pipelined_multiping_with(&sockets, addresses, base_id, options))
}

pub fn pipelined_multiping_with<T: IcmpTransport>(
    sockets: &HashMap<Family, T>,
    addresses: &[IpAddr],
    base_id: u16,
    options: &MultipingOptions,
) -> Vec<Host> {
    let ping = &options.ping;
    let mut tallies: Vec<Tally> = addresses.iter().map(|_| Tally::default()).collect();
    let width = addresses.len() as u32;

    for round in 0..ping.count {
        // Datagram sockets share one kernel identifier, so sequences stay
        // unique across the whole run.
        let mut in_flight = Vec::with_capacity(addresses.len());
        for (index, address) in addresses.iter().enumerate() {
            let sequence = round.wrapping_mul(width).wrapping_add(index as u32);
            let mut request = ping.request(*address, identifier(base_id, index), sequence);
            let sent = match sockets.get(&request.family()) {
                Some(socket) => socket.send(&mut request),
                None => Err(IcmpError::Unavailable),
            };
            in_flight.push((request, sent));
        }

        for (index, (request, sent)) in in_flight.into_iter().enumerate() {
            let outcome = match (sent, sockets.get(&request.family())) {
                (Ok(()), Some(socket)) => {
                    ProbeOutcome::classify(socket.receive(Some(&request), ping.timeout), &request)
                }
                (Err(e), _) => ProbeOutcome::SendFailed(e),
                (Ok(()), None) => ProbeOutcome::SendFailed(IcmpError::Unavailable),
            };
            tallies[index].record(&outcome);
        }

        if round + 1 < ping.count {
            thread::sleep(ping.interval);
        }
    }

    tallies
        .into_iter()
        .zip(addresses)
        .map(|(tally, address)| tally.into_host(*address))
        .collect()
}
