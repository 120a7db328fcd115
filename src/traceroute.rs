use std::net::IpAddr;
use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::icmp::{IcmpSocket, IcmpTransport};
use crate::ping::{self, PingOptions, ProbeOutcome};
use crate::stats::{Hop, Tally};

#[derive(Debug, Clone)]
pub struct TracerouteOptions {
    /// Per-hop probing: `count` probes per TTL, `interval` after each
    /// Time Exceeded, `timeout` per probe. The probe TTL is ignored.
    pub probe: PingOptions,
    pub first_hop: u8,
    pub max_hops: u8,
    /// Move to the next TTL as soon as one probe gets an answer.
    pub fast: bool,
}

impl Default for TracerouteOptions {
    fn default() -> Self {
        Self {
            probe: PingOptions {
                count: 2,
                interval: Duration::from_millis(50),
                timeout: Duration::from_secs(2),
                ..PingOptions::default()
            },
            first_hop: 1,
            max_hops: 30,
            fast: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraceState {
    Probing(u8),
    Reached,
    Exhausted,
}

impl TraceState {
    fn start(options: &TracerouteOptions) -> Self {
        if options.first_hop == 0 || options.first_hop > options.max_hops {
            TraceState::Exhausted
        } else {
            TraceState::Probing(options.first_hop)
        }
    }

    fn advance(self, reached: bool, max_hops: u8) -> Self {
        match self {
            TraceState::Probing(_) if reached => TraceState::Reached,
            TraceState::Probing(ttl) if ttl < max_hops => TraceState::Probing(ttl + 1),
            TraceState::Probing(_) => TraceState::Exhausted,
            done => done,
        }
    }
}

/// Traces the route to `address` on a fresh socket.
pub fn traceroute(address: IpAddr, id: u16, options: &TracerouteOptions) -> Result<Vec<Hop>> {
    let socket = IcmpSocket::for_destination(&address, options.probe.source, options.probe.privileged)?;
    Ok(traceroute_with(&socket, address, id, options))
}

pub fn traceroute_with<T: IcmpTransport + ?Sized>(
    transport: &T,
    address: IpAddr,
    id: u16,
    options: &TracerouteOptions,
) -> Vec<Hop> {
    let mut hops = Vec::new();
    traceroute_each(transport, address, id, options, |hop| hops.push(hop.clone()));
    hops
}

/// Hands each responding hop to `on_hop` as soon as its probes are done.
///
/// Silent TTLs produce no hop, so gaps show up as jumps in `distance`.
pub fn traceroute_each<T, F>(transport: &T, address: IpAddr, id: u16, options: &TracerouteOptions, mut on_hop: F)
where
    T: IcmpTransport + ?Sized,
    F: FnMut(&Hop),
{
    let probe = &options.probe;
    let mut sequence: u32 = 0;
    let mut state = TraceState::start(options);

    while let TraceState::Probing(ttl) = state {
        let mut tally = Tally::default();
        let mut reached = false;

        for _ in 0..probe.count {
            let mut request = probe.request(address, id, sequence).with_ttl(ttl);
            sequence = sequence.wrapping_add(1);

            let outcome = ping::probe(transport, &mut request, probe.timeout);
            if outcome.was_sent() {
                tally.packets_sent += 1;
            }

            match outcome {
                ProbeOutcome::Condition { reply, condition, rtt } if condition.is_time_exceeded() => {
                    tally.add_sample(reply.source, rtt);
                    thread::sleep(probe.interval);
                }
                ProbeOutcome::Echo { reply, rtt } => {
                    tally.add_sample(reply.source, rtt);
                    reached = true;
                }
                _ => continue,
            }

            if options.fast {
                break;
            }
        }

        if let Some(source) = tally.last_source {
            let hop = Hop {
                host: tally.into_host(source),
                distance: ttl,
            };
            log::debug!("Hop {}: {} ({} samples)", ttl, source, hop.rtts.len());
            on_hop(&hop);
        } else {
            log::debug!("Hop {}: no answer", ttl);
        }

        state = state.advance(reached, options.max_hops);
    }

    if state == TraceState::Exhausted {
        log::debug!("{} not reached within {} hops", address, options.max_hops);
    }
}
