use std::net::{IpAddr, Ipv4Addr};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{IcmpError, Result};
use crate::icmp::{
    AsyncIcmpSocket, Family, IcmpCondition, IcmpReply, IcmpRequest, IcmpSocket, IcmpTransport,
};
use crate::stats::{Host, Tally};

#[derive(Debug, Clone)]
pub struct PingOptions {
    pub count: u32,
    pub interval: Duration,
    pub timeout: Duration,
    pub ttl: u8,
    pub traffic_class: u8,
    /// Explicit payload. Overrides `payload_size` when set.
    pub payload: Option<Vec<u8>>,
    pub payload_size: usize,
    pub source: Option<IpAddr>,
    pub privileged: bool,
}

impl Default for PingOptions {
    fn default() -> Self {
        Self {
            count: 4,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(2),
            ttl: IcmpRequest::DEFAULT_TTL,
            traffic_class: 0,
            payload: None,
            payload_size: IcmpRequest::DEFAULT_PAYLOAD_SIZE,
            source: None,
            privileged: true,
        }
    }
}

impl PingOptions {
    pub fn request(&self, address: IpAddr, id: u16, sequence: u32) -> IcmpRequest {
        let request = IcmpRequest::new(address, u32::from(id), sequence)
            .with_ttl(self.ttl)
            .with_traffic_class(self.traffic_class);
        match &self.payload {
            Some(payload) => request.with_payload(payload.clone()),
            None => request.with_payload_size(self.payload_size),
        }
    }

    fn open(&self, address: &IpAddr) -> Result<IcmpSocket> {
        IcmpSocket::for_destination(address, self.source, self.privileged)
    }
}

/// What happened to a single probe.
#[derive(Debug)]
pub enum ProbeOutcome {
    Echo { reply: IcmpReply, rtt: f64 },
    /// A router or the host answered with an ICMP error instead.
    Condition { reply: IcmpReply, condition: IcmpCondition, rtt: f64 },
    Timeout,
    SendFailed(IcmpError),
    ReceiveFailed(IcmpError),
}

impl ProbeOutcome {
    pub fn classify(received: Result<IcmpReply>, request: &IcmpRequest) -> Self {
        match received {
            Ok(reply) => {
                let rtt = reply.rtt_ms(request).unwrap_or(0.0);
                match reply.condition() {
                    None => ProbeOutcome::Echo { reply, rtt },
                    Some(condition) => ProbeOutcome::Condition { reply, condition, rtt },
                }
            }
            Err(e) if e.is_timeout() => ProbeOutcome::Timeout,
            Err(e) => ProbeOutcome::ReceiveFailed(e),
        }
    }

    pub fn was_sent(&self) -> bool {
        !matches!(self, ProbeOutcome::SendFailed(_))
    }

    pub fn reply(&self) -> Option<&IcmpReply> {
        match self {
            ProbeOutcome::Echo { reply, .. } | ProbeOutcome::Condition { reply, .. } => Some(reply),
            _ => None,
        }
    }

    pub fn rtt(&self) -> Option<f64> {
        match self {
            ProbeOutcome::Echo { rtt, .. } | ProbeOutcome::Condition { rtt, .. } => Some(*rtt),
            _ => None,
        }
    }

    fn log(&self, request: &IcmpRequest) {
        match self {
            ProbeOutcome::Echo { .. } => {}
            ProbeOutcome::Condition { condition, reply, .. } => log::debug!(
                "icmp_seq={} to {}: {} from {}",
                request.sequence(),
                request.destination(),
                condition,
                reply.source
            ),
            ProbeOutcome::Timeout => log::debug!(
                "icmp_seq={} to {}: timed out",
                request.sequence(),
                request.destination()
            ),
            ProbeOutcome::SendFailed(e) | ProbeOutcome::ReceiveFailed(e) => log::warn!(
                "icmp_seq={} to {}: {}",
                request.sequence(),
                request.destination(),
                e
            ),
        }
    }
}

/// Sends `request` and waits for its reply.
pub fn probe<T: IcmpTransport + ?Sized>(
    transport: &T,
    request: &mut IcmpRequest,
    timeout: Duration,
) -> ProbeOutcome {
    let outcome = match transport.send(request) {
        Ok(()) => ProbeOutcome::classify(transport.receive(Some(request), timeout), request),
        Err(e) => ProbeOutcome::SendFailed(e),
    };
    outcome.log(request);
    outcome
}

/// Pings `address` on a fresh socket that is closed before returning.
///
/// Only socket setup can fail. An address that never answers still yields a
/// `Host`, just one with no samples.
pub fn ping(address: IpAddr, id: u16, options: &PingOptions) -> Result<Host> {
    let socket = options.open(&address)?;
    Ok(ping_with(&socket, address, id, options))
}

pub fn ping_with<T: IcmpTransport + ?Sized>(
    transport: &T,
    address: IpAddr,
    id: u16,
    options: &PingOptions,
) -> Host {
    ping_each(transport, address, id, options, |_, _| {})
}

/// Like [`ping_with`], reporting every probe to `observer` as it completes.
pub fn ping_each<T, F>(
    transport: &T,
    address: IpAddr,
    id: u16,
    options: &PingOptions,
    mut observer: F,
) -> Host
where
    T: IcmpTransport + ?Sized,
    F: FnMut(u16, &ProbeOutcome),
{
    let mut tally = Tally::default();

    for sequence in 0..options.count {
        let mut request = options.request(address, id, sequence);
        let outcome = probe(transport, &mut request, options.timeout);

        tally.record(&outcome);
        observer(request.sequence(), &outcome);

        if sequence + 1 < options.count {
            thread::sleep(options.interval);
        }
    }

    tally.into_host(address)
}

pub async fn async_ping(address: IpAddr, id: u16, options: &PingOptions) -> Result<Host> {
    let socket = AsyncIcmpSocket::new(options.open(&address)?);
    Ok(async_ping_with(&socket, address, id, options).await)
}

pub async fn async_ping_with<T: IcmpTransport + 'static>(
    socket: &AsyncIcmpSocket<T>,
    address: IpAddr,
    id: u16,
    options: &PingOptions,
) -> Host {
    let mut tally = Tally::default();

    for sequence in 0..options.count {
        let mut request = options.request(address, id, sequence);
        let outcome = match socket.send(&mut request) {
            Ok(()) => {
                let received = socket.receive(&request, options.timeout).await;
                ProbeOutcome::classify(received, &request)
            }
            Err(e) => ProbeOutcome::SendFailed(e),
        };
        outcome.log(&request);
        tally.record(&outcome);

        if sequence + 1 < options.count {
            tokio::time::sleep(options.interval).await;
        }
    }

    tally.into_host(address)
}

/// One answer to a broadcast Echo Request.
#[derive(Debug, Clone)]
pub struct BroadcastReply {
    pub sequence: u16,
    pub source: IpAddr,
    pub bytes_received: usize,
    pub rtt: f64,
}

/// Pings a broadcast address and keeps every answer that arrives before
/// each probe's deadline.
pub fn broadcast_ping(
    address: Ipv4Addr,
    id: u16,
    options: &PingOptions,
) -> Result<Vec<BroadcastReply>> {
    let socket = IcmpSocket::new(Family::V4, options.source, options.privileged)?;
    socket.set_broadcast(true)?;
    broadcast_ping_with(&socket, IpAddr::V4(address), id, options)
}

pub fn broadcast_ping_with<T: IcmpTransport + ?Sized>(
    transport: &T,
    address: IpAddr,
    id: u16,
    options: &PingOptions,
) -> Result<Vec<BroadcastReply>> {
    let mut replies = Vec::new();

    for sequence in 0..options.count {
        let mut request = options.request(address, id, sequence);
        transport.send(&mut request)?;
        let deadline = request.sent_at().unwrap_or_else(Instant::now) + options.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match transport.receive(Some(&request), remaining) {
                Ok(reply) if reply.is_echo_reply() => replies.push(BroadcastReply {
                    sequence: request.sequence(),
                    source: reply.source,
                    bytes_received: reply.bytes_received,
                    rtt: reply.rtt_ms(&request).unwrap_or(0.0),
                }),
                Ok(reply) => log::debug!("Ignoring ICMP type {} from {}", reply.icmp_type, reply.source),
                Err(IcmpError::TimeoutExceeded(_)) => break,
                Err(e) => return Err(e),
            }
        }

        if sequence + 1 < options.count {
            thread::sleep(options.interval);
        }
    }

    Ok(replies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icmp::mock::{Response, ScriptedTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick(count: u32, timeout_ms: u64) -> PingOptions {
        PingOptions {
            count,
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(timeout_ms),
            ..PingOptions::default()
        }
    }

    fn constant_latency(ms: u64) -> ScriptedTransport {
        ScriptedTransport::new(Family::V4, move |request| Response::Echo {
            from: request.destination(),
            after: Duration::from_millis(ms),
        })
    }

    struct BrokenTransport;

    impl IcmpTransport for BrokenTransport {
        fn family(&self) -> Family {
            Family::V4
        }

        fn send(&self, _request: &mut IcmpRequest) -> Result<()> {
            Err(IcmpError::BroadcastDenied)
        }

        fn receive(&self, _request: Option<&IcmpRequest>, timeout: Duration) -> Result<IcmpReply> {
            Err(IcmpError::TimeoutExceeded(timeout))
        }
    }

    #[test]
    fn test_defaults() {
        let options = PingOptions::default();
        assert_eq!(options.count, 4);
        assert_eq!(options.ttl, 64);
        assert_eq!(options.payload_size, 56);
        assert!(options.privileged);

        let request = options.request("10.0.0.1".parse().unwrap(), 9, 70000);
        assert_eq!(request.sequence(), 4464);
        assert_eq!(request.payload_size(), 56);
    }

    #[test]
    fn test_constant_latency_host() {
        let address: IpAddr = "192.0.2.10".parse().unwrap();
        let transport = constant_latency(10);
        let host = ping_with(&transport, address, 42, &quick(5, 1000));

        assert_eq!(host.address, address);
        assert_eq!(host.packets_sent, 5);
        assert_eq!(host.rtts.len(), 5);
        assert!(host.rtts.iter().all(|rtt| (rtt - 10.0).abs() < 1.0));
        assert_eq!(host.packet_loss(), 0.0);
        assert!(host.jitter() < 1.0);
        assert!(host.is_alive());

        let sequences: Vec<u16> = transport.sent().iter().map(|r| r.sequence()).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
        assert!(transport.sent().iter().all(|r| r.id() == 42));
    }

    #[test]
    fn test_unreachable_host_is_data() {
        let transport = ScriptedTransport::new(Family::V4, |_| Response::Silent);
        let timeout = Duration::from_millis(200);
        let start = Instant::now();
        let host = ping_with(&transport, "192.0.2.99".parse().unwrap(), 1, &quick(3, 200));

        assert_eq!(host.packets_sent, 3);
        assert!(host.rtts.is_empty());
        assert_eq!(host.packet_loss(), 1.0);
        assert!(!host.is_alive());
        assert!(start.elapsed() < timeout * 3 + Duration::from_millis(300));
    }

    #[test]
    fn test_conditions_do_not_produce_samples() {
        let transport = ScriptedTransport::new(Family::V4, |request| {
            if request.sequence() % 2 == 0 {
                Response::Echo {
                    from: request.destination(),
                    after: Duration::from_millis(1),
                }
            } else {
                Response::Condition {
                    from: "10.9.9.9".parse().unwrap(),
                    icmp_type: 3,
                    code: 1,
                    after: Duration::from_millis(1),
                }
            }
        });

        let mut seen = Vec::new();
        let host = ping_each(&transport, "192.0.2.1".parse().unwrap(), 7, &quick(4, 500), |seq, outcome| {
            seen.push((seq, matches!(outcome, ProbeOutcome::Condition { .. })));
        });

        assert_eq!(host.packets_sent, 4);
        assert_eq!(host.packets_received(), 2);
        assert_eq!(seen, vec![(0, false), (1, true), (2, false), (3, true)]);
    }

    #[test]
    fn test_failed_sends_are_not_counted() {
        let host = ping_with(&BrokenTransport, "192.0.2.1".parse().unwrap(), 1, &quick(3, 10));
        assert_eq!(host.packets_sent, 0);
        assert!(host.rtts.is_empty());
    }

    #[test]
    fn test_probe_classification() {
        let transport = ScriptedTransport::new(Family::V6, |_| Response::Condition {
            from: "2001:db8::1".parse().unwrap(),
            icmp_type: 3,
            code: 0,
            after: Duration::from_millis(2),
        });
        let mut request = IcmpRequest::new("2001:db8::99".parse().unwrap(), 1, 1);
        match probe(&transport, &mut request, Duration::from_secs(1)) {
            ProbeOutcome::Condition { condition, rtt, .. } => {
                assert!(condition.is_time_exceeded());
                assert!(rtt >= 2.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_async_ping() {
        let socket = AsyncIcmpSocket::new(constant_latency(5));
        let host = async_ping_with(&socket, "192.0.2.3".parse().unwrap(), 3, &quick(3, 500)).await;
        assert_eq!(host.packets_sent, 3);
        assert_eq!(host.packets_received(), 3);
    }

    #[test]
    fn test_broadcast_collects_every_answer() {
        let calls = AtomicUsize::new(0);
        let transport = ScriptedTransport::new(Family::V4, move |_| {
            match calls.fetch_add(1, Ordering::SeqCst) % 3 {
                0 => Response::Echo {
                    from: "10.0.0.17".parse().unwrap(),
                    after: Duration::from_millis(1),
                },
                1 => Response::Echo {
                    from: "10.0.0.40".parse().unwrap(),
                    after: Duration::from_millis(2),
                },
                _ => Response::Silent,
            }
        });

        let replies =
            broadcast_ping_with(&transport, "10.0.0.255".parse().unwrap(), 1, &quick(2, 50)).unwrap();
        let sources: Vec<String> = replies.iter().map(|r| r.source.to_string()).collect();
        assert_eq!(sources, vec!["10.0.0.17", "10.0.0.40", "10.0.0.17", "10.0.0.40"]);
        assert_eq!(replies[2].sequence, 1);
    }

    #[test]
    fn test_broadcast_denied_is_raised() {
        let result = broadcast_ping_with(&BrokenTransport, "10.0.0.255".parse().unwrap(), 1, &quick(1, 10));
        assert!(matches!(result, Err(IcmpError::BroadcastDenied)));
    }
}
