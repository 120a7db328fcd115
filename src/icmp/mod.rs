pub mod async_socket;
pub mod buffered;
pub mod packet;
pub mod socket;

#[cfg(test)]
pub(crate) mod mock;

pub use async_socket::AsyncIcmpSocket;
pub use buffered::BufferedSocket;
pub use packet::*;
pub use socket::*;

use std::net::IpAddr;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol};

use crate::error::{IcmpError, Result};

/// Address family of an ICMP exchange. Everything that differs between
/// ICMPv4 and ICMPv6 hangs off this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(address: &IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn echo_request(self) -> u8 {
        match self {
            Family::V4 => ICMP_ECHO_REQUEST,
            Family::V6 => ICMPV6_ECHO_REQUEST,
        }
    }

    pub fn echo_reply(self) -> u8 {
        match self {
            Family::V4 => ICMP_ECHO_REPLY,
            Family::V6 => ICMPV6_ECHO_REPLY,
        }
    }

    /// Length of the original IP header quoted inside an ICMP error.
    pub fn quoted_header_len(self) -> usize {
        match self {
            Family::V4 => IPV4_HEADER_LEN,
            Family::V6 => IPV6_HEADER_LEN,
        }
    }

    pub(crate) fn domain(self) -> Domain {
        match self {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        }
    }

    pub(crate) fn protocol(self) -> Protocol {
        match self {
            Family::V4 => Protocol::ICMPV4,
            Family::V6 => Protocol::ICMPV6,
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}

/// One Echo Request probe.
#[derive(Debug, Clone)]
pub struct IcmpRequest {
    destination: IpAddr,
    id: u16,
    sequence: u16,
    payload: Option<Vec<u8>>,
    payload_size: usize,
    ttl: u8,
    traffic_class: u8,
    sent_at: Option<Instant>,
}

impl IcmpRequest {
    pub const DEFAULT_PAYLOAD_SIZE: usize = 56;
    pub const DEFAULT_TTL: u8 = 64;

    /// Identifier and sequence are truncated to the 16 bits the header has.
    pub fn new(destination: IpAddr, id: u32, sequence: u32) -> Self {
        Self {
            destination,
            id: (id & 0xffff) as u16,
            sequence: (sequence & 0xffff) as u16,
            payload: None,
            payload_size: Self::DEFAULT_PAYLOAD_SIZE,
            ttl: Self::DEFAULT_TTL,
            traffic_class: 0,
            sent_at: None,
        }
    }

    /// An explicit payload overrides any declared size.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload_size = payload.len();
        self.payload = Some(payload);
        self
    }

    pub fn with_payload_size(mut self, size: usize) -> Self {
        if self.payload.is_none() {
            self.payload_size = size;
        }
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_traffic_class(mut self, traffic_class: u8) -> Self {
        self.traffic_class = traffic_class;
        self
    }

    pub fn destination(&self) -> IpAddr {
        self.destination
    }

    pub fn family(&self) -> Family {
        Family::of(&self.destination)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn traffic_class(&self) -> u8 {
        self.traffic_class
    }

    /// When the request was handed to the OS. `None` until sent.
    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    /// Bytes that go after the header: the explicit payload, or random
    /// printable bytes of the declared size.
    pub fn payload_bytes(&self) -> Vec<u8> {
        match &self.payload {
            Some(payload) => payload.clone(),
            None => crate::utils::random_payload(self.payload_size),
        }
    }

    pub(crate) fn mark_sent(&mut self, at: Instant) {
        if self.sent_at.is_none() {
            self.sent_at = Some(at);
        }
    }

    /// Datagram sockets let the kernel pick the identifier.
    pub(crate) fn set_id(&mut self, id: u16) {
        self.id = id;
    }
}

/// A parsed ICMP message received from the network.
#[derive(Debug, Clone)]
pub struct IcmpReply {
    pub source: IpAddr,
    pub family: Family,
    pub id: u16,
    pub sequence: u16,
    pub icmp_type: u8,
    pub code: u8,
    pub bytes_received: usize,
    pub received_at: Instant,
    pub ttl: Option<u8>,
}

impl IcmpReply {
    pub fn is_echo_reply(&self) -> bool {
        self.icmp_type == self.family.echo_reply()
    }

    pub fn matches(&self, request: &IcmpRequest) -> bool {
        self.id == request.id() && self.sequence == request.sequence()
    }

    pub fn condition(&self) -> Option<IcmpCondition> {
        if self.is_echo_reply() {
            None
        } else {
            Some(IcmpCondition::classify(self.family, self.icmp_type, self.code))
        }
    }

    /// Turns anything other than an Echo Reply into a typed error.
    pub fn check(&self) -> Result<()> {
        match self.condition() {
            None => Ok(()),
            Some(condition) => Err(IcmpError::Condition(condition)),
        }
    }

    /// Round-trip time in milliseconds measured against the request's
    /// send timestamp.
    pub fn rtt_ms(&self, request: &IcmpRequest) -> Option<f64> {
        let sent_at = request.sent_at()?;
        let elapsed = self.received_at.saturating_duration_since(sent_at);
        Some(elapsed.as_secs_f64() * 1000.0)
    }
}

/// ICMP error messages surfaced when a reply is not an Echo Reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpCondition {
    DestinationUnreachable { code: u8 },
    TimeExceeded { code: u8 },
    ParameterProblem { code: u8 },
    Redirect { code: u8 },
    SourceQuench,
    PacketTooBig,
    Other { icmp_type: u8, code: u8 },
}

impl IcmpCondition {
    pub fn classify(family: Family, icmp_type: u8, code: u8) -> Self {
        match (family, icmp_type) {
            (Family::V4, 3) | (Family::V6, 1) => IcmpCondition::DestinationUnreachable { code },
            (Family::V4, 11) | (Family::V6, 3) => IcmpCondition::TimeExceeded { code },
            (Family::V4, 12) | (Family::V6, 4) => IcmpCondition::ParameterProblem { code },
            (Family::V4, 5) => IcmpCondition::Redirect { code },
            (Family::V4, 4) => IcmpCondition::SourceQuench,
            (Family::V6, 2) => IcmpCondition::PacketTooBig,
            _ => IcmpCondition::Other { icmp_type, code },
        }
    }

    pub fn is_time_exceeded(&self) -> bool {
        matches!(self, IcmpCondition::TimeExceeded { .. })
    }
}

impl std::fmt::Display for IcmpCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IcmpCondition::DestinationUnreachable { code } => {
                write!(f, "Destination unreachable (code {})", code)
            }
            IcmpCondition::TimeExceeded { code } => write!(f, "Time exceeded (code {})", code),
            IcmpCondition::ParameterProblem { code } => {
                write!(f, "Parameter problem (code {})", code)
            }
            IcmpCondition::Redirect { code } => write!(f, "Redirect (code {})", code),
            IcmpCondition::SourceQuench => write!(f, "Source quench"),
            IcmpCondition::PacketTooBig => write!(f, "Packet too big"),
            IcmpCondition::Other { icmp_type, code } => {
                write!(f, "ICMP error type {}, code {}", icmp_type, code)
            }
        }
    }
}

/// Anything that can carry Echo Requests out and hand replies back.
///
/// `receive` with a request waits for the reply matching that request's
/// identifier and sequence; without one it returns the first parseable
/// reply. Both give up with [`IcmpError::TimeoutExceeded`].
pub trait IcmpTransport: Send + Sync {
    fn family(&self) -> Family;

    fn send(&self, request: &mut IcmpRequest) -> Result<()>;

    fn receive(&self, request: Option<&IcmpRequest>, timeout: Duration) -> Result<IcmpReply>;
}

impl<T: IcmpTransport + ?Sized> IcmpTransport for std::sync::Arc<T> {
    fn family(&self) -> Family {
        (**self).family()
    }

    fn send(&self, request: &mut IcmpRequest) -> Result<()> {
        (**self).send(request)
    }

    fn receive(&self, request: Option<&IcmpRequest>, timeout: Duration) -> Result<IcmpReply> {
        (**self).receive(request, timeout)
    }
}
