use socket2::{SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::error::{IcmpError, Result};
use crate::icmp::{Family, IcmpPacket, IcmpReply, IcmpRequest, IcmpTransport, parse_reply};

const RECV_BUFFER_SIZE: usize = 4096;

// A zero timeval disables the read timeout, so anything below the
// resolution of SO_RCVTIMEO counts as already expired
const MIN_READ_TIMEOUT: Duration = Duration::from_micros(1);

/// Kernel-mediated ICMP datagram sockets exist only on these platforms.
pub const UNPRIVILEGED_SUPPORTED: bool =
    cfg!(any(target_os = "linux", target_os = "android", target_os = "macos"));

/// Linux datagram sockets replace the identifier with the socket's local
/// port. macOS keeps the caller's identifier.
const KERNEL_ASSIGNS_IDENTIFIER: bool = cfg!(any(target_os = "linux", target_os = "android"));

/// An ICMP socket bound to one address family.
///
/// Privileged sockets are raw sockets and this crate builds every header.
/// Unprivileged sockets are ICMP datagram sockets where the kernel owns the
/// identifier. The OS handle is released on `close` or drop.
pub struct IcmpSocket {
    socket: Option<Socket>,
    family: Family,
    privileged: bool,
    source: Option<IpAddr>,
}

impl IcmpSocket {
    pub fn new(family: Family, source: Option<IpAddr>, privileged: bool) -> Result<Self> {
        if let Some(address) = source.filter(|a| Family::of(a) != family) {
            return Err(IcmpError::AddressBinding {
                address,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("source address is not {}", family),
                ),
            });
        }

        let privileged = privileged || !UNPRIVILEGED_SUPPORTED;
        let ty = if privileged { Type::RAW } else { Type::DGRAM };

        let socket = Socket::new(family.domain(), ty, Some(family.protocol())).map_err(|e| {
            log::debug!("Failed to create {} ICMP socket: {}", family, e);
            match e.kind() {
                io::ErrorKind::PermissionDenied => IcmpError::Permission,
                _ => IcmpError::Socket(e),
            }
        })?;

        socket.set_nonblocking(false)?;

        if let Some(address) = source {
            socket
                .bind(&SocketAddr::new(address, 0).into())
                .map_err(|source| IcmpError::AddressBinding { address, source })?;
        }

        log::debug!(
            "Opened {} ICMP socket ({})",
            family,
            if privileged { "raw" } else { "datagram" }
        );

        Ok(Self {
            socket: Some(socket),
            family,
            privileged,
            source,
        })
    }

    /// Opens a socket whose family matches `destination`.
    pub fn for_destination(
        destination: &IpAddr,
        source: Option<IpAddr>,
        privileged: bool,
    ) -> Result<Self> {
        Self::new(Family::of(destination), source, privileged)
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn source(&self) -> Option<IpAddr> {
        self.source
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    /// Allows sending to broadcast addresses. IPv4 only.
    pub fn set_broadcast(&self, allow: bool) -> Result<()> {
        let socket = self.inner()?;
        if self.family == Family::V6 {
            return Err(IcmpError::Socket(io::Error::new(
                io::ErrorKind::Unsupported,
                "broadcast is an IPv4 feature",
            )));
        }
        socket.set_broadcast(allow)?;
        Ok(())
    }

    pub fn broadcast(&self) -> Result<bool> {
        Ok(self.inner()?.broadcast()?)
    }

    /// Releases the OS handle. Calling it again does nothing.
    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            log::debug!("Closed {} ICMP socket", self.family);
        }
    }

    fn inner(&self) -> Result<&Socket> {
        self.socket.as_ref().ok_or(IcmpError::Unavailable)
    }

    fn apply_options(&self, socket: &Socket, request: &IcmpRequest) {
        let ttl = u32::from(request.ttl());
        let result = match self.family {
            Family::V4 => socket.set_ttl(ttl),
            Family::V6 => socket.set_unicast_hops_v6(ttl),
        };
        if let Err(e) = result {
            log::debug!("Cannot set TTL {} on {} socket: {}", ttl, self.family, e);
        }

        if let Err(e) = set_traffic_class(socket, self.family, request.traffic_class()) {
            log::debug!("Cannot set traffic class {}: {}", request.traffic_class(), e);
        }
    }
}

impl IcmpTransport for IcmpSocket {
    fn family(&self) -> Family {
        self.family
    }

    fn send(&self, request: &mut IcmpRequest) -> Result<()> {
        let socket = self.inner()?;

        let packet = IcmpPacket::new_echo_request(
            request.id(),
            request.sequence(),
            request.payload_bytes(),
            self.family,
        )
        .to_bytes();
        self.apply_options(socket, request);

        let target = SockAddr::from(SocketAddr::new(request.destination(), 0));

        log::debug!(
            "Sending ICMP packet to {}: {} bytes, id={} seq={}",
            request.destination(),
            packet.len(),
            request.id(),
            request.sequence()
        );
        request.mark_sent(Instant::now());
        socket.send_to(&packet, &target).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => IcmpError::BroadcastDenied,
            _ => IcmpError::Socket(e),
        })?;

        if !self.privileged && KERNEL_ASSIGNS_IDENTIFIER {
            if let Some(port) = socket.local_addr().ok().and_then(|a| a.as_socket()).map(|a| a.port()) {
                request.set_id(port);
            }
        }

        Ok(())
    }

    fn receive(&self, request: Option<&IcmpRequest>, timeout: Duration) -> Result<IcmpReply> {
        let socket = self.inner()?;
        let deadline = Instant::now() + timeout;
        let mut buffer = [MaybeUninit::<u8>::uninit(); RECV_BUFFER_SIZE];

        loop {
            let Some(remaining) = read_timeout(deadline) else {
                return Err(IcmpError::TimeoutExceeded(timeout));
            };
            socket.set_read_timeout(Some(remaining))?;

            let (len, address) = match socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Err(IcmpError::TimeoutExceeded(timeout));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(IcmpError::Socket(e)),
            };
            let received_at = Instant::now();

            // SAFETY: recv_from initialised the first `len` bytes of the buffer.
            let data = unsafe { std::slice::from_raw_parts(buffer.as_ptr().cast::<u8>(), len) };

            let Some(source) = address.as_socket().map(|a| a.ip()) else {
                continue;
            };

            match parse_reply(data, source, received_at, self.family) {
                Some(reply) if request.is_none_or(|r| reply.matches(r)) => {
                    log::debug!(
                        "Received ICMP type {} from {}: id={} seq={}",
                        reply.icmp_type,
                        reply.source,
                        reply.id,
                        reply.sequence
                    );
                    return Ok(reply);
                }
                Some(reply) => {
                    log::debug!("Ignoring reply id={} seq={} from {}", reply.id, reply.sequence, source);
                }
                None => log::debug!("Dropping {} byte frame from {}", len, source),
            }
        }
    }
}

/// Time left before `deadline`, or `None` once it is too short to arm.
fn read_timeout(deadline: Instant) -> Option<Duration> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    (remaining >= MIN_READ_TIMEOUT).then_some(remaining)
}

impl Drop for IcmpSocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(unix)]
fn set_traffic_class(socket: &Socket, family: Family, traffic_class: u8) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    match family {
        Family::V4 => socket.set_tos(u32::from(traffic_class)),
        Family::V6 => {
            let value = libc::c_int::from(traffic_class);
            // SAFETY: the fd is owned by `socket` and `value` outlives the call.
            let rc = unsafe {
                libc::setsockopt(
                    socket.as_raw_fd(),
                    libc::IPPROTO_IPV6,
                    libc::IPV6_TCLASS,
                    (&value as *const libc::c_int).cast::<libc::c_void>(),
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
        }
    }
}

#[cfg(not(unix))]
fn set_traffic_class(_socket: &Socket, _family: Family, _traffic_class: u8) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_any(family: Family) -> Option<IcmpSocket> {
        for privileged in [true, false] {
            match IcmpSocket::new(family, None, privileged) {
                Ok(socket) => return Some(socket),
                Err(e) => println!("ICMP socket creation failed (privileged={}): {}", privileged, e),
            }
        }
        None
    }

    #[test]
    fn test_raw_socket_creation() {
        // This test may fail without elevated privileges
        match IcmpSocket::new(Family::V4, None, true) {
            Ok(socket) => assert!(socket.is_privileged()),
            Err(IcmpError::Permission) => println!("Raw socket creation needs privileges"),
            Err(e) => println!("Raw socket creation failed: {}", e),
        }
    }

    #[test]
    fn test_source_of_wrong_family_is_a_binding_error() {
        let result = IcmpSocket::new(Family::V4, Some("::1".parse().unwrap()), false);
        assert!(matches!(result, Err(IcmpError::AddressBinding { .. })));
    }

    #[test]
    fn test_unroutable_source_is_a_binding_error() {
        let result = IcmpSocket::new(Family::V4, Some("192.0.2.123".parse().unwrap()), false);
        match result {
            Err(IcmpError::AddressBinding { address, .. }) => {
                assert_eq!(address, "192.0.2.123".parse::<IpAddr>().unwrap())
            }
            Err(e) => println!("ICMP socket creation failed: {}", e),
            Ok(_) => panic!("bound an address this host does not own"),
        }
    }

    #[test]
    fn test_closed_socket_is_unavailable() {
        let Some(mut socket) = open_any(Family::V4) else {
            return;
        };
        socket.close();
        socket.close();
        assert!(socket.is_closed());

        let mut request = IcmpRequest::new("127.0.0.1".parse().unwrap(), 1, 0);
        assert!(matches!(socket.send(&mut request), Err(IcmpError::Unavailable)));
        assert!(matches!(
            socket.receive(None, Duration::from_millis(10)),
            Err(IcmpError::Unavailable)
        ));
    }

    #[test]
    fn test_receive_times_out_within_bound() {
        let Some(socket) = open_any(Family::V4) else {
            return;
        };
        let request = IcmpRequest::new("127.0.0.1".parse().unwrap(), 0xfffe, 0xfffe);
        let start = Instant::now();
        let result = socket.receive(Some(&request), Duration::from_millis(100));
        assert!(matches!(result, Err(IcmpError::TimeoutExceeded(_))));
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn test_loopback_echo() {
        let Some(socket) = open_any(Family::V4) else {
            return;
        };
        let mut request = IcmpRequest::new("127.0.0.1".parse().unwrap(), 4242, 1);
        if let Err(e) = socket.send(&mut request) {
            println!("Send failed: {}", e);
            return;
        }
        assert!(request.sent_at().is_some());
        match socket.receive(Some(&request), Duration::from_secs(2)) {
            Ok(reply) => {
                assert!(reply.matches(&request));
                assert!(reply.is_echo_reply());
            }
            Err(e) => println!("Loopback echo failed: {}", e),
        }
    }

    #[test]
    fn test_read_timeout_below_resolution_is_expired() {
        assert_eq!(read_timeout(Instant::now()), None);
        assert_eq!(read_timeout(Instant::now() + Duration::from_nanos(900)), None);
        let armed = read_timeout(Instant::now() + Duration::from_secs(1)).unwrap();
        assert!(armed > Duration::from_millis(900));
    }

    #[test]
    fn test_sub_microsecond_timeout_does_not_block() {
        let Some(socket) = open_any(Family::V4) else {
            return;
        };
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let request = IcmpRequest::new("127.0.0.1".parse().unwrap(), 0xfffd, 0xfffd);
            let _ = tx.send(socket.receive(Some(&request), Duration::from_nanos(900)));
        });

        let result = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("receive blocked past its deadline");
        assert!(matches!(result, Err(IcmpError::TimeoutExceeded(_))));
    }

    #[test]
    fn test_receive_skips_other_sequences() {
        let Some(socket) = open_any(Family::V4) else {
            return;
        };
        let destination: IpAddr = "127.0.0.1".parse().unwrap();
        let mut first = IcmpRequest::new(destination, 4343, 1);
        let mut second = IcmpRequest::new(destination, 4343, 2);
        if let Err(e) = socket.send(&mut first).and_then(|_| socket.send(&mut second)) {
            println!("Send failed: {}", e);
            return;
        }

        match socket.receive(Some(&second), Duration::from_secs(2)) {
            Ok(reply) => {
                assert_eq!(reply.sequence, 2);
                assert_eq!(reply.id, second.id());
            }
            Err(e) => {
                println!("Loopback echo failed: {}", e);
                return;
            }
        }

        // Another reply is on its way while we wait for one that never comes
        let mut third = IcmpRequest::new(destination, 4343, 3);
        if socket.send(&mut third).is_err() {
            return;
        }
        let never_sent = IcmpRequest::new(destination, u32::from(second.id()), 99);
        let start = Instant::now();
        let result = socket.receive(Some(&never_sent), Duration::from_millis(100));
        assert!(matches!(result, Err(IcmpError::TimeoutExceeded(_))));
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn test_datagram_identifier_follows_platform() {
        assert!(!KERNEL_ASSIGNS_IDENTIFIER || UNPRIVILEGED_SUPPORTED);
        if !UNPRIVILEGED_SUPPORTED {
            return;
        }
        let socket = match IcmpSocket::new(Family::V4, None, false) {
            Ok(socket) => socket,
            Err(e) => {
                println!("Datagram ICMP socket unavailable: {}", e);
                return;
            }
        };
        let mut request = IcmpRequest::new("127.0.0.1".parse().unwrap(), 4242, 1);
        if let Err(e) = socket.send(&mut request) {
            println!("Send failed: {}", e);
            return;
        }

        if KERNEL_ASSIGNS_IDENTIFIER {
            let port = socket
                .inner()
                .unwrap()
                .local_addr()
                .unwrap()
                .as_socket()
                .unwrap()
                .port();
            assert_eq!(request.id(), port);
        } else {
            assert_eq!(request.id(), 4242);
        }
    }
}
