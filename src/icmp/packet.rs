use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use std::net::IpAddr;
use std::time::Instant;

use crate::icmp::{Family, IcmpReply};

pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

pub const ICMP_HEADER_LEN: usize = 8;
pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;

// Byte 8 of the IPv4 header
const IPV4_TTL_OFFSET: usize = 8;

#[derive(Debug, Clone)]
pub struct IcmpPacket {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl IcmpPacket {
    pub fn new_echo_request(identifier: u16, sequence: u16, payload: Vec<u8>, family: Family) -> Self {
        let mut packet = Self {
            icmp_type: family.echo_request(),
            code: 0,
            checksum: 0,
            identifier,
            sequence,
            payload,
        };

        packet.calculate_checksum();
        packet
    }

    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < ICMP_HEADER_LEN {
            return Err(anyhow::anyhow!("ICMP packet too short"));
        }

        let mut cursor = Cursor::new(data);
        let icmp_type = cursor.read_u8()?;
        let code = cursor.read_u8()?;
        let checksum = cursor.read_u16::<BigEndian>()?;
        let identifier = cursor.read_u16::<BigEndian>()?;
        let sequence = cursor.read_u16::<BigEndian>()?;

        let mut payload = Vec::new();
        cursor.read_to_end(&mut payload)?;

        Ok(Self {
            icmp_type,
            code,
            checksum,
            identifier,
            sequence,
            payload,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ICMP_HEADER_LEN + self.payload.len());
        // Writes into a Vec cannot fail.
        let _ = bytes.write_u8(self.icmp_type);
        let _ = bytes.write_u8(self.code);
        let _ = bytes.write_u16::<BigEndian>(self.checksum);
        let _ = bytes.write_u16::<BigEndian>(self.identifier);
        let _ = bytes.write_u16::<BigEndian>(self.sequence);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Serialises once with a zero checksum field, then stores the real one.
    pub fn calculate_checksum(&mut self) {
        self.checksum = 0;
        let bytes = self.to_bytes();
        self.checksum = checksum(&bytes);
    }
}

/// RFC 1071 Internet checksum.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }

    // Odd length: pad with a zero byte
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }

    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

/// Header plus payload, ready for the wire.
pub fn build_packet(icmp_type: u8, identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = IcmpPacket {
        icmp_type,
        code: 0,
        checksum: 0,
        identifier,
        sequence,
        payload: payload.to_vec(),
    };
    packet.calculate_checksum();
    packet.to_bytes()
}

/// Parses a received datagram into a reply.
///
/// IPv4 raw sockets hand over the IP header; unprivileged datagram sockets on
/// Linux do not. The version nibble tells them apart, which is the same as
/// treating a missing header as zero-length padding. For anything other than
/// an Echo Reply the identifier and sequence come from the quoted copy of our
/// own request. Returns `None` for frames too short to demultiplex and for
/// frames that cannot be answers to our Echo Requests.
pub fn parse_reply(
    data: &[u8],
    source: IpAddr,
    received_at: Instant,
    family: Family,
) -> Option<IcmpReply> {
    let (icmp, ttl) = match family {
        Family::V4 => strip_ipv4_header(data)?,
        Family::V6 => (data, None),
    };

    let outer = IcmpPacket::from_bytes(icmp).ok()?;

    // Raw sockets also see our own requests on loopback
    if outer.icmp_type == family.echo_request() {
        return None;
    }

    let (identifier, sequence) = if outer.icmp_type == family.echo_reply() {
        (outer.identifier, outer.sequence)
    } else {
        let quoted = &outer.payload;
        let ip_len = match family {
            Family::V4 => ipv4_header_len(quoted)?,
            Family::V6 => family.quoted_header_len(),
        };
        let original = IcmpPacket::from_bytes(quoted.get(ip_len..)?).ok()?;
        if original.icmp_type != family.echo_request() {
            return None;
        }
        (original.identifier, original.sequence)
    };

    Some(IcmpReply {
        source,
        family,
        id: identifier,
        sequence,
        icmp_type: outer.icmp_type,
        code: outer.code,
        bytes_received: icmp.len(),
        received_at,
        ttl,
    })
}

fn strip_ipv4_header(data: &[u8]) -> Option<(&[u8], Option<u8>)> {
    let first = *data.first()?;
    if first >> 4 != 4 {
        return Some((data, None));
    }
    let header_len = ipv4_header_len(data)?;
    Some((data.get(header_len..)?, data.get(IPV4_TTL_OFFSET).copied()))
}

fn ipv4_header_len(data: &[u8]) -> Option<usize> {
    let first = *data.first()?;
    if first >> 4 != 4 {
        return None;
    }
    let len = usize::from(first & 0x0f) * 4;
    if len < IPV4_HEADER_LEN || data.len() < len {
        return None;
    }
    Some(len)
}
