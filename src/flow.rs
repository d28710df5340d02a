//! Classifying IP packets into flows, and the text form of a flow.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

use crate::Error;

/// IP protocol numbers whose headers start with a 16-bit source and destination port.
const PORTED_PROTOCOLS: [u8; 4] = [
    6,   // TCP
    17,  // UDP
    132, // SCTP
    136, // UDP-Lite
];

// IPv6 extension headers skipped on the way to the transport header
const IPV6_HOP_BY_HOP: u8 = 0;
const IPV6_ROUTING: u8 = 43;
const IPV6_FRAGMENT: u8 = 44;
const IPV6_AUTH: u8 = 51;
const IPV6_DEST_OPTS: u8 = 60;

/// A transport-layer conversation: protocol plus source and destination endpoints.
///
/// Packets that carry no recognised transport header all map to [`Flow::UNCLASSIFIED`], which
/// acts as a single shared bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Flow {
    /// IP protocol number, zero for the shared bucket.
    pub protocol: u8,

    /// Source address and port.
    pub src: SocketAddr,

    /// Destination address and port.
    pub dst: SocketAddr,
}

impl Flow {
    /// The flow of every packet without a recognised transport header.
    pub const UNCLASSIFIED: Flow = Flow {
        protocol: 0,
        src: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        dst: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
    };

    /// Whether this is the shared bucket.
    pub fn is_unclassified(&self) -> bool {
        *self == Self::UNCLASSIFIED
    }
}

impl Default for Flow {
    fn default() -> Self {
        Self::UNCLASSIFIED
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unclassified() {
            return f.write_str("unclassified");
        }

        match self.protocol {
            6 => f.write_str("tcp")?,
            17 => f.write_str("udp")?,
            132 => f.write_str("sctp")?,
            136 => f.write_str("udplite")?,
            n => write!(f, "proto{n}")?,
        }
        write!(f, " {} -> {}", self.src, self.dst)
    }
}

/// Find the flow an IP packet belongs to.
///
/// Fails if the buffer is too short for an IP header or isn't IPv4 or IPv6. A packet whose
/// transport header isn't recognised (or is cut short) belongs to [`Flow::UNCLASSIFIED`].
pub fn classify(packet: &[u8]) -> Result<Flow, Error> {
    let Some(first) = packet.first() else {
        return Err(Error::Parse("empty packet"));
    };

    match first >> 4 {
        4 => classify_v4(packet),
        6 => classify_v6(packet),
        _ => Err(Error::Parse("not an IPv4 or IPv6 packet")),
    }
}

fn classify_v4(packet: &[u8]) -> Result<Flow, Error> {
    if packet.len() < 20 {
        return Err(Error::Parse("truncated IPv4 header"));
    }

    let ihl = (packet[0] & 0x0f) as usize * 4;
    if ihl < 20 || packet.len() < ihl {
        return Err(Error::Parse("bad IPv4 header length"));
    }

    // only the first fragment carries the transport header
    let fragment_offset = u16::from_be_bytes([packet[6], packet[7]]) & 0x1fff;
    if fragment_offset != 0 {
        return Ok(Flow::UNCLASSIFIED);
    }

    let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    Ok(with_ports(packet[9], src.into(), dst.into(), &packet[ihl..]))
}

fn classify_v6(packet: &[u8]) -> Result<Flow, Error> {
    if packet.len() < 40 {
        return Err(Error::Parse("truncated IPv6 header"));
    }

    let (mut src, mut dst) = ([0_u8; 16], [0_u8; 16]);
    src.copy_from_slice(&packet[8..24]);
    dst.copy_from_slice(&packet[24..40]);
    let (src, dst) = (Ipv6Addr::from(src), Ipv6Addr::from(dst));

    let mut next = packet[6];
    let mut offset = 40;
    loop {
        match next {
            IPV6_HOP_BY_HOP | IPV6_ROUTING | IPV6_DEST_OPTS => {
                let Some(header) = packet.get(offset..offset + 2) else {
                    return Ok(Flow::UNCLASSIFIED);
                };
                next = header[0];
                offset += (header[1] as usize + 1) * 8;
            }
            IPV6_AUTH => {
                let Some(header) = packet.get(offset..offset + 2) else {
                    return Ok(Flow::UNCLASSIFIED);
                };
                next = header[0];
                offset += (header[1] as usize + 2) * 4;
            }
            IPV6_FRAGMENT => {
                let Some(header) = packet.get(offset..offset + 8) else {
                    return Ok(Flow::UNCLASSIFIED);
                };
                if u16::from_be_bytes([header[2], header[3]]) >> 3 != 0 {
                    return Ok(Flow::UNCLASSIFIED);
                }
                next = header[0];
                offset += 8;
            }
            protocol => {
                let transport = packet.get(offset..).unwrap_or_default();
                return Ok(with_ports(protocol, src.into(), dst.into(), transport));
            }
        }
    }
}

fn with_ports(protocol: u8, src: IpAddr, dst: IpAddr, transport: &[u8]) -> Flow {
    if !PORTED_PROTOCOLS.contains(&protocol) || transport.len() < 4 {
        return Flow::UNCLASSIFIED;
    }

    Flow {
        protocol,
        src: SocketAddr::new(src, u16::from_be_bytes([transport[0], transport[1]])),
        dst: SocketAddr::new(dst, u16::from_be_bytes([transport[2], transport[3]])),
    }
}

/// Serialise a flow to a portable string.
///
/// The string is the base64 of `protocol(1) | src_len(1) | src | dst_len(1) | dst`, where each
/// endpoint is its raw address followed by the port (2 bytes, big-endian). The shared bucket has
/// empty endpoints.
pub fn encode_flow(flow: &Flow) -> String {
    let mut buf = Vec::with_capacity(1 + 2 * 19);
    buf.push(flow.protocol);
    if flow.is_unclassified() {
        buf.extend_from_slice(&[0, 0]);
    } else {
        for endpoint in [flow.src, flow.dst] {
            let raw = endpoint_bytes(endpoint);
            buf.push(raw.len() as u8);
            buf.extend_from_slice(&raw);
        }
    }

    BASE64.encode(buf)
}

fn endpoint_bytes(endpoint: SocketAddr) -> Vec<u8> {
    let mut raw = match endpoint.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    raw.extend_from_slice(&endpoint.port().to_be_bytes());
    raw
}

/// Parse a string made by [`encode_flow`].
pub fn decode_flow(text: &str) -> Result<Flow, Error> {
    let bytes = BASE64
        .decode(text)
        .map_err(|_| Error::Parse("flow is not valid base64"))?;

    let Some((&protocol, rest)) = bytes.split_first() else {
        return Err(Error::Parse("empty flow"));
    };
    let (src, rest) = take_endpoint(rest)?;
    let (dst, rest) = take_endpoint(rest)?;
    if !rest.is_empty() {
        return Err(Error::Parse("trailing bytes after flow"));
    }

    match (src, dst) {
        (None, None) if protocol == 0 => Ok(Flow::UNCLASSIFIED),
        (Some(src), Some(dst)) => Ok(Flow { protocol, src, dst }),
        _ => Err(Error::Parse("flow has a missing endpoint")),
    }
}

fn take_endpoint(bytes: &[u8]) -> Result<(Option<SocketAddr>, &[u8]), Error> {
    let Some((&len, rest)) = bytes.split_first() else {
        return Err(Error::Parse("truncated flow"));
    };
    let len = len as usize;
    if rest.len() < len {
        return Err(Error::Parse("truncated flow endpoint"));
    }
    let (raw, rest) = rest.split_at(len);

    let endpoint = match raw.len() {
        0 => None,
        6 => {
            let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
            Some(SocketAddr::new(ip.into(), u16::from_be_bytes([raw[4], raw[5]])))
        }
        18 => {
            let mut ip = [0; 16];
            ip.copy_from_slice(&raw[..16]);
            let port = u16::from_be_bytes([raw[16], raw[17]]);
            Some(SocketAddr::new(Ipv6Addr::from(ip).into(), port))
        }
        _ => return Err(Error::Parse("bad flow endpoint length")),
    };

    Ok((endpoint, rest))
}
