//! Address translation between IPv4 and IPv6, and name resolution.
//!
//! IPv4 addresses travel inside 16-byte fields embedded under the well-known NAT64 prefix
//! `64:ff9b::/96` (RFC 6052).

use std::{
    fmt::Write as _,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use tokio::net::lookup_host;
use tracing::debug;

use crate::Error;

/// The 12-byte well-known prefix IPv4 addresses are embedded under.
pub const WELL_KNOWN_PREFIX: [u8; 12] = [0x00, 0x64, 0xff, 0x9b, 0, 0, 0, 0, 0, 0, 0, 0];

/// Embed an IPv4 address in an IPv6 address under the well-known prefix.
pub fn embed_v4_in_v6(ipv4: [u8; 4]) -> [u8; 16] {
    let mut out = [0; 16];
    out[..12].copy_from_slice(&WELL_KNOWN_PREFIX);
    out[12..].copy_from_slice(&ipv4);
    out
}

/// Extract the IPv4 address embedded in an IPv6 address.
///
/// Returns `None` unless the first 12 bytes are exactly the well-known prefix.
pub fn extract_v4_from_v6(ipv6: [u8; 16]) -> Option<[u8; 4]> {
    let (prefix, v4) = ipv6.split_at(12);
    if prefix != WELL_KNOWN_PREFIX {
        return None;
    }

    v4.try_into().ok()
}

/// Convert an [`IpAddr`] to its 16-byte wire form.
pub fn to_wire(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => embed_v4_in_v6(v4.octets()),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Convert a 16-byte wire address back to an [`IpAddr`], unwrapping embedded IPv4.
pub fn from_wire(bytes: [u8; 16]) -> IpAddr {
    match extract_v4_from_v6(bytes) {
        Some(v4) => IpAddr::V4(Ipv4Addr::from(v4)),
        None => IpAddr::V6(Ipv6Addr::from(bytes)),
    }
}

/// Resolve a hostname (or IP literal) to a single address.
///
/// IPv6 results are preferred; the first IPv4 result is used if there are none.
pub async fn resolve_hostname(name: &str) -> Result<IpAddr, Error> {
    let addrs: Vec<IpAddr> = lookup_host((name, 0))
        .await
        .map_err(|err| Error::Resolution(format!("{name}: {err}")))?
        .map(|addr| addr.ip().to_canonical())
        .collect();
    debug!(name, ?addrs, "resolved");

    addrs
        .iter()
        .find(|ip| ip.is_ipv6())
        .or_else(|| addrs.iter().find(|ip| ip.is_ipv4()))
        .copied()
        .ok_or_else(|| Error::Resolution(format!("{name}: no addresses")))
}

/// Format raw address bytes for display.
///
/// 4 bytes give dotted decimal, 16 bytes give eight bracketed groups of four lowercase hex
/// digits. Any other length gives an empty string.
pub fn format_address(bytes: &[u8]) -> String {
    match bytes.len() {
        4 => bytes
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join("."),
        16 => {
            let mut out = String::with_capacity(41);
            out.push('[');
            for (i, pair) in bytes.chunks_exact(2).enumerate() {
                if i > 0 {
                    out.push(':');
                }
                let _ = write!(out, "{:02x}{:02x}", pair[0], pair[1]);
            }
            out.push(']');
            out
        }
        _ => String::new(),
    }
}
