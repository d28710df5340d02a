//! In-place IP header edits.

/// Mark a packet as having experienced congestion (ECN CE).
///
/// IPv4 packets get both ECN bits of the TOS byte set and their header checksum recomputed;
/// IPv6 packets get the matching bits of the traffic class. Anything else is left alone.
pub fn mark_ecn(packet: &mut [u8]) {
    match packet.first().map(|b| b >> 4) {
        Some(4) if packet.len() >= 20 => {
            packet[1] |= 0x03;
            let checksum = ipv4_header_checksum(packet);
            packet[10..12].copy_from_slice(&checksum.to_be_bytes());
        }
        Some(6) if packet.len() >= 2 => {
            packet[1] |= 0x30;
        }
        _ => {}
    }
}

/// Compute the IPv4 header checksum, skipping the checksum field itself.
///
/// Covers the header length given by IHL (at least 20 bytes), clamped to the buffer.
pub fn ipv4_header_checksum(packet: &[u8]) -> u16 {
    let ihl = packet
        .first()
        .map_or(20, |b| ((b & 0x0f) as usize * 4).max(20))
        .min(packet.len() & !1);

    let mut sum: u32 = packet[..ihl]
        .chunks_exact(2)
        .enumerate()
        .filter(|(i, _)| *i != 5)
        .map(|(_, word)| u32::from(u16::from_be_bytes([word[0], word[1]])))
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}
