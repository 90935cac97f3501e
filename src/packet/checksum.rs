//! One's-complement checksums (RFC 1071)

use std::net::IpAddr;

/// Accumulate 16-bit big-endian words into a running sum. An odd trailing
/// byte is padded with zero on the right.
fn accumulate(data: &[u8], mut sum: u32) -> u32 {
    for i in (0..data.len()).step_by(2) {
        let word = if i + 1 < data.len() {
            ((data[i] as u32) << 8) | (data[i + 1] as u32)
        } else {
            (data[i] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }
    sum
}

/// Fold end-around carries and complement.
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

/// Plain internet checksum over a byte range (IPv4 header checksum).
pub fn internet_checksum(data: &[u8]) -> u16 {
    fold(accumulate(data, 0))
}

/// Transport checksum over the v4/v6 pseudo-header plus the segment.
///
/// The segment must carry a zeroed checksum field when computing, and its
/// on-wire checksum when verifying. `src` and `dst` always come from the
/// same packet, so mixed address families cannot occur.
pub fn pseudo_checksum(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> u16 {
    let mut sum = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let sum = accumulate(&s.octets(), 0);
            accumulate(&d.octets(), sum)
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let sum = accumulate(&s.octets(), 0);
            accumulate(&d.octets(), sum)
        }
        _ => 0,
    };
    sum = sum.wrapping_add(protocol as u32);
    sum = sum.wrapping_add(segment.len() as u32);
    fold(accumulate(segment, sum))
}

/// Verify a transport segment against its embedded checksum. A valid
/// segment sums to zero after complementing.
pub fn verify_transport(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> bool {
    pseudo_checksum(src, dst, protocol, segment) == 0
}

/// UDP maps a computed checksum of zero to 0xFFFF; zero on the wire means
/// "not computed" (RFC 768).
pub fn udp_wire_checksum(checksum: u16) -> u16 {
    if checksum == 0 {
        0xFFFF
    } else {
        checksum
    }
}
