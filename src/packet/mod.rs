//! Packet header codecs and whole-packet builders
//!
//! Pure functions: decoding never reads past the buffer, encoding
//! reproduces the exact on-wire layout. No I/O happens here.

pub mod checksum;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod udp;

pub use ipv4::Ipv4Header;
pub use ipv6::{ExtensionHeader, Ipv6Header};
pub use tcp::{seq_after, seq_before, seq_before_or_eq, TcpFlags, TcpHeader, TcpOptions};
pub use udp::UdpHeader;

use crate::error::{Result, StackError};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_MSS_V4: u16 = 1360;
pub const DEFAULT_MSS_V6: u16 = 1340;

/// Network-layer header of a parsed packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpHeader {
    V4(Ipv4Header),
    V6(Ipv6Header),
}

impl IpHeader {
    pub fn src(&self) -> IpAddr {
        match self {
            IpHeader::V4(h) => IpAddr::V4(h.src),
            IpHeader::V6(h) => IpAddr::V6(h.src),
        }
    }

    pub fn dst(&self) -> IpAddr {
        match self {
            IpHeader::V4(h) => IpAddr::V4(h.dst),
            IpHeader::V6(h) => IpAddr::V6(h.dst),
        }
    }

    pub fn protocol(&self) -> u8 {
        match self {
            IpHeader::V4(h) => h.protocol,
            IpHeader::V6(h) => h.protocol(),
        }
    }

    pub fn header_len(&self) -> usize {
        match self {
            IpHeader::V4(h) => h.header_len(),
            IpHeader::V6(h) => h.header_len(),
        }
    }
}

/// Transport-layer header of a parsed packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp(TcpHeader),
    Udp(UdpHeader),
}

/// A fully decoded packet. Payload bytes stay in the caller's buffer;
/// `payload()` re-slices them.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub ip: IpHeader,
    pub transport: Transport,
    pub payload_offset: usize,
    pub payload_len: usize,
    /// Transport checksum verification result. A mismatch is recorded,
    /// never a reason to drop the packet (tunnel-level artifacts).
    pub checksum_ok: bool,
}

impl ParsedPacket {
    pub fn src_socket(&self) -> SocketAddr {
        let port = match &self.transport {
            Transport::Tcp(t) => t.src_port,
            Transport::Udp(u) => u.src_port,
        };
        SocketAddr::new(self.ip.src(), port)
    }

    pub fn dst_socket(&self) -> SocketAddr {
        let port = match &self.transport {
            Transport::Tcp(t) => t.dst_port,
            Transport::Udp(u) => u.dst_port,
        };
        SocketAddr::new(self.ip.dst(), port)
    }

    pub fn payload<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        let end = (self.payload_offset + self.payload_len).min(raw.len());
        if self.payload_offset >= end {
            &[]
        } else {
            &raw[self.payload_offset..end]
        }
    }

    pub fn is_tcp_syn(&self) -> bool {
        matches!(&self.transport, Transport::Tcp(t) if t.flags.syn && !t.flags.ack)
    }
}

/// Parse a raw IP packet, dispatching on the version nibble.
pub fn parse_packet(data: &[u8]) -> Result<ParsedPacket> {
    if data.is_empty() {
        return Err(StackError::PacketTooShort { expected: 1, actual: 0 });
    }
    match data[0] >> 4 {
        4 => parse_v4(data),
        6 => parse_v6(data),
        v => Err(StackError::InvalidIpVersion(v)),
    }
}

fn parse_v4(data: &[u8]) -> Result<ParsedPacket> {
    let hdr = Ipv4Header::decode(data)?;
    let ip_len = hdr.header_len();
    let end = (hdr.total_len as usize).min(data.len());
    let segment = &data[ip_len..end];
    parse_transport(IpHeader::V4(hdr), ip_len, segment)
}

fn parse_v6(data: &[u8]) -> Result<ParsedPacket> {
    let hdr = Ipv6Header::decode(data)?;
    let ip_len = hdr.header_len();
    let end = (ipv6::FIXED_HEADER_LEN + hdr.payload_len as usize).min(data.len());
    let segment = &data[ip_len..end];
    parse_transport(IpHeader::V6(hdr), ip_len, segment)
}

fn parse_transport(ip: IpHeader, ip_len: usize, segment: &[u8]) -> Result<ParsedPacket> {
    let src = ip.src();
    let dst = ip.dst();
    match ip.protocol() {
        PROTO_TCP => {
            let th = TcpHeader::decode(segment)?;
            let data_offset = ((segment[12] >> 4) as usize) * 4;
            let checksum_ok = checksum::verify_transport(src, dst, PROTO_TCP, segment);
            Ok(ParsedPacket {
                ip,
                transport: Transport::Tcp(th),
                payload_offset: ip_len + data_offset,
                payload_len: segment.len() - data_offset,
                checksum_ok,
            })
        }
        PROTO_UDP => {
            let uh = UdpHeader::decode(segment)?;
            // zero on the wire means the sender skipped the checksum
            let wire_cksum = u16::from_be_bytes([segment[6], segment[7]]);
            let checksum_ok =
                wire_cksum == 0 || checksum::verify_transport(src, dst, PROTO_UDP, segment);
            let payload_len = uh.payload_len().min(segment.len() - udp::HEADER_LEN);
            Ok(ParsedPacket {
                ip,
                transport: Transport::Udp(uh),
                payload_offset: ip_len + udp::HEADER_LEN,
                payload_len,
                checksum_ok,
            })
        }
        other => Err(StackError::UnsupportedProtocol(other)),
    }
}

fn next_ident() -> u16 {
    static IP_ID: AtomicU16 = AtomicU16::new(1);
    IP_ID.fetch_add(1, Ordering::Relaxed)
}

/// Build a complete IP/TCP packet, v4 or v6 chosen by the addresses.
#[allow(clippy::too_many_arguments)]
pub fn build_tcp(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    options: TcpOptions,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let th = TcpHeader {
        src_port: src.port(),
        dst_port: dst.port(),
        seq,
        ack,
        flags,
        window,
        urgent: 0,
        options,
    };
    let mut segment = th.encode();
    segment.extend_from_slice(payload);
    let cksum = checksum::pseudo_checksum(src.ip(), dst.ip(), PROTO_TCP, &segment);
    segment[16..18].copy_from_slice(&cksum.to_be_bytes());
    wrap_ip(src.ip(), dst.ip(), PROTO_TCP, segment)
}

/// Build a complete IP/UDP packet, v4 or v6 chosen by the addresses.
pub fn build_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let uh = UdpHeader {
        src_port: src.port(),
        dst_port: dst.port(),
        length: (udp::HEADER_LEN + payload.len()) as u16,
    };
    let mut segment = uh.encode();
    segment.extend_from_slice(payload);
    let cksum = checksum::udp_wire_checksum(checksum::pseudo_checksum(
        src.ip(),
        dst.ip(),
        PROTO_UDP,
        &segment,
    ));
    segment[6..8].copy_from_slice(&cksum.to_be_bytes());
    wrap_ip(src.ip(), dst.ip(), PROTO_UDP, segment)
}

fn wrap_ip(src: IpAddr, dst: IpAddr, protocol: u8, segment: Vec<u8>) -> Result<Vec<u8>> {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let hdr = Ipv4Header {
                dscp_ecn: 0,
                total_len: (ipv4::MIN_HEADER_LEN + segment.len()) as u16,
                ident: next_ident(),
                flags_frag: 0x4000, // don't fragment
                ttl: 64,
                protocol,
                src: s,
                dst: d,
                options: Vec::new(),
            };
            let mut pkt = hdr.encode();
            pkt.extend_from_slice(&segment);
            Ok(pkt)
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let hdr = Ipv6Header {
                traffic_class: 0,
                flow_label: 0,
                payload_len: segment.len() as u16,
                next_header: protocol,
                hop_limit: 64,
                src: s,
                dst: d,
                extensions: Vec::new(),
            };
            let mut pkt = hdr.encode();
            pkt.extend_from_slice(&segment);
            Ok(pkt)
        }
        _ => Err(StackError::Internal(
            "address family mismatch in packet builder".to_string(),
        )),
    }
}
