//! IPv4 header codec

use crate::error::{Result, StackError};
use crate::packet::checksum::internet_checksum;
use std::net::Ipv4Addr;

/// Minimum IPv4 header size (no options)
pub const MIN_HEADER_LEN: usize = 20;

/// Decoded IPv4 header. The checksum field is not stored; `encode`
/// recomputes it, `verify_checksum` validates the on-wire value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub dscp_ecn: u8,
    pub total_len: u16,
    pub ident: u16,
    pub flags_frag: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// Raw option bytes, length a multiple of 4
    pub options: Vec<u8>,
}

impl Ipv4Header {
    pub fn header_len(&self) -> usize {
        MIN_HEADER_LEN + self.options.len()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_HEADER_LEN {
            return Err(StackError::PacketTooShort {
                expected: MIN_HEADER_LEN,
                actual: data.len(),
            });
        }
        let version = data[0] >> 4;
        if version != 4 {
            return Err(StackError::InvalidIpVersion(version));
        }
        let ihl = ((data[0] & 0x0F) as usize) * 4;
        if ihl < MIN_HEADER_LEN {
            return Err(StackError::MalformedHeader(format!(
                "IPv4 IHL {} below minimum",
                ihl
            )));
        }
        if ihl > data.len() {
            return Err(StackError::PacketTooShort {
                expected: ihl,
                actual: data.len(),
            });
        }
        let total_len = u16::from_be_bytes([data[2], data[3]]);
        if (total_len as usize) < ihl {
            return Err(StackError::MalformedHeader(format!(
                "IPv4 total length {} shorter than header {}",
                total_len, ihl
            )));
        }

        Ok(Self {
            dscp_ecn: data[1],
            total_len,
            ident: u16::from_be_bytes([data[4], data[5]]),
            flags_frag: u16::from_be_bytes([data[6], data[7]]),
            ttl: data[8],
            protocol: data[9],
            src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            options: data[MIN_HEADER_LEN..ihl].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let ihl = self.header_len();
        let mut buf = vec![0u8; ihl];
        buf[0] = 0x40 | ((ihl / 4) as u8);
        buf[1] = self.dscp_ecn;
        buf[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        buf[4..6].copy_from_slice(&self.ident.to_be_bytes());
        buf[6..8].copy_from_slice(&self.flags_frag.to_be_bytes());
        buf[8] = self.ttl;
        buf[9] = self.protocol;
        buf[12..16].copy_from_slice(&self.src.octets());
        buf[16..20].copy_from_slice(&self.dst.octets());
        buf[MIN_HEADER_LEN..ihl].copy_from_slice(&self.options);

        let cksum = internet_checksum(&buf);
        buf[10..12].copy_from_slice(&cksum.to_be_bytes());
        buf
    }

    /// Validate the header checksum over the on-wire bytes.
    pub fn verify_checksum(data: &[u8]) -> bool {
        if data.len() < MIN_HEADER_LEN {
            return false;
        }
        let ihl = ((data[0] & 0x0F) as usize) * 4;
        if ihl < MIN_HEADER_LEN || ihl > data.len() {
            return false;
        }
        internet_checksum(&data[..ihl]) == 0
    }
}
