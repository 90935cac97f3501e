//! IPv6 header codec with a bounded extension-header chain

use crate::error::{Result, StackError};
use std::net::Ipv6Addr;

/// Fixed IPv6 header size
pub const FIXED_HEADER_LEN: usize = 40;

/// Upper bound on the extension-header walk. Adversarial packets can
/// otherwise chain headers up to the buffer length.
pub const MAX_EXTENSION_HEADERS: usize = 8;

const EXT_HOP_BY_HOP: u8 = 0;
const EXT_ROUTING: u8 = 43;
const EXT_FRAGMENT: u8 = 44;
const EXT_DEST_OPTS: u8 = 60;

fn is_extension(kind: u8) -> bool {
    matches!(kind, EXT_HOP_BY_HOP | EXT_ROUTING | EXT_FRAGMENT | EXT_DEST_OPTS)
}

/// One extension header, kept as its raw on-wire block so encoding is
/// byte-identical. `bytes[0]` is the next-header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionHeader {
    pub kind: u8,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Header {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub payload_len: u16,
    /// Next-header byte of the fixed header (first link in the chain)
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub extensions: Vec<ExtensionHeader>,
}

impl Ipv6Header {
    /// Protocol of the upper layer after walking the extension chain.
    pub fn protocol(&self) -> u8 {
        match self.extensions.last() {
            Some(ext) => ext.bytes[0],
            None => self.next_header,
        }
    }

    pub fn extension_len(&self) -> usize {
        self.extensions.iter().map(|e| e.bytes.len()).sum()
    }

    pub fn header_len(&self) -> usize {
        FIXED_HEADER_LEN + self.extension_len()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(StackError::PacketTooShort {
                expected: FIXED_HEADER_LEN,
                actual: data.len(),
            });
        }
        let version = data[0] >> 4;
        if version != 6 {
            return Err(StackError::InvalidIpVersion(version));
        }
        let payload_len = u16::from_be_bytes([data[4], data[5]]);
        let declared_end = FIXED_HEADER_LEN + payload_len as usize;
        if declared_end > data.len() {
            return Err(StackError::PacketTooShort {
                expected: declared_end,
                actual: data.len(),
            });
        }

        let mut src = [0u8; 16];
        src.copy_from_slice(&data[8..24]);
        let mut dst = [0u8; 16];
        dst.copy_from_slice(&data[24..40]);

        let next_header = data[6];
        let mut extensions = Vec::new();
        let mut kind = next_header;
        let mut offset = FIXED_HEADER_LEN;
        while is_extension(kind) {
            if extensions.len() >= MAX_EXTENSION_HEADERS {
                return Err(StackError::ExtensionChainInvalid(format!(
                    "more than {} extension headers",
                    MAX_EXTENSION_HEADERS
                )));
            }
            if offset + 8 > declared_end {
                return Err(StackError::ExtensionChainInvalid(
                    "extension header truncated".to_string(),
                ));
            }
            // Fragment headers are a fixed 8 bytes; the others carry a
            // length field counting additional 8-octet units.
            let len = if kind == EXT_FRAGMENT {
                8
            } else {
                8 * (data[offset + 1] as usize + 1)
            };
            if offset + len > declared_end {
                return Err(StackError::ExtensionChainInvalid(format!(
                    "extension header of {} bytes exceeds payload",
                    len
                )));
            }
            extensions.push(ExtensionHeader {
                kind,
                bytes: data[offset..offset + len].to_vec(),
            });
            kind = data[offset];
            offset += len;
        }

        let chain_len = offset - FIXED_HEADER_LEN;
        if chain_len % 8 != 0 {
            return Err(StackError::ExtensionChainInvalid(format!(
                "chain length {} not a multiple of 8",
                chain_len
            )));
        }

        Ok(Self {
            traffic_class: (data[0] << 4) | (data[1] >> 4),
            flow_label: u32::from_be_bytes([0, data[1] & 0x0F, data[2], data[3]]),
            payload_len,
            next_header,
            hop_limit: data[7],
            src: Ipv6Addr::from(src),
            dst: Ipv6Addr::from(dst),
            extensions,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header_len());
        buf.push(0x60 | (self.traffic_class >> 4));
        buf.push((self.traffic_class << 4) | ((self.flow_label >> 16) as u8 & 0x0F));
        buf.push((self.flow_label >> 8) as u8);
        buf.push(self.flow_label as u8);
        buf.extend_from_slice(&self.payload_len.to_be_bytes());
        buf.push(self.next_header);
        buf.push(self.hop_limit);
        buf.extend_from_slice(&self.src.octets());
        buf.extend_from_slice(&self.dst.octets());
        for ext in &self.extensions {
            buf.extend_from_slice(&ext.bytes);
        }
        buf
    }
}
