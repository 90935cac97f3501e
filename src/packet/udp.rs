//! UDP header codec

use crate::error::{Result, StackError};

/// UDP header size
pub const HEADER_LEN: usize = 8;

/// Decoded UDP header. The checksum is verified at parse time and
/// recomputed by the packet builders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// Header plus payload length as declared on the wire
    pub length: u16,
}

impl UdpHeader {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(StackError::PacketTooShort {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }
        let length = u16::from_be_bytes([data[4], data[5]]);
        if (length as usize) < HEADER_LEN {
            return Err(StackError::MalformedHeader(format!(
                "UDP length {} below header size",
                length
            )));
        }
        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            length,
        })
    }

    /// Encode with a zeroed checksum field.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        buf[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        buf[4..6].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize - HEADER_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let hdr = UdpHeader { src_port: 5353, dst_port: 53, length: 40 };
        let bytes = hdr.encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        let decoded = UdpHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(decoded.payload_len(), 32);
    }

    #[test]
    fn short_buffer_rejected() {
        assert!(matches!(
            UdpHeader::decode(&[0u8; 7]),
            Err(StackError::PacketTooShort { .. })
        ));
    }

    #[test]
    fn undersized_length_rejected() {
        let bytes = [0, 53, 0, 53, 0, 4, 0, 0];
        assert!(matches!(
            UdpHeader::decode(&bytes),
            Err(StackError::MalformedHeader(_))
        ));
    }
}
