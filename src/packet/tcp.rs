//! TCP header codec, typed flags and wrap-around sequence arithmetic

use crate::error::{Result, StackError};

/// Minimum TCP header size (no options)
pub const MIN_HEADER_LEN: usize = 20;

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_WINDOW_SCALE: u8 = 3;
const OPT_SACK_PERMITTED: u8 = 4;
const OPT_TIMESTAMPS: u8 = 8;

/// TCP control flags, including the ECN bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn syn_only() -> Self {
        Self { syn: true, ..Default::default() }
    }
    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn rst_only() -> Self {
        Self { rst: true, ..Default::default() }
    }
    pub fn rst_ack() -> Self {
        Self { rst: true, ack: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        if self.urg { flags |= 0x20; }
        if self.ece { flags |= 0x40; }
        if self.cwr { flags |= 0x80; }
        flags
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            fin: byte & 0x01 != 0,
            syn: byte & 0x02 != 0,
            rst: byte & 0x04 != 0,
            psh: byte & 0x08 != 0,
            ack: byte & 0x10 != 0,
            urg: byte & 0x20 != 0,
            ece: byte & 0x40 != 0,
            cwr: byte & 0x80 != 0,
        }
    }
}

/// Options this stack understands. Anything else is skipped on decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    /// (TSval, TSecr)
    pub timestamp: Option<(u32, u32)>,
}

impl TcpOptions {
    pub fn is_empty(&self) -> bool {
        self.mss.is_none()
            && self.window_scale.is_none()
            && !self.sack_permitted
            && self.timestamp.is_none()
    }

    fn raw_len(&self) -> usize {
        let mut len = 0;
        if self.mss.is_some() { len += 4; }
        if self.window_scale.is_some() { len += 3; }
        if self.sack_permitted { len += 2; }
        if self.timestamp.is_some() { len += 10; }
        len
    }

    /// Encoded length padded to a 4-byte boundary
    pub fn encoded_len(&self) -> usize {
        (self.raw_len() + 3) & !3
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        if let Some(mss) = self.mss {
            buf.push(OPT_MSS);
            buf.push(4);
            buf.extend_from_slice(&mss.to_be_bytes());
        }
        if let Some(scale) = self.window_scale {
            buf.push(OPT_WINDOW_SCALE);
            buf.push(3);
            buf.push(scale);
        }
        if self.sack_permitted {
            buf.push(OPT_SACK_PERMITTED);
            buf.push(2);
        }
        if let Some((tsval, tsecr)) = self.timestamp {
            buf.push(OPT_TIMESTAMPS);
            buf.push(10);
            buf.extend_from_slice(&tsval.to_be_bytes());
            buf.extend_from_slice(&tsecr.to_be_bytes());
        }
        while buf.len() % 4 != 0 {
            buf.push(OPT_NOP);
        }
    }

    fn decode(opts: &[u8]) -> Self {
        let mut out = Self::default();
        let mut i = 0;
        while i < opts.len() {
            match opts[i] {
                OPT_END => break,
                OPT_NOP => i += 1,
                OPT_MSS if i + 4 <= opts.len() => {
                    out.mss = Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
                    i += 4;
                }
                OPT_WINDOW_SCALE if i + 3 <= opts.len() => {
                    out.window_scale = Some(opts[i + 2]);
                    i += 3;
                }
                OPT_SACK_PERMITTED if i + 2 <= opts.len() => {
                    out.sack_permitted = true;
                    i += 2;
                }
                OPT_TIMESTAMPS if i + 10 <= opts.len() => {
                    out.timestamp = Some((
                        u32::from_be_bytes([opts[i + 2], opts[i + 3], opts[i + 4], opts[i + 5]]),
                        u32::from_be_bytes([opts[i + 6], opts[i + 7], opts[i + 8], opts[i + 9]]),
                    ));
                    i += 10;
                }
                _ => {
                    // skip unknown option by its length byte
                    if i + 1 < opts.len() && opts[i + 1] >= 2 {
                        i += opts[i + 1] as usize;
                    } else {
                        break;
                    }
                }
            }
        }
        out
    }
}

/// Decoded TCP header. The checksum is not stored; whole-packet builders
/// compute it over the pseudo-header, verification happens at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub urgent: u16,
    pub options: TcpOptions,
}

impl TcpHeader {
    pub fn header_len(&self) -> usize {
        MIN_HEADER_LEN + self.options.encoded_len()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_HEADER_LEN {
            return Err(StackError::PacketTooShort {
                expected: MIN_HEADER_LEN,
                actual: data.len(),
            });
        }
        let data_offset = ((data[12] >> 4) as usize) * 4;
        if data_offset < MIN_HEADER_LEN {
            return Err(StackError::MalformedHeader(format!(
                "TCP data offset {} below minimum",
                data_offset
            )));
        }
        if data_offset > data.len() {
            return Err(StackError::PacketTooShort {
                expected: data_offset,
                actual: data.len(),
            });
        }

        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: TcpFlags::from_byte(data[13]),
            window: u16::from_be_bytes([data[14], data[15]]),
            urgent: u16::from_be_bytes([data[18], data[19]]),
            options: TcpOptions::decode(&data[MIN_HEADER_LEN..data_offset]),
        })
    }

    /// Encode with a zeroed checksum field; the packet builder patches it
    /// in after the pseudo-header sum.
    pub fn encode(&self) -> Vec<u8> {
        let header_len = self.header_len();
        let mut buf = Vec::with_capacity(header_len);
        buf.extend_from_slice(&self.src_port.to_be_bytes());
        buf.extend_from_slice(&self.dst_port.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.ack.to_be_bytes());
        buf.push(((header_len / 4) as u8) << 4);
        buf.push(self.flags.to_byte());
        buf.extend_from_slice(&self.window.to_be_bytes());
        buf.extend_from_slice(&[0, 0]); // checksum
        buf.extend_from_slice(&self.urgent.to_be_bytes());
        self.options.encode_into(&mut buf);
        debug_assert_eq!(buf.len(), header_len);
        buf
    }
}

/// True when `a` precedes `b` in wrap-around sequence space.
pub fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// True when `a` follows `b` in wrap-around sequence space.
pub fn seq_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

pub fn seq_before_or_eq(a: u32, b: u32) -> bool {
    a == b || seq_before(a, b)
}
