//! Inner TCP header codec.
//!
//! The streams inside a device are TCP-shaped but private: the data offset is
//! always 5 words, options never appear, and checksum/urgent travel as zero.

use crate::WebmuxdError;

pub const HEADER_SIZE: usize = 20;

const DATA_OFFSET_WORDS: u16 = 5;
const FLAGS_MASK: u16 = 0x7F;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub const FIN: u16 = 0x01;
    pub const SYN: u16 = 0x02;
    pub const RST: u16 = 0x04;
    pub const PSH: u16 = 0x08;
    pub const ACK: u16 = 0x10;
    pub const URG: u16 = 0x20;

    pub fn from_bits(flags: u16) -> Self {
        Self {
            fin: (flags & Self::FIN) != 0,
            syn: (flags & Self::SYN) != 0,
            rst: (flags & Self::RST) != 0,
            psh: (flags & Self::PSH) != 0,
            ack: (flags & Self::ACK) != 0,
            urg: (flags & Self::URG) != 0,
        }
    }

    pub fn to_bits(self) -> u16 {
        let mut flags = 0;
        if self.fin {
            flags |= Self::FIN;
        }
        if self.syn {
            flags |= Self::SYN;
        }
        if self.rst {
            flags |= Self::RST;
        }
        if self.psh {
            flags |= Self::PSH;
        }
        if self.ack {
            flags |= Self::ACK;
        }
        if self.urg {
            flags |= Self::URG;
        }
        flags
    }

    pub fn ack() -> Self {
        Self {
            ack: true,
            ..Default::default()
        }
    }

    pub fn syn() -> Self {
        Self {
            syn: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}

impl TcpHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let offset_flags = (DATA_OFFSET_WORDS << 12) | self.flags.to_bits();
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.source_port.to_be_bytes());
        buf[2..4].copy_from_slice(&self.destination_port.to_be_bytes());
        buf[4..8].copy_from_slice(&self.sequence.to_be_bytes());
        buf[8..12].copy_from_slice(&self.acknowledgement.to_be_bytes());
        buf[12..14].copy_from_slice(&offset_flags.to_be_bytes());
        buf[14..16].copy_from_slice(&self.window.to_be_bytes());
        buf[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        buf[18..20].copy_from_slice(&self.urgent.to_be_bytes());
        buf
    }

    /// Splits a TCP-over-MUX payload into its header and trailing data.
    pub fn parse(packet: &[u8]) -> Result<(Self, &[u8]), WebmuxdError> {
        if packet.len() < HEADER_SIZE {
            return Err(WebmuxdError::MalformedFrame("tcp"));
        }
        let offset_flags = u16::from_be_bytes(packet[12..14].try_into().unwrap());
        let header = Self {
            source_port: u16::from_be_bytes(packet[0..2].try_into().unwrap()),
            destination_port: u16::from_be_bytes(packet[2..4].try_into().unwrap()),
            sequence: u32::from_be_bytes(packet[4..8].try_into().unwrap()),
            acknowledgement: u32::from_be_bytes(packet[8..12].try_into().unwrap()),
            flags: TcpFlags::from_bits(offset_flags & FLAGS_MASK),
            window: u16::from_be_bytes(packet[14..16].try_into().unwrap()),
            checksum: u16::from_be_bytes(packet[16..18].try_into().unwrap()),
            urgent: u16::from_be_bytes(packet[18..20].try_into().unwrap()),
        };
        Ok((header, &packet[HEADER_SIZE..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip() {
        for bits in 0..0x40u16 {
            assert_eq!(TcpFlags::from_bits(bits).to_bits(), bits);
        }
    }

    #[test]
    fn header_round_trip() {
        let header = TcpHeader {
            source_port: 1024,
            destination_port: 0xF27E,
            sequence: 420,
            acknowledgement: 6969,
            flags: TcpFlags {
                syn: true,
                ack: true,
                ..Default::default()
            },
            window: 512,
            checksum: 0,
            urgent: 0,
        };
        let mut packet = header.encode().to_vec();
        packet.extend_from_slice(&[1, 2, 3]);
        let (decoded, payload) = TcpHeader::parse(&packet).unwrap();
        assert_eq!(header, decoded);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn data_offset_packed_high() {
        let header = TcpHeader {
            source_port: 1,
            destination_port: 2,
            sequence: 0,
            acknowledgement: 0,
            flags: TcpFlags::ack(),
            window: 512,
            checksum: 0,
            urgent: 0,
        };
        let buf = header.encode();
        assert_eq!(buf[12] >> 4, 5);
        assert_eq!(buf[13], TcpFlags::ACK as u8);
    }

    #[test]
    fn short_packet_rejected() {
        assert!(TcpHeader::parse(&[0u8; 19]).is_err());
    }
}
