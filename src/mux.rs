//! MUX packet layer carried inside each agent message.
//!
//! A 16-byte big-endian header classifies the frame (Version, Control, Setup
//! or TCP) and carries the per-device sequence counters. `length` includes
//! the header. Outbound frames are stamped `0xFEEDFACE`; the device answers
//! with `0xFACEFACE`. Version frames predate the magic and are exempt.

use tracing::debug;

use crate::WebmuxdError;

pub const HEADER_SIZE: usize = 16;

pub const MAGIC_OUTBOUND: u32 = 0xFEEDFACE;
pub const MAGIC_INBOUND: u32 = 0xFACEFACE;

pub const VERSION_MAJOR: u32 = 2;
pub const VERSION_MINOR: u32 = 8;
pub const VERSION_PAYLOAD_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Protocol {
    Version = 0,
    Control = 1,
    Setup = 2,
    Tcp = 6,
}

impl Protocol {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Protocol::Version,
            1 => Protocol::Control,
            2 => Protocol::Setup,
            6 => Protocol::Tcp,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxHeader {
    pub protocol: u32,
    pub length: u32,
    pub magic: u32,
    pub tx: u16,
    pub rx: u16,
}

impl MuxHeader {
    pub fn outbound(protocol: Protocol, payload_len: usize, tx: u16, rx: u16) -> Self {
        Self {
            protocol: protocol as u32,
            length: (HEADER_SIZE + payload_len) as u32,
            magic: MAGIC_OUTBOUND,
            tx,
            rx,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.protocol.to_be_bytes());
        buf[4..8].copy_from_slice(&self.length.to_be_bytes());
        buf[8..12].copy_from_slice(&self.magic.to_be_bytes());
        buf[12..14].copy_from_slice(&self.tx.to_be_bytes());
        buf[14..16].copy_from_slice(&self.rx.to_be_bytes());
        buf
    }

    /// Parses a header from the front of `buf`. A frame whose declared
    /// length is shorter than the header or longer than the buffer is
    /// rejected whole; nothing of it is dispatched.
    pub fn decode(buf: &[u8]) -> Result<Self, WebmuxdError> {
        if buf.len() < HEADER_SIZE {
            return Err(WebmuxdError::MalformedFrame("mux"));
        }
        let header = Self {
            protocol: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            length: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            magic: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            tx: u16::from_be_bytes(buf[12..14].try_into().unwrap()),
            rx: u16::from_be_bytes(buf[14..16].try_into().unwrap()),
        };
        if (header.length as usize) < HEADER_SIZE || header.length as usize > buf.len() {
            debug!(
                "mux header claims {} bytes, buffer holds {}",
                header.length,
                buf.len()
            );
            return Err(WebmuxdError::MalformedFrame("mux"));
        }
        Ok(header)
    }
}

/// Fixed Version payload: `major=2`, `minor=8`, `padding=0`.
pub fn encode_version_payload() -> [u8; VERSION_PAYLOAD_SIZE] {
    let mut buf = [0u8; VERSION_PAYLOAD_SIZE];
    buf[0..4].copy_from_slice(&VERSION_MAJOR.to_be_bytes());
    buf[4..8].copy_from_slice(&VERSION_MINOR.to_be_bytes());
    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionPayload {
    pub major: u32,
    pub minor: u32,
    pub padding: u32,
}

impl VersionPayload {
    pub fn decode(buf: &[u8]) -> Result<Self, WebmuxdError> {
        if buf.len() < VERSION_PAYLOAD_SIZE {
            return Err(WebmuxdError::MalformedFrame("mux version"));
        }
        Ok(Self {
            major: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            minor: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            padding: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Error,
    Warning,
    Info,
}

/// Splits a Control payload into its severity byte and message bytes.
pub fn decode_control(payload: &[u8]) -> Result<(ControlType, &[u8]), WebmuxdError> {
    let kind = match payload.first() {
        Some(0x03) => ControlType::Error,
        Some(0x05) => ControlType::Warning,
        Some(0x07) => ControlType::Info,
        _ => return Err(WebmuxdError::MalformedFrame("mux control")),
    };
    Ok((kind, &payload[1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = MuxHeader::outbound(Protocol::Tcp, 20, 3, 7);
        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(&[0u8; 20]);
        let decoded = MuxHeader::decode(&frame).unwrap();
        assert_eq!(header, decoded);
        assert_eq!(decoded.magic, MAGIC_OUTBOUND);
    }

    #[test]
    fn oversized_length_rejected() {
        let header = MuxHeader::outbound(Protocol::Control, 64, 0, 0);
        // claims 80 bytes but only the header is present
        assert!(MuxHeader::decode(&header.encode()).is_err());
    }

    #[test]
    fn undersized_length_rejected() {
        let mut buf = MuxHeader::outbound(Protocol::Version, 0, 0, 0).encode();
        buf[4..8].copy_from_slice(&4u32.to_be_bytes());
        assert!(MuxHeader::decode(&buf).is_err());
    }

    #[test]
    fn version_payload_layout() {
        let buf = encode_version_payload();
        assert_eq!(&buf[0..4], &[0, 0, 0, 2]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 8]);
        let decoded = VersionPayload::decode(&buf).unwrap();
        assert_eq!(decoded.major, VERSION_MAJOR);
        assert_eq!(decoded.minor, VERSION_MINOR);
        assert_eq!(decoded.padding, 0);
    }

    #[test]
    fn control_payload_split() {
        let (kind, message) = decode_control(&[0x03, b'n', b'o']).unwrap();
        assert_eq!(kind, ControlType::Error);
        assert_eq!(message, b"no");
        assert!(decode_control(&[]).is_err());
        assert!(decode_control(&[0x01]).is_err());
    }
}
