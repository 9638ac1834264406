//! usbmuxd wire protocol spoken to local clients.
//!
//! Every message starts with a 16-byte little-endian header whose `length`
//! field includes the header itself. Version 0 carries the fixed binary
//! payloads, version 1 wraps a property list.

use tracing::debug;

use crate::WebmuxdError;

pub mod des;

pub const HEADER_SIZE: usize = 16;

pub const BINARY_PLIST_VERSION: u32 = 0;
pub const XML_PLIST_VERSION: u32 = 1;

/// Notifications are unsolicited and carry no request tag.
pub const BROADCAST_TAG: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Message {
    Result = 1,
    Connect = 2,
    Listen = 3,
    DeviceAdd = 4,
    DeviceRemove = 5,
    DevicePaired = 6,
    Plist = 8,
}

impl Message {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Message::Result,
            2 => Message::Connect,
            3 => Message::Listen,
            4 => Message::DeviceAdd,
            5 => Message::DeviceRemove,
            6 => Message::DevicePaired,
            8 => Message::Plist,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    Ok = 0,
    BadCommand = 1,
    BadDevice = 2,
    ConnectionRefused = 3,
    BadVersion = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length: u32,
    pub version: u32,
    pub message: u32,
    pub tag: u32,
}

impl Header {
    pub fn new(payload_len: usize, version: u32, message: Message, tag: u32) -> Self {
        Self {
            length: (HEADER_SIZE + payload_len) as u32,
            version,
            message: message as u32,
            tag,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.message.to_le_bytes());
        buf[12..16].copy_from_slice(&self.tag.to_le_bytes());
        buf
    }

    /// Parses a header from the front of `buf`. The declared length must
    /// cover at least the header itself; shorter claims are malformed.
    pub fn decode(buf: &[u8]) -> Result<Self, WebmuxdError> {
        if buf.len() < HEADER_SIZE {
            return Err(WebmuxdError::MalformedFrame("usbmuxd"));
        }
        let header = Self {
            length: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            version: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            message: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            tag: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        };
        if (header.length as usize) < HEADER_SIZE {
            debug!("usbmuxd header claims {} bytes", header.length);
            return Err(WebmuxdError::MalformedFrame("usbmuxd"));
        }
        Ok(header)
    }
}

/// Binary `Result` frame: header plus a 4-byte result code.
pub fn encode_result(version: u32, tag: u32, code: ResultCode) -> Vec<u8> {
    let header = Header::new(4, version, Message::Result, tag);
    let mut frame = header.encode().to_vec();
    frame.extend_from_slice(&(code as u32).to_le_bytes());
    frame
}

/// Binary `Connect` payload: `device_id(u32)`, `port(u16)`, `reserved(u16)`.
pub fn decode_connect_payload(buf: &[u8]) -> Result<(u32, u16), WebmuxdError> {
    if buf.len() < 8 {
        return Err(WebmuxdError::MalformedFrame("usbmuxd connect"));
    }
    let device_id = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let port = u16::from_le_bytes(buf[4..6].try_into().unwrap());
    Ok((device_id, port))
}

/// Binary `DeviceAdd` payload, the version-0 counterpart of an `Attached`
/// property list: `device_id(u32)`, `product_id(u16)`, `serial[256]`,
/// `padding(u16)`, `location(u32)`.
pub fn encode_device_add(
    version: u32,
    device_id: u32,
    product_id: u16,
    location_id: u32,
    serial_number: &str,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(268);
    payload.extend_from_slice(&device_id.to_le_bytes());
    payload.extend_from_slice(&product_id.to_le_bytes());
    let mut serial = [0u8; 256];
    let bytes = serial_number.as_bytes();
    let len = bytes.len().min(255);
    serial[..len].copy_from_slice(&bytes[..len]);
    payload.extend_from_slice(&serial);
    payload.extend_from_slice(&0u16.to_le_bytes());
    payload.extend_from_slice(&location_id.to_le_bytes());

    let header = Header::new(payload.len(), version, Message::DeviceAdd, BROADCAST_TAG);
    let mut frame = header.encode().to_vec();
    frame.extend_from_slice(&payload);
    frame
}

/// Binary `DeviceRemove` payload is the bare device id.
pub fn encode_device_remove(version: u32, device_id: u32) -> Vec<u8> {
    let header = Header::new(4, version, Message::DeviceRemove, BROADCAST_TAG);
    let mut frame = header.encode().to_vec();
    frame.extend_from_slice(&device_id.to_le_bytes());
    frame
}

/// Wraps an XML property list body in a version-1 `Plist` frame.
pub fn encode_plist<T: serde::Serialize>(tag: u32, body: &T) -> Result<Vec<u8>, WebmuxdError> {
    let mut payload = Vec::new();
    plist::to_writer_xml(&mut payload, body)?;
    let header = Header::new(payload.len(), XML_PLIST_VERSION, Message::Plist, tag);
    let mut frame = header.encode().to_vec();
    frame.extend_from_slice(&payload);
    Ok(frame)
}
