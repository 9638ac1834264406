//! Remote usbmuxd bridge.
//!
//! Local processes speak the Apple usbmuxd protocol on a Unix socket as if a
//! device were attached to this machine; the bridge forwards the traffic over
//! a WebSocket to a remote agent that holds the physical device. Three
//! framings are terminated here: usbmuxd towards local clients, the MUX
//! packet layer towards the agent, and the TCP-shaped streams inside it.

use thiserror::Error;

pub mod agent;
pub mod device;
pub mod hub;
pub mod local;
pub mod lockdown;
pub mod mux;
pub mod plist_service;
pub mod remote;
pub mod tcp;
pub mod usbmuxd;

#[derive(Debug, Error)]
pub enum WebmuxdError {
    #[error("socket io failed")]
    Socket(#[from] std::io::Error),
    #[error("websocket transport failed")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("io on plist")]
    Plist(#[from] plist::Error),
    #[error("protobuf decode failed")]
    Protobuf(#[from] prost::DecodeError),
    #[error("malformed {0} frame")]
    MalformedFrame(&'static str),
    #[error("unsupported usbmuxd version {0}")]
    UnsupportedVersion(u32),
    #[error("mux magic mismatch {0:#010x}")]
    BadMagic(u32),
    #[error("endpoint is gone")]
    EndpointGone,
}
