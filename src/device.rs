//! Per-device state and MUX packet dispatch.
//!
//! A `RemoteDevice` lives inside the reader task of the connection that
//! introduced it; that task is the only mutator. Everyone else talks to the
//! device through `DeviceCommand`s on the connection's command queue, with a
//! `DeviceHandle` as the opaque address.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{self, ClientMessage};
use crate::lockdown;
use crate::mux::{self, MuxHeader, Protocol, VersionPayload};
use crate::tcp::packets::TcpHeader;
use crate::tcp::{ChannelEvent, ChannelState, CloseReason, TcpChannel, TcpSegment};
use crate::WebmuxdError;

/// Source ports are allocated monotonically from here.
pub const FIRST_SOURCE_PORT: u16 = 1024;

/// Repeated magic mismatches tear the connection down.
const MAGIC_STRIKE_LIMIT: u32 = 3;

/// Requests routed to a device through its owning connection.
#[derive(Debug)]
pub enum DeviceCommand {
    OpenChannel {
        serial: String,
        destination_port: u16,
        events: mpsc::UnboundedSender<ChannelEvent>,
    },
    ChannelSend {
        serial: String,
        destination_port: u16,
        data: Vec<u8>,
    },
    CloseChannel {
        serial: String,
        destination_port: u16,
    },
}

/// What the rest of the system holds instead of the device itself.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub serial: String,
    pub properties: agent::DeviceConnected,
    pub commands: mpsc::Sender<DeviceCommand>,
    /// Id of the remote connection that introduced the device.
    pub owner: u64,
}

/// Write half of one channel, usable from any task.
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    serial: String,
    destination_port: u16,
    commands: mpsc::Sender<DeviceCommand>,
}

impl ChannelWriter {
    pub fn new(serial: String, destination_port: u16, commands: mpsc::Sender<DeviceCommand>) -> Self {
        Self {
            serial,
            destination_port,
            commands,
        }
    }

    pub async fn send(&self, data: Vec<u8>) -> Result<(), WebmuxdError> {
        self.commands
            .send(DeviceCommand::ChannelSend {
                serial: self.serial.clone(),
                destination_port: self.destination_port,
                data,
            })
            .await
            .map_err(|_| WebmuxdError::EndpointGone)
    }
}

#[derive(Debug)]
pub struct RemoteDevice {
    serial: String,
    properties: agent::DeviceConnected,
    tx: u16,
    rx: u16,
    next_source_port: u16,
    channels: HashMap<u16, TcpChannel>,
    version: Option<VersionPayload>,
    outbound: mpsc::Sender<ClientMessage>,
    magic_strikes: u32,
}

impl RemoteDevice {
    pub fn new(properties: agent::DeviceConnected, outbound: mpsc::Sender<ClientMessage>) -> Self {
        Self {
            serial: properties.serial_number.clone(),
            properties,
            tx: 0,
            rx: 0,
            next_source_port: FIRST_SOURCE_PORT,
            channels: HashMap::new(),
            version: None,
            outbound,
            magic_strikes: 0,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn handle(&self, commands: mpsc::Sender<DeviceCommand>, owner: u64) -> DeviceHandle {
        DeviceHandle {
            serial: self.serial.clone(),
            properties: self.properties.clone(),
            commands,
            owner,
        }
    }

    /// Composes one MUX frame and queues it for the agent. A Setup frame
    /// resets the counters before the header is formed; every frame
    /// advances `tx` after its header is stamped.
    pub async fn send_packet(
        &mut self,
        protocol: Protocol,
        payload: &[u8],
    ) -> Result<(), WebmuxdError> {
        if protocol == Protocol::Setup {
            self.rx = 0xFFFF;
            self.tx = 0x0000;
        }
        let header = MuxHeader::outbound(protocol, payload.len(), self.tx, self.rx);
        self.tx = self.tx.wrapping_add(1);

        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(payload);
        let message = ClientMessage::to_device(&self.serial, Uuid::new_v4().to_string(), frame);
        self.outbound
            .send(message)
            .await
            .map_err(|_| WebmuxdError::EndpointGone)
    }

    pub async fn send_version(&mut self) -> Result<(), WebmuxdError> {
        self.send_packet(Protocol::Version, &mux::encode_version_payload())
            .await
    }

    /// Dispatches one agent payload. Frames may be batched; each is
    /// consumed in order. On the first Version frame the device performs
    /// its Setup handshake and opens the lockdown channel, whose event
    /// queue is handed back for the caller to service.
    pub async fn receive_data(
        &mut self,
        data: &[u8],
    ) -> Result<Option<mpsc::UnboundedReceiver<ChannelEvent>>, WebmuxdError> {
        let mut lockdown_events = None;
        let mut offset = 0;
        while offset < data.len() {
            let rest = &data[offset..];
            let header = MuxHeader::decode(rest)?;
            let payload = &rest[mux::HEADER_SIZE..header.length as usize];
            offset += header.length as usize;

            let protocol = Protocol::from_u32(header.protocol);
            if protocol != Some(Protocol::Version) {
                self.rx = header.rx;
                if header.magic != mux::MAGIC_INBOUND {
                    warn!(
                        serial = %self.serial,
                        magic = header.magic,
                        "dropping mux frame with bad magic"
                    );
                    self.magic_strikes += 1;
                    if self.magic_strikes >= MAGIC_STRIKE_LIMIT {
                        return Err(WebmuxdError::BadMagic(header.magic));
                    }
                    continue;
                }
            }

            match protocol {
                Some(Protocol::Version) => {
                    if let Some(events) = self.receive_version(payload).await? {
                        lockdown_events = Some(events);
                    }
                }
                Some(Protocol::Control) => self.receive_control(payload),
                Some(Protocol::Tcp) => self.receive_tcp(payload).await?,
                Some(Protocol::Setup) | None => {
                    debug!(
                        serial = %self.serial,
                        protocol = header.protocol,
                        "ignoring unexpected mux frame"
                    );
                }
            }
        }
        Ok(lockdown_events)
    }

    async fn receive_version(
        &mut self,
        payload: &[u8],
    ) -> Result<Option<mpsc::UnboundedReceiver<ChannelEvent>>, WebmuxdError> {
        if self.version.is_some() {
            debug!(serial = %self.serial, "ignoring repeated version frame");
            return Ok(None);
        }
        let version = VersionPayload::decode(payload)?;
        info!(
            serial = %self.serial,
            major = version.major,
            minor = version.minor,
            "device reported mux version"
        );
        self.version = Some(version);
        self.send_packet(Protocol::Setup, &[0x05]).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.open_channel(lockdown::LOCKDOWN_PORT, events_tx).await?;
        Ok(Some(events_rx))
    }

    fn receive_control(&self, payload: &[u8]) {
        match mux::decode_control(payload) {
            Ok((kind, message)) => {
                let message = String::from_utf8_lossy(message);
                match kind {
                    mux::ControlType::Error => {
                        warn!(serial = %self.serial, %message, "device error")
                    }
                    mux::ControlType::Warning => {
                        warn!(serial = %self.serial, %message, "device warning")
                    }
                    mux::ControlType::Info => {
                        info!(serial = %self.serial, %message, "device info")
                    }
                }
            }
            Err(_) => warn!(serial = %self.serial, "unparseable control frame"),
        }
    }

    async fn receive_tcp(&mut self, payload: &[u8]) -> Result<(), WebmuxdError> {
        let (header, data) = TcpHeader::parse(payload)?;
        // Our destination port is the remote's source port.
        let port = header.source_port;
        let (segments, state) = match self.channels.get_mut(&port) {
            Some(channel) => {
                let segments = channel.receive_packet(&header, data);
                (segments, channel.state())
            }
            None => {
                warn!(serial = %self.serial, port, "tcp frame for unknown channel");
                return Ok(());
            }
        };
        for segment in segments {
            self.send_tcp_segment(segment).await?;
        }
        if matches!(state, ChannelState::Closed | ChannelState::Refused) {
            self.channels.remove(&port);
            debug!(serial = %self.serial, port, "channel removed");
        }
        Ok(())
    }

    /// Opens a channel to `destination_port` and transmits its SYN. Channels
    /// only exist after the Version/Setup handshake.
    pub async fn open_channel(
        &mut self,
        destination_port: u16,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<(), WebmuxdError> {
        if self.version.is_none() {
            warn!(
                serial = %self.serial,
                port = destination_port,
                "channel requested before the handshake completed"
            );
            let _ = events.send(ChannelEvent::Closed(CloseReason::Refused));
            return Ok(());
        }
        if self.channels.contains_key(&destination_port) {
            warn!(
                serial = %self.serial,
                port = destination_port,
                "destination port already has a live channel"
            );
            let _ = events.send(ChannelEvent::Closed(CloseReason::Refused));
            return Ok(());
        }
        let source_port = self.next_source_port;
        self.next_source_port = self.next_source_port.wrapping_add(1);
        let (channel, syn) = TcpChannel::new(source_port, destination_port, events);
        self.channels.insert(destination_port, channel);
        self.send_tcp_segment(syn).await
    }

    pub async fn channel_send(
        &mut self,
        destination_port: u16,
        data: Vec<u8>,
    ) -> Result<(), WebmuxdError> {
        let segment = match self.channels.get_mut(&destination_port) {
            Some(channel) => channel.send(data),
            None => {
                warn!(
                    serial = %self.serial,
                    port = destination_port,
                    "send for unknown channel"
                );
                return Ok(());
            }
        };
        if let Some(segment) = segment {
            self.send_tcp_segment(segment).await?;
        }
        Ok(())
    }

    /// Destroys a channel from this side with an RST.
    pub async fn close_channel(&mut self, destination_port: u16) -> Result<(), WebmuxdError> {
        if let Some(mut channel) = self.channels.remove(&destination_port) {
            let rst = channel.abort();
            self.send_tcp_segment(rst).await?;
        }
        Ok(())
    }

    async fn send_tcp_segment(&mut self, segment: TcpSegment) -> Result<(), WebmuxdError> {
        self.send_packet(Protocol::Tcp, &segment.encode()).await
    }
}
