//! One local usbmuxd client.
//!
//! The conversation starts in command mode: framed usbmuxd requests answered
//! on the same socket. A successful `Connect` turns the socket into the pipe
//! of one device channel; from then on bytes flow raw in both directions.
//!
//! Device identifiers handed to a client are 1-based indices private to that
//! client, assigned over a sorted snapshot of the hub's registry the first
//! time an operation needs them and extended as attach events arrive.

use std::collections::BTreeMap;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::device::{DeviceCommand, DeviceHandle};
use crate::hub::{ClientEvent, HubHandle};
use crate::tcp::{ChannelEvent, CloseReason};
use crate::usbmuxd::{self, des, Header, Message, ResultCode};
use crate::WebmuxdError;

const READ_BUFFER_SIZE: usize = 1024;
const VERSION_STRIKE_LIMIT: u32 = 3;

/// Per-client projection of the hub's device registry.
#[derive(Debug)]
struct DeviceMap {
    by_index: BTreeMap<u32, DeviceHandle>,
    next_index: u32,
}

impl DeviceMap {
    fn from_snapshot(snapshot: Vec<DeviceHandle>) -> Self {
        let mut map = Self {
            by_index: BTreeMap::new(),
            next_index: 1,
        };
        for handle in snapshot {
            map.insert(handle);
        }
        map
    }

    fn insert(&mut self, handle: DeviceHandle) -> Option<u32> {
        if self.by_index.values().any(|d| d.serial == handle.serial) {
            return None;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.by_index.insert(index, handle);
        Some(index)
    }

    fn remove_serial(&mut self, serial: &str) -> Option<u32> {
        let index = self
            .by_index
            .iter()
            .find(|(_, d)| d.serial == serial)
            .map(|(index, _)| *index)?;
        self.by_index.remove(&index);
        Some(index)
    }

    fn get(&self, index: u32) -> Option<&DeviceHandle> {
        self.by_index.get(&index)
    }

    fn entries(&self) -> impl Iterator<Item = (u32, &DeviceHandle)> {
        self.by_index.iter().map(|(index, handle)| (*index, handle))
    }
}

/// The channel a client opened with `Connect`, if any.
#[derive(Debug)]
struct ClientChannel {
    serial: String,
    destination_port: u16,
    commands: mpsc::Sender<DeviceCommand>,
    /// Tag of the `Connect` request, answered once the channel opens.
    pending_tag: Option<u32>,
    open: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Keep,
    Drop,
    Shutdown,
}

#[derive(Debug)]
struct LocalClient {
    id: u64,
    hub: HubHandle,
    writer: OwnedWriteHalf,
    listening: bool,
    /// Wire version the client last spoke; notifications use it.
    notify_version: u32,
    devices: Option<DeviceMap>,
    channel: Option<ClientChannel>,
    version_strikes: u32,
}

/// Runs one client conversation to completion.
pub async fn serve(stream: UnixStream, id: u64, hub: HubHandle) -> Result<(), WebmuxdError> {
    let (mut reader, writer) = stream.into_split();
    let (events_tx, mut hub_events) = mpsc::unbounded_channel();
    hub.local_connected(id, events_tx).await?;

    let mut client = LocalClient {
        id,
        hub: hub.clone(),
        writer,
        listening: false,
        notify_version: usbmuxd::XML_PLIST_VERSION,
        devices: None,
        channel: None,
        version_strikes: 0,
    };
    let mut channel_events: Option<mpsc::UnboundedReceiver<ChannelEvent>> = None;
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

    let result = loop {
        tokio::select! {
            read = reader.read_buf(&mut buffer) => {
                match read {
                    Ok(0) => break Ok(()),
                    Ok(_) => match client.process_buffer(&mut buffer).await {
                        Ok(Some(events)) => channel_events = Some(events),
                        Ok(None) => {}
                        Err(e) => break Err(e),
                    },
                    Err(e) => break Err(e.into()),
                }
            }
            Some(event) = hub_events.recv() => {
                if let Err(e) = client.handle_hub_event(event).await {
                    break Err(e);
                }
            }
            event = recv_channel_event(&mut channel_events) => {
                match client.handle_channel_event(event).await {
                    Ok(Disposition::Keep) => {
                        // Bytes that raced the Connect result belong to the
                        // pipe now that it is open.
                        if !buffer.is_empty() {
                            if let Err(e) = client.process_buffer(&mut buffer).await {
                                break Err(e);
                            }
                        }
                    }
                    Ok(Disposition::Drop) => channel_events = None,
                    Ok(Disposition::Shutdown) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
        }
    };

    let _ = hub.local_disconnected(id).await;
    if let Some(channel) = client.channel.take() {
        let _ = channel
            .commands
            .send(DeviceCommand::CloseChannel {
                serial: channel.serial,
                destination_port: channel.destination_port,
            })
            .await;
    }
    info!(id, "local client closed");
    result
}

/// Pends forever while the client has no channel, so the select loop only
/// polls a queue that exists.
async fn recv_channel_event(
    events: &mut Option<mpsc::UnboundedReceiver<ChannelEvent>>,
) -> Option<ChannelEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

impl LocalClient {
    /// Consumes whatever complete frames (or pipe bytes) the buffer holds.
    async fn process_buffer(
        &mut self,
        buffer: &mut BytesMut,
    ) -> Result<Option<mpsc::UnboundedReceiver<ChannelEvent>>, WebmuxdError> {
        if let Some(channel) = &self.channel {
            if channel.open {
                if !buffer.is_empty() {
                    let data = buffer.split().to_vec();
                    channel
                        .commands
                        .send(DeviceCommand::ChannelSend {
                            serial: channel.serial.clone(),
                            destination_port: channel.destination_port,
                            data,
                        })
                        .await
                        .map_err(|_| WebmuxdError::EndpointGone)?;
                }
            }
            // Connect still in flight: hold the bytes until it resolves.
            return Ok(None);
        }

        while buffer.len() >= usbmuxd::HEADER_SIZE {
            let header = Header::decode(&buffer[..])?;
            if buffer.len() < header.length as usize {
                break;
            }
            let frame = buffer.split_to(header.length as usize);
            if let Some(events) = self
                .handle_frame(&header, &frame[usbmuxd::HEADER_SIZE..])
                .await?
            {
                // A Connect switches modes; later bytes belong to the pipe.
                return Ok(Some(events));
            }
        }
        Ok(None)
    }

    async fn handle_frame(
        &mut self,
        header: &Header,
        body: &[u8],
    ) -> Result<Option<mpsc::UnboundedReceiver<ChannelEvent>>, WebmuxdError> {
        if header.version > usbmuxd::XML_PLIST_VERSION {
            warn!(id = self.id, version = header.version, "unsupported protocol version");
            self.version_strikes += 1;
            if self.version_strikes >= VERSION_STRIKE_LIMIT {
                return Err(WebmuxdError::UnsupportedVersion(header.version));
            }
            self.write_all(&usbmuxd::encode_result(
                header.version,
                header.tag,
                ResultCode::BadVersion,
            ))
            .await?;
            return Ok(None);
        }

        match Message::from_u32(header.message) {
            Some(Message::Listen) => {
                self.notify_version = header.version;
                self.listening = true;
                self.ensure_devices().await?;
                info!(id = self.id, "local client is listening");
                self.write_all(&usbmuxd::encode_result(
                    header.version,
                    header.tag,
                    ResultCode::Ok,
                ))
                .await?;
                Ok(None)
            }
            Some(Message::Plist) => self.handle_plist(header, body).await,
            Some(Message::Connect) => {
                // Only the plist form of Connect is served.
                match usbmuxd::decode_connect_payload(body) {
                    Ok((device_id, port)) => debug!(
                        id = self.id,
                        device_id, port, "not acting on binary connect"
                    ),
                    Err(_) => warn!(id = self.id, "malformed binary connect payload"),
                }
                Ok(None)
            }
            other => {
                debug!(
                    id = self.id,
                    message = header.message,
                    ?other,
                    "not acting on usbmuxd message"
                );
                Ok(None)
            }
        }
    }

    async fn handle_plist(
        &mut self,
        header: &Header,
        body: &[u8],
    ) -> Result<Option<mpsc::UnboundedReceiver<ChannelEvent>>, WebmuxdError> {
        let document: plist::Dictionary = match plist::from_bytes(body) {
            Ok(document) => document,
            Err(e) => {
                warn!(id = self.id, "skipping unparseable plist request: {e}");
                return Ok(None);
            }
        };
        let message_type = document
            .get("MessageType")
            .and_then(|v| v.as_string())
            .unwrap_or_default()
            .to_string();

        match message_type.as_str() {
            "Listen" => {
                self.notify_version = header.version;
                self.listening = true;
                self.ensure_devices().await?;
                info!(id = self.id, "local client is listening");
                self.write_plist(header.tag, &des::ResultMessage::ok())
                    .await?;
                Ok(None)
            }
            "ListDevices" => {
                self.ensure_devices().await?;
                let device_list = match &self.devices {
                    Some(devices) => devices
                        .entries()
                        .map(|(index, handle)| {
                            des::AttachedMessage::new(
                                index,
                                handle.properties.product_id,
                                &handle.serial,
                            )
                        })
                        .collect(),
                    None => Vec::new(),
                };
                let response = des::DeviceListMessage { device_list };
                self.write_plist(header.tag, &response).await?;
                Ok(None)
            }
            "Connect" => self.handle_connect(header, &document).await,
            other => {
                debug!(id = self.id, other, "not acting on usbmuxd request");
                Ok(None)
            }
        }
    }

    async fn handle_connect(
        &mut self,
        header: &Header,
        document: &plist::Dictionary,
    ) -> Result<Option<mpsc::UnboundedReceiver<ChannelEvent>>, WebmuxdError> {
        let (Some(device_id), Some(port)) = (
            unsigned(document, "DeviceID"),
            unsigned(document, "PortNumber"),
        ) else {
            warn!(id = self.id, "connect request missing DeviceID or PortNumber");
            self.write_plist(
                header.tag,
                &des::ResultMessage::new(ResultCode::BadCommand as u64),
            )
            .await?;
            return Ok(None);
        };

        self.ensure_devices().await?;
        let handle = u32::try_from(device_id).ok().and_then(|device_id| {
            self.devices
                .as_ref()
                .and_then(|devices| devices.get(device_id))
                .cloned()
        });
        let Some(handle) = handle else {
            warn!(id = self.id, device_id, "connect to unknown device");
            self.write_plist(
                header.tag,
                &des::ResultMessage::new(ResultCode::BadDevice as u64),
            )
            .await?;
            return Ok(None);
        };

        let destination_port = port as u16;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if handle
            .commands
            .send(DeviceCommand::OpenChannel {
                serial: handle.serial.clone(),
                destination_port,
                events: events_tx,
            })
            .await
            .is_err()
        {
            warn!(id = self.id, serial = %handle.serial, "device connection is gone");
            self.write_plist(
                header.tag,
                &des::ResultMessage::new(ResultCode::BadDevice as u64),
            )
            .await?;
            return Ok(None);
        }

        info!(
            id = self.id,
            serial = %handle.serial,
            port = destination_port,
            "connecting client to device"
        );
        self.channel = Some(ClientChannel {
            serial: handle.serial.clone(),
            destination_port,
            commands: handle.commands.clone(),
            pending_tag: Some(header.tag),
            open: false,
        });
        Ok(Some(events_rx))
    }

    async fn handle_hub_event(&mut self, event: ClientEvent) -> Result<(), WebmuxdError> {
        match event {
            ClientEvent::Attached(handle) => {
                let Some(devices) = &mut self.devices else {
                    // No map yet; a later snapshot will pick the device up.
                    return Ok(());
                };
                let Some(index) = devices.insert(handle.clone()) else {
                    return Ok(());
                };
                if self.listening {
                    self.notify_attached(index, &handle).await?;
                }
            }
            ClientEvent::Detached { serial } => {
                let Some(devices) = &mut self.devices else {
                    return Ok(());
                };
                let Some(index) = devices.remove_serial(&serial) else {
                    return Ok(());
                };
                if self.listening {
                    self.notify_detached(index).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_channel_event(
        &mut self,
        event: Option<ChannelEvent>,
    ) -> Result<Disposition, WebmuxdError> {
        // A dropped queue means the owning device vanished mid-stream.
        let event = event.unwrap_or(ChannelEvent::Closed(CloseReason::DeviceGone));
        match event {
            ChannelEvent::Opened => {
                let mut tag = None;
                if let Some(channel) = &mut self.channel {
                    channel.open = true;
                    tag = channel.pending_tag.take();
                }
                if let Some(tag) = tag {
                    self.write_plist(tag, &des::ResultMessage::ok()).await?;
                }
                Ok(Disposition::Keep)
            }
            ChannelEvent::Data(data) => {
                self.writer.write_all(&data).await?;
                Ok(Disposition::Keep)
            }
            ChannelEvent::Closed(reason) => {
                let tag = self.channel.as_mut().and_then(|c| c.pending_tag.take());
                match tag {
                    Some(tag) => {
                        let code = match reason {
                            CloseReason::Refused => ResultCode::ConnectionRefused,
                            CloseReason::Closed | CloseReason::DeviceGone => ResultCode::BadDevice,
                        };
                        debug!(id = self.id, ?reason, "connect attempt failed");
                        self.write_plist(tag, &des::ResultMessage::new(code as u64))
                            .await?;
                        self.channel = None;
                        Ok(Disposition::Drop)
                    }
                    // The pipe ended; the client's socket ends with it.
                    None => Ok(Disposition::Shutdown),
                }
            }
        }
    }

    async fn ensure_devices(&mut self) -> Result<(), WebmuxdError> {
        if self.devices.is_none() {
            let snapshot = self.hub.snapshot().await?;
            self.devices = Some(DeviceMap::from_snapshot(snapshot));
        }
        Ok(())
    }

    async fn notify_attached(
        &mut self,
        index: u32,
        handle: &DeviceHandle,
    ) -> Result<(), WebmuxdError> {
        if self.notify_version == usbmuxd::BINARY_PLIST_VERSION {
            let frame = usbmuxd::encode_device_add(
                self.notify_version,
                index,
                handle.properties.product_id as u16,
                index,
                &handle.serial,
            );
            self.write_all(&frame).await
        } else {
            let message =
                des::AttachedMessage::new(index, handle.properties.product_id, &handle.serial);
            self.write_plist(usbmuxd::BROADCAST_TAG, &message).await
        }
    }

    async fn notify_detached(&mut self, index: u32) -> Result<(), WebmuxdError> {
        if self.notify_version == usbmuxd::BINARY_PLIST_VERSION {
            let frame = usbmuxd::encode_device_remove(self.notify_version, index);
            self.write_all(&frame).await
        } else {
            self.write_plist(usbmuxd::BROADCAST_TAG, &des::DetachedMessage::new(index))
                .await
        }
    }

    async fn write_plist<T: serde::Serialize>(
        &mut self,
        tag: u32,
        body: &T,
    ) -> Result<(), WebmuxdError> {
        let frame = usbmuxd::encode_plist(tag, body)?;
        self.write_all(&frame).await
    }

    async fn write_all(&mut self, frame: &[u8]) -> Result<(), WebmuxdError> {
        self.writer.write_all(frame).await?;
        Ok(())
    }
}

fn unsigned(document: &plist::Dictionary, key: &str) -> Option<u64> {
    match document.get(key) {
        Some(plist::Value::Integer(i)) => i.as_unsigned(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::DeviceConnected;
    use crate::hub::{next_endpoint_id, Hub};

    async fn setup() -> (UnixStream, HubHandle, mpsc::Receiver<DeviceCommand>) {
        let (hub, handle) = Hub::new();
        tokio::task::spawn(hub.run());

        let (commands_tx, commands_rx) = mpsc::channel(8);
        let device = DeviceHandle {
            serial: "ABC".into(),
            properties: DeviceConnected {
                serial_number: "ABC".into(),
                product_id: 0x12a8,
                location_id: 1,
            },
            commands: commands_tx,
            owner: 1,
        };
        handle.remote_connected(1).await.unwrap();
        handle.device_attached(device).await.unwrap();

        let (client_side, daemon_side) = UnixStream::pair().unwrap();
        let id = next_endpoint_id();
        let hub_for_client = handle.clone();
        tokio::task::spawn(async move {
            let _ = serve(daemon_side, id, hub_for_client).await;
        });
        (client_side, handle, commands_rx)
    }

    async fn send_request(stream: &mut UnixStream, tag: u32, dict: plist::Dictionary) {
        let frame = usbmuxd::encode_plist(tag, &plist::Value::Dictionary(dict)).unwrap();
        stream.write_all(&frame).await.unwrap();
    }

    async fn read_frame(stream: &mut UnixStream) -> (Header, Vec<u8>) {
        let mut raw = [0u8; usbmuxd::HEADER_SIZE];
        stream.read_exact(&mut raw).await.unwrap();
        let header = Header::decode(&raw).unwrap();
        let mut body = vec![0u8; header.length as usize - usbmuxd::HEADER_SIZE];
        stream.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    fn connect_request(device_id: u64, port: u64) -> plist::Dictionary {
        let mut dict = plist::Dictionary::new();
        dict.insert("MessageType".into(), "Connect".into());
        dict.insert("DeviceID".into(), device_id.into());
        dict.insert("PortNumber".into(), port.into());
        dict
    }

    #[tokio::test]
    async fn list_devices_reports_indexed_snapshot() {
        let (mut stream, _hub, _commands) = setup().await;

        let mut dict = plist::Dictionary::new();
        dict.insert("MessageType".into(), "ListDevices".into());
        send_request(&mut stream, 7, dict).await;

        let (header, body) = read_frame(&mut stream).await;
        assert_eq!(header.tag, 7);
        let response: des::DeviceListMessage = plist::from_bytes(&body).unwrap();
        assert_eq!(response.device_list.len(), 1);
        let entry = &response.device_list[0];
        assert_eq!(entry.device_id, 1);
        assert_eq!(entry.properties.serial_number, "ABC");
        assert_eq!(entry.properties.connection_type, "USB");
        assert_eq!(entry.properties.connection_speed, 480_000_000);
        assert_eq!(entry.properties.product_id, 0x12a8);
        assert_eq!(entry.properties.location_id, 1);
    }

    #[tokio::test]
    async fn connect_without_list_devices_resolves_lazily() {
        let (mut stream, _hub, mut commands) = setup().await;

        send_request(&mut stream, 9, connect_request(1, 62078)).await;
        let command = commands.recv().await.unwrap();
        let DeviceCommand::OpenChannel {
            serial,
            destination_port,
            events,
        } = command
        else {
            panic!("expected a channel open");
        };
        assert_eq!(serial, "ABC");
        assert_eq!(destination_port, 62078);

        events.send(ChannelEvent::Opened).unwrap();
        let (header, body) = read_frame(&mut stream).await;
        assert_eq!(header.tag, 9);
        let result: des::ResultMessage = plist::from_bytes(&body).unwrap();
        assert_eq!(result.number, 0);

        // the socket is now the channel's pipe, both ways
        stream.write_all(b"ping").await.unwrap();
        let command = commands.recv().await.unwrap();
        let DeviceCommand::ChannelSend { data, .. } = command else {
            panic!("expected piped data");
        };
        assert_eq!(data, b"ping");

        events.send(ChannelEvent::Data(b"pong".to_vec())).unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
    }

    #[tokio::test]
    async fn refused_connect_surfaces_result() {
        let (mut stream, _hub, mut commands) = setup().await;

        send_request(&mut stream, 11, connect_request(1, 62078)).await;
        let DeviceCommand::OpenChannel { events, .. } = commands.recv().await.unwrap() else {
            panic!("expected a channel open");
        };
        events
            .send(ChannelEvent::Closed(CloseReason::Refused))
            .unwrap();

        let (header, body) = read_frame(&mut stream).await;
        assert_eq!(header.tag, 11);
        let result: des::ResultMessage = plist::from_bytes(&body).unwrap();
        assert_eq!(result.number, ResultCode::ConnectionRefused as u64);
    }

    #[tokio::test]
    async fn connect_to_unknown_device_is_bad_device() {
        let (mut stream, _hub, _commands) = setup().await;

        send_request(&mut stream, 13, connect_request(42, 62078)).await;
        let (header, body) = read_frame(&mut stream).await;
        assert_eq!(header.tag, 13);
        let result: des::ResultMessage = plist::from_bytes(&body).unwrap();
        assert_eq!(result.number, ResultCode::BadDevice as u64);
    }

    #[tokio::test]
    async fn listener_hears_detach_when_remote_drops() {
        let (mut stream, hub, _commands) = setup().await;

        let mut dict = plist::Dictionary::new();
        dict.insert("MessageType".into(), "Listen".into());
        send_request(&mut stream, 2, dict).await;
        let (header, body) = read_frame(&mut stream).await;
        assert_eq!(header.tag, 2);
        let result: des::ResultMessage = plist::from_bytes(&body).unwrap();
        assert_eq!(result.number, 0);

        hub.remote_disconnected(1).await.unwrap();
        let (header, body) = read_frame(&mut stream).await;
        assert_eq!(header.tag, usbmuxd::BROADCAST_TAG);
        let detached: des::DetachedMessage = plist::from_bytes(&body).unwrap();
        assert_eq!(detached.message_type, "Detached");
        assert_eq!(detached.device_id, 1);
    }

    #[tokio::test]
    async fn listener_hears_new_attachments() {
        let (mut stream, hub, _commands) = setup().await;

        let mut dict = plist::Dictionary::new();
        dict.insert("MessageType".into(), "Listen".into());
        send_request(&mut stream, 3, dict).await;
        let _ = read_frame(&mut stream).await;

        let (commands_tx, _late_rx) = mpsc::channel(8);
        let late = DeviceHandle {
            serial: "DEF".into(),
            properties: DeviceConnected {
                serial_number: "DEF".into(),
                product_id: 0x12a9,
                location_id: 2,
            },
            commands: commands_tx,
            owner: 1,
        };
        hub.device_attached(late).await.unwrap();

        let (header, body) = read_frame(&mut stream).await;
        assert_eq!(header.tag, usbmuxd::BROADCAST_TAG);
        let attached: des::AttachedMessage = plist::from_bytes(&body).unwrap();
        assert_eq!(attached.message_type, "Attached");
        assert_eq!(attached.device_id, 2);
        assert_eq!(attached.properties.serial_number, "DEF");
    }

    #[tokio::test]
    async fn binary_listen_gets_binary_result() {
        let (mut stream, _hub, _commands) = setup().await;

        let header = Header::new(0, usbmuxd::BINARY_PLIST_VERSION, Message::Listen, 5);
        stream.write_all(&header.encode()).await.unwrap();

        let (reply, body) = read_frame(&mut stream).await;
        assert_eq!(reply.version, usbmuxd::BINARY_PLIST_VERSION);
        assert_eq!(reply.message, Message::Result as u32);
        assert_eq!(reply.tag, 5);
        assert_eq!(
            u32::from_le_bytes(body.try_into().unwrap()),
            ResultCode::Ok as u32
        );
    }

    #[tokio::test]
    async fn binary_connect_is_decoded_but_not_served() {
        let (mut stream, _hub, mut commands) = setup().await;

        let header = Header::new(8, usbmuxd::BINARY_PLIST_VERSION, Message::Connect, 8);
        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(&1u32.to_le_bytes());
        frame.extend_from_slice(&62078u16.to_le_bytes());
        frame.extend_from_slice(&0u16.to_le_bytes());
        stream.write_all(&frame).await.unwrap();

        // no channel opens, and the conversation keeps going
        let mut dict = plist::Dictionary::new();
        dict.insert("MessageType".into(), "ListDevices".into());
        send_request(&mut stream, 21, dict).await;
        let (reply, _) = read_frame(&mut stream).await;
        assert_eq!(reply.tag, 21);
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn binary_listener_hears_binary_attachments() {
        let (mut stream, hub, _commands) = setup().await;

        let header = Header::new(0, usbmuxd::BINARY_PLIST_VERSION, Message::Listen, 4);
        stream.write_all(&header.encode()).await.unwrap();
        let _ = read_frame(&mut stream).await;

        let (commands_tx, _late_rx) = mpsc::channel(8);
        let late = DeviceHandle {
            serial: "DEF".into(),
            properties: DeviceConnected {
                serial_number: "DEF".into(),
                product_id: 0x12a9,
                location_id: 2,
            },
            commands: commands_tx,
            owner: 1,
        };
        hub.device_attached(late).await.unwrap();

        let (notify, body) = read_frame(&mut stream).await;
        assert_eq!(notify.version, usbmuxd::BINARY_PLIST_VERSION);
        assert_eq!(notify.message, Message::DeviceAdd as u32);
        assert_eq!(u32::from_le_bytes(body[0..4].try_into().unwrap()), 2);
        assert_eq!(&body[6..9], b"DEF");
    }

    #[tokio::test]
    async fn future_version_is_rejected() {
        let (mut stream, _hub, _commands) = setup().await;

        let header = Header::new(0, 2, Message::Listen, 6);
        stream.write_all(&header.encode()).await.unwrap();

        let (reply, body) = read_frame(&mut stream).await;
        assert_eq!(reply.tag, 6);
        assert_eq!(
            u32::from_le_bytes(body.try_into().unwrap()),
            ResultCode::BadVersion as u32
        );
    }
}
