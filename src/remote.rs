//! One WebSocket session with a remote agent.
//!
//! The session splits into a reader and a writer task. The reader is the
//! sole owner of every device this connection introduced: agent messages,
//! channel opens and sends from local clients, and the lockdown bootstrap
//! all funnel into it, so device state needs no locks. The writer drains a
//! bounded queue, does the protobuf encoding, and keeps the link alive with
//! pings.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::agent::{server_message, ClientMessage, ServerMessage};
use crate::device::{ChannelWriter, DeviceCommand, RemoteDevice};
use crate::hub::HubHandle;
use crate::lockdown::{self, LockdownService};
use crate::tcp::{ChannelEvent, CloseReason};
use crate::WebmuxdError;

pub const DEVICE_ENDPOINT: &str = "/v1/device";

/// Frames from the agent larger than this are protocol errors.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// The link is dead if nothing arrives for this long.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Must be shorter than [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(54);

pub const OUTBOUND_QUEUE_DEPTH: usize = 256;
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Upgrades `stream` and runs the session to completion.
pub async fn serve(stream: TcpStream, id: u64, hub: HubHandle) -> Result<(), WebmuxdError> {
    let config = WebSocketConfig::default()
        .max_message_size(Some(MAX_MESSAGE_SIZE))
        .max_frame_size(Some(MAX_MESSAGE_SIZE));
    let callback = |request: &Request, response: Response| {
        // Origin is deliberately not checked; agents come from anywhere.
        if request.uri().path() != DEVICE_ENDPOINT {
            let mut not_found = ErrorResponse::new(None);
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            return Err(not_found);
        }
        Ok(response)
    };
    let socket =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(config)).await?;
    info!(id, "agent connection upgraded");

    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let (writer_dead_tx, writer_dead_rx) = oneshot::channel();

    hub.remote_connected(id).await?;
    tokio::task::spawn(write_pump(sink, outbound_rx, writer_dead_tx));
    let result = read_pump(
        stream,
        id,
        &hub,
        outbound_tx,
        commands_tx,
        commands_rx,
        writer_dead_rx,
    )
    .await;

    // Dropping the reader drops its devices; the hub forgets them too.
    let _ = hub.remote_disconnected(id).await;
    info!(id, "agent connection closed");
    result
}

#[allow(clippy::too_many_arguments)]
async fn read_pump(
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    id: u64,
    hub: &HubHandle,
    outbound: mpsc::Sender<ClientMessage>,
    commands_tx: mpsc::Sender<DeviceCommand>,
    mut commands_rx: mpsc::Receiver<DeviceCommand>,
    mut writer_dead: oneshot::Receiver<()>,
) -> Result<(), WebmuxdError> {
    let mut devices: HashMap<String, RemoteDevice> = HashMap::new();
    let deadline = tokio::time::sleep(PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!(id, "read deadline expired");
                break;
            }
            _ = &mut writer_dead => {
                debug!(id, "writer exited, stopping reader");
                break;
            }
            Some(command) = commands_rx.recv() => {
                handle_command(&mut devices, command).await?;
            }
            message = stream.next() => {
                deadline.as_mut().reset(tokio::time::Instant::now() + PONG_WAIT);
                match message {
                    Some(Ok(Message::Binary(frame))) => {
                        handle_server_message(
                            &frame,
                            id,
                            hub,
                            &outbound,
                            &commands_tx,
                            &mut devices,
                        )
                        .await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Pings are answered by the library; pongs only feed the
                    // deadline above.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(id, "read failed: {e}");
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_server_message(
    frame: &[u8],
    id: u64,
    hub: &HubHandle,
    outbound: &mpsc::Sender<ClientMessage>,
    commands_tx: &mpsc::Sender<DeviceCommand>,
    devices: &mut HashMap<String, RemoteDevice>,
) -> Result<(), WebmuxdError> {
    let message = match ServerMessage::decode_frame(frame) {
        Ok(message) => message,
        Err(e) => {
            warn!(id, "skipping undecodable agent message: {e}");
            return Ok(());
        }
    };
    match message.message {
        Some(server_message::Message::DeviceConnected(info)) => {
            info!(serial = %info.serial_number, "device connected");
            let mut device = RemoteDevice::new(info, outbound.clone());
            if devices.contains_key(device.serial()) {
                warn!(serial = %device.serial(), "replacing device with duplicate serial");
            }
            hub.device_attached(device.handle(commands_tx.clone(), id))
                .await?;
            device.send_version().await?;
            devices.insert(device.serial().to_string(), device);
        }
        Some(server_message::Message::FromDevice(from)) => {
            match devices.get_mut(&from.serial_number) {
                Some(device) => {
                    if let Some(events) = device.receive_data(&from.data).await? {
                        let writer = ChannelWriter::new(
                            from.serial_number.clone(),
                            lockdown::LOCKDOWN_PORT,
                            commands_tx.clone(),
                        );
                        LockdownService::spawn(writer, events);
                    }
                }
                None => warn!(serial = %from.serial_number, "payload for unknown device"),
            }
        }
        Some(server_message::Message::ToDeviceResult(result)) => {
            debug!(
                correlation_id = %result.correlation_id,
                success = result.success,
                "agent acknowledged"
            );
        }
        None => debug!(id, "empty agent message"),
    }
    Ok(())
}

async fn handle_command(
    devices: &mut HashMap<String, RemoteDevice>,
    command: DeviceCommand,
) -> Result<(), WebmuxdError> {
    match command {
        DeviceCommand::OpenChannel {
            serial,
            destination_port,
            events,
        } => match devices.get_mut(&serial) {
            Some(device) => device.open_channel(destination_port, events).await?,
            None => {
                warn!(%serial, "channel open for unknown device");
                let _ = events.send(ChannelEvent::Closed(CloseReason::DeviceGone));
            }
        },
        DeviceCommand::ChannelSend {
            serial,
            destination_port,
            data,
        } => match devices.get_mut(&serial) {
            Some(device) => device.channel_send(destination_port, data).await?,
            None => warn!(%serial, "send for unknown device"),
        },
        DeviceCommand::CloseChannel {
            serial,
            destination_port,
        } => {
            if let Some(device) = devices.get_mut(&serial) {
                device.close_channel(destination_port).await?;
            }
        }
    }
    Ok(())
}

async fn write_pump(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbound: mpsc::Receiver<ClientMessage>,
    _writer_dead: oneshot::Sender<()>,
) {
    let start = tokio::time::Instant::now() + PING_PERIOD;
    let mut pings = tokio::time::interval_at(start, PING_PERIOD);
    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    let frame = message.encode_frame();
                    if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                        warn!("write failed: {e}");
                        break;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            _ = pings.tick() => {
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    warn!("ping failed: {e}");
                    break;
                }
            }
        }
    }
    // Dropping the held oneshot sender tells the reader we are gone.
}
