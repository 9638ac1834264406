//! The Hub: registries and their event loop.
//!
//! One task owns the maps of attached devices (keyed by serial), live remote
//! connections, and local clients. Every other component sends tagged events
//! into the loop and reads snapshots back through it, so the registries need
//! no locks. Attach and detach fan out to each client's own queue; the
//! client keeps its private projection of the device list.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::device::DeviceHandle;
use crate::{local, remote, WebmuxdError};

const EVENT_QUEUE_DEPTH: usize = 64;

/// What a local client hears about the world.
#[derive(Debug)]
pub enum ClientEvent {
    Attached(DeviceHandle),
    Detached { serial: String },
}

#[derive(Debug)]
pub enum HubEvent {
    DeviceAttached(DeviceHandle),
    DeviceRemoved {
        serial: String,
    },
    RemoteConnected {
        id: u64,
    },
    RemoteDisconnected {
        id: u64,
    },
    LocalConnected {
        id: u64,
        events: mpsc::UnboundedSender<ClientEvent>,
    },
    LocalDisconnected {
        id: u64,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<DeviceHandle>>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct HubHandle {
    events: mpsc::Sender<HubEvent>,
}

impl HubHandle {
    async fn send(&self, event: HubEvent) -> Result<(), WebmuxdError> {
        self.events
            .send(event)
            .await
            .map_err(|_| WebmuxdError::EndpointGone)
    }

    pub async fn device_attached(&self, device: DeviceHandle) -> Result<(), WebmuxdError> {
        self.send(HubEvent::DeviceAttached(device)).await
    }

    pub async fn device_removed(&self, serial: String) -> Result<(), WebmuxdError> {
        self.send(HubEvent::DeviceRemoved { serial }).await
    }

    pub async fn remote_connected(&self, id: u64) -> Result<(), WebmuxdError> {
        self.send(HubEvent::RemoteConnected { id }).await
    }

    pub async fn remote_disconnected(&self, id: u64) -> Result<(), WebmuxdError> {
        self.send(HubEvent::RemoteDisconnected { id }).await
    }

    pub async fn local_connected(
        &self,
        id: u64,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Result<(), WebmuxdError> {
        self.send(HubEvent::LocalConnected { id, events }).await
    }

    pub async fn local_disconnected(&self, id: u64) -> Result<(), WebmuxdError> {
        self.send(HubEvent::LocalDisconnected { id }).await
    }

    /// The currently-attached devices, sorted by serial.
    pub async fn snapshot(&self) -> Result<Vec<DeviceHandle>, WebmuxdError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HubEvent::Snapshot { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| WebmuxdError::EndpointGone)
    }

    pub async fn shutdown(&self) -> Result<(), WebmuxdError> {
        self.send(HubEvent::Shutdown).await
    }
}

#[derive(Debug)]
pub struct Hub {
    devices: BTreeMap<String, DeviceHandle>,
    remotes: HashSet<u64>,
    clients: HashMap<u64, mpsc::UnboundedSender<ClientEvent>>,
    events: mpsc::Receiver<HubEvent>,
}

impl Hub {
    pub fn new() -> (Self, HubHandle) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        (
            Self {
                devices: BTreeMap::new(),
                remotes: HashSet::new(),
                clients: HashMap::new(),
                events: events_rx,
            },
            HubHandle { events: events_tx },
        )
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                HubEvent::DeviceAttached(device) => self.attach(device),
                HubEvent::DeviceRemoved { serial } => self.detach(&serial),
                HubEvent::RemoteConnected { id } => {
                    self.remotes.insert(id);
                }
                HubEvent::RemoteDisconnected { id } => {
                    self.remotes.remove(&id);
                    let orphaned: Vec<String> = self
                        .devices
                        .values()
                        .filter(|device| device.owner == id)
                        .map(|device| device.serial.clone())
                        .collect();
                    for serial in orphaned {
                        self.detach(&serial);
                    }
                }
                HubEvent::LocalConnected { id, events } => {
                    self.clients.insert(id, events);
                }
                HubEvent::LocalDisconnected { id } => {
                    self.clients.remove(&id);
                }
                HubEvent::Snapshot { reply } => {
                    let _ = reply.send(self.devices.values().cloned().collect());
                }
                HubEvent::Shutdown => break,
            }
        }
        debug!("hub loop finished");
    }

    fn attach(&mut self, device: DeviceHandle) {
        info!(serial = %device.serial, "device attached");
        if self
            .devices
            .insert(device.serial.clone(), device.clone())
            .is_some()
        {
            warn!(serial = %device.serial, "attach replaced an existing device");
        }
        self.clients
            .retain(|_, events| events.send(ClientEvent::Attached(device.clone())).is_ok());
    }

    fn detach(&mut self, serial: &str) {
        if self.devices.remove(serial).is_none() {
            return;
        }
        info!(serial, "device detached");
        self.clients.retain(|_, events| {
            events
                .send(ClientEvent::Detached {
                    serial: serial.to_string(),
                })
                .is_ok()
        });
    }
}

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_endpoint_id() -> u64 {
    NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Accepts local usbmuxd clients and injects them into the hub.
pub async fn run_local_listener(listener: UnixListener, hub: HubHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let id = next_endpoint_id();
                info!(id, "local connection accepted");
                let hub = hub.clone();
                tokio::task::spawn(async move {
                    if let Err(e) = local::serve(stream, id, hub).await {
                        debug!(id, "local client ended: {e}");
                    }
                });
            }
            Err(e) => warn!("local accept failed: {e}"),
        }
    }
}

/// Accepts agent WebSocket connections and injects them into the hub.
pub async fn run_remote_listener(listener: TcpListener, hub: HubHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let id = next_endpoint_id();
                info!(id, %peer, "remote connection accepted");
                let hub = hub.clone();
                tokio::task::spawn(async move {
                    if let Err(e) = remote::serve(stream, id, hub).await {
                        debug!(id, "remote connection ended: {e}");
                    }
                });
            }
            Err(e) => warn!("remote accept failed: {e}"),
        }
    }
}
