//! TCP-shaped channels multiplexed inside a device.
//!
//! A channel is one bidirectional byte stream bound to a destination port.
//! The state machine owns the sequencing contract; it never transmits
//! itself. Instead every operation returns the segments to put on the wire,
//! and the owning device wraps them in MUX frames. Life-cycle and payload
//! notifications are queued to the channel's owner, which keeps the
//! single-reader ordering: `Opened` is always observed before any `Data`.

use tokio::sync::mpsc;
use tracing::{debug, warn};

pub mod packets;

use packets::{TcpFlags, TcpHeader};

/// Fixed receive window; the wire advertises `window >> 8`.
pub const CHANNEL_WINDOW: u32 = 131072;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Connecting,
    Connected,
    Closing,
    Closed,
    Refused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote side finished the stream.
    Closed,
    /// The remote side reset the connection.
    Refused,
    /// The owning device disappeared before the stream finished.
    DeviceGone,
}

/// Notifications queued to the channel's owner.
#[derive(Debug)]
pub enum ChannelEvent {
    Opened,
    Data(Vec<u8>),
    Closed(CloseReason),
}

/// An outbound segment, ready to be wrapped in a MUX frame by the device.
#[derive(Debug)]
pub struct TcpSegment {
    pub header: TcpHeader,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.header.encode().to_vec();
        buf.extend_from_slice(&self.payload);
        buf
    }
}

#[derive(Debug)]
pub struct TcpChannel {
    source_port: u16,
    destination_port: u16,
    tx_sequence: u32,
    tx_acknowledgement: u32,
    rx_sequence: u32,
    rx_acknowledgement: u32,
    rx_bytes: u32,
    tx_bytes: u64,
    window: u32,
    state: ChannelState,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl TcpChannel {
    /// Opens a channel: the returned SYN segment must be transmitted by the
    /// caller. The channel is `Connecting` until the matching SYN+ACK.
    pub fn new(
        source_port: u16,
        destination_port: u16,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> (Self, TcpSegment) {
        let mut channel = Self {
            source_port,
            destination_port,
            tx_sequence: 0,
            tx_acknowledgement: 0,
            rx_sequence: 0,
            rx_acknowledgement: 0,
            rx_bytes: 0,
            tx_bytes: 0,
            window: CHANNEL_WINDOW,
            state: ChannelState::New,
            events,
        };
        let syn = channel.segment(TcpFlags::syn(), Vec::new());
        channel.state = ChannelState::Connecting;
        (channel, syn)
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    pub fn destination_port(&self) -> u16 {
        self.destination_port
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes
    }

    fn segment(&mut self, flags: TcpFlags, payload: Vec<u8>) -> TcpSegment {
        let header = TcpHeader {
            source_port: self.source_port,
            destination_port: self.destination_port,
            sequence: self.tx_sequence,
            acknowledgement: self.tx_acknowledgement,
            flags,
            window: (self.window >> 8) as u16,
            checksum: 0,
            urgent: 0,
        };
        self.tx_sequence = self.tx_sequence.wrapping_add(payload.len() as u32);
        TcpSegment { header, payload }
    }

    fn notify(&self, event: ChannelEvent) {
        // The owner dropping its queue just means nobody is listening.
        let _ = self.events.send(event);
    }

    /// Queues application data. Only legal on a connected channel; anything
    /// else is dropped with a log.
    pub fn send(&mut self, data: Vec<u8>) -> Option<TcpSegment> {
        if self.state != ChannelState::Connected {
            warn!(
                port = self.destination_port,
                state = ?self.state,
                "dropping send on channel that is not connected"
            );
            return None;
        }
        self.tx_bytes += data.len() as u64;
        Some(self.segment(TcpFlags::ack(), data))
    }

    /// Aborts the channel from this side, e.g. when the local client that
    /// owns it goes away. Returns the RST to transmit.
    pub fn abort(&mut self) -> TcpSegment {
        self.state = ChannelState::Closed;
        self.segment(
            TcpFlags {
                rst: true,
                ..Default::default()
            },
            Vec::new(),
        )
    }

    /// Feeds one inbound segment through the state machine and returns the
    /// segments to transmit in response.
    pub fn receive_packet(&mut self, header: &TcpHeader, payload: &[u8]) -> Vec<TcpSegment> {
        self.rx_sequence = header.sequence;
        self.rx_acknowledgement = header.acknowledgement;

        if header.flags.rst {
            self.state = ChannelState::Refused;
            self.notify(ChannelEvent::Closed(CloseReason::Refused));
            return Vec::new();
        }

        let mut out = Vec::new();
        match self.state {
            ChannelState::Connecting => {
                if header.flags.syn && header.flags.ack {
                    // The SYN consumed one sequence number on each side.
                    self.tx_sequence = self.tx_sequence.wrapping_add(1);
                    self.tx_acknowledgement = self.tx_acknowledgement.wrapping_add(1);
                    self.rx_bytes = header.sequence;
                    out.push(self.segment(TcpFlags::ack(), Vec::new()));
                    self.state = ChannelState::Connected;
                    self.notify(ChannelEvent::Opened);
                    if !payload.is_empty() {
                        out.extend(self.receive_data(payload));
                    }
                } else {
                    debug!(port = self.destination_port, "unexpected segment while connecting");
                }
            }
            ChannelState::Connected => {
                if header.flags.fin {
                    let fin_ack = self.segment(
                        TcpFlags {
                            fin: true,
                            ack: true,
                            ..Default::default()
                        },
                        Vec::new(),
                    );
                    out.push(fin_ack);
                    self.state = ChannelState::Closing;
                    self.notify(ChannelEvent::Closed(CloseReason::Closed));
                } else if !payload.is_empty() {
                    out.extend(self.receive_data(payload));
                }
            }
            ChannelState::Closing => {
                if header.flags.ack {
                    self.state = ChannelState::Closed;
                    self.notify(ChannelEvent::Closed(CloseReason::Closed));
                }
            }
            ChannelState::New | ChannelState::Closed | ChannelState::Refused => {
                debug!(
                    port = self.destination_port,
                    state = ?self.state,
                    "segment for channel that cannot receive"
                );
            }
        }
        out
    }

    fn receive_data(&mut self, payload: &[u8]) -> Vec<TcpSegment> {
        self.rx_bytes = self.rx_bytes.wrapping_add(payload.len() as u32);
        self.tx_acknowledgement = self.tx_acknowledgement.wrapping_add(payload.len() as u32);
        // Acknowledge before the owner sees the bytes.
        let ack = self.segment(TcpFlags::ack(), Vec::new());
        self.notify(ChannelEvent::Data(payload.to_vec()));
        vec![ack]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_channel() -> (
        TcpChannel,
        TcpSegment,
        mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (channel, syn) = TcpChannel::new(1024, 0xF27E, tx);
        (channel, syn, rx)
    }

    fn syn_ack(sequence: u32) -> TcpHeader {
        TcpHeader {
            source_port: 0xF27E,
            destination_port: 1024,
            sequence,
            acknowledgement: 1,
            flags: TcpFlags {
                syn: true,
                ack: true,
                ..Default::default()
            },
            window: 512,
            checksum: 0,
            urgent: 0,
        }
    }

    #[test]
    fn create_sends_syn() {
        let (channel, syn, _rx) = open_channel();
        assert_eq!(channel.state(), ChannelState::Connecting);
        assert!(syn.header.flags.syn);
        assert!(syn.payload.is_empty());
        assert_eq!(syn.header.sequence, 0);
        assert_eq!(syn.header.window, 512);
    }

    #[test]
    fn syn_ack_connects_and_acks() {
        let (mut channel, _syn, mut rx) = open_channel();
        let out = channel.receive_packet(&syn_ack(77), &[]);
        assert_eq!(channel.state(), ChannelState::Connected);
        assert_eq!(out.len(), 1);
        assert!(out[0].header.flags.ack);
        assert!(out[0].payload.is_empty());
        // the SYN consumed a sequence number
        assert_eq!(out[0].header.sequence, 1);
        assert_eq!(out[0].header.acknowledgement, 1);
        assert!(matches!(rx.try_recv().unwrap(), ChannelEvent::Opened));
    }

    #[test]
    fn no_data_before_connected() {
        let (mut channel, _syn, _rx) = open_channel();
        assert!(channel.send(vec![1, 2, 3]).is_none());
        assert_eq!(channel.tx_bytes(), 0);
    }

    #[test]
    fn data_advances_sequence_and_bytes() {
        let (mut channel, _syn, _rx) = open_channel();
        channel.receive_packet(&syn_ack(0), &[]);
        let first = channel.send(vec![0u8; 10]).unwrap();
        assert_eq!(first.header.sequence, 1);
        let second = channel.send(vec![0u8; 5]).unwrap();
        assert_eq!(second.header.sequence, 11);
        assert_eq!(channel.tx_bytes(), 15);
    }

    #[test]
    fn inbound_data_is_acked_then_delivered() {
        let (mut channel, _syn, mut rx) = open_channel();
        channel.receive_packet(&syn_ack(0), &[]);
        assert!(matches!(rx.try_recv().unwrap(), ChannelEvent::Opened));

        let data_header = TcpHeader {
            source_port: 0xF27E,
            destination_port: 1024,
            sequence: 1,
            acknowledgement: 1,
            flags: TcpFlags::ack(),
            window: 512,
            checksum: 0,
            urgent: 0,
        };
        let out = channel.receive_packet(&data_header, b"hello");
        assert_eq!(out.len(), 1);
        assert!(out[0].payload.is_empty());
        assert_eq!(out[0].header.acknowledgement, 6);
        match rx.try_recv().unwrap() {
            ChannelEvent::Data(data) => assert_eq!(data, b"hello"),
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn rst_refuses_in_any_state() {
        let (mut channel, _syn, mut rx) = open_channel();
        let rst = TcpHeader {
            source_port: 0xF27E,
            destination_port: 1024,
            sequence: 0,
            acknowledgement: 0,
            flags: TcpFlags {
                rst: true,
                ..Default::default()
            },
            window: 0,
            checksum: 0,
            urgent: 0,
        };
        let out = channel.receive_packet(&rst, &[]);
        assert!(out.is_empty());
        assert_eq!(channel.state(), ChannelState::Refused);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ChannelEvent::Closed(CloseReason::Refused)
        ));
    }

    #[test]
    fn fin_then_ack_closes() {
        let (mut channel, _syn, mut rx) = open_channel();
        channel.receive_packet(&syn_ack(0), &[]);
        let _ = rx.try_recv();

        let fin = TcpHeader {
            source_port: 0xF27E,
            destination_port: 1024,
            sequence: 1,
            acknowledgement: 1,
            flags: TcpFlags {
                fin: true,
                ..Default::default()
            },
            window: 512,
            checksum: 0,
            urgent: 0,
        };
        let out = channel.receive_packet(&fin, &[]);
        assert_eq!(out.len(), 1);
        assert!(out[0].header.flags.fin && out[0].header.flags.ack);
        assert_eq!(channel.state(), ChannelState::Closing);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ChannelEvent::Closed(CloseReason::Closed)
        ));

        let ack = TcpHeader {
            flags: TcpFlags::ack(),
            ..fin
        };
        let out = channel.receive_packet(&ack, &[]);
        assert!(out.is_empty());
        assert_eq!(channel.state(), ChannelState::Closed);
        // the terminal transition notifies again
        assert!(matches!(
            rx.try_recv().unwrap(),
            ChannelEvent::Closed(CloseReason::Closed)
        ));
    }
}
