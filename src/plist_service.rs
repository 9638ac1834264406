//! Property-list messaging over a channel.
//!
//! Services exchange whole plist documents framed by a 4-byte big-endian
//! length. A service owns its channel's event queue; the stream side of the
//! conversation is whatever task drives [`PropertyListService::next`].

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::device::ChannelWriter;
use crate::tcp::ChannelEvent;
use crate::WebmuxdError;

const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug)]
pub enum ServiceEvent {
    /// The underlying channel reached Connected.
    Connected,
    /// One complete plist document arrived.
    Message(plist::Dictionary),
}

#[derive(Debug)]
struct Reassembly {
    expected: usize,
    buffer: Vec<u8>,
}

#[derive(Debug)]
pub struct PropertyListService {
    writer: ChannelWriter,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    connected: bool,
    pending: Option<Reassembly>,
}

impl PropertyListService {
    pub fn new(writer: ChannelWriter, events: mpsc::UnboundedReceiver<ChannelEvent>) -> Self {
        Self {
            writer,
            events,
            connected: false,
            pending: None,
        }
    }

    /// Marshals `message` as a binary plist and writes it to the channel.
    /// Sending before the channel is connected is logged and dropped.
    pub async fn send(&mut self, message: &plist::Dictionary) -> Result<(), WebmuxdError> {
        if !self.connected {
            warn!("tried to send a property list on a channel that is not connected");
            return Ok(());
        }
        let mut body = Vec::new();
        plist::Value::Dictionary(message.clone()).to_writer_binary(&mut body)?;

        let mut framed = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        framed.extend_from_slice(&body);
        self.writer.send(framed).await
    }

    /// Waits for the next service event. Returns `None` once the channel is
    /// gone or its framing breaks; the caller tears down.
    pub async fn next(&mut self) -> Option<ServiceEvent> {
        loop {
            match self.events.recv().await? {
                ChannelEvent::Opened => {
                    self.connected = true;
                    return Some(ServiceEvent::Connected);
                }
                ChannelEvent::Data(data) => match self.feed(&data) {
                    Ok(Some(message)) => return Some(ServiceEvent::Message(message)),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("plist datagram framing broke: {e}");
                        return None;
                    }
                },
                ChannelEvent::Closed(reason) => {
                    debug!(?reason, "property list channel closed");
                    return None;
                }
            }
        }
    }

    /// Feeds one chunk into the single in-flight datagram.
    fn feed(&mut self, data: &[u8]) -> Result<Option<plist::Dictionary>, WebmuxdError> {
        match &mut self.pending {
            None => {
                if data.len() < LENGTH_PREFIX_SIZE {
                    return Err(WebmuxdError::MalformedFrame("plist datagram"));
                }
                let expected =
                    u32::from_be_bytes(data[..LENGTH_PREFIX_SIZE].try_into().unwrap()) as usize;
                self.pending = Some(Reassembly {
                    expected,
                    buffer: data[LENGTH_PREFIX_SIZE..].to_vec(),
                });
            }
            Some(pending) => pending.buffer.extend_from_slice(data),
        }

        let pending = self.pending.as_ref().unwrap();
        if pending.buffer.len() < pending.expected {
            return Ok(None);
        }
        if pending.buffer.len() > pending.expected {
            return Err(WebmuxdError::MalformedFrame("plist datagram"));
        }
        let message = plist::from_bytes(&pending.buffer)?;
        self.pending = None;
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceCommand;

    fn test_service() -> (
        PropertyListService,
        mpsc::UnboundedSender<ChannelEvent>,
        mpsc::Receiver<DeviceCommand>,
    ) {
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let writer = ChannelWriter::new("ABC".into(), 0xF27E, commands_tx);
        (
            PropertyListService::new(writer, events_rx),
            events_tx,
            commands_rx,
        )
    }

    fn marshal(dict: &plist::Dictionary) -> Vec<u8> {
        let mut body = Vec::new();
        plist::Value::Dictionary(dict.clone())
            .to_writer_binary(&mut body)
            .unwrap();
        let mut framed = (body.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(&body);
        framed
    }

    #[tokio::test]
    async fn datagram_round_trip() {
        let (mut service, events, _commands) = test_service();
        let mut dict = plist::Dictionary::new();
        dict.insert("Request".into(), "QueryType".into());

        events.send(ChannelEvent::Opened).unwrap();
        assert!(matches!(service.next().await, Some(ServiceEvent::Connected)));

        events.send(ChannelEvent::Data(marshal(&dict))).unwrap();
        match service.next().await {
            Some(ServiceEvent::Message(message)) => assert_eq!(message, dict),
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn datagram_reassembled_from_chunks() {
        let (mut service, events, _commands) = test_service();
        let mut dict = plist::Dictionary::new();
        dict.insert("Key".into(), "Value".into());

        let framed = marshal(&dict);
        let (head, tail) = framed.split_at(7);
        events.send(ChannelEvent::Opened).unwrap();
        events.send(ChannelEvent::Data(head.to_vec())).unwrap();
        events.send(ChannelEvent::Data(tail.to_vec())).unwrap();

        assert!(matches!(service.next().await, Some(ServiceEvent::Connected)));
        match service.next().await {
            Some(ServiceEvent::Message(message)) => assert_eq!(message, dict),
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_before_connected_is_dropped() {
        let (mut service, _events, mut commands) = test_service();
        let dict = plist::Dictionary::new();
        service.send(&dict).await.unwrap();
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflowing_datagram_tears_down() {
        let (mut service, events, _commands) = test_service();
        events.send(ChannelEvent::Opened).unwrap();
        let mut framed = 2u32.to_be_bytes().to_vec();
        framed.extend_from_slice(&[0, 0, 0]);
        events.send(ChannelEvent::Data(framed)).unwrap();
        assert!(matches!(service.next().await, Some(ServiceEvent::Connected)));
        assert!(service.next().await.is_none());
    }
}
