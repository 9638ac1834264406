//! Lockdown bootstrap conversation.
//!
//! Lockdown is the first service opened on every device that completes the
//! MUX handshake. The conversation here only has to exist: a `QueryType`
//! followed by a `GetValue` drives the device side of the handshake to
//! completion. Replies past that point are logged and otherwise ignored.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::device::ChannelWriter;
use crate::plist_service::{PropertyListService, ServiceEvent};
use crate::tcp::ChannelEvent;

pub const LOCKDOWN_PORT: u16 = 0xF27E;

const QUERY_TYPE_LABEL: &str = "webserver";
const GET_VALUE_LABEL: &str = "webmuxd";

#[derive(Debug)]
pub struct LockdownService {
    service: PropertyListService,
}

impl LockdownService {
    pub fn spawn(
        writer: ChannelWriter,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> JoinHandle<()> {
        let lockdown = Self {
            service: PropertyListService::new(writer, events),
        };
        tokio::task::spawn(lockdown.run())
    }

    async fn run(mut self) {
        while let Some(event) = self.service.next().await {
            let result = match event {
                ServiceEvent::Connected => self.service.send(&query_type_request()).await,
                ServiceEvent::Message(message) => {
                    let request = message.get("Request").and_then(|v| v.as_string());
                    if request == Some("QueryType") {
                        self.service.send(&get_value_request()).await
                    } else {
                        debug!(?message, "lockdown reply");
                        Ok(())
                    }
                }
            };
            if result.is_err() {
                // The owning connection is gone; nothing left to drive.
                break;
            }
        }
    }
}

fn query_type_request() -> plist::Dictionary {
    let mut request = plist::Dictionary::new();
    request.insert("Request".into(), "QueryType".into());
    request.insert("Label".into(), QUERY_TYPE_LABEL.into());
    request
}

fn get_value_request() -> plist::Dictionary {
    let mut request = plist::Dictionary::new();
    request.insert("Request".into(), "GetValue".into());
    request.insert("Label".into(), GET_VALUE_LABEL.into());
    request
}
