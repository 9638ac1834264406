//! Wire protocol spoken with the remote agent over the WebSocket.
//!
//! Messages are protobuf; the types below are maintained by hand in
//! prost-build output form so the schema lives with the code instead of a
//! build-time protoc run. `data` payloads are MUX frames.

use prost::Message as _;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceConnected {
    #[prost(string, tag = "1")]
    pub serial_number: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub product_id: u32,
    #[prost(uint32, tag = "3")]
    pub location_id: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FromDevice {
    #[prost(string, tag = "1")]
    pub serial_number: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToDeviceResult {
    #[prost(string, tag = "1")]
    pub correlation_id: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub success: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToDevice {
    #[prost(string, tag = "1")]
    pub serial_number: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub correlation_id: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "3")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

/// Everything the agent can tell us.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerMessage {
    #[prost(oneof = "server_message::Message", tags = "1, 2, 3")]
    pub message: ::core::option::Option<server_message::Message>,
}

pub mod server_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        DeviceConnected(super::DeviceConnected),
        #[prost(message, tag = "2")]
        FromDevice(super::FromDevice),
        #[prost(message, tag = "3")]
        ToDeviceResult(super::ToDeviceResult),
    }
}

/// Everything we can tell the agent.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientMessage {
    #[prost(oneof = "client_message::Message", tags = "1")]
    pub message: ::core::option::Option<client_message::Message>,
}

pub mod client_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        ToDevice(super::ToDevice),
    }
}

impl ClientMessage {
    pub fn to_device(serial_number: &str, correlation_id: String, data: Vec<u8>) -> Self {
        Self {
            message: Some(client_message::Message::ToDevice(ToDevice {
                serial_number: serial_number.to_string(),
                correlation_id,
                data,
            })),
        }
    }

    pub fn encode_frame(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}

impl ServerMessage {
    pub fn decode_frame(buf: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_round_trip() {
        let msg = ClientMessage::to_device("ABC", "id-1".to_string(), vec![1, 2, 3]);
        let decoded = ClientMessage::decode(msg.encode_frame().as_slice()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn server_message_round_trip() {
        let msg = ServerMessage {
            message: Some(server_message::Message::DeviceConnected(DeviceConnected {
                serial_number: "ABC".into(),
                product_id: 0x12a8,
                location_id: 1,
            })),
        };
        let decoded = ServerMessage::decode_frame(&msg.encode_to_vec()).unwrap();
        assert_eq!(msg, decoded);
    }
}
