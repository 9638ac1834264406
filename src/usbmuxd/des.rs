use serde::{Deserialize, Serialize};

/// The `Properties` dictionary carried by `Attached` notifications and
/// `DeviceList` entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProperties {
    #[serde(rename = "ConnectionSpeed")]
    pub connection_speed: u64,
    #[serde(rename = "ConnectionType")]
    pub connection_type: String,
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "LocationID")]
    pub location_id: u32,
    #[serde(rename = "ProductID")]
    pub product_id: u32,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachedMessage {
    #[serde(rename = "MessageType")]
    pub message_type: String,
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DeviceProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachedMessage {
    #[serde(rename = "MessageType")]
    pub message_type: String,
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(rename = "MessageType")]
    pub message_type: String,
    #[serde(rename = "Number")]
    pub number: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceListMessage {
    #[serde(rename = "DeviceList")]
    pub device_list: Vec<AttachedMessage>,
}

impl AttachedMessage {
    pub fn new(device_id: u32, product_id: u32, serial_number: &str) -> Self {
        Self {
            message_type: "Attached".into(),
            device_id,
            properties: DeviceProperties {
                connection_speed: 480_000_000,
                connection_type: "USB".into(),
                device_id,
                location_id: device_id,
                product_id,
                serial_number: serial_number.into(),
            },
        }
    }
}

impl DetachedMessage {
    pub fn new(device_id: u32) -> Self {
        Self {
            message_type: "Detached".into(),
            device_id,
        }
    }
}

impl ResultMessage {
    pub fn new(number: u64) -> Self {
        Self {
            message_type: "Result".into(),
            number,
        }
    }

    pub fn ok() -> Self {
        Self::new(0)
    }
}
