// Jackson Coxson

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use log::{debug, warn};
use serde::Deserialize;

use crate::{
    usbmuxd::{Connection, UsbmuxdDevice},
    LockdownError,
};

#[derive(Deserialize)]
pub struct ListDevicesResponse {
    #[serde(rename = "DeviceList")]
    pub device_list: Vec<DeviceListResponse>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceListResponse {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DevicePropertiesResponse,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DevicePropertiesResponse {
    #[serde(rename = "ConnectionType")]
    pub connection_type: String,
    #[serde(rename = "NetworkAddress")]
    pub network_address: Option<plist::Data>,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
}

/// Reads the 16 address bytes of a sockaddr_in6
fn ipv6_at_offset_8(addr: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&addr[8..24]);
    Ipv6Addr::from(octets)
}

/// Decodes the raw sockaddr usbmuxd reports for network attached devices
fn decode_network_address(addr: &[u8]) -> Result<Connection, LockdownError> {
    let malformed = || LockdownError::ProtocolError("malformed device network address".into());
    if addr.len() < 8 {
        warn!("Device address bytes len < 8");
        return Err(malformed());
    }

    Ok(match (addr[0], addr[1]) {
        // sockaddr_in, family first
        (0x02, _) => Connection::Network(IpAddr::V4(Ipv4Addr::new(
            addr[4], addr[5], addr[6], addr[7],
        ))),
        // sockaddr_in6, family first
        (0x1E, _) => {
            if addr.len() < 24 {
                warn!("IPv6 address is less than 24 bytes");
                return Err(malformed());
            }
            Connection::Network(IpAddr::V6(ipv6_at_offset_8(addr)))
        }
        // BSD sockaddr_in6 with a length byte first
        (0x1C, 0x1E) => {
            if addr.len() < 28 {
                warn!("IPv6 sockaddr_in6 data too short (len {})", addr.len());
                return Err(malformed());
            }
            Connection::Network(IpAddr::V6(ipv6_at_offset_8(addr)))
        }
        (0x1C, family) => {
            warn!("Expected IPv6 family (0x1E) but got {family:02X} for length 0x1C");
            Connection::Unknown(format!("Network {family:02X}"))
        }
        (family, _) => {
            warn!("Unknown IP address protocol: {family:02X}");
            Connection::Unknown(format!("Network {family:02X}"))
        }
    })
}

impl TryFrom<DeviceListResponse> for UsbmuxdDevice {
    type Error = LockdownError;

    fn try_from(dev: DeviceListResponse) -> Result<Self, Self::Error> {
        let connection_type = match dev.properties.connection_type.as_str() {
            "Network" => match dev.properties.network_address {
                Some(addr) => decode_network_address(&Into::<Vec<u8>>::into(addr))?,
                None => {
                    warn!("Device is network attached, but has no network info");
                    return Err(LockdownError::ProtocolError(
                        "network device without an address".into(),
                    ));
                }
            },
            "USB" => Connection::Usb,
            _ => Connection::Unknown(dev.properties.connection_type),
        };
        debug!("Connection type: {connection_type:?}");
        Ok(UsbmuxdDevice {
            connection_type,
            udid: dev.properties.serial_number,
            device_id: dev.device_id,
        })
    }
}
