use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::domain::buttons::Button;

/// 6-byte peripheral address, most significant byte first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralAddress(pub [u8; 6]);

impl PeripheralAddress {
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid peripheral address: {0:?}")]
pub struct AddressParseError(pub String);

impl FromStr for PeripheralAddress {
    type Err = AddressParseError;

    /// Accepts `90:84:2b:01:02:03` as well as the bare `90842b010203` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.trim().chars().filter(|c| *c != ':').collect();
        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressParseError(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| AddressParseError(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for PeripheralAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeripheralAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// GAP address type as reported by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Public,
    Random,
    Other(u8),
}

impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Public,
            0x01 => Self::Random,
            other => Self::Other(other),
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => 0x00,
            AddressType::Random => 0x01,
            AddressType::Other(other) => other,
        }
    }
}

/// Lifecycle of a remote connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Discovered,
    Connecting,
    ServiceDiscovery,
    CharacteristicDiscovery,
    Subscribing,
    Ready,
    Disconnected,
}

impl ConnectionState {
    /// A link to the peripheral exists (connection handle assigned).
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::ServiceDiscovery
                | Self::CharacteristicDiscovery
                | Self::Subscribing
                | Self::Ready
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle | Self::Disconnected)
    }
}

/// Events delivered to subscribers of a remote service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    StateChanged(ConnectionState),
    Buttons(Vec<Button>),
    /// Value returned by a characteristic read
    Read(Vec<u8>),
}
