//! Adapter seam
//!
//! The radio is driven through [`BleAdapter`]. Calls only *start* an
//! operation; results come back later as [`AdapterEvent`]s, pushed by the
//! adapter into the unbounded channel handed to it at construction.

use crate::domain::models::{AddressType, PeripheralAddress};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Connection handle assigned by the adapter
pub type ConnHandle = u16;

/// Attribute status code of a successful GATT operation
pub const STATUS_SUCCESS: u16 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("adapter is not powered on")]
    NotActive,
    #[error("adapter busy")]
    Busy,
    #[error("unknown connection handle {0}")]
    UnknownConnection(ConnHandle),
    #[error("adapter operation failed: {0}")]
    Other(String),
}

/// Write procedure to use for a GATT write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// One advertising report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub address_type: AddressType,
    pub address: PeripheralAddress,
    pub rssi: i8,
    pub adv_data: Vec<u8>,
}

/// Asynchronous completions and indications raised by the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    ScanResult(ScanReport),
    /// Scan window elapsed or scan was stopped
    ScanDone,
    PeripheralConnected {
        conn: ConnHandle,
        address_type: AddressType,
        address: PeripheralAddress,
    },
    PeripheralDisconnected {
        conn: ConnHandle,
    },
    ServiceResult {
        conn: ConnHandle,
        start_handle: u16,
        end_handle: u16,
        uuid: Uuid,
    },
    ServiceDone {
        conn: ConnHandle,
        status: u16,
    },
    CharacteristicResult {
        conn: ConnHandle,
        def_handle: u16,
        value_handle: u16,
        properties: u8,
        uuid: Uuid,
    },
    CharacteristicDone {
        conn: ConnHandle,
        status: u16,
    },
    WriteDone {
        conn: ConnHandle,
        value_handle: u16,
        status: u16,
    },
    ReadResult {
        conn: ConnHandle,
        value_handle: u16,
        status: u16,
        data: Vec<u8>,
    },
    Notify {
        conn: ConnHandle,
        value_handle: u16,
        data: Vec<u8>,
    },
}

impl AdapterEvent {
    /// Connection the event belongs to, if any.
    pub fn conn(&self) -> Option<ConnHandle> {
        match self {
            Self::ScanResult(_) | Self::ScanDone => None,
            Self::PeripheralConnected { conn, .. }
            | Self::PeripheralDisconnected { conn }
            | Self::ServiceResult { conn, .. }
            | Self::ServiceDone { conn, .. }
            | Self::CharacteristicResult { conn, .. }
            | Self::CharacteristicDone { conn, .. }
            | Self::WriteDone { conn, .. }
            | Self::ReadResult { conn, .. }
            | Self::Notify { conn, .. } => Some(*conn),
        }
    }
}

/// Central-role operations needed to reach the remote
pub trait BleAdapter {
    /// Scan for advertisements for at most `duration`.
    fn start_scan(&mut self, duration: Duration) -> Result<(), AdapterError>;

    fn stop_scan(&mut self) -> Result<(), AdapterError>;

    fn connect(
        &mut self,
        address_type: AddressType,
        address: PeripheralAddress,
    ) -> Result<(), AdapterError>;

    fn disconnect(&mut self, conn: ConnHandle) -> Result<(), AdapterError>;

    /// Discover primary services, optionally filtered by UUID.
    fn discover_services(
        &mut self,
        conn: ConnHandle,
        uuid: Option<Uuid>,
    ) -> Result<(), AdapterError>;

    fn discover_characteristics(
        &mut self,
        conn: ConnHandle,
        start_handle: u16,
        end_handle: u16,
    ) -> Result<(), AdapterError>;

    fn write(
        &mut self,
        conn: ConnHandle,
        value_handle: u16,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), AdapterError>;

    /// Read a characteristic value; completes with [`AdapterEvent::ReadResult`].
    fn read(&mut self, conn: ConnHandle, value_handle: u16) -> Result<(), AdapterError>;
}
