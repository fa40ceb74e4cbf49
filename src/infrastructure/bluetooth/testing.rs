//! Recording adapter for unit tests

use crate::domain::models::{AddressType, PeripheralAddress};
use crate::infrastructure::bluetooth::adapter::{
    AdapterError, AdapterEvent, BleAdapter, ConnHandle, ScanReport, WriteMode,
};
use crate::infrastructure::bluetooth::protocol::SERVICE_UUID;
use std::time::Duration;
use uuid::Uuid;

pub const REMOTE: PeripheralAddress = PeripheralAddress([0x90, 0x84, 0x2B, 0x01, 0x02, 0x03]);
pub const CONN: ConnHandle = 64;
pub const VALUE_HANDLE: u16 = 0x0E;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan(Duration),
    StopScan,
    Connect(PeripheralAddress),
    Disconnect(ConnHandle),
    DiscoverServices(ConnHandle, Option<Uuid>),
    DiscoverCharacteristics(ConnHandle, u16, u16),
    Write {
        conn: ConnHandle,
        handle: u16,
        data: Vec<u8>,
        mode: WriteMode,
    },
    Read(ConnHandle, u16),
}

#[derive(Debug, Default)]
pub struct RecordingAdapter {
    pub calls: Vec<Call>,
    pub fail_writes: bool,
    pub fail_disconnects: bool,
}

impl RecordingAdapter {
    pub fn writes(&self) -> Vec<(u16, Vec<u8>)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Write { handle, data, .. } => Some((*handle, data.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::Connect(_)))
            .count()
    }
}

impl BleAdapter for RecordingAdapter {
    fn start_scan(&mut self, duration: Duration) -> Result<(), AdapterError> {
        self.calls.push(Call::StartScan(duration));
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), AdapterError> {
        self.calls.push(Call::StopScan);
        Ok(())
    }

    fn connect(
        &mut self,
        _address_type: AddressType,
        address: PeripheralAddress,
    ) -> Result<(), AdapterError> {
        self.calls.push(Call::Connect(address));
        Ok(())
    }

    fn disconnect(&mut self, conn: ConnHandle) -> Result<(), AdapterError> {
        self.calls.push(Call::Disconnect(conn));
        if self.fail_disconnects {
            return Err(AdapterError::UnknownConnection(conn));
        }
        Ok(())
    }

    fn discover_services(
        &mut self,
        conn: ConnHandle,
        uuid: Option<Uuid>,
    ) -> Result<(), AdapterError> {
        self.calls.push(Call::DiscoverServices(conn, uuid));
        Ok(())
    }

    fn discover_characteristics(
        &mut self,
        conn: ConnHandle,
        start_handle: u16,
        end_handle: u16,
    ) -> Result<(), AdapterError> {
        self.calls
            .push(Call::DiscoverCharacteristics(conn, start_handle, end_handle));
        Ok(())
    }

    fn write(
        &mut self,
        conn: ConnHandle,
        value_handle: u16,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), AdapterError> {
        if self.fail_writes {
            return Err(AdapterError::Busy);
        }
        self.calls.push(Call::Write {
            conn,
            handle: value_handle,
            data: data.to_vec(),
            mode,
        });
        Ok(())
    }

    fn read(&mut self, conn: ConnHandle, value_handle: u16) -> Result<(), AdapterError> {
        self.calls.push(Call::Read(conn, value_handle));
        Ok(())
    }
}

pub fn remote_adv(product_id: u8) -> Vec<u8> {
    let mut data = vec![0x02, 0x01, 0x06, 0x11, 0x07];
    data.extend_from_slice(&SERVICE_UUID.as_u128().to_le_bytes());
    data.extend_from_slice(&[0x09, 0xFF, 0x97, 0x03, 0x00, product_id, 0x06, 0x00, 0x41, 0x00]);
    data
}

pub fn scan_result(address: PeripheralAddress, product_id: u8) -> AdapterEvent {
    AdapterEvent::ScanResult(ScanReport {
        address_type: AddressType::Public,
        address,
        rssi: -55,
        adv_data: remote_adv(product_id),
    })
}

pub fn write_ack(status: u16) -> AdapterEvent {
    AdapterEvent::WriteDone {
        conn: CONN,
        value_handle: VALUE_HANDLE,
        status,
    }
}

pub fn read_result(status: u16, data: &[u8]) -> AdapterEvent {
    AdapterEvent::ReadResult {
        conn: CONN,
        value_handle: VALUE_HANDLE,
        status,
        data: data.to_vec(),
    }
}

pub fn notify(data: &[u8]) -> AdapterEvent {
    AdapterEvent::Notify {
        conn: CONN,
        value_handle: VALUE_HANDLE,
        data: data.to_vec(),
    }
}
