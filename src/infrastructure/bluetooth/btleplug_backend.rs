//! btleplug radio backend
//!
//! Drives a host Bluetooth adapter through btleplug and reports completions
//! as [`AdapterEvent`]s. btleplug hides ATT handles, so the backend assigns
//! its own: every discovered service gets a contiguous handle range and every
//! characteristic a declaration and value handle inside it. Descriptors are
//! not exposed either. A notification-enable write to a handle that is not a
//! characteristic value subscribes to every notifying characteristic instead.
//!
//! Trait calls only spawn work on the runtime the adapter was opened on, so
//! they never block the caller.

use super::adapter::{
    AdapterError, AdapterEvent, BleAdapter, ConnHandle, ScanReport, WriteMode, STATUS_SUCCESS,
};
use super::advertisement::ad_type;
use super::protocol::LEGO_COMPANY_ID;
use crate::domain::models::{AddressType, PeripheralAddress};
use btleplug::api::{
    self, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Handle reported when a link-layer connect fails before one is assigned
pub const NO_CONNECTION: ConnHandle = 0xFFFF;

const ATT_INVALID_HANDLE: u16 = 0x01;
const ATT_UNLIKELY_ERROR: u16 = 0x0E;

/// CCCD value that switches notifications on
const ENABLE_NOTIFICATIONS: [u8; 2] = [0x01, 0x00];

/// Kept clear of the fixed hub CCCD handle
const FIRST_HANDLE: u16 = 0x0010;
/// Declaration, value and one descriptor
const HANDLES_PER_CHARACTERISTIC: u16 = 3;

/// Service UUIDs per advertising record (15 * 16 bytes fits a length byte)
const UUIDS_PER_RECORD: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ServiceLayout {
    uuid: Uuid,
    start_handle: u16,
    end_handle: u16,
    characteristics: Vec<CharacteristicLayout>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CharacteristicLayout {
    uuid: Uuid,
    def_handle: u16,
    value_handle: u16,
    properties: u8,
}

struct Link {
    peripheral: Peripheral,
    services: Vec<ServiceLayout>,
    characteristics: HashMap<u16, Characteristic>,
    notifications: Option<JoinHandle<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(task) = self.notifications.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct Shared {
    scan: Option<JoinHandle<()>>,
    seen: HashMap<PeripheralAddress, Peripheral>,
    links: HashMap<ConnHandle, Link>,
    next_conn: ConnHandle,
}

impl Shared {
    fn open(&mut self, peripheral: Peripheral) -> ConnHandle {
        self.next_conn = next_handle(self.next_conn, |conn| self.links.contains_key(&conn));
        self.links.insert(
            self.next_conn,
            Link {
                peripheral,
                services: Vec::new(),
                characteristics: HashMap::new(),
                notifications: None,
            },
        );
        self.next_conn
    }
}

fn next_handle(after: ConnHandle, in_use: impl Fn(ConnHandle) -> bool) -> ConnHandle {
    let mut conn = after;
    loop {
        conn = conn.wrapping_add(1);
        if conn != NO_CONNECTION && !in_use(conn) {
            return conn;
        }
    }
}

/// [`BleAdapter`] over the host's Bluetooth stack
pub struct BtleplugAdapter {
    central: Adapter,
    events: UnboundedSender<AdapterEvent>,
    shared: Arc<Mutex<Shared>>,
    runtime: Handle,
    watcher: JoinHandle<()>,
}

impl BtleplugAdapter {
    /// Open the first Bluetooth adapter the host reports.
    pub async fn first(events: UnboundedSender<AdapterEvent>) -> Result<Self, AdapterError> {
        let manager = Manager::new().await.map_err(backend_error)?;
        let central = manager
            .adapters()
            .await
            .map_err(backend_error)?
            .into_iter()
            .next()
            .ok_or(AdapterError::NotActive)?;
        Self::with_central(central, events).await
    }

    /// Wrap an adapter obtained from btleplug directly.
    pub async fn with_central(
        central: Adapter,
        events: UnboundedSender<AdapterEvent>,
    ) -> Result<Self, AdapterError> {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let stream = central.events().await.map_err(backend_error)?;
        let watcher = tokio::spawn(watch_disconnects(stream, shared.clone(), events.clone()));

        match central.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        Ok(Self {
            central,
            events,
            shared,
            runtime: Handle::current(),
            watcher,
        })
    }

    fn peripheral(&self, conn: ConnHandle) -> Result<Peripheral, AdapterError> {
        lock(&self.shared)
            .links
            .get(&conn)
            .map(|link| link.peripheral.clone())
            .ok_or(AdapterError::UnknownConnection(conn))
    }

    fn target(
        &self,
        conn: ConnHandle,
        value_handle: u16,
    ) -> Result<(Peripheral, Option<Characteristic>), AdapterError> {
        let shared = lock(&self.shared);
        let link = shared
            .links
            .get(&conn)
            .ok_or(AdapterError::UnknownConnection(conn))?;
        Ok((
            link.peripheral.clone(),
            link.characteristics.get(&value_handle).cloned(),
        ))
    }
}

impl BleAdapter for BtleplugAdapter {
    fn start_scan(&mut self, duration: Duration) -> Result<(), AdapterError> {
        let mut shared = lock(&self.shared);
        if shared.scan.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(AdapterError::Busy);
        }
        info!("Scanning for {:?}", duration);
        shared.scan = Some(self.runtime.spawn(run_scan(
            self.central.clone(),
            duration,
            self.shared.clone(),
            self.events.clone(),
        )));
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), AdapterError> {
        if let Some(task) = lock(&self.shared).scan.take() {
            task.abort();
        }
        let central = self.central.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            if let Err(e) = central.stop_scan().await {
                debug!("stop_scan: {}", e);
            }
            emit(&events, AdapterEvent::ScanDone);
        });
        Ok(())
    }

    fn connect(
        &mut self,
        address_type: AddressType,
        address: PeripheralAddress,
    ) -> Result<(), AdapterError> {
        let peripheral = lock(&self.shared)
            .seen
            .get(&address)
            .cloned()
            .ok_or_else(|| AdapterError::Other(format!("{} was not seen in a scan", address)))?;

        let shared = self.shared.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            if let Err(e) = peripheral.connect().await {
                warn!("Link to {} failed: {}", address, e);
                emit(&events, AdapterEvent::PeripheralDisconnected { conn: NO_CONNECTION });
                return;
            }
            let conn = lock(&shared).open(peripheral);
            debug!("Link to {} up as handle {}", address, conn);
            emit(
                &events,
                AdapterEvent::PeripheralConnected {
                    conn,
                    address_type,
                    address,
                },
            );
        });
        Ok(())
    }

    fn disconnect(&mut self, conn: ConnHandle) -> Result<(), AdapterError> {
        let peripheral = {
            let link = lock(&self.shared)
                .links
                .remove(&conn)
                .ok_or(AdapterError::UnknownConnection(conn))?;
            link.peripheral.clone()
        };

        let events = self.events.clone();
        self.runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!("disconnect of handle {}: {}", conn, e);
            }
            emit(&events, AdapterEvent::PeripheralDisconnected { conn });
        });
        Ok(())
    }

    fn discover_services(
        &mut self,
        conn: ConnHandle,
        uuid: Option<Uuid>,
    ) -> Result<(), AdapterError> {
        let peripheral = self.peripheral(conn)?;
        let shared = self.shared.clone();
        let events = self.events.clone();

        self.runtime.spawn(async move {
            if let Err(e) = peripheral.discover_services().await {
                warn!("Service discovery on handle {} failed: {}", conn, e);
                emit(
                    &events,
                    AdapterEvent::ServiceDone {
                        conn,
                        status: ATT_UNLIKELY_ERROR,
                    },
                );
                return;
            }

            let services: Vec<api::Service> = peripheral.services().into_iter().collect();
            let layout = assign_handles(services.iter().map(|service| {
                let characteristics: Vec<(Uuid, u8)> = service
                    .characteristics
                    .iter()
                    .map(|c| (c.uuid, c.properties.bits()))
                    .collect();
                (service.uuid, characteristics)
            }));

            let mut characteristics = HashMap::new();
            for (service, laid_out) in services.iter().zip(&layout) {
                for (characteristic, slot) in
                    service.characteristics.iter().zip(&laid_out.characteristics)
                {
                    characteristics.insert(slot.value_handle, characteristic.clone());
                }
            }

            let results: Vec<AdapterEvent> = layout
                .iter()
                .filter(|service| uuid.map_or(true, |wanted| wanted == service.uuid))
                .map(|service| AdapterEvent::ServiceResult {
                    conn,
                    start_handle: service.start_handle,
                    end_handle: service.end_handle,
                    uuid: service.uuid,
                })
                .collect();

            match lock(&shared).links.get_mut(&conn) {
                Some(link) => {
                    link.services = layout;
                    link.characteristics = characteristics;
                }
                None => return,
            }

            for event in results {
                emit(&events, event);
            }
            emit(
                &events,
                AdapterEvent::ServiceDone {
                    conn,
                    status: STATUS_SUCCESS,
                },
            );
        });
        Ok(())
    }

    fn discover_characteristics(
        &mut self,
        conn: ConnHandle,
        start_handle: u16,
        end_handle: u16,
    ) -> Result<(), AdapterError> {
        // Characteristics were fetched with the services; answer from the layout.
        let found: Vec<AdapterEvent> = {
            let shared = lock(&self.shared);
            let link = shared
                .links
                .get(&conn)
                .ok_or(AdapterError::UnknownConnection(conn))?;
            link.services
                .iter()
                .flat_map(|service| &service.characteristics)
                .filter(|c| (start_handle..=end_handle).contains(&c.def_handle))
                .map(|c| AdapterEvent::CharacteristicResult {
                    conn,
                    def_handle: c.def_handle,
                    value_handle: c.value_handle,
                    properties: c.properties,
                    uuid: c.uuid,
                })
                .collect()
        };

        for event in found {
            emit(&self.events, event);
        }
        emit(
            &self.events,
            AdapterEvent::CharacteristicDone {
                conn,
                status: STATUS_SUCCESS,
            },
        );
        Ok(())
    }

    fn write(
        &mut self,
        conn: ConnHandle,
        value_handle: u16,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), AdapterError> {
        let (peripheral, characteristic) = self.target(conn, value_handle)?;
        let events = self.events.clone();
        let data = data.to_vec();

        match characteristic {
            Some(characteristic) => {
                let write_type = match mode {
                    WriteMode::WithResponse => WriteType::WithResponse,
                    WriteMode::WithoutResponse => WriteType::WithoutResponse,
                };
                self.runtime.spawn(async move {
                    let status = match peripheral.write(&characteristic, &data, write_type).await {
                        Ok(()) => STATUS_SUCCESS,
                        Err(e) => {
                            warn!("Write to {:#06x} failed: {}", value_handle, e);
                            ATT_UNLIKELY_ERROR
                        }
                    };
                    emit(
                        &events,
                        AdapterEvent::WriteDone {
                            conn,
                            value_handle,
                            status,
                        },
                    );
                });
            }
            None if data == ENABLE_NOTIFICATIONS => {
                let shared = self.shared.clone();
                self.runtime.spawn(async move {
                    let status = match subscribe_all(&peripheral, conn, &shared, &events).await {
                        Ok(()) => STATUS_SUCCESS,
                        Err(e) => {
                            warn!("Subscribing on handle {} failed: {}", conn, e);
                            ATT_UNLIKELY_ERROR
                        }
                    };
                    emit(
                        &events,
                        AdapterEvent::WriteDone {
                            conn,
                            value_handle,
                            status,
                        },
                    );
                });
            }
            None => {
                debug!("Write to unknown handle {:#06x}", value_handle);
                emit(
                    &self.events,
                    AdapterEvent::WriteDone {
                        conn,
                        value_handle,
                        status: ATT_INVALID_HANDLE,
                    },
                );
            }
        }
        Ok(())
    }

    fn read(&mut self, conn: ConnHandle, value_handle: u16) -> Result<(), AdapterError> {
        let (peripheral, characteristic) = self.target(conn, value_handle)?;
        let Some(characteristic) = characteristic else {
            emit(
                &self.events,
                AdapterEvent::ReadResult {
                    conn,
                    value_handle,
                    status: ATT_INVALID_HANDLE,
                    data: Vec::new(),
                },
            );
            return Ok(());
        };

        let events = self.events.clone();
        self.runtime.spawn(async move {
            let (status, data) = match peripheral.read(&characteristic).await {
                Ok(data) => (STATUS_SUCCESS, data),
                Err(e) => {
                    warn!("Read of {:#06x} failed: {}", value_handle, e);
                    (ATT_UNLIKELY_ERROR, Vec::new())
                }
            };
            emit(
                &events,
                AdapterEvent::ReadResult {
                    conn,
                    value_handle,
                    status,
                    data,
                },
            );
        });
        Ok(())
    }
}

impl Drop for BtleplugAdapter {
    fn drop(&mut self) {
        self.watcher.abort();
        let mut shared = lock(&self.shared);
        if let Some(task) = shared.scan.take() {
            task.abort();
        }
        shared.links.clear();
    }
}

fn backend_error(e: btleplug::Error) -> AdapterError {
    AdapterError::Other(e.to_string())
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn emit(events: &UnboundedSender<AdapterEvent>, event: AdapterEvent) {
    if events.send(event).is_err() {
        trace!("Adapter event dropped, receiver is gone");
    }
}

async fn run_scan(
    central: Adapter,
    duration: Duration,
    shared: Arc<Mutex<Shared>>,
    events: UnboundedSender<AdapterEvent>,
) {
    let mut stream = match central.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("No adapter event stream: {}", e);
            emit(&events, AdapterEvent::ScanDone);
            return;
        }
    };
    if let Err(e) = central.start_scan(ScanFilter::default()).await {
        warn!("Could not start scan: {}", e);
        emit(&events, AdapterEvent::ScanDone);
        return;
    }

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = stream.next() => match event {
                Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => {
                    if let Some((report, peripheral)) = scan_report(&central, &id).await {
                        lock(&shared).seen.insert(report.address, peripheral);
                        emit(&events, AdapterEvent::ScanResult(report));
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
    }

    if let Err(e) = central.stop_scan().await {
        debug!("stop_scan after window: {}", e);
    }
    emit(&events, AdapterEvent::ScanDone);
}

async fn scan_report(central: &Adapter, id: &PeripheralId) -> Option<(ScanReport, Peripheral)> {
    let peripheral = central.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;

    let report = ScanReport {
        address_type: match properties.address_type {
            Some(api::AddressType::Random) => AddressType::Random,
            _ => AddressType::Public,
        },
        address: PeripheralAddress(properties.address.into_inner()),
        rssi: clamp_rssi(properties.rssi),
        adv_data: synthesize_adv(
            properties.local_name.as_deref(),
            &properties.services,
            &properties.manufacturer_data,
        ),
    };
    Some((report, peripheral))
}

/// Forward link losses the host stack reports on its own.
async fn watch_disconnects<S>(
    mut stream: S,
    shared: Arc<Mutex<Shared>>,
    events: UnboundedSender<AdapterEvent>,
) where
    S: Stream<Item = CentralEvent> + Unpin,
{
    while let Some(event) = stream.next().await {
        let CentralEvent::DeviceDisconnected(id) = event else {
            continue;
        };

        let dropped: Vec<ConnHandle> = {
            let mut shared = lock(&shared);
            let conns: Vec<ConnHandle> = shared
                .links
                .iter()
                .filter(|(_, link)| link.peripheral.id() == id)
                .map(|(conn, _)| *conn)
                .collect();
            for conn in &conns {
                shared.links.remove(conn);
            }
            conns
        };

        for conn in dropped {
            info!("Host reported handle {} disconnected", conn);
            emit(&events, AdapterEvent::PeripheralDisconnected { conn });
        }
    }
}

async fn subscribe_all(
    peripheral: &Peripheral,
    conn: ConnHandle,
    shared: &Arc<Mutex<Shared>>,
    events: &UnboundedSender<AdapterEvent>,
) -> btleplug::Result<()> {
    let targets: Vec<(u16, Characteristic)> = {
        let shared = lock(shared);
        let Some(link) = shared.links.get(&conn) else {
            return Err(btleplug::Error::NotConnected);
        };
        link.characteristics
            .iter()
            .filter(|(_, c)| {
                c.properties
                    .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
            })
            .map(|(handle, c)| (*handle, c.clone()))
            .collect()
    };

    for (_, characteristic) in &targets {
        peripheral.subscribe(characteristic).await?;
    }

    let mut notifications = peripheral.notifications().await?;
    let handles: HashMap<Uuid, u16> = targets.iter().map(|(h, c)| (c.uuid, *h)).collect();
    let events = events.clone();
    let task = tokio::spawn(async move {
        while let Some(notification) = notifications.next().await {
            if let Some(&value_handle) = handles.get(&notification.uuid) {
                emit(
                    &events,
                    AdapterEvent::Notify {
                        conn,
                        value_handle,
                        data: notification.value,
                    },
                );
            }
        }
    });

    let mut shared = lock(shared);
    match shared.links.get_mut(&conn) {
        Some(link) => {
            if let Some(previous) = link.notifications.replace(task) {
                previous.abort();
            }
        }
        None => task.abort(),
    }
    Ok(())
}

/// Lay services and their characteristics out over synthetic ATT handles.
fn assign_handles<I, C>(services: I) -> Vec<ServiceLayout>
where
    I: IntoIterator<Item = (Uuid, C)>,
    C: IntoIterator<Item = (Uuid, u8)>,
{
    let mut next = FIRST_HANDLE;
    let mut layout = Vec::new();

    for (uuid, characteristics) in services {
        let start_handle = next;
        next = next.saturating_add(1);

        let mut laid_out = Vec::new();
        for (uuid, properties) in characteristics {
            let def_handle = next;
            next = next.saturating_add(HANDLES_PER_CHARACTERISTIC);
            laid_out.push(CharacteristicLayout {
                uuid,
                def_handle,
                value_handle: def_handle.saturating_add(1),
                properties,
            });
        }

        layout.push(ServiceLayout {
            uuid,
            start_handle,
            end_handle: next - 1,
            characteristics: laid_out,
        });
    }

    layout
}

/// Rebuild advertising records from the fields btleplug decoded.
fn synthesize_adv(
    local_name: Option<&str>,
    services: &[Uuid],
    manufacturer_data: &HashMap<u16, Vec<u8>>,
) -> Vec<u8> {
    let mut data = Vec::new();

    for chunk in services.chunks(UUIDS_PER_RECORD) {
        let value: Vec<u8> = chunk
            .iter()
            .flat_map(|uuid| uuid.as_u128().to_le_bytes())
            .collect();
        push_record(&mut data, ad_type::COMPLETE_UUID128, &value);
    }

    let mut companies: Vec<_> = manufacturer_data.iter().collect();
    // The scanner reads the first manufacturer record.
    companies.sort_by_key(|(company_id, _)| (**company_id != LEGO_COMPANY_ID, **company_id));
    for (company_id, payload) in companies {
        let mut value = company_id.to_le_bytes().to_vec();
        value.extend_from_slice(payload);
        push_record(&mut data, ad_type::MANUFACTURER_SPECIFIC, &value);
    }

    if let Some(name) = local_name {
        push_record(&mut data, ad_type::COMPLETE_LOCAL_NAME, name.as_bytes());
    }

    data
}

fn push_record(data: &mut Vec<u8>, kind: u8, value: &[u8]) {
    let value = &value[..value.len().min(u8::MAX as usize - 1)];
    data.push(value.len() as u8 + 1);
    data.push(kind);
    data.extend_from_slice(value);
}

fn clamp_rssi(rssi: Option<i16>) -> i8 {
    rssi.map_or(i8::MIN, |r| r.clamp(i8::MIN.into(), i8::MAX.into()) as i8)
}
