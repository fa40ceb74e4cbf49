//! BLE Connection Module
//!
//! Drives a remote from the first scan result to a subscribed, ready link.
//!
//! ```text
//! Idle -> Scanning -> Discovered -> Connecting -> ServiceDiscovery
//!      -> CharacteristicDiscovery -> Subscribing -> Ready
//! ```
//!
//! Every adapter event goes through [`ConnectionStateMachine::dispatch`].
//! Any failure, a disconnect or [`ConnectionStateMachine::cancel`] tears the
//! connection down through `Disconnected` back to `Idle`, clearing the
//! button state in the same step.

use crate::domain::buttons::{Button, ButtonCombo, ButtonState};
use crate::domain::models::{ConnectionState, PeripheralAddress, RemoteEvent};
use crate::error::RemoteError;
use crate::infrastructure::bluetooth::adapter::{
    AdapterEvent, BleAdapter, ConnHandle, ScanReport, WriteMode, STATUS_SUCCESS,
};
use crate::infrastructure::bluetooth::protocol::{
    self, ButtonMode, Color, Command, WriteTarget, CHARACTERISTIC_UUID, LEFT_PORT, RIGHT_PORT,
    SERVICE_UUID,
};
use crate::infrastructure::bluetooth::scanner::{PeripheralCandidate, ScanFilter};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    /// Paddle input mode requested from the remote
    pub button_mode: ButtonMode,
    /// Color written once the link is ready
    pub initial_color: Option<Color>,
}

/// The subscribe handshake, in the order the writes are sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    LeftPort,
    RightPort,
    Notifications,
}

impl HandshakeStep {
    pub fn command(&self, mode: ButtonMode) -> Command {
        match self {
            Self::LeftPort => Command::EnablePortNotifications {
                port: LEFT_PORT,
                mode,
            },
            Self::RightPort => Command::EnablePortNotifications {
                port: RIGHT_PORT,
                mode,
            },
            Self::Notifications => Command::EnableNotifications,
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::LeftPort => Some(Self::RightPort),
            Self::RightPort => Some(Self::Notifications),
            Self::Notifications => None,
        }
    }
}

/// Per-connection data; dropped as a whole on teardown
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    pub peer: Option<PeripheralCandidate>,
    pub conn: Option<ConnHandle>,
    pub service_range: Option<(u16, u16)>,
    pub value_handle: Option<u16>,
    /// Handshake write waiting for its acknowledgement
    pub pending: Option<HandshakeStep>,
    pub read_pending: bool,
    /// Value of the last completed read, until taken
    pub read_value: Option<Vec<u8>>,
}

pub struct ConnectionStateMachine<A: BleAdapter> {
    adapter: A,
    config: ConnectionConfig,
    state: ConnectionState,
    filter: ScanFilter,
    context: Option<ConnectionContext>,
    buttons: ButtonState,
    last_error: Option<RemoteError>,
    /// Last promoted peer; survives teardown
    last_peer: Option<PeripheralAddress>,
    state_tx: watch::Sender<ConnectionState>,
    event_sender: Option<mpsc::UnboundedSender<RemoteEvent>>,
}

impl<A: BleAdapter> ConnectionStateMachine<A> {
    pub fn new(adapter: A, config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            adapter,
            config,
            state: ConnectionState::Idle,
            filter: ScanFilter::default(),
            context: None,
            buttons: ButtonState::new(),
            last_error: None,
            last_peer: None,
            state_tx,
            event_sender: None,
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn context(&self) -> Option<&ConnectionContext> {
        self.context.as_ref()
    }

    pub fn pressed(&self) -> Vec<Button> {
        self.buttons.snapshot()
    }

    pub fn combo(&self) -> ButtonCombo {
        self.buttons.combo()
    }

    /// Address of the current peer, else the pinned address, else the last
    /// remote that was connected to.
    pub fn address(&self) -> Option<PeripheralAddress> {
        self.context
            .as_ref()
            .and_then(|ctx| ctx.peer.as_ref())
            .map(|peer| peer.address)
            .or(self.filter.target())
            .or(self.last_peer)
    }

    /// Reason the last attempt ended, consumed by the caller.
    pub fn take_error(&mut self) -> Option<RemoteError> {
        self.last_error.take()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn set_event_sender(&mut self, sender: mpsc::UnboundedSender<RemoteEvent>) {
        self.event_sender = Some(sender);
    }

    /// Start scanning for a remote, optionally pinned to `target`.
    pub fn begin_connect(
        &mut self,
        timeout: Duration,
        target: Option<PeripheralAddress>,
    ) -> Result<(), RemoteError> {
        if !self.state.is_idle() {
            debug!("Restarting connect from {:?}", self.state);
            self.cancel();
        }

        self.filter = ScanFilter::new(target);
        self.last_error = None;
        self.context = Some(ConnectionContext::default());

        match target {
            Some(address) => info!("Scanning {:?} for remote {}", timeout, address),
            None => info!("Scanning {:?} for any remote", timeout),
        }

        if let Err(e) = self.adapter.start_scan(timeout) {
            warn!("Could not start scan: {}", e);
            self.context = None;
            return Err(e.into());
        }
        self.set_state(ConnectionState::Scanning);
        Ok(())
    }

    /// Stop everything and return to `Idle`. Safe to call in any state.
    pub fn cancel(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Scanning | ConnectionState::Discovered
        ) {
            if let Err(e) = self.adapter.stop_scan() {
                debug!("stop_scan during cancel: {}", e);
            }
        }

        if let Some(conn) = self.context.as_ref().and_then(|ctx| ctx.conn) {
            info!("Disconnecting handle {}", conn);
            if let Err(e) = self.adapter.disconnect(conn) {
                debug!("disconnect during cancel: {}", e);
            }
        }

        self.teardown();
    }

    /// React to one adapter event.
    pub fn dispatch(&mut self, event: AdapterEvent) {
        if let Some(conn) = event.conn() {
            let ours = self.current_conn() == Some(conn);
            // A failed link-layer connect reports a handle that was never assigned.
            let connect_failed = self.state == ConnectionState::Connecting
                && self.current_conn().is_none()
                && matches!(event, AdapterEvent::PeripheralDisconnected { .. });
            if !ours && !connect_failed && !matches!(event, AdapterEvent::PeripheralConnected { .. })
            {
                trace!("Ignoring event for foreign handle {}: {:?}", conn, event);
                return;
            }
        }

        match event {
            AdapterEvent::ScanResult(report) => self.on_scan_result(report),
            AdapterEvent::ScanDone => self.on_scan_done(),
            AdapterEvent::PeripheralConnected { conn, address, .. } => {
                self.on_connected(conn, address)
            }
            AdapterEvent::PeripheralDisconnected { conn } => self.on_disconnected(conn),
            AdapterEvent::ServiceResult {
                start_handle,
                end_handle,
                uuid,
                ..
            } => self.on_service_result(start_handle, end_handle, uuid),
            AdapterEvent::ServiceDone { status, .. } => self.on_service_done(status),
            AdapterEvent::CharacteristicResult {
                value_handle, uuid, ..
            } => self.on_characteristic_result(value_handle, uuid),
            AdapterEvent::CharacteristicDone { status, .. } => self.on_characteristic_done(status),
            AdapterEvent::WriteDone { status, .. } => self.on_write_done(status),
            AdapterEvent::ReadResult {
                value_handle,
                status,
                data,
                ..
            } => self.on_read_result(value_handle, status, data),
            AdapterEvent::Notify { data, .. } => self.on_notify(&data),
        }
    }

    /// Fire-and-forget write of a command. Returns `false` when not ready.
    pub fn write_command(&mut self, command: Command) -> bool {
        self.write_raw(command.target(), &command.encode())
    }

    /// Write raw bytes to the remote. Returns `false` when not ready.
    pub fn write_raw(&mut self, target: WriteTarget, data: &[u8]) -> bool {
        if !self.is_ready() {
            debug!("Dropping write while {:?}", self.state);
            return false;
        }
        let Some((conn, handle)) = self.resolve(target) else {
            return false;
        };

        trace!("Writing {:02X?} to handle {:#06x}", data, handle);
        if let Err(e) = self
            .adapter
            .write(conn, handle, data, WriteMode::WithResponse)
        {
            warn!("Write failed: {}", e);
            self.fail(e.into());
            return false;
        }
        true
    }

    /// Read the hub characteristic. Returns `false` when not ready or when a
    /// read is already in flight.
    pub fn request_read(&mut self) -> bool {
        if !self.is_ready() {
            debug!("Dropping read while {:?}", self.state);
            return false;
        }
        let Some((conn, handle)) = self.resolve(WriteTarget::Characteristic) else {
            return false;
        };
        if self.context.as_ref().is_some_and(|ctx| ctx.read_pending) {
            debug!("Read already pending on handle {:#06x}", handle);
            return false;
        }

        trace!("Reading handle {:#06x}", handle);
        if let Err(e) = self.adapter.read(conn, handle) {
            warn!("Read failed: {}", e);
            self.fail(e.into());
            return false;
        }
        let ctx = self.context_mut();
        ctx.read_pending = true;
        ctx.read_value = None;
        true
    }

    /// Value of the last completed read, if not taken yet.
    pub fn take_read(&mut self) -> Option<Vec<u8>> {
        self.context.as_mut().and_then(|ctx| ctx.read_value.take())
    }

    pub fn read_pending(&self) -> bool {
        self.context.as_ref().is_some_and(|ctx| ctx.read_pending)
    }

    fn current_conn(&self) -> Option<ConnHandle> {
        self.context.as_ref().and_then(|ctx| ctx.conn)
    }

    fn context_mut(&mut self) -> &mut ConnectionContext {
        self.context.get_or_insert_with(ConnectionContext::default)
    }

    fn resolve(&self, target: WriteTarget) -> Option<(ConnHandle, u16)> {
        let ctx = self.context.as_ref()?;
        let conn = ctx.conn?;
        let handle = match target {
            WriteTarget::Characteristic => ctx.value_handle?,
            WriteTarget::Handle(handle) => handle,
        };
        Some((conn, handle))
    }

    fn on_scan_result(&mut self, report: ScanReport) {
        if self.state != ConnectionState::Scanning {
            return;
        }
        let Some(candidate) = self.filter.evaluate(&report) else {
            return;
        };

        info!(
            "Found remote {} ({}, RSSI {})",
            candidate.address,
            candidate.name.as_deref().unwrap_or("Unknown"),
            candidate.rssi
        );
        let (address_type, address) = (candidate.address_type, candidate.address);
        self.context_mut().peer = Some(candidate);
        self.last_peer = Some(address);
        self.set_state(ConnectionState::Discovered);

        if let Err(e) = self.adapter.stop_scan() {
            warn!("Could not stop scan: {}", e);
            self.fail(e.into());
            return;
        }

        info!("Connecting to {}", address);
        self.set_state(ConnectionState::Connecting);
        if let Err(e) = self.adapter.connect(address_type, address) {
            warn!("Connect request failed: {}", e);
            self.fail(e.into());
        }
    }

    fn on_scan_done(&mut self) {
        if self.state == ConnectionState::Scanning {
            info!("Scan finished without finding a remote");
            self.fail(RemoteError::ScanTimeout);
        }
    }

    fn on_connected(&mut self, conn: ConnHandle, address: PeripheralAddress) {
        let expected = self
            .context
            .as_ref()
            .and_then(|ctx| ctx.peer.as_ref())
            .map(|peer| peer.address);

        if self.state != ConnectionState::Connecting || expected != Some(address) {
            warn!(
                "Unexpected connection {} to {} while {:?}, dropping it",
                conn, address, self.state
            );
            if let Err(e) = self.adapter.disconnect(conn) {
                debug!("disconnect of unexpected connection: {}", e);
            }
            return;
        }

        info!("Connected to {} (handle {})", address, conn);
        self.context_mut().conn = Some(conn);
        self.set_state(ConnectionState::ServiceDiscovery);

        if let Err(e) = self.adapter.discover_services(conn, Some(SERVICE_UUID)) {
            warn!("Service discovery failed to start: {}", e);
            self.fail(e.into());
        }
    }

    fn on_disconnected(&mut self, conn: ConnHandle) {
        info!("Remote disconnected (handle {})", conn);
        // The link is already gone, forget the handle before tearing down.
        self.context_mut().conn = None;
        self.last_error = Some(RemoteError::Disconnected);
        self.teardown();
    }

    fn on_service_result(&mut self, start_handle: u16, end_handle: u16, uuid: Uuid) {
        if self.state != ConnectionState::ServiceDiscovery || uuid != SERVICE_UUID {
            return;
        }
        let Some(conn) = self.current_conn() else {
            return;
        };

        debug!(
            "Hub service at handles {:#06x}..={:#06x}",
            start_handle, end_handle
        );
        self.context_mut().service_range = Some((start_handle, end_handle));
        self.set_state(ConnectionState::CharacteristicDiscovery);

        if let Err(e) = self
            .adapter
            .discover_characteristics(conn, start_handle, end_handle)
        {
            warn!("Characteristic discovery failed to start: {}", e);
            self.fail(e.into());
        }
    }

    fn on_service_done(&mut self, status: u16) {
        if self.state == ConnectionState::ServiceDiscovery {
            warn!("Service discovery finished (status {}) without the hub service", status);
            self.fail(RemoteError::ServiceNotFound);
        }
    }

    fn on_characteristic_result(&mut self, value_handle: u16, uuid: Uuid) {
        if self.state != ConnectionState::CharacteristicDiscovery || uuid != CHARACTERISTIC_UUID {
            return;
        }

        debug!("Hub characteristic value handle {:#06x}", value_handle);
        self.context_mut().value_handle = Some(value_handle);
        self.set_state(ConnectionState::Subscribing);
        self.send_step(HandshakeStep::LeftPort);
    }

    fn on_characteristic_done(&mut self, status: u16) {
        if self.state == ConnectionState::CharacteristicDiscovery {
            warn!(
                "Characteristic discovery finished (status {}) without the hub characteristic",
                status
            );
            self.fail(RemoteError::CharacteristicNotFound);
        }
    }

    fn send_step(&mut self, step: HandshakeStep) {
        let command = step.command(self.config.button_mode);
        let Some((conn, handle)) = self.resolve(command.target()) else {
            return;
        };

        debug!("Handshake {:?}", step);
        self.context_mut().pending = Some(step);
        if let Err(e) = self
            .adapter
            .write(conn, handle, &command.encode(), WriteMode::WithResponse)
        {
            warn!("Handshake write {:?} failed: {}", step, e);
            self.fail(e.into());
        }
    }

    fn on_write_done(&mut self, status: u16) {
        let pending = self.context.as_ref().and_then(|ctx| ctx.pending);

        match (self.state, pending) {
            (ConnectionState::Subscribing, Some(step)) => {
                if status != STATUS_SUCCESS {
                    warn!("Handshake {:?} rejected with status {}", step, status);
                    self.fail(RemoteError::HandshakeFailed { step, status });
                    return;
                }

                self.context_mut().pending = None;
                match step.next() {
                    Some(next) => self.send_step(next),
                    None => self.on_ready(),
                }
            }
            (ConnectionState::Ready, _) if status != STATUS_SUCCESS => {
                warn!("Write rejected with status {}", status);
                self.fail(RemoteError::WriteFailed { status });
            }
            _ => trace!("Write acknowledged while {:?}", self.state),
        }
    }

    fn on_read_result(&mut self, value_handle: u16, status: u16, data: Vec<u8>) {
        let expected = self.context.as_ref().and_then(|ctx| ctx.value_handle);
        if self.state != ConnectionState::Ready
            || !self.read_pending()
            || expected != Some(value_handle)
        {
            trace!("Ignoring read result for handle {:#06x}", value_handle);
            return;
        }
        if status != STATUS_SUCCESS {
            warn!("Read rejected with status {}", status);
            self.fail(RemoteError::ReadFailed { status });
            return;
        }

        debug!("Read {:02X?}", data);
        let ctx = self.context_mut();
        ctx.read_pending = false;
        ctx.read_value = Some(data.clone());
        self.emit(RemoteEvent::Read(data));
    }

    fn on_ready(&mut self) {
        info!("Remote ready");
        self.set_state(ConnectionState::Ready);

        if let Some(color) = self.config.initial_color {
            self.write_command(Command::SetColor(color));
        }
    }

    fn on_notify(&mut self, data: &[u8]) {
        if !matches!(
            self.state,
            ConnectionState::Subscribing | ConnectionState::Ready
        ) {
            return;
        }
        let Some(frame) = protocol::decode_notification(data) else {
            return;
        };

        let before = self.buttons.clone();
        self.buttons.apply(frame);
        if self.buttons != before {
            let pressed = self.buttons.snapshot();
            debug!("Buttons: {:?}", pressed);
            self.emit(RemoteEvent::Buttons(pressed));
        }
    }

    fn fail(&mut self, error: RemoteError) {
        warn!("Connection attempt aborted: {}", error);
        self.cancel();
        self.last_error = Some(error);
    }

    fn teardown(&mut self) {
        let had_buttons = !self.buttons.is_empty();
        self.buttons.clear();
        self.context = None;

        if had_buttons {
            self.emit(RemoteEvent::Buttons(Vec::new()));
        }
        if self.state != ConnectionState::Idle {
            self.set_state(ConnectionState::Disconnected);
            self.set_state(ConnectionState::Idle);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!("{:?} -> {:?}", self.state, state);
        self.state = state;
        self.state_tx.send_replace(state);
        self.emit(RemoteEvent::StateChanged(state));
    }

    fn emit(&self, event: RemoteEvent) {
        if let Some(sender) = &self.event_sender {
            let _ = sender.send(event);
        }
    }
}
