//! Remote Service Module
//!
//! Facade that owns the adapter event receiver and the connection state
//! machine, and exposes the handset API: connect, cancel, pressed buttons,
//! address and light color.

use crate::domain::buttons::{Button, ButtonCombo};
use crate::domain::models::{ConnectionState, PeripheralAddress, RemoteEvent};
use crate::domain::settings::RemoteSettings;
use crate::error::RemoteError;
use crate::infrastructure::bluetooth::{
    adapter::{AdapterEvent, BleAdapter},
    connection::{ConnectionConfig, ConnectionStateMachine},
    protocol::{self, Color, Command, WriteTarget},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Aborts a pending [`RemoteService::connect`] from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    generation: Arc<watch::Sender<u64>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }
}

/// Handset facade over a [`BleAdapter`]
pub struct RemoteService<A: BleAdapter> {
    machine: ConnectionStateMachine<A>,
    events: mpsc::UnboundedReceiver<AdapterEvent>,
    settings: RemoteSettings,
    cancel_tx: Arc<watch::Sender<u64>>,
}

impl<A: BleAdapter> RemoteService<A> {
    /// `events` must be the receiving end of the channel `adapter` reports into.
    pub fn new(
        adapter: A,
        events: mpsc::UnboundedReceiver<AdapterEvent>,
        settings: RemoteSettings,
    ) -> Self {
        let config = ConnectionConfig {
            button_mode: settings.button_mode,
            initial_color: settings.initial_color,
        };
        let (cancel_tx, _) = watch::channel(0);

        Self {
            machine: ConnectionStateMachine::new(adapter, config),
            events,
            settings,
            cancel_tx: Arc::new(cancel_tx),
        }
    }

    /// Connect to the first matching remote and wait until it is ready.
    ///
    /// `address` pins the attempt to one remote; without it the pinned address
    /// from the settings applies, if any. Scanning is bounded by `timeout` and
    /// everything after the scan by the handshake timeout from the settings.
    pub async fn connect(
        &mut self,
        timeout: Duration,
        address: Option<PeripheralAddress>,
    ) -> Result<(), RemoteError> {
        let target = address.or(self.settings.pinned_address);
        let handshake_timeout = self.settings.handshake_timeout();
        let mut cancel_rx = self.cancel_tx.subscribe();

        self.machine.begin_connect(timeout, target)?;

        let scan_deadline = Instant::now() + timeout;
        let mut handshake_deadline: Option<Instant> = None;

        loop {
            match self.machine.state() {
                ConnectionState::Ready => {
                    info!("Connected to remote {:?}", self.machine.address());
                    return Ok(());
                }
                state if state.is_idle() => {
                    let error = self
                        .machine
                        .take_error()
                        .unwrap_or(RemoteError::Disconnected);
                    return Err(error);
                }
                ConnectionState::Scanning => {}
                _ => {
                    handshake_deadline.get_or_insert_with(|| Instant::now() + handshake_timeout);
                }
            }

            let deadline = handshake_deadline.unwrap_or(scan_deadline);
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.machine.dispatch(event),
                    None => return Err(self.abort(RemoteError::AdapterClosed)),
                },
                _ = cancel_rx.changed() => {
                    return Err(self.abort(RemoteError::Cancelled));
                }
                _ = sleep_until(deadline) => {
                    let error = if handshake_deadline.is_some() {
                        RemoteError::HandshakeTimeout(handshake_timeout)
                    } else {
                        RemoteError::ScanTimeout
                    };
                    return Err(self.abort(error));
                }
            }
        }
    }

    /// [`connect`](Self::connect) with the scan timeout and pinned address from
    /// the settings.
    pub async fn connect_default(&mut self) -> Result<(), RemoteError> {
        let timeout = self.settings.scan_timeout();
        self.connect(timeout, None).await
    }

    /// Read the hub characteristic and wait for its value.
    pub async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, RemoteError> {
        if !self.machine.is_ready() {
            return Err(RemoteError::NotReady);
        }
        if !self.machine.request_read() {
            return Err(self.machine.take_error().unwrap_or(RemoteError::NotReady));
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.machine.take_read() {
                return Ok(value);
            }
            if !self.machine.is_ready() {
                return Err(self
                    .machine
                    .take_error()
                    .unwrap_or(RemoteError::Disconnected));
            }

            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.machine.dispatch(event),
                    None => return Err(self.abort(RemoteError::AdapterClosed)),
                },
                _ = sleep_until(deadline) => {
                    return Err(self.abort(RemoteError::ReadTimeout(timeout)));
                }
            }
        }
    }

    fn abort(&mut self, error: RemoteError) -> RemoteError {
        warn!("Aborting: {}", error);
        self.machine.cancel();
        error
    }

    /// Parse `address` and pin future connects to it.
    pub fn pin(&mut self, address: &str) -> Result<PeripheralAddress, RemoteError> {
        let address: PeripheralAddress = address.parse()?;
        debug!("Pinned remote {}", address);
        self.settings.pinned_address = Some(address);
        Ok(address)
    }

    /// Stop scanning or disconnect, whatever is in progress.
    pub fn cancel(&mut self) {
        self.machine.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            generation: Arc::clone(&self.cancel_tx),
        }
    }

    /// Currently pressed buttons, empty when not connected.
    pub fn pressed(&self) -> Vec<Button> {
        self.machine.pressed()
    }

    pub fn combo(&self) -> ButtonCombo {
        self.machine.combo()
    }

    /// Connected peer, else the pinned address, else the last remote seen.
    pub fn address(&self) -> Option<PeripheralAddress> {
        if self.machine.is_connected() {
            return self.machine.address();
        }
        self.settings.pinned_address.or(self.machine.address())
    }

    /// Set the remote's light. Ignored unless the remote is ready.
    pub fn color(&mut self, color: Color) {
        self.machine.write_command(Command::SetColor(color));
    }

    /// Pack `fields` into bytes and write them to the hub characteristic.
    ///
    /// Returns `Ok(false)` when the remote is not ready.
    pub fn send_fields(&mut self, fields: &[i16]) -> Result<bool, RemoteError> {
        let data = protocol::pack_fields(fields)?;
        Ok(self.machine.write_raw(WriteTarget::Characteristic, &data))
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn is_connected(&self) -> bool {
        self.machine.is_connected()
    }

    pub fn is_ready(&self) -> bool {
        self.machine.is_ready()
    }

    /// Dispatch every event already queued by the adapter.
    pub fn process_pending(&mut self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.events.try_recv() {
            self.machine.dispatch(event);
            count += 1;
        }
        count
    }

    /// Wait for one adapter event and dispatch it. Returns `false` once the
    /// adapter has gone away.
    pub async fn process_next(&mut self) -> bool {
        match self.events.recv().await {
            Some(event) => {
                self.machine.dispatch(event);
                true
            }
            None => false,
        }
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.machine.watch_state()
    }

    /// Start receiving state and button events. Replaces any previous subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<RemoteEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.machine.set_event_sender(tx);
        rx
    }

    pub fn settings(&self) -> &RemoteSettings {
        &self.settings
    }

    pub fn adapter(&self) -> &A {
        self.machine.adapter()
    }
}

impl<A: BleAdapter> Drop for RemoteService<A> {
    fn drop(&mut self) {
        self.machine.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::AddressType;
    use crate::infrastructure::bluetooth::protocol::{CHARACTERISTIC_UUID, SERVICE_UUID};
    use crate::infrastructure::bluetooth::testing::*;

    fn service(
        settings: RemoteSettings,
    ) -> (
        RemoteService<RecordingAdapter>,
        mpsc::UnboundedSender<AdapterEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            RemoteService::new(RecordingAdapter::default(), rx, settings),
            tx,
        )
    }

    fn queue_until_subscribing(tx: &mpsc::UnboundedSender<AdapterEvent>) {
        tx.send(scan_result(REMOTE, 0x42)).unwrap();
        tx.send(AdapterEvent::PeripheralConnected {
            conn: CONN,
            address_type: AddressType::Public,
            address: REMOTE,
        })
        .unwrap();
        tx.send(AdapterEvent::ServiceResult {
            conn: CONN,
            start_handle: 0x0B,
            end_handle: 0x20,
            uuid: SERVICE_UUID,
        })
        .unwrap();
        tx.send(AdapterEvent::CharacteristicResult {
            conn: CONN,
            def_handle: 0x0D,
            value_handle: VALUE_HANDLE,
            properties: 0x1E,
            uuid: CHARACTERISTIC_UUID,
        })
        .unwrap();
    }

    fn queue_handshake(tx: &mpsc::UnboundedSender<AdapterEvent>) {
        queue_until_subscribing(tx);
        for _ in 0..3 {
            tx.send(write_ack(0)).unwrap();
        }
    }

    #[tokio::test]
    async fn connect_resolves_when_ready() {
        let (mut service, tx) = service(RemoteSettings::default());
        queue_handshake(&tx);

        service
            .connect(Duration::from_secs(5), None)
            .await
            .unwrap();
        assert!(service.is_ready());
        assert_eq!(service.address(), Some(REMOTE));
        assert_eq!(*service.watch_state().borrow(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn connect_reports_scan_exhaustion() {
        let (mut service, tx) = service(RemoteSettings::default());
        tx.send(scan_result(REMOTE, 0x41)).unwrap();
        tx.send(AdapterEvent::ScanDone).unwrap();

        let result = service.connect(Duration::from_secs(5), None).await;
        assert_eq!(result, Err(RemoteError::ScanTimeout));
        assert_eq!(service.adapter().connects(), 0);
        assert_eq!(service.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn connect_times_out_without_scan_done() {
        let (mut service, _tx) = service(RemoteSettings::default());
        let result = service.connect(Duration::from_millis(20), None).await;
        assert_eq!(result, Err(RemoteError::ScanTimeout));
        assert_eq!(service.adapter().calls.last(), Some(&Call::StopScan));
    }

    #[tokio::test]
    async fn handshake_is_bounded() {
        let settings = RemoteSettings {
            handshake_timeout_ms: 30,
            ..RemoteSettings::default()
        };
        let (mut service, tx) = service(settings);
        queue_until_subscribing(&tx);

        let result = service.connect(Duration::from_secs(5), None).await;
        assert_eq!(
            result,
            Err(RemoteError::HandshakeTimeout(Duration::from_millis(30)))
        );
        assert_eq!(service.state(), ConnectionState::Idle);
        assert!(service.adapter().calls.contains(&Call::Disconnect(CONN)));
    }

    #[tokio::test]
    async fn connect_surfaces_handshake_failure() {
        let (mut service, tx) = service(RemoteSettings::default());
        queue_until_subscribing(&tx);
        tx.send(write_ack(0)).unwrap();
        tx.send(write_ack(0x03)).unwrap();

        let result = service.connect(Duration::from_secs(5), None).await;
        assert!(matches!(
            result,
            Err(RemoteError::HandshakeFailed { status: 0x03, .. })
        ));
        assert!(service.pressed().is_empty());
    }

    #[tokio::test]
    async fn closed_adapter_channel_fails_connect() {
        let (mut service, tx) = service(RemoteSettings::default());
        drop(tx);
        let result = service.connect(Duration::from_secs(5), None).await;
        assert_eq!(result, Err(RemoteError::AdapterClosed));
        assert_eq!(service.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn cancel_handle_aborts_connect() {
        let (mut service, _tx) = service(RemoteSettings::default());
        let handle = service.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });

        let result = service.connect(Duration::from_secs(5), None).await;
        assert_eq!(result, Err(RemoteError::Cancelled));
        assert_eq!(service.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn pinned_address_from_settings_applies() {
        let settings = RemoteSettings {
            pinned_address: Some(REMOTE),
            ..RemoteSettings::default()
        };
        let (mut service, tx) = service(settings);
        assert_eq!(service.address(), Some(REMOTE));

        let other = PeripheralAddress([0x90, 0x84, 0x2B, 0x09, 0x09, 0x09]);
        tx.send(scan_result(other, 0x42)).unwrap();
        queue_handshake(&tx);

        service
            .connect(Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(service.adapter().connects(), 1);
        assert!(service.adapter().calls.contains(&Call::Connect(REMOTE)));
    }

    #[test]
    fn pin_parses_address() {
        let (mut service, _tx) = service(RemoteSettings::default());
        assert_eq!(service.pin("90:84:2b:01:02:03").unwrap(), REMOTE);
        assert_eq!(service.settings().pinned_address, Some(REMOTE));
        assert!(matches!(
            service.pin("not-an-address"),
            Err(RemoteError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn buttons_and_color_after_ready() {
        let (mut service, tx) = service(RemoteSettings::default());
        let mut events = service.subscribe();
        queue_handshake(&tx);
        service
            .connect(Duration::from_secs(5), None)
            .await
            .unwrap();

        tx.send(notify(&[0x05, 0x00, 0x45, 0x00, 0x01])).unwrap();
        tx.send(notify(&[0x05, 0x00, 0x45, 0x01, 0xFF])).unwrap();
        assert_eq!(service.process_pending(), 2);
        assert_eq!(service.pressed(), vec![Button::LeftPlus, Button::RightMinus]);
        assert_eq!(service.combo(), ButtonCombo::LeftPlusRightMinus);

        service.color(Color::LightGreen);
        assert_eq!(
            service.adapter().writes().last().map(|w| w.1.clone()),
            Some(vec![0x08, 0x00, 0x81, 0x34, 0x11, 0x51, 0x00, 0x05])
        );

        let mut buttons = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RemoteEvent::Buttons(pressed) = event {
                buttons.push(pressed);
            }
        }
        assert_eq!(
            buttons,
            vec![
                vec![Button::LeftPlus],
                vec![Button::LeftPlus, Button::RightMinus]
            ]
        );

        tx.send(AdapterEvent::PeripheralDisconnected { conn: CONN })
            .unwrap();
        assert!(service.process_next().await);
        assert!(service.pressed().is_empty());
        assert_eq!(service.state(), ConnectionState::Idle);
    }

    #[test]
    fn writes_are_ignored_when_not_ready() {
        let (mut service, _tx) = service(RemoteSettings::default());
        service.color(Color::Red);
        assert_eq!(service.send_fields(&[8, 0, 0x81]), Ok(false));
        assert!(service.adapter().writes().is_empty());
        assert!(matches!(
            service.send_fields(&[300]),
            Err(RemoteError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn send_fields_packs_signed_values() {
        let (mut service, tx) = service(RemoteSettings::default());
        queue_handshake(&tx);
        service
            .connect(Duration::from_secs(5), None)
            .await
            .unwrap();

        assert_eq!(service.send_fields(&[0x05, 0x00, 0x45, 0x00, -1]), Ok(true));
        assert_eq!(
            service.adapter().writes().last(),
            Some(&(VALUE_HANDLE, vec![0x05, 0x00, 0x45, 0x00, 0xFF]))
        );
    }

    #[tokio::test]
    async fn connect_default_uses_scan_timeout_setting() {
        let settings = RemoteSettings {
            scan_timeout_ms: 25,
            ..RemoteSettings::default()
        };
        let (mut service, _tx) = service(settings);
        assert_eq!(service.connect_default().await, Err(RemoteError::ScanTimeout));
        assert_eq!(
            service.adapter().calls.first(),
            Some(&Call::StartScan(Duration::from_millis(25)))
        );
    }

    #[tokio::test]
    async fn read_waits_for_value() {
        let (mut service, tx) = service(RemoteSettings::default());
        assert_eq!(
            service.read(Duration::from_secs(1)).await,
            Err(RemoteError::NotReady)
        );

        queue_handshake(&tx);
        service
            .connect(Duration::from_secs(5), None)
            .await
            .unwrap();

        tx.send(notify(&[0x05, 0x00, 0x45, 0x00, 0x01])).unwrap();
        tx.send(read_result(0, &[0x07, 0x00, 0x45])).unwrap();
        assert_eq!(
            service.read(Duration::from_secs(1)).await,
            Ok(vec![0x07, 0x00, 0x45])
        );
        assert_eq!(service.pressed(), vec![Button::LeftPlus]);
        assert!(service
            .adapter()
            .calls
            .contains(&Call::Read(CONN, VALUE_HANDLE)));
    }

    #[tokio::test]
    async fn read_times_out_and_drops_link() {
        let (mut service, tx) = service(RemoteSettings::default());
        queue_handshake(&tx);
        service
            .connect(Duration::from_secs(5), None)
            .await
            .unwrap();

        let result = service.read(Duration::from_millis(20)).await;
        assert_eq!(
            result,
            Err(RemoteError::ReadTimeout(Duration::from_millis(20)))
        );
        assert_eq!(service.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn read_reports_disconnect() {
        let (mut service, tx) = service(RemoteSettings::default());
        queue_handshake(&tx);
        service
            .connect(Duration::from_secs(5), None)
            .await
            .unwrap();

        tx.send(AdapterEvent::PeripheralDisconnected { conn: CONN })
            .unwrap();
        let result = service.read(Duration::from_secs(1)).await;
        assert_eq!(result, Err(RemoteError::Disconnected));
        assert_eq!(service.address(), Some(REMOTE));
    }

    #[test]
    fn cancel_before_connect_is_noop() {
        let (mut service, _tx) = service(RemoteSettings::default());
        service.cancel();
        service.cancel();
        assert_eq!(service.state(), ConnectionState::Idle);
        assert!(service.adapter().calls.is_empty());
    }
}
