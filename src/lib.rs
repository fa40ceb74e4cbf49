//! Client for the LEGO Powered Up handset remote (88010) over Bluetooth LE.
//!
//! Plug a radio in through [`BleAdapter`], then drive it with
//! [`RemoteService`]:
//!
//! ```ignore
//! let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
//! let mut remote = RemoteService::new(MyAdapter::new(tx), rx, RemoteSettings::default());
//! remote.connect(Duration::from_secs(5), None).await?;
//! remote.color(Color::Green);
//! while remote.process_next().await {
//!     println!("{:?}", remote.pressed());
//! }
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::buttons::{Button, ButtonCombo};
pub use domain::models::{AddressType, ConnectionState, PeripheralAddress, RemoteEvent};
pub use domain::settings::{LogSettings, RemoteSettings, SettingsService};
pub use error::RemoteError;
pub use infrastructure::bluetooth::protocol::{ButtonMode, Color};
pub use infrastructure::bluetooth::{
    AdapterError, AdapterEvent, BleAdapter, CancelHandle, ConnHandle, RemoteService, ScanReport,
    WriteMode,
};
pub use infrastructure::logging::{init_logger, LoggingGuard};

#[cfg(feature = "btleplug")]
pub use infrastructure::bluetooth::BtleplugAdapter;
