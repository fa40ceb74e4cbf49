//! Bluetooth Module
//!
//! Central-role BLE client for the LEGO Powered Up handset remote.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     RemoteService                        │
//! │   (connect / cancel / pressed / address / color)         │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ AdapterEvent (mpsc)
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │               ConnectionStateMachine                     │
//! └───────┬──────────────────┬──────────────────┬───────────┘
//!         │                  │                  │
//!         ▼                  ▼                  ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Scanner    │   │   Protocol   │   │  BleAdapter  │
//! │ - adv decode │   │ - commands   │   │ - radio      │
//! │ - filtering  │   │ - frames     │   │   operations │
//! └──────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`adapter`] - Radio seam: operations out, events back
//! - [`advertisement`] - Advertising data record decoding
//! - [`scanner`] - Candidate filtering
//! - [`protocol`] - Hub UUIDs, outbound commands and button frames
//! - [`connection`] - Connect / discover / subscribe state machine
//! - [`service`] - Public facade
//! - `btleplug_backend` - Host radio through btleplug (feature `btleplug`)

pub mod adapter;
pub mod advertisement;
#[cfg(feature = "btleplug")]
pub mod btleplug_backend;
pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter::{AdapterError, AdapterEvent, BleAdapter, ConnHandle, ScanReport, WriteMode};
pub use service::{CancelHandle, RemoteService};

#[cfg(feature = "btleplug")]
pub use btleplug_backend::BtleplugAdapter;
