//! BLE Scanner Module
//!
//! Turns advertising reports into candidates and decides which one may be
//! promoted to a connection target.

use crate::domain::models::{AddressType, PeripheralAddress};
use crate::infrastructure::bluetooth::adapter::ScanReport;
use crate::infrastructure::bluetooth::advertisement::{
    decode_manufacturer, decode_name, decode_services, ManufacturerData,
};
use crate::infrastructure::bluetooth::protocol::{
    PRODUCT_ID_OFFSET, REMOTE_PRODUCT_ID, SERVICE_UUID,
};
use tracing::{debug, trace};
use uuid::Uuid;

/// A peripheral seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralCandidate {
    pub address_type: AddressType,
    pub address: PeripheralAddress,
    pub rssi: i8,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
    pub manufacturer: Option<ManufacturerData>,
}

impl PeripheralCandidate {
    pub fn from_report(report: &ScanReport) -> Self {
        Self {
            address_type: report.address_type,
            address: report.address,
            rssi: report.rssi,
            name: decode_name(&report.adv_data),
            services: decode_services(&report.adv_data),
            manufacturer: decode_manufacturer(&report.adv_data),
        }
    }

    /// Product identifier byte from the manufacturer payload.
    pub fn product_id(&self) -> Option<u8> {
        self.manufacturer
            .as_ref()
            .and_then(|m| m.payload.get(PRODUCT_ID_OFFSET).copied())
    }

    pub fn advertises_remote_service(&self) -> bool {
        self.services.contains(&SERVICE_UUID)
    }

    pub fn is_remote(&self) -> bool {
        self.product_id() == Some(REMOTE_PRODUCT_ID)
    }
}

/// Promotion rules for scan results
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    target: Option<PeripheralAddress>,
}

impl ScanFilter {
    /// Create a filter, optionally pinned to a single address
    pub fn new(target: Option<PeripheralAddress>) -> Self {
        Self { target }
    }

    pub fn target(&self) -> Option<PeripheralAddress> {
        self.target
    }

    /// Decode `report` and return it as a candidate if it may be connected to.
    ///
    /// The service, the pinned address and the product id must all match.
    pub fn evaluate(&self, report: &ScanReport) -> Option<PeripheralCandidate> {
        let candidate = PeripheralCandidate::from_report(report);

        if !candidate.advertises_remote_service() {
            trace!("{} does not advertise the hub service", candidate.address);
            return None;
        }

        if let Some(target) = self.target {
            if target != candidate.address {
                debug!("Skipping {} (pinned to {})", candidate.address, target);
                return None;
            }
        }

        if !candidate.is_remote() {
            debug!(
                "Skipping {}: product id {:?} is not a remote",
                candidate.address,
                candidate.product_id()
            );
            return None;
        }

        Some(candidate)
    }
}
