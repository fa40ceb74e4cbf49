use crate::domain::models::AddressParseError;
use crate::infrastructure::bluetooth::adapter::AdapterError;
use crate::infrastructure::bluetooth::connection::HandshakeStep;
use crate::infrastructure::bluetooth::protocol::CodecError;
use std::time::Duration;
use thiserror::Error;

/// Why a connection attempt ended
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("no remote found before the scan timed out")]
    ScanTimeout,
    #[error("remote did not become ready within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("hub service not found on the remote")]
    ServiceNotFound,
    #[error("hub characteristic not found on the remote")]
    CharacteristicNotFound,
    #[error("handshake step {step:?} failed with status {status:#06x}")]
    HandshakeFailed { step: HandshakeStep, status: u16 },
    #[error("write failed with status {status:#06x}")]
    WriteFailed { status: u16 },
    #[error("read failed with status {status:#06x}")]
    ReadFailed { status: u16 },
    #[error("no read result within {0:?}")]
    ReadTimeout(Duration),
    #[error("remote is not ready")]
    NotReady,
    #[error("remote disconnected")]
    Disconnected,
    #[error("connect cancelled")]
    Cancelled,
    #[error("adapter event channel closed")]
    AdapterClosed,
    #[error(transparent)]
    InvalidAddress(#[from] AddressParseError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
