//! Registry error type

use axon_bus::TransportError;
use axon_core::{RegNum, RegNumError};
use thiserror::Error;

use crate::family::FamilyError;

/// Recoverable failures of registry operations; none leaves partial state behind
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Device {0} already exists")]
    DuplicateAttach(RegNum),
    #[error("Device {0} doesn't exist")]
    NotFound(RegNum),
    #[error("Device {0} has an invalid CRC")]
    ChecksumMismatch(RegNum),
    #[error("Failed to allocate new slave device")]
    Allocation,
    #[error("Family hook failed for {slave}: {source}")]
    FamilyHook {
        slave: RegNum,
        #[source]
        source: FamilyError,
    },
    #[error("Family {0:02x} is already registered")]
    DuplicateFamily(u8),
    #[error("Family {0:02x} is not registered")]
    UnknownFamily(u8),
    #[error(transparent)]
    InvalidId(#[from] RegNumError),
    #[error("Bus master {0} not found")]
    UnknownMaster(u32),
    #[error("No devices present on the wire")]
    NoPresence,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
