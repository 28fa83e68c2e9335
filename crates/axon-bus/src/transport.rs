//! Bus transport capability implemented by bus master drivers

use async_trait::async_trait;
use thiserror::Error;

/// Read the ROM of the only device on the bus
pub const READ_ROM: u8 = 0x33;
/// Address one device by its full ROM
pub const MATCH_ROM: u8 = 0x55;
/// Address every device at once
pub const SKIP_ROM: u8 = 0xCC;
/// Enumerate all devices
pub const SEARCH_ROM: u8 = 0xF0;
/// Enumerate devices with an active alarm condition
pub const ALARM_SEARCH: u8 = 0xEC;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bus fault: {0}")]
    Fault(String),
}

/// Result of one search triplet: read a bit, read its complement, write a direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triplet {
    /// Wired-AND of the current bit of all participating devices
    pub id_bit: bool,
    /// Wired-AND of the complement of that bit
    pub complement_bit: bool,
    /// Direction actually written back to the bus
    pub direction: bool,
}

impl Triplet {
    /// Decode the packed form used by bus master hardware:
    /// bit 0 id bit, bit 1 complement bit, bit 2 direction taken.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            id_bit: bits & 0x01 != 0,
            complement_bit: bits & 0x02 != 0,
            direction: bits & 0x04 != 0,
        }
    }

    pub fn to_bits(&self) -> u8 {
        (self.id_bit as u8) | ((self.complement_bit as u8) << 1) | ((self.direction as u8) << 2)
    }

    /// Neither a 0 nor a 1 was driven: nobody is listening any more
    pub fn no_response(&self) -> bool {
        self.id_bit && self.complement_bit
    }

    /// Devices disagree on this bit, the written direction picked a branch
    pub fn is_branch(&self) -> bool {
        !self.id_bit && !self.complement_bit
    }
}

/// Blocking primitives of a physical 1-Wire bus master
///
/// Every call may take from hundreds of microseconds to milliseconds.
/// Callers serialize access through the owning master's bus lock.
#[async_trait]
pub trait BusTransport: Send {
    /// Reset the bus; returns whether any device answered with a presence pulse
    async fn reset(&mut self) -> Result<bool, TransportError>;

    async fn write_block(&mut self, data: &[u8]) -> Result<(), TransportError>;

    async fn read_block(&mut self, len: usize) -> Result<Vec<u8>, TransportError>;

    /// Perform one search step, writing `direction` when the devices disagree
    async fn triplet(&mut self, direction: bool) -> Result<Triplet, TransportError>;

    async fn write_byte(&mut self, byte: u8) -> Result<(), TransportError> {
        self.write_block(&[byte]).await
    }
}

#[async_trait]
impl<T: BusTransport + ?Sized> BusTransport for Box<T> {
    async fn reset(&mut self) -> Result<bool, TransportError> {
        (**self).reset().await
    }

    async fn write_block(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write_block(data).await
    }

    async fn read_block(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read_block(len).await
    }

    async fn triplet(&mut self, direction: bool) -> Result<Triplet, TransportError> {
        (**self).triplet(direction).await
    }

    async fn write_byte(&mut self, byte: u8) -> Result<(), TransportError> {
        (**self).write_byte(byte).await
    }
}
