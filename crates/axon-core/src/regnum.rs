//! Registration numbers: the 64-bit identity every 1-Wire device carries

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::crc::crc8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegNumError {
    #[error("bad slave string format {0:?}, expecting ff-dddddddddddd")]
    Format(String),
}

/// Unique identifier of a slave device
///
/// On the wire the number is a little-endian `u64`: byte 0 is the family
/// code, bytes 1..=6 the serial id, byte 7 the CRC-8 of the first seven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegNum {
    family: u8,
    id: u64,
    crc: u8,
}

impl RegNum {
    /// Mask for the 48-bit serial id
    pub const ID_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

    /// Build a registration number, computing its CRC
    pub fn new(family: u8, id: u64) -> Self {
        let mut rn = Self {
            family,
            id: id & Self::ID_MASK,
            crc: 0,
        };
        rn.crc = crc8(&rn.to_bytes()[..7]);
        rn
    }

    /// Split a raw identifier as assembled by the bus search
    pub fn from_raw(raw: u64) -> Self {
        Self {
            family: raw as u8,
            id: (raw >> 8) & Self::ID_MASK,
            crc: (raw >> 56) as u8,
        }
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self::from_raw(u64::from_le_bytes(bytes))
    }

    pub fn to_raw(&self) -> u64 {
        (self.family as u64) | (self.id << 8) | ((self.crc as u64) << 56)
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        self.to_raw().to_le_bytes()
    }

    pub fn family(&self) -> u8 {
        self.family
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn crc(&self) -> u8 {
        self.crc
    }

    /// Whether the stored CRC matches the family and id bytes
    pub fn is_valid(&self) -> bool {
        self.crc == crc8(&self.to_bytes()[..7])
    }

    /// Name used for sysfs-style listings, e.g. `28-00000a1b2c3d`
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RegNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}-{:012x}", self.family, self.id)
    }
}

/// Parse the administrative form `ff-dddddddddddd`
///
/// The CRC is never taken from the caller; it is always recomputed.
impl FromStr for RegNum {
    type Err = RegNumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let err = || RegNumError::Format(text.to_string());

        let (family, id) = text.split_once('-').ok_or_else(err)?;
        if family.len() != 2 || id.is_empty() || id.len() > 12 {
            return Err(err());
        }
        if !family.chars().chain(id.chars()).all(|c| c.is_ascii_hexdigit()) {
            return Err(err());
        }

        let family = u8::from_str_radix(family, 16).map_err(|_| err())?;
        let id = u64::from_str_radix(id, 16).map_err(|_| err())?;
        Ok(Self::new(family, id))
    }
}

impl Serialize for RegNum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RegNum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
