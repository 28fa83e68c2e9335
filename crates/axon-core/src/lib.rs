//! Axon Core - Core types shared by the bus, discovery, and daemon crates
//!
//! This crate provides the foundational types for the Axon system:
//! - Registration numbers (family code, serial id, CRC-8) and their textual form
//! - The Dallas/Maxim CRC-8 used to validate identifiers
//! - Drainable reference counts for devices, masters, and families
//! - Attach/detach events and serializable snapshots for presentation layers

pub mod crc;
pub mod event;
pub mod refcount;
pub mod regnum;

pub use crc::crc8;
pub use event::{MasterInfo, SlaveEvent, SlaveInfo};
pub use refcount::RefCount;
pub use regnum::{RegNum, RegNumError};
