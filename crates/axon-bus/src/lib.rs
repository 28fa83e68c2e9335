//! Axon Bus - 1-Wire bus access and device enumeration
//!
//! This crate provides:
//! - The `BusTransport` capability a bus master driver implements
//! - The ROM search engine that enumerates every device on a bus
//! - A simulated in-memory bus for tests and hardware-free setups

pub mod search;
pub mod sim;
pub mod transport;

pub use search::{search, Search, SearchError, SearchType};
pub use sim::SimulatedBus;
pub use transport::{
    BusTransport, TransportError, Triplet, ALARM_SEARCH, MATCH_ROM, READ_ROM, SEARCH_ROM,
    SKIP_ROM,
};
