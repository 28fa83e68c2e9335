//! Axon Discovery - Device registry and lifecycle for 1-Wire bus masters
//!
//! This crate ties the bus search to a registry of attached slaves:
//! - Bus masters owning their slaves, with attach/detach and TTL aging
//! - A registry of masters with cross-master lookup and family reconnects
//! - Family dispatch: per-family hooks with a no-op default
//! - A pausable background scheduler running periodic sweeps

pub mod error;
pub mod family;
pub mod master;
pub mod registry;
pub mod scheduler;

pub use error::RegistryError;
pub use family::{DefaultFamily, Family, FamilyError, FamilyOps, FamilyRegistry};
pub use master::{BusMaster, MasterConfig, SlaveDevice, SweepReport};
pub use registry::{MasterRef, Registry, SlaveRef};
pub use scheduler::{Scheduler, TaskControl};
