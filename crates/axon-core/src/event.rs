//! Registry events and read-only snapshots for presentation layers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::regnum::RegNum;

/// Notification emitted by a bus master as its device set changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlaveEvent {
    /// A slave was attached to a master
    Added { master: u32, slave: RegNum },
    /// A slave was detached from a master
    Removed { master: u32, slave: RegNum },
    /// A sweep of the bus finished
    SweepCompleted {
        master: u32,
        found: usize,
        total: usize,
    },
}

/// Snapshot of one attached slave
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveInfo {
    /// Registration number
    pub reg_num: RegNum,
    /// Listing name, `ff-dddddddddddd`
    pub name: String,
    /// Owning master id
    pub master: u32,
    /// Family code the device was bound to (0 for the default family)
    pub bound_family: u8,
    /// Sweeps left before the device is aged out
    pub ttl: u32,
    /// Outstanding external references
    pub refs: usize,
    /// When the device was attached
    pub attached_at: DateTime<Utc>,
}

/// Snapshot of one bus master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterInfo {
    pub id: u32,
    pub name: String,
    /// Delay between background sweeps in milliseconds (0 = disabled)
    pub search_cadence_ms: u64,
    pub max_slave_count: usize,
    pub slave_ttl: u32,
    pub enable_pullup: bool,
    /// Number of sweeps run so far
    pub attempts: u64,
    pub slave_count: usize,
    /// Whether the background scheduler is paused
    pub paused: bool,
    pub slaves: Vec<String>,
}
