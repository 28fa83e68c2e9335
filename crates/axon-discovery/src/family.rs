//! Family dispatch: per-family hooks run when slaves attach and detach

use axon_core::RefCount;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;

use crate::error::RegistryError;
use crate::master::SlaveDevice;

/// Failure reported by a family's `add_slave` hook
#[derive(Error, Debug)]
#[error("{0}")]
pub struct FamilyError(pub String);

impl FamilyError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Behaviour shared by all devices of one family code
pub trait FamilyOps: Send + Sync {
    /// Short name for logs and listings
    fn name(&self) -> &str;

    /// Called once the slave is built, before it becomes visible.
    /// An error aborts the attachment.
    fn add_slave(&self, _slave: &SlaveDevice) -> Result<(), FamilyError> {
        Ok(())
    }

    /// Called right after the slave has been removed from its master
    fn remove_slave(&self, _slave: &SlaveDevice) {}
}

/// Family used for every code without a registered descriptor
#[derive(Debug, Default)]
pub struct DefaultFamily;

impl FamilyOps for DefaultFamily {
    fn name(&self) -> &str {
        "default"
    }
}

/// A family descriptor and the number of live slaves bound to it
pub struct Family {
    fid: u8,
    default: bool,
    ops: Arc<dyn FamilyOps>,
    users: RefCount,
}

impl Family {
    fn new(fid: u8, default: bool, ops: Arc<dyn FamilyOps>) -> Self {
        Self {
            fid,
            default,
            ops,
            users: RefCount::new(),
        }
    }

    /// Family code, 0 for the default family
    pub fn fid(&self) -> u8 {
        self.fid
    }

    pub fn is_default(&self) -> bool {
        self.default
    }

    pub fn name(&self) -> &str {
        self.ops.name()
    }

    pub fn ops(&self) -> &dyn FamilyOps {
        self.ops.as_ref()
    }

    /// Live slaves bound to this family
    pub fn users(&self) -> usize {
        self.users.count()
    }

    pub(crate) async fn wait_unused(&self) {
        self.users.wait_drained().await;
    }
}

impl std::fmt::Debug for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Family")
            .field("fid", &self.fid)
            .field("default", &self.default)
            .field("name", &self.name())
            .field("users", &self.users())
            .finish()
    }
}

/// A slave's hold on its family; released when the slave is dropped
#[derive(Debug)]
pub struct FamilyHandle {
    family: Arc<Family>,
}

impl Deref for FamilyHandle {
    type Target = Family;

    fn deref(&self) -> &Family {
        &self.family
    }
}

impl Drop for FamilyHandle {
    fn drop(&mut self) {
        self.family.users.put();
    }
}

/// Family code to descriptor map shared by every bus master
///
/// Guarded by its own lock, never by a master's state lock.
pub struct FamilyRegistry {
    families: RwLock<HashMap<u8, Arc<Family>>>,
    default: Arc<Family>,
}

impl FamilyRegistry {
    pub fn new() -> Self {
        Self {
            families: RwLock::new(HashMap::new()),
            default: Arc::new(Family::new(0, true, Arc::new(DefaultFamily))),
        }
    }

    pub(crate) fn insert(&self, fid: u8, ops: Arc<dyn FamilyOps>) -> Result<(), RegistryError> {
        let mut families = self.families.write();
        if families.contains_key(&fid) {
            return Err(RegistryError::DuplicateFamily(fid));
        }
        families.insert(fid, Arc::new(Family::new(fid, false, ops)));
        Ok(())
    }

    pub(crate) fn remove(&self, fid: u8) -> Result<Arc<Family>, RegistryError> {
        self.families
            .write()
            .remove(&fid)
            .ok_or(RegistryError::UnknownFamily(fid))
    }

    /// Bind a new slave to the descriptor for `fid`, or to the default one
    pub fn resolve(&self, fid: u8) -> FamilyHandle {
        let families = self.families.read();
        let family = families
            .get(&fid)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        // Count the user while the map is locked so a concurrent
        // unregistration always sees it.
        family.users.get();
        FamilyHandle { family }
    }

    pub fn get(&self, fid: u8) -> Option<Arc<Family>> {
        self.families.read().get(&fid).cloned()
    }

    pub fn default_family(&self) -> &Arc<Family> {
        &self.default
    }

    /// Registered family codes in ascending order
    pub fn codes(&self) -> Vec<u8> {
        let mut codes: Vec<u8> = self.families.read().keys().copied().collect();
        codes.sort_unstable();
        codes
    }
}

impl Default for FamilyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
