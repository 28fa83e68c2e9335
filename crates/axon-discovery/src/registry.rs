//! Registry of bus masters
//!
//! Owns every master and its background scheduler, resolves slaves across
//! masters, and rebinds slaves when families come and go. Lookups hand out
//! counted references ([`MasterRef`], [`SlaveRef`]); removal waits for them.

use axon_bus::BusTransport;
use axon_core::{MasterInfo, RegNum, SlaveEvent};
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::family::{FamilyOps, FamilyRegistry};
use crate::master::{BusMaster, MasterConfig, SlaveDevice};
use crate::scheduler::Scheduler;

/// Counted reference to a bus master, released on drop
pub struct MasterRef {
    master: Arc<BusMaster>,
}

impl MasterRef {
    pub(crate) fn new(master: Arc<BusMaster>) -> Self {
        master.get();
        Self { master }
    }

    /// Give the reference back early
    pub fn release(self) {}
}

impl Clone for MasterRef {
    fn clone(&self) -> Self {
        Self::new(self.master.clone())
    }
}

impl Deref for MasterRef {
    type Target = BusMaster;

    fn deref(&self) -> &BusMaster {
        &self.master
    }
}

impl Drop for MasterRef {
    fn drop(&mut self) {
        self.master.put();
    }
}

impl std::fmt::Debug for MasterRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MasterRef").field(&self.master.id()).finish()
    }
}

/// Counted reference to an attached slave and its master, released on drop
///
/// Detaching the slave blocks until every `SlaveRef` is gone.
#[derive(Debug)]
pub struct SlaveRef {
    device: Arc<SlaveDevice>,
    master: MasterRef,
}

impl SlaveRef {
    fn new(device: Arc<SlaveDevice>, master: MasterRef) -> Self {
        device.get();
        Self { device, master }
    }

    /// The master this slave is attached to
    pub fn master(&self) -> &BusMaster {
        &self.master
    }

    pub fn release(self) {}
}

impl Deref for SlaveRef {
    type Target = SlaveDevice;

    fn deref(&self) -> &SlaveDevice {
        &self.device
    }
}

impl Drop for SlaveRef {
    fn drop(&mut self) {
        self.device.put();
    }
}

struct MasterSlot {
    master: Arc<BusMaster>,
    scheduler: Scheduler,
}

/// All bus masters plus the shared family registry
pub struct Registry {
    masters: RwLock<Vec<MasterSlot>>,
    families: Arc<FamilyRegistry>,
    events: broadcast::Sender<SlaveEvent>,
    next_id: AtomicU32,
}

impl Registry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            masters: RwLock::new(Vec::new()),
            families: Arc::new(FamilyRegistry::new()),
            events,
            next_id: AtomicU32::new(1),
        }
    }

    /// Slave add/remove and sweep events from every master
    pub fn subscribe(&self) -> broadcast::Receiver<SlaveEvent> {
        self.events.subscribe()
    }

    pub fn families(&self) -> &Arc<FamilyRegistry> {
        &self.families
    }

    /// Register a bus master and start its background sweeps
    pub async fn add_master(
        &self,
        config: MasterConfig,
        transport: Box<dyn BusTransport>,
    ) -> MasterRef {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let name = config.name.clone();
        let master = Arc::new(BusMaster::new(
            id,
            config,
            transport,
            self.families.clone(),
            self.events.clone(),
        ));

        let scheduler = Scheduler::spawn(MasterRef::new(master.clone()));
        self.masters.write().await.push(MasterSlot {
            master: master.clone(),
            scheduler,
        });

        info!(master = id, name = %name, "Bus master registered");
        MasterRef::new(master)
    }

    /// Unregister a master
    ///
    /// Stops its scheduler, waits until no [`MasterRef`] remains, then
    /// detaches every slave.
    pub async fn remove_master(&self, id: u32) -> Result<(), RegistryError> {
        let slot = {
            let mut masters = self.masters.write().await;
            let index = masters
                .iter()
                .position(|slot| slot.master.id() == id)
                .ok_or(RegistryError::UnknownMaster(id))?;
            masters.remove(index)
        };

        slot.scheduler.shutdown().await;

        let refs = slot.master.refs();
        if refs > 0 {
            debug!(master = id, refs, "Waiting for bus master to become free");
        }
        slot.master.wait_unused().await;
        slot.master.detach_all().await;

        info!(master = id, "Bus master removed");
        Ok(())
    }

    /// Remove every master
    pub async fn shutdown(&self) {
        for id in self.master_ids().await {
            // Only fails if the master vanished concurrently
            let _ = self.remove_master(id).await;
        }
    }

    pub async fn find_master(&self, id: u32) -> Option<MasterRef> {
        self.masters
            .read()
            .await
            .iter()
            .find(|slot| slot.master.id() == id)
            .map(|slot| MasterRef::new(slot.master.clone()))
    }

    /// Current masters; the list lock is released before returning so
    /// callers may wait on a master's state lock.
    async fn snapshot(&self) -> Vec<Arc<BusMaster>> {
        self.masters
            .read()
            .await
            .iter()
            .map(|slot| slot.master.clone())
            .collect()
    }

    /// Find an attached slave on any master
    pub async fn find_slave(&self, rn: RegNum) -> Result<SlaveRef, RegistryError> {
        for master in self.snapshot().await {
            let state = master.lock_state().await;
            if let Some(device) = state.find(rn) {
                let device = device.clone();
                drop(state);
                return Ok(SlaveRef::new(device, MasterRef::new(master)));
            }
        }
        Err(RegistryError::NotFound(rn))
    }

    pub async fn master_ids(&self) -> Vec<u32> {
        self.masters
            .read()
            .await
            .iter()
            .map(|slot| slot.master.id())
            .collect()
    }

    pub async fn master_infos(&self) -> Vec<MasterInfo> {
        let masters = self.snapshot().await;
        let mut infos = Vec::with_capacity(masters.len());
        for master in masters {
            infos.push(master.info().await);
        }
        infos
    }

    /// Register a family descriptor and move matching slaves onto it
    pub async fn register_family(
        &self,
        fid: u8,
        ops: Arc<dyn FamilyOps>,
    ) -> Result<(), RegistryError> {
        let name = ops.name().to_string();
        self.families.insert(fid, ops)?;
        info!(family = %format!("{fid:02x}"), name = %name, "Family registered");

        self.reconnect_family(fid, true).await;
        Ok(())
    }

    /// Unregister a family, rebinding its slaves to the default family
    ///
    /// Returns once no slave is bound to the removed descriptor.
    pub async fn unregister_family(&self, fid: u8) -> Result<(), RegistryError> {
        let family = self.families.remove(fid)?;
        self.reconnect_family(fid, false).await;

        let users = family.users();
        if users > 0 {
            debug!(family = %format!("{fid:02x}"), users, "Waiting for family to become free");
        }
        family.wait_unused().await;

        info!(family = %format!("{fid:02x}"), "Family unregistered");
        Ok(())
    }

    /// Detach and reattach every slave affected by a family change
    pub async fn reconnect_family(&self, fid: u8, attaching: bool) -> usize {
        let mut total = 0;
        for master in self.snapshot().await {
            total += master.reconnect(fid, attaching).await;
        }
        if total > 0 {
            info!(family = %format!("{fid:02x}"), slaves = total, attaching, "Reconnected slaves");
        }
        total
    }

    /// Stop background sweeps on every master
    ///
    /// Waits for sweeps already in flight to finish.
    pub async fn suspend(&self) {
        let masters = self.snapshot().await;
        for master in &masters {
            master.control().pause();
            drop(master.lock_state().await);
        }
        info!(masters = masters.len(), "Bus masters suspended");
    }

    /// Restart background sweeps; the first sweep re-checks bus identity
    pub async fn resume(&self) {
        let masters = self.snapshot().await;
        for master in &masters {
            master.request_reverify();
            master.control().resume();
        }
        info!(masters = masters.len(), "Bus masters resumed");
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::FamilyError;
    use async_trait::async_trait;
    use axon_bus::{SimulatedBus, TransportError, Triplet};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        added: Mutex<Vec<RegNum>>,
        removed: Mutex<Vec<RegNum>>,
    }

    impl FamilyOps for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn add_slave(&self, slave: &SlaveDevice) -> Result<(), FamilyError> {
            self.added.lock().push(slave.reg_num());
            Ok(())
        }

        fn remove_slave(&self, slave: &SlaveDevice) {
            self.removed.lock().push(slave.reg_num());
        }
    }

    struct Refusing;

    impl FamilyOps for Refusing {
        fn name(&self) -> &str {
            "refusing"
        }

        fn add_slave(&self, _slave: &SlaveDevice) -> Result<(), FamilyError> {
            Err(FamilyError::new("sensor not supported"))
        }
    }

    fn idle_config() -> MasterConfig {
        MasterConfig {
            search_cadence_ms: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_find_slave_counts_references() {
        let rn = RegNum::new(0x28, 1);
        let bus = SimulatedBus::with_devices([rn]);
        let registry = Registry::new();
        let master = registry.add_master(idle_config(), Box::new(bus)).await;
        master.search_and_reconcile().await.unwrap();

        let base = master.refs();
        let slave = registry.find_slave(rn).await.unwrap();
        assert_eq!(slave.refs(), 1);
        assert_eq!(slave.master_id(), master.id());
        assert_eq!(slave.master().refs(), base + 1);
        let again = registry.find_slave(rn).await.unwrap();
        assert_eq!(slave.refs(), 2);
        assert_eq!(master.refs(), base + 2);

        again.release();
        slave.release();
        assert_eq!(master.refs(), base);
        let slave = registry.find_slave(rn).await.unwrap();
        assert_eq!(slave.refs(), 1);

        assert!(matches!(
            registry.find_slave(RegNum::new(0x28, 2)).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_find_master_counts_references() {
        let registry = Registry::new();
        let master = registry
            .add_master(idle_config(), Box::new(SimulatedBus::new()))
            .await;
        // The scheduler holds one reference too
        let base = master.refs();

        let found = registry.find_master(master.id()).await.unwrap();
        assert_eq!(master.refs(), base + 1);
        found.release();
        assert_eq!(master.refs(), base);
        assert!(registry.find_master(99).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_waits_for_references() {
        let rn = RegNum::new(0x28, 1);
        let registry = Registry::new();
        let master = registry
            .add_master(idle_config(), Box::new(SimulatedBus::new()))
            .await;
        master.attach(rn).await.unwrap();

        let held = registry.find_slave(rn).await.unwrap();
        let detaching = {
            let master = master.clone();
            tokio::spawn(async move { master.detach(rn).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!detaching.is_finished());

        held.release();
        detaching.await.unwrap().unwrap();
        assert_eq!(master.slave_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_wait_does_not_block_registry() {
        let rn = RegNum::new(0x28, 1);
        let registry = Arc::new(Registry::new());
        let master = registry
            .add_master(idle_config(), Box::new(SimulatedBus::new()))
            .await;
        master.attach(rn).await.unwrap();

        let held = registry.find_slave(rn).await.unwrap();
        let detaching = {
            let master = master.clone();
            tokio::spawn(async move { master.detach(rn).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Queues on the detaching master's state lock
        let lookup = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.find_slave(RegNum::new(0x28, 2)).await })
        };
        let adding = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .add_master(idle_config(), Box::new(SimulatedBus::new()))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ids = tokio::time::timeout(Duration::from_secs(30), registry.master_ids())
            .await
            .expect("master list blocked behind a detaching master");
        let added = tokio::time::timeout(Duration::from_secs(30), adding)
            .await
            .unwrap()
            .unwrap();
        assert!(!ids.is_empty());
        assert_eq!(registry.master_ids().await.len(), 2);
        assert!(!detaching.is_finished());

        held.release();
        detaching.await.unwrap().unwrap();
        assert!(matches!(
            lookup.await.unwrap(),
            Err(RegistryError::NotFound(_))
        ));
        added.release();
    }

    struct SlowBus {
        inner: SimulatedBus,
        delay: Duration,
    }

    #[async_trait]
    impl BusTransport for SlowBus {
        async fn reset(&mut self) -> Result<bool, TransportError> {
            self.inner.reset().await
        }

        async fn write_block(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.inner.write_block(data).await
        }

        async fn read_block(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
            self.inner.read_block(len).await
        }

        async fn triplet(&mut self, direction: bool) -> Result<Triplet, TransportError> {
            tokio::time::sleep(self.delay).await;
            self.inner.triplet(direction).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_master_cancels_running_sweep() {
        let bus = SimulatedBus::with_devices([RegNum::new(0x28, 1), RegNum::new(0x28, 2)]);
        let registry = Registry::new();
        let master = registry
            .add_master(
                MasterConfig {
                    search_cadence_ms: 1000,
                    ..Default::default()
                },
                Box::new(SlowBus {
                    inner: bus.clone(),
                    delay: Duration::from_millis(10),
                }),
            )
            .await;
        let id = master.id();

        tokio::time::sleep(Duration::from_millis(105)).await;
        let started = bus.triplet_count();
        assert!(started > 0 && started < 64, "sweep at {started} triplets");

        master.release();
        tokio::time::timeout(Duration::from_secs(1), registry.remove_master(id))
            .await
            .expect("removal waited for the whole sweep")
            .unwrap();
        assert!(bus.triplet_count() <= started + 1);
        assert!(registry.find_master(id).await.is_none());
    }

    #[tokio::test]
    async fn test_register_family_rebinds_existing_slaves() {
        let a = RegNum::new(0x28, 1);
        let b = RegNum::new(0x28, 2);
        let other = RegNum::new(0x10, 3);
        let bus = SimulatedBus::with_devices([a, b, other]);
        let registry = Registry::new();
        let master = registry.add_master(idle_config(), Box::new(bus)).await;
        master.search_and_reconcile().await.unwrap();
        assert!(master.slaves().await.iter().all(|s| s.bound_family == 0));

        let recorder = Arc::new(Recorder::default());
        registry.register_family(0x28, recorder.clone()).await.unwrap();

        let mut added = recorder.added.lock().clone();
        added.sort();
        assert_eq!(added, vec![a, b]);
        for slave in master.slaves().await {
            let expected = if slave.reg_num.family() == 0x28 { 0x28 } else { 0 };
            assert_eq!(slave.bound_family, expected);
        }
        assert_eq!(master.slave_count().await, 3);
        assert_eq!(registry.families().get(0x28).unwrap().users(), 2);

        registry.unregister_family(0x28).await.unwrap();
        let mut removed = recorder.removed.lock().clone();
        removed.sort();
        assert_eq!(removed, vec![a, b]);
        assert!(master.slaves().await.iter().all(|s| s.bound_family == 0));
        assert!(master.contains(a).await && master.contains(b).await);
        assert!(registry.families().get(0x28).is_none());
    }

    #[tokio::test]
    async fn test_family_registration_errors() {
        let registry = Registry::new();
        registry
            .register_family(0x28, Arc::new(Recorder::default()))
            .await
            .unwrap();
        assert!(matches!(
            registry.register_family(0x28, Arc::new(Recorder::default())).await,
            Err(RegistryError::DuplicateFamily(0x28))
        ));
        assert!(matches!(
            registry.unregister_family(0x3A).await,
            Err(RegistryError::UnknownFamily(0x3A))
        ));
    }

    #[tokio::test]
    async fn test_family_hook_failure_unwinds() {
        let rn = RegNum::new(0x3A, 5);
        let registry = Registry::new();
        registry.register_family(0x3A, Arc::new(Refusing)).await.unwrap();
        let master = registry
            .add_master(idle_config(), Box::new(SimulatedBus::new()))
            .await;

        assert!(matches!(
            master.attach(rn).await,
            Err(RegistryError::FamilyHook { slave, .. }) if slave == rn
        ));
        assert_eq!(master.slave_count().await, 0);
        assert_eq!(registry.families().get(0x3A).unwrap().users(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_sweeps_at_cadence() {
        let rn = RegNum::new(0x28, 1);
        let bus = SimulatedBus::with_devices([rn]);
        let registry = Registry::new();
        let master = registry
            .add_master(
                MasterConfig {
                    search_cadence_ms: 100,
                    ..Default::default()
                },
                Box::new(bus),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(master.contains(rn).await);
        assert_eq!(master.attempts().await, 4);

        master.set_search_cadence(0).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(master.attempts().await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_and_resume() {
        let old = RegNum::new(0x28, 1);
        let new = RegNum::new(0x28, 2);
        let bus = SimulatedBus::with_devices([old]);
        let registry = Registry::new();
        let master = registry
            .add_master(
                MasterConfig {
                    search_cadence_ms: 100,
                    ..Default::default()
                },
                Box::new(bus.clone()),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(master.contains(old).await);

        registry.suspend().await;
        let attempts = master.attempts().await;
        assert!(master.info().await.paused);

        bus.remove_device(old);
        bus.add_device(new);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(master.attempts().await, attempts);

        registry.resume().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(master.attempts().await, attempts + 1);
        assert!(!master.reverify_pending());
        assert!(!master.contains(old).await);
        assert!(master.contains(new).await);
    }

    #[tokio::test]
    async fn test_remove_master_detaches_everything() {
        let a = RegNum::new(0x28, 1);
        let b = RegNum::new(0x10, 2);
        let bus = SimulatedBus::with_devices([a, b]);
        let registry = Registry::new();
        let master = registry.add_master(idle_config(), Box::new(bus)).await;
        master.search_and_reconcile().await.unwrap();
        let id = master.id();
        master.release();

        let mut events = registry.subscribe();
        registry.remove_master(id).await.unwrap();

        let mut removed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SlaveEvent::Removed { slave, .. } = event {
                removed.push(slave);
            }
        }
        removed.sort();
        assert_eq!(removed, vec![a, b]);
        assert!(registry.find_master(id).await.is_none());
        assert!(matches!(
            registry.remove_master(id).await,
            Err(RegistryError::UnknownMaster(_))
        ));
    }

    #[tokio::test]
    async fn test_master_ids_are_unique() {
        let registry = Registry::new();
        let first = registry
            .add_master(idle_config(), Box::new(SimulatedBus::new()))
            .await;
        let second = registry
            .add_master(idle_config(), Box::new(SimulatedBus::new()))
            .await;
        assert_ne!(first.id(), second.id());
        assert_eq!(registry.master_ids().await, vec![first.id(), second.id()]);
        assert_eq!(registry.master_infos().await.len(), 2);
    }
}
