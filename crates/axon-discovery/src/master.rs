//! Bus masters and the slaves attached to them

use axon_bus::{
    search, BusTransport, Search, SearchError, SearchType, MATCH_ROM, SKIP_ROM,
};
use axon_core::{MasterInfo, RefCount, RegNum, SlaveEvent, SlaveInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::family::{Family, FamilyHandle, FamilyRegistry};
use crate::scheduler::TaskControl;

/// Bus master configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Human-readable master name
    pub name: String,
    /// Most devices expected on the bus; bounds search rounds, 1 enables READ ROM
    pub max_slave_count: usize,
    /// Sweeps a device may be missed before it is detached
    pub slave_ttl: u32,
    /// Delay between background sweeps in milliseconds (0 = disabled)
    pub search_cadence_ms: u64,
    /// Strong pullup after writes
    pub enable_pullup: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            name: "w1_bus_master".to_string(),
            max_slave_count: 10,
            slave_ttl: 10,
            search_cadence_ms: 10_000,
            enable_pullup: false,
        }
    }
}

/// Counts from one sweep of a bus
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Identifiers reported by the search
    pub found: usize,
    /// New slaves attached
    pub attached: usize,
    /// Slaves detached by aging or verification
    pub detached: usize,
    /// Slaves attached after the sweep
    pub total: usize,
}

/// A device attached to a bus master
#[derive(Debug)]
pub struct SlaveDevice {
    reg_num: RegNum,
    master: u32,
    family: FamilyHandle,
    refs: RefCount,
    attached_at: DateTime<Utc>,
}

impl SlaveDevice {
    fn new(reg_num: RegNum, master: u32, family: FamilyHandle) -> Self {
        Self {
            reg_num,
            master,
            family,
            refs: RefCount::new(),
            attached_at: Utc::now(),
        }
    }

    pub fn reg_num(&self) -> RegNum {
        self.reg_num
    }

    pub fn name(&self) -> String {
        self.reg_num.name()
    }

    /// Id of the owning master
    pub fn master_id(&self) -> u32 {
        self.master
    }

    pub fn family(&self) -> &Family {
        &self.family
    }

    pub fn refs(&self) -> usize {
        self.refs.count()
    }

    pub fn attached_at(&self) -> DateTime<Utc> {
        self.attached_at
    }

    pub(crate) fn get(&self) {
        self.refs.get();
    }

    pub(crate) fn put(&self) {
        self.refs.put();
    }
}

#[derive(Debug)]
struct SlaveEntry {
    device: Arc<SlaveDevice>,
    active: bool,
    ttl: u32,
}

/// Identity check applied to the discoveries of one sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verification {
    Off,
    /// First discovery after a resume is compared against the first known slave
    Resume,
    /// Only this identifier may stay attached
    Expect(RegNum),
}

/// Everything guarded by a master's state lock
#[derive(Debug)]
pub(crate) struct MasterState {
    slaves: Vec<SlaveEntry>,
    search_cadence_ms: u64,
    slave_ttl: u32,
    enable_pullup: bool,
    attempts: u64,
}

impl MasterState {
    fn position(&self, rn: RegNum) -> Option<usize> {
        self.slaves.iter().position(|e| e.device.reg_num == rn)
    }

    pub(crate) fn find(&self, rn: RegNum) -> Option<&Arc<SlaveDevice>> {
        self.slaves
            .iter()
            .find(|e| e.device.reg_num == rn)
            .map(|e| &e.device)
    }

    /// Slaves matching `filter`, in attach order
    pub(crate) fn select(&self, filter: impl Fn(&SlaveDevice) -> bool) -> Vec<RegNum> {
        self.slaves
            .iter()
            .filter(|e| filter(&e.device))
            .map(|e| e.device.reg_num)
            .collect()
    }
}

/// One physical bus controller and the slaves found on it
///
/// Two locks: the state lock guards the slave list and configuration and is
/// held for a whole sweep; the bus lock guards the transport and is only
/// taken around bus transactions, nested inside the state lock.
pub struct BusMaster {
    id: u32,
    name: String,
    max_slave_count: usize,
    state: Mutex<MasterState>,
    bus: Mutex<Box<dyn BusTransport>>,
    refs: RefCount,
    reverify: AtomicBool,
    control: TaskControl,
    families: Arc<FamilyRegistry>,
    events: broadcast::Sender<SlaveEvent>,
}

impl BusMaster {
    pub(crate) fn new(
        id: u32,
        config: MasterConfig,
        transport: Box<dyn BusTransport>,
        families: Arc<FamilyRegistry>,
        events: broadcast::Sender<SlaveEvent>,
    ) -> Self {
        Self {
            id,
            name: config.name,
            max_slave_count: config.max_slave_count.max(1),
            state: Mutex::new(MasterState {
                slaves: Vec::new(),
                search_cadence_ms: config.search_cadence_ms,
                slave_ttl: config.slave_ttl.max(1),
                enable_pullup: config.enable_pullup,
                attempts: 0,
            }),
            bus: Mutex::new(transport),
            refs: RefCount::new(),
            reverify: AtomicBool::new(false),
            control: TaskControl::new(),
            families,
            events,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_slave_count(&self) -> usize {
        self.max_slave_count
    }

    /// Background task signals for this master
    pub fn control(&self) -> &TaskControl {
        &self.control
    }

    /// Outstanding external references
    pub fn refs(&self) -> usize {
        self.refs.count()
    }

    pub(crate) fn get(&self) {
        self.refs.get();
    }

    pub(crate) fn put(&self) {
        self.refs.put();
    }

    pub(crate) async fn wait_unused(&self) {
        self.refs.wait_drained().await;
    }

    pub(crate) async fn lock_state(&self) -> tokio::sync::MutexGuard<'_, MasterState> {
        self.state.lock().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SlaveEvent> {
        self.events.subscribe()
    }

    pub async fn search_cadence(&self) -> u64 {
        self.state.lock().await.search_cadence_ms
    }

    /// Change the background sweep delay (0 disables) and wake the scheduler
    pub async fn set_search_cadence(&self, cadence_ms: u64) {
        self.state.lock().await.search_cadence_ms = cadence_ms;
        info!(master = self.id, cadence_ms, "Search cadence updated");
        self.control.wake();
    }

    pub async fn pullup(&self) -> bool {
        self.state.lock().await.enable_pullup
    }

    pub async fn set_pullup(&self, enabled: bool) {
        self.state.lock().await.enable_pullup = enabled;
        info!(master = self.id, enabled, "Pullup {}", if enabled { "enabled" } else { "disabled" });
        self.control.wake();
    }

    pub async fn slave_ttl(&self) -> u32 {
        self.state.lock().await.slave_ttl
    }

    pub async fn slave_count(&self) -> usize {
        self.state.lock().await.slaves.len()
    }

    /// Sweeps run so far
    pub async fn attempts(&self) -> u64 {
        self.state.lock().await.attempts
    }

    pub async fn contains(&self, rn: RegNum) -> bool {
        self.state.lock().await.position(rn).is_some()
    }

    pub async fn slaves(&self) -> Vec<SlaveInfo> {
        let state = self.state.lock().await;
        state
            .slaves
            .iter()
            .map(|e| SlaveInfo {
                reg_num: e.device.reg_num,
                name: e.device.name(),
                master: self.id,
                bound_family: e.device.family().fid(),
                ttl: e.ttl,
                refs: e.device.refs(),
                attached_at: e.device.attached_at,
            })
            .collect()
    }

    pub async fn info(&self) -> MasterInfo {
        let state = self.state.lock().await;
        MasterInfo {
            id: self.id,
            name: self.name.clone(),
            search_cadence_ms: state.search_cadence_ms,
            max_slave_count: self.max_slave_count,
            slave_ttl: state.slave_ttl,
            enable_pullup: state.enable_pullup,
            attempts: state.attempts,
            slave_count: state.slaves.len(),
            paused: self.control.is_paused(),
            slaves: state.slaves.iter().map(|e| e.device.name()).collect(),
        }
    }

    /// Make the next sweep re-check the bus identity; used after a resume
    pub fn request_reverify(&self) {
        self.reverify.store(true, Ordering::SeqCst);
    }

    pub fn reverify_pending(&self) -> bool {
        self.reverify.load(Ordering::SeqCst)
    }

    /// Attach a slave by registration number
    pub async fn attach(&self, rn: RegNum) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        self.attach_locked(&mut state, rn).await
    }

    /// Detach a slave, waiting until every outstanding reference is released
    pub async fn detach(&self, rn: RegNum) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        let Some(index) = state.position(rn) else {
            info!(master = self.id, slave = %rn, "Device doesn't exist");
            return Err(RegistryError::NotFound(rn));
        };
        self.detach_at(&mut state, index).await;
        Ok(())
    }

    /// Administrative add from the `ff-dddddddddddd` form
    pub async fn add_slave_str(&self, text: &str) -> Result<RegNum, RegistryError> {
        let rn: RegNum = text.parse()?;
        self.attach(rn).await?;
        Ok(rn)
    }

    /// Administrative remove from the `ff-dddddddddddd` form
    pub async fn remove_slave_str(&self, text: &str) -> Result<RegNum, RegistryError> {
        let rn: RegNum = text.parse()?;
        self.detach(rn).await?;
        Ok(rn)
    }

    /// Run one full sweep now; never cancelled by the scheduler
    pub async fn search_and_reconcile(&self) -> Result<SweepReport, SearchError> {
        self.sweep(None, None).await
    }

    /// Sweep now and report whether any slave is attached afterwards
    pub async fn check_presence(&self) -> Result<bool, SearchError> {
        let report = self.sweep(None, None).await?;
        info!(master = self.id, slaves = report.total, "Presence check");
        Ok(report.total > 0)
    }

    /// Sweep that keeps only `expected` attached
    ///
    /// Discovered devices with another identifier are refused and detached
    /// if known; afterwards every other slave is dropped. Returns whether
    /// `expected` answered this sweep.
    pub async fn verify_identity(&self, expected: RegNum) -> Result<bool, SearchError> {
        let mut state = self.state.lock().await;
        self.sweep_locked(&mut state, Verification::Expect(expected), None)
            .await?;

        while let Some(index) = state
            .slaves
            .iter()
            .position(|e| e.device.reg_num != expected)
        {
            self.detach_at(&mut state, index).await;
        }

        let present = state
            .slaves
            .iter()
            .any(|e| e.device.reg_num == expected && e.active);
        info!(master = self.id, expected = %expected, present, "Identity verification");
        Ok(present)
    }

    /// Devices currently signalling an alarm; the registry is left untouched
    pub async fn alarm_search(&self) -> Result<Vec<RegNum>, SearchError> {
        let mut found = Vec::new();
        search(
            &self.bus,
            self.max_slave_count,
            SearchType::Alarm,
            None,
            |raw| found.push(RegNum::from_raw(raw)),
        )
        .await?;
        Ok(found)
    }

    /// Write to one device: reset, address it, then send `data`
    pub async fn write_slave(&self, rn: RegNum, data: &[u8]) -> Result<(), RegistryError> {
        let mut bus = self.bus.lock().await;
        self.reset_select(&mut **bus, rn).await?;
        bus.write_block(data).await?;
        Ok(())
    }

    /// Read from one device: reset, address it, then read `len` bytes
    pub async fn read_slave(&self, rn: RegNum, len: usize) -> Result<Vec<u8>, RegistryError> {
        let mut bus = self.bus.lock().await;
        self.reset_select(&mut **bus, rn).await?;
        Ok(bus.read_block(len).await?)
    }

    async fn reset_select(
        &self,
        bus: &mut dyn BusTransport,
        rn: RegNum,
    ) -> Result<(), RegistryError> {
        if !bus.reset().await? {
            return Err(RegistryError::NoPresence);
        }
        if self.max_slave_count == 1 {
            bus.write_byte(SKIP_ROM).await?;
        } else {
            let mut frame = Vec::with_capacity(9);
            frame.push(MATCH_ROM);
            frame.extend_from_slice(&rn.to_bytes());
            bus.write_block(&frame).await?;
        }
        Ok(())
    }

    /// Sweep under the state lock
    ///
    /// `expect` runs an identity verification; `cancel` is only passed by
    /// the background scheduler.
    pub(crate) async fn sweep(
        &self,
        expect: Option<RegNum>,
        cancel: Option<&CancellationToken>,
    ) -> Result<SweepReport, SearchError> {
        let mut state = self.state.lock().await;
        let verification = match expect {
            Some(rn) => Verification::Expect(rn),
            None => Verification::Off,
        };
        self.sweep_locked(&mut state, verification, cancel).await
    }

    async fn sweep_locked(
        &self,
        state: &mut MasterState,
        verification: Verification,
        cancel: Option<&CancellationToken>,
    ) -> Result<SweepReport, SearchError> {
        for entry in state.slaves.iter_mut() {
            entry.active = false;
        }
        state.attempts += 1;

        let mut verification = match verification {
            Verification::Off if self.reverify.swap(false, Ordering::SeqCst) => {
                Verification::Resume
            }
            other => other,
        };

        let mut report = SweepReport::default();
        let mut search = Search::new(&self.bus, self.max_slave_count, SearchType::Normal, cancel);
        let outcome = loop {
            match search.next().await {
                Ok(Some(raw)) => {
                    report.found += 1;
                    self.slave_found(state, raw, &mut verification, &mut report)
                        .await;
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        debug!(
            master = self.id,
            rounds = search.rounds(),
            found = report.found,
            "Search pass finished"
        );

        if let Err(e) = outcome {
            // An unfinished search says nothing about absent devices: skip aging
            if verification == Verification::Resume {
                self.reverify.store(true, Ordering::SeqCst);
            }
            return Err(e);
        }

        let ttl = state.slave_ttl;
        let mut index = 0;
        while index < state.slaves.len() {
            let entry = &mut state.slaves[index];
            if entry.active {
                entry.ttl = ttl;
                index += 1;
                continue;
            }
            entry.ttl = entry.ttl.saturating_sub(1);
            if entry.ttl == 0 {
                self.detach_at(state, index).await;
                report.detached += 1;
            } else {
                index += 1;
            }
        }

        report.total = state.slaves.len();
        let _ = self.events.send(SlaveEvent::SweepCompleted {
            master: self.id,
            found: report.found,
            total: report.total,
        });
        Ok(report)
    }

    /// Per-discovery handling: mark known slaves active, attach new valid ones
    async fn slave_found(
        &self,
        state: &mut MasterState,
        raw: u64,
        verification: &mut Verification,
        report: &mut SweepReport,
    ) {
        let rn = RegNum::from_raw(raw);

        match *verification {
            Verification::Resume => {
                *verification = Verification::Off;
                let stale = state
                    .slaves
                    .first()
                    .map(|e| e.device.reg_num)
                    .filter(|&known| known != rn && state.position(rn).is_none());
                if let Some(known) = stale {
                    info!(
                        master = self.id,
                        expected = %known,
                        found = %rn,
                        "Device changed while suspended"
                    );
                    self.detach_at(state, 0).await;
                    report.detached += 1;
                }
            }
            Verification::Expect(expected) if rn != expected => {
                debug!(master = self.id, slave = %rn, expected = %expected, "Refusing unexpected device");
                if let Some(index) = state.position(rn) {
                    self.detach_at(state, index).await;
                    report.detached += 1;
                }
                return;
            }
            _ => {}
        }

        if let Some(index) = state.position(rn) {
            state.slaves[index].active = true;
            return;
        }

        if raw == 0 || !rn.is_valid() {
            debug!(
                master = self.id,
                rom = %format!("{raw:016x}"),
                "Dropping identifier with bad CRC"
            );
            return;
        }

        match self.attach_locked(state, rn).await {
            Ok(()) => report.attached += 1,
            Err(e) => warn!(master = self.id, slave = %rn, error = %e, "Attaching slave failed"),
        }
    }

    pub(crate) async fn attach_locked(
        &self,
        state: &mut MasterState,
        rn: RegNum,
    ) -> Result<(), RegistryError> {
        if state.position(rn).is_some() {
            info!(master = self.id, slave = %rn, "Device already exists");
            return Err(RegistryError::DuplicateAttach(rn));
        }
        if !rn.is_valid() {
            return Err(RegistryError::ChecksumMismatch(rn));
        }
        state
            .slaves
            .try_reserve(1)
            .map_err(|_| RegistryError::Allocation)?;

        let family = self.families.resolve(rn.family());
        if family.is_default() {
            info!(
                master = self.id,
                slave = %rn,
                family = %format!("{:02x}", rn.family()),
                crc = %format!("{:02x}", rn.crc()),
                "Family is not registered, using default"
            );
        }

        let device = Arc::new(SlaveDevice::new(rn, self.id, family));
        if let Err(source) = device.family().ops().add_slave(&device) {
            // Dropping the device releases its family reference
            warn!(master = self.id, slave = %rn, error = %source, "Family add_slave failed");
            return Err(RegistryError::FamilyHook { slave: rn, source });
        }

        info!(
            master = self.id,
            slave = %rn,
            family = device.family().name(),
            "Attached slave"
        );
        state.slaves.push(SlaveEntry {
            device,
            active: true,
            ttl: state.slave_ttl,
        });
        let _ = self.events.send(SlaveEvent::Added {
            master: self.id,
            slave: rn,
        });
        Ok(())
    }

    /// Remove the slave at `index`, then wait for its holders to let go
    pub(crate) async fn detach_at(&self, state: &mut MasterState, index: usize) {
        let SlaveEntry { device, .. } = state.slaves.remove(index);
        let rn = device.reg_num;
        info!(master = self.id, slave = %rn, "Detaching slave");

        device.family().ops().remove_slave(&device);
        let _ = self.events.send(SlaveEvent::Removed {
            master: self.id,
            slave: rn,
        });

        let refs = device.refs();
        if refs > 0 {
            debug!(master = self.id, slave = %rn, refs, "Waiting for slave to become free");
        }
        device.refs.wait_drained().await;
    }

    /// Detach and reattach the slaves affected by a family change
    ///
    /// When `attaching`, slaves of code `fid` still bound to the default
    /// family move to the new descriptor; otherwise slaves bound to `fid`
    /// fall back to whatever the family registry now resolves. Returns the
    /// number of slaves reattached.
    pub(crate) async fn reconnect(&self, fid: u8, attaching: bool) -> usize {
        let mut state = self.state.lock().await;
        let affected = state.select(|slave| {
            if attaching {
                slave.family().is_default() && slave.reg_num().family() == fid
            } else {
                !slave.family().is_default() && slave.family().fid() == fid
            }
        });

        let mut reattached = 0;
        for rn in affected {
            if let Some(index) = state.position(rn) {
                self.detach_at(&mut state, index).await;
            }
            match self.attach_locked(&mut state, rn).await {
                Ok(()) => reattached += 1,
                Err(e) => warn!(master = self.id, slave = %rn, error = %e, "Reattaching slave failed"),
            }
        }
        reattached
    }

    /// Detach every slave; used when the master goes away
    pub(crate) async fn detach_all(&self) {
        let mut state = self.state.lock().await;
        while !state.slaves.is_empty() {
            self.detach_at(&mut state, 0).await;
        }
    }
}

impl std::fmt::Debug for BusMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusMaster")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("max_slave_count", &self.max_slave_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_bus::SimulatedBus;

    fn master_with(bus: &SimulatedBus, config: MasterConfig) -> BusMaster {
        let (events, _) = broadcast::channel(64);
        BusMaster::new(
            1,
            config,
            Box::new(bus.clone()),
            Arc::new(FamilyRegistry::new()),
            events,
        )
    }

    fn config(ttl: u32) -> MasterConfig {
        MasterConfig {
            slave_ttl: ttl,
            search_cadence_ms: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sweep_attaches_discovered_devices() {
        let devices = [RegNum::new(0x28, 1), RegNum::new(0x28, 2), RegNum::new(0x10, 3)];
        let bus = SimulatedBus::with_devices(devices);
        let master = master_with(&bus, config(10));

        let report = master.search_and_reconcile().await.unwrap();
        assert_eq!(report.found, 3);
        assert_eq!(report.attached, 3);
        assert_eq!(report.total, 3);
        for rn in devices {
            assert!(master.contains(rn).await);
        }

        let again = master.search_and_reconcile().await.unwrap();
        assert_eq!(again.attached, 0);
        assert_eq!(again.total, 3);
        assert_eq!(master.attempts().await, 2);
    }

    #[tokio::test]
    async fn test_sweep_drops_bad_crc() {
        let bus = SimulatedBus::new();
        bus.add_raw(RegNum::new(0x28, 5).to_raw() ^ (0xFF << 56));
        let master = master_with(&bus, config(10));

        let report = master.search_and_reconcile().await.unwrap();
        assert_eq!(report.found, 1);
        assert_eq!(report.attached, 0);
        assert_eq!(master.slave_count().await, 0);
    }

    #[tokio::test]
    async fn test_attach_twice_is_duplicate() {
        let bus = SimulatedBus::new();
        let master = master_with(&bus, config(10));
        let rn = RegNum::new(0x28, 9);

        master.attach(rn).await.unwrap();
        assert!(matches!(
            master.attach(rn).await,
            Err(RegistryError::DuplicateAttach(dup)) if dup == rn
        ));
        assert_eq!(master.slave_count().await, 1);
    }

    #[tokio::test]
    async fn test_attach_rejects_bad_crc() {
        let bus = SimulatedBus::new();
        let master = master_with(&bus, config(10));
        let bad = RegNum::from_raw(RegNum::new(0x28, 9).to_raw() ^ (1 << 57));

        assert!(matches!(
            master.attach(bad).await,
            Err(RegistryError::ChecksumMismatch(_))
        ));
        assert_eq!(master.slave_count().await, 0);
    }

    #[tokio::test]
    async fn test_ttl_one_ages_out_after_one_miss() {
        let keep = RegNum::new(0x28, 1);
        let gone = RegNum::new(0x28, 2);
        let bus = SimulatedBus::with_devices([keep, gone]);
        let master = master_with(&bus, config(1));

        master.search_and_reconcile().await.unwrap();
        assert_eq!(master.slave_count().await, 2);

        bus.remove_device(gone);
        let report = master.search_and_reconcile().await.unwrap();
        assert_eq!(report.detached, 1);
        assert!(master.contains(keep).await);
        assert!(!master.contains(gone).await);

        for _ in 0..5 {
            master.search_and_reconcile().await.unwrap();
        }
        assert!(master.contains(keep).await);
    }

    #[tokio::test]
    async fn test_ttl_counts_down_and_resets() {
        let rn = RegNum::new(0x28, 1);
        let bus = SimulatedBus::with_devices([rn]);
        let master = master_with(&bus, config(3));
        master.search_and_reconcile().await.unwrap();

        bus.remove_device(rn);
        master.search_and_reconcile().await.unwrap();
        master.search_and_reconcile().await.unwrap();
        assert_eq!(master.slaves().await[0].ttl, 1);

        bus.add_device(rn);
        master.search_and_reconcile().await.unwrap();
        assert_eq!(master.slaves().await[0].ttl, 3);

        bus.remove_device(rn);
        for _ in 0..3 {
            master.search_and_reconcile().await.unwrap();
        }
        assert_eq!(master.slave_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_bus_ages_everything() {
        let rn = RegNum::new(0x28, 1);
        let bus = SimulatedBus::new();
        let master = master_with(&bus, config(1));
        master.attach(rn).await.unwrap();

        let report = master.search_and_reconcile().await.unwrap();
        assert_eq!(report.found, 0);
        assert_eq!(report.detached, 1);
        assert_eq!(bus.triplet_count(), 0);
    }

    #[tokio::test]
    async fn test_glitch_skips_aging() {
        let rn = RegNum::new(0x28, 1);
        let bus = SimulatedBus::with_devices([RegNum::new(0x28, 2)]);
        let master = master_with(&bus, config(1));
        master.attach(rn).await.unwrap();

        bus.glitch_next_search(3);
        let err = master.search_and_reconcile().await.unwrap_err();
        assert!(matches!(err, SearchError::NoResponse { .. }));
        assert!(master.contains(rn).await);
    }

    #[tokio::test]
    async fn test_detach_missing_is_not_found() {
        let bus = SimulatedBus::new();
        let master = master_with(&bus, config(10));
        assert!(matches!(
            master.detach(RegNum::new(0x28, 1)).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_text_add_and_remove() {
        let bus = SimulatedBus::new();
        let master = master_with(&bus, config(10));

        let rn = master.add_slave_str("28-00000a1b2c3d\n").await.unwrap();
        assert!(rn.is_valid());
        assert_eq!(master.info().await.slaves, vec!["28-00000a1b2c3d".to_string()]);

        assert!(matches!(
            master.add_slave_str("28:00000a1b2c3d").await,
            Err(RegistryError::InvalidId(_))
        ));

        master.remove_slave_str("28-00000a1b2c3d").await.unwrap();
        assert_eq!(master.slave_count().await, 0);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let rn = RegNum::new(0x28, 1);
        let bus = SimulatedBus::with_devices([rn]);
        let master = master_with(&bus, config(1));
        let mut rx = master.subscribe();

        master.search_and_reconcile().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), SlaveEvent::Added { master: 1, slave: rn });
        assert!(matches!(rx.recv().await.unwrap(), SlaveEvent::SweepCompleted { found: 1, total: 1, .. }));

        master.detach(rn).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), SlaveEvent::Removed { master: 1, slave: rn });
    }

    #[tokio::test]
    async fn test_resume_reverify_replaces_swapped_device() {
        let old = RegNum::new(0x28, 1);
        let new = RegNum::new(0x28, 2);
        let bus = SimulatedBus::with_devices([old]);
        let master = master_with(&bus, MasterConfig { max_slave_count: 1, ..config(10) });
        master.search_and_reconcile().await.unwrap();

        bus.remove_device(old);
        bus.add_device(new);
        master.request_reverify();

        let report = master.search_and_reconcile().await.unwrap();
        assert_eq!(report.detached, 1);
        assert!(!master.contains(old).await);
        assert!(master.contains(new).await);
        assert!(!master.reverify_pending());
    }

    #[tokio::test]
    async fn test_resume_reverify_keeps_known_device() {
        let rn = RegNum::new(0x28, 1);
        let bus = SimulatedBus::with_devices([rn]);
        let master = master_with(&bus, config(10));
        master.search_and_reconcile().await.unwrap();

        master.request_reverify();
        let report = master.search_and_reconcile().await.unwrap();
        assert_eq!(report.detached, 0);
        assert!(master.contains(rn).await);
    }

    #[tokio::test]
    async fn test_verify_identity() {
        let expected = RegNum::new(0x2D, 7);
        let other = RegNum::new(0x28, 8);
        let bus = SimulatedBus::with_devices([expected, other]);
        let master = master_with(&bus, config(10));
        master.search_and_reconcile().await.unwrap();
        assert_eq!(master.slave_count().await, 2);

        assert!(master.verify_identity(expected).await.unwrap());
        assert_eq!(master.slaves().await.len(), 1);
        assert!(master.contains(expected).await);

        bus.remove_device(expected);
        assert!(!master.verify_identity(expected).await.unwrap());
    }

    #[tokio::test]
    async fn test_alarm_search_leaves_registry_alone() {
        let quiet = RegNum::new(0x28, 1);
        let loud = RegNum::new(0x28, 2);
        let bus = SimulatedBus::with_devices([quiet, loud]);
        bus.set_alarm(loud, true);
        let master = master_with(&bus, config(10));

        assert_eq!(master.alarm_search().await.unwrap(), vec![loud]);
        assert_eq!(master.slave_count().await, 0);
        assert_eq!(master.attempts().await, 0);
    }

    #[tokio::test]
    async fn test_write_and_read_slave() {
        let a = RegNum::new(0x28, 1);
        let b = RegNum::new(0x28, 2);
        let bus = SimulatedBus::with_devices([a, b]);
        let master = master_with(&bus, config(10));

        master.write_slave(b, &[0x4E, 0x01]).await.unwrap();
        assert_eq!(bus.memory(b).unwrap(), vec![0x4E, 0x01]);
        assert!(bus.memory(a).unwrap().is_empty());
        assert_eq!(master.read_slave(b, 2).await.unwrap(), vec![0x4E, 0x01]);

        let empty = SimulatedBus::new();
        let idle = master_with(&empty, config(10));
        assert!(matches!(
            idle.write_slave(a, &[0]).await,
            Err(RegistryError::NoPresence)
        ));
    }

    #[tokio::test]
    async fn test_check_presence() {
        let bus = SimulatedBus::with_devices([RegNum::new(0x28, 1)]);
        let master = master_with(&bus, config(10));
        assert!(master.check_presence().await.unwrap());

        let empty = SimulatedBus::new();
        let idle = master_with(&empty, config(10));
        assert!(!idle.check_presence().await.unwrap());
    }

    #[tokio::test]
    async fn test_config_updates() {
        let bus = SimulatedBus::new();
        let master = master_with(&bus, config(10));
        master.set_search_cadence(250).await;
        master.set_pullup(true).await;

        let info = master.info().await;
        assert_eq!(info.search_cadence_ms, 250);
        assert!(info.enable_pullup);
        assert_eq!(info.slave_count, 0);
        assert!(!info.paused);
    }
}
