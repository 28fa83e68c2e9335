//! Application state management

use anyhow::Result;
use axon_bus::SimulatedBus;
use axon_core::{RegNum, SlaveEvent};
use axon_discovery::{FamilyError, FamilyOps, MasterRef, Registry, SlaveDevice};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::Config;

/// Family driver that only logs attach and detach
pub struct LoggingFamily {
    name: String,
}

impl LoggingFamily {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl FamilyOps for LoggingFamily {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_slave(&self, slave: &SlaveDevice) -> Result<(), FamilyError> {
        info!(family = %self.name, slave = %slave.reg_num(), master = slave.master_id(), "Slave bound");
        Ok(())
    }

    fn remove_slave(&self, slave: &SlaveDevice) {
        info!(family = %self.name, slave = %slave.reg_num(), "Slave unbound");
    }
}

/// Shared application state
pub struct AppState {
    /// Bus masters and families
    pub registry: Registry,
    /// Simulated wire behind each master, by master id
    pub buses: HashMap<u32, SimulatedBus>,
    /// Configuration
    pub config: Config,
}

impl AppState {
    /// Create new application state
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let registry = Registry::new();

        for family in &config.families {
            registry
                .register_family(family.code, Arc::new(LoggingFamily::new(&family.name)))
                .await?;
        }

        let mut buses = HashMap::new();
        for section in config.master_sections() {
            let bus = SimulatedBus::new();
            for device in &section.devices {
                let rn: RegNum = device.id.parse()?;
                bus.add_device(rn);
                if device.alarm {
                    bus.set_alarm(rn, true);
                }
            }

            let master = registry
                .add_master(config.master_config(&section), Box::new(bus.clone()))
                .await;
            info!(
                master = master.id(),
                name = %section.name,
                devices = section.devices.len(),
                "Simulated bus attached"
            );
            buses.insert(master.id(), bus);
        }

        Ok(Arc::new(Self {
            registry,
            buses,
            config,
        }))
    }

    /// Subscribe to slave events
    pub fn subscribe(&self) -> broadcast::Receiver<SlaveEvent> {
        self.registry.subscribe()
    }

    pub async fn master(&self, id: u32) -> Option<MasterRef> {
        self.registry.find_master(id).await
    }

    /// Simulated wire of a registered master; `None` once the master is removed
    pub async fn bus(&self, id: u32) -> Option<&SimulatedBus> {
        self.registry.find_master(id).await?;
        self.buses.get(&id)
    }
}
