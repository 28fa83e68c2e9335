//! Simulated 1-Wire bus
//!
//! Emulates the wired-AND behaviour of a real bus closely enough to run the
//! ROM search, READ ROM, MATCH ROM and SKIP ROM against a set of virtual
//! devices. Handles are cheap clones sharing one bus, so a test (or the
//! daemon) can plug devices in and out while a master owns the transport.

use async_trait::async_trait;
use axon_core::RegNum;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

use crate::transport::{
    BusTransport, TransportError, Triplet, ALARM_SEARCH, MATCH_ROM, READ_ROM, SEARCH_ROM,
    SKIP_ROM,
};

#[derive(Debug, Clone)]
struct SimDevice {
    rom: u64,
    alarm: bool,
    memory: Vec<u8>,
}

impl SimDevice {
    fn bit(&self, index: u32) -> bool {
        (self.rom >> index) & 1 == 1
    }
}

/// Where the bus is in its transaction after the last reset
#[derive(Debug, Default)]
enum Phase {
    /// No reset yet, or the transaction is over
    #[default]
    Idle,
    /// Reset done, waiting for a ROM command
    Command,
    /// ROM search in progress over the devices still participating
    Search {
        candidates: Vec<usize>,
        bit: u32,
        glitch_at: Option<u32>,
    },
    /// READ ROM issued
    ReadRom,
    /// MATCH ROM issued, collecting the 8 ROM bytes
    Match { rom: Vec<u8> },
    /// Function commands now go to these devices
    Selected(Vec<usize>),
}

#[derive(Debug, Default)]
struct SimState {
    devices: Vec<SimDevice>,
    phase: Phase,
    resets: usize,
    triplets: usize,
    glitch_next_search: Option<u32>,
}

impl SimState {
    fn feed(&mut self, byte: u8) {
        match std::mem::take(&mut self.phase) {
            Phase::Command => {
                self.phase = match byte {
                    SEARCH_ROM | ALARM_SEARCH => Phase::Search {
                        candidates: self
                            .devices
                            .iter()
                            .enumerate()
                            .filter(|(_, d)| byte == SEARCH_ROM || d.alarm)
                            .map(|(i, _)| i)
                            .collect(),
                        bit: 0,
                        glitch_at: self.glitch_next_search.take(),
                    },
                    READ_ROM => Phase::ReadRom,
                    MATCH_ROM => Phase::Match { rom: Vec::with_capacity(8) },
                    SKIP_ROM => Phase::Selected((0..self.devices.len()).collect()),
                    _ => Phase::Idle,
                };
            }
            Phase::Match { mut rom } => {
                rom.push(byte);
                self.phase = if rom.len() == 8 {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&rom);
                    let wanted = u64::from_le_bytes(bytes);
                    Phase::Selected(
                        self.devices
                            .iter()
                            .enumerate()
                            .filter(|(_, d)| d.rom == wanted)
                            .map(|(i, _)| i)
                            .collect(),
                    )
                } else {
                    Phase::Match { rom }
                };
            }
            Phase::Selected(selected) => {
                for &i in &selected {
                    self.devices[i].memory.push(byte);
                }
                self.phase = Phase::Selected(selected);
            }
            other => self.phase = other,
        }
    }

    /// Wired-AND of one byte driven by several devices; idle line reads 0xFF
    fn wired_and<'a>(bytes: impl Iterator<Item = Option<&'a u8>>) -> u8 {
        bytes.fold(0xFF, |acc, b| acc & b.copied().unwrap_or(0xFF))
    }
}

/// Handle to a simulated bus; clones share the same wire
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus with the given devices plugged in
    pub fn with_devices(devices: impl IntoIterator<Item = RegNum>) -> Self {
        let bus = Self::new();
        for rn in devices {
            bus.add_device(rn);
        }
        bus
    }

    /// Plug in a device by its raw 64-bit ROM, valid CRC or not
    pub fn add_raw(&self, rom: u64) {
        self.inner.lock().devices.push(SimDevice {
            rom,
            alarm: false,
            memory: Vec::new(),
        });
    }

    pub fn add_device(&self, rn: RegNum) {
        self.add_raw(rn.to_raw());
    }

    /// Unplug a device; returns whether it was present
    pub fn remove_device(&self, rn: RegNum) -> bool {
        let mut state = self.inner.lock();
        let before = state.devices.len();
        state.devices.retain(|d| d.rom != rn.to_raw());
        // Indices in an ongoing transaction are stale now
        state.phase = Phase::Idle;
        state.devices.len() != before
    }

    pub fn set_alarm(&self, rn: RegNum, alarm: bool) {
        let mut state = self.inner.lock();
        for device in state.devices.iter_mut().filter(|d| d.rom == rn.to_raw()) {
            device.alarm = alarm;
        }
    }

    /// Make the next ROM search report "no device responded" at `bit`
    pub fn glitch_next_search(&self, bit: u32) {
        self.inner.lock().glitch_next_search = Some(bit);
    }

    pub fn devices(&self) -> Vec<RegNum> {
        self.inner
            .lock()
            .devices
            .iter()
            .map(|d| RegNum::from_raw(d.rom))
            .collect()
    }

    /// Bytes written to a device through MATCH ROM or SKIP ROM
    pub fn memory(&self, rn: RegNum) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .devices
            .iter()
            .find(|d| d.rom == rn.to_raw())
            .map(|d| d.memory.clone())
    }

    pub fn reset_count(&self) -> usize {
        self.inner.lock().resets
    }

    pub fn triplet_count(&self) -> usize {
        self.inner.lock().triplets
    }
}

#[async_trait]
impl BusTransport for SimulatedBus {
    async fn reset(&mut self) -> Result<bool, TransportError> {
        let mut state = self.inner.lock();
        state.resets += 1;
        state.phase = Phase::Command;
        Ok(!state.devices.is_empty())
    }

    async fn write_block(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.inner.lock();
        for &byte in data {
            state.feed(byte);
        }
        Ok(())
    }

    async fn read_block(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut state = self.inner.lock();
        let data = match &state.phase {
            Phase::ReadRom => {
                let roms: Vec<[u8; 8]> = state.devices.iter().map(|d| d.rom.to_le_bytes()).collect();
                (0..len)
                    .map(|i| SimState::wired_and(roms.iter().map(|r| r.get(i))))
                    .collect()
            }
            Phase::Selected(selected) => (0..len)
                .map(|i| {
                    SimState::wired_and(selected.iter().map(|&d| state.devices[d].memory.get(i)))
                })
                .collect(),
            _ => vec![0xFF; len],
        };
        if matches!(state.phase, Phase::ReadRom) {
            state.phase = Phase::Idle;
        }
        Ok(data)
    }

    async fn triplet(&mut self, direction: bool) -> Result<Triplet, TransportError> {
        let mut state = self.inner.lock();
        state.triplets += 1;

        let SimState { devices, phase, .. } = &mut *state;
        let Phase::Search {
            candidates,
            bit,
            glitch_at,
        } = phase
        else {
            return Ok(Triplet::from_bits(0b011));
        };

        if *bit >= 64 || *glitch_at == Some(*bit) {
            return Ok(Triplet::from_bits(0b011));
        }

        let index = *bit;
        let id_bit = candidates.iter().all(|&d| devices[d].bit(index));
        let complement_bit = candidates.iter().all(|&d| !devices[d].bit(index));
        let taken = match (id_bit, complement_bit) {
            (true, false) => true,
            (false, true) => false,
            _ => direction,
        };
        candidates.retain(|&d| devices[d].bit(index) == taken);
        *bit += 1;

        let triplet = Triplet {
            id_bit,
            complement_bit,
            direction: taken,
        };
        trace!(bit = index, bits = triplet.to_bits(), "Simulated triplet");
        Ok(triplet)
    }
}
