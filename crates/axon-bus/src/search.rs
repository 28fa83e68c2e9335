//! ROM search: enumerate every device on a bus
//!
//! The search is a binary tree walk over the 64 ROM bits, least significant
//! bit first. For each bit the master reads the bit and its complement from
//! all devices still participating and writes back a direction; devices
//! whose bit differs drop out until the next reset. When both reads are 0
//! the devices disagree and the master has to pick a branch. Each round
//! follows the previous round's path up to the most recent branch where the
//! 0 side was taken, takes the 1 side there, and prefers 0 afterwards. A
//! round that makes no new 0 choice ends the enumeration.
//!
//! Devices are therefore reported in ascending order of their ROM read
//! from the least significant bit.

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::transport::{BusTransport, TransportError, ALARM_SEARCH, READ_ROM, SEARCH_ROM};

/// Bit index meaning "no branch point yet"
const NO_BRANCH: u32 = 64;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("No device responded at bit {bit} of round {round}")]
    NoResponse { round: usize, bit: u32 },
    #[error("Search cancelled")]
    Cancelled,
}

/// Which devices take part in the search
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SearchType {
    /// Every device on the bus
    #[default]
    Normal,
    /// Only devices signalling an alarm condition
    Alarm,
}

impl SearchType {
    pub fn command(&self) -> u8 {
        match self {
            Self::Normal => SEARCH_ROM,
            Self::Alarm => ALARM_SEARCH,
        }
    }
}

/// One enumeration of a bus, yielding raw ROM ids as they are found
///
/// The bus lock is taken for each round and released before the id is
/// handed out, so the caller may do slow work between rounds.
pub struct Search<'a, B: BusTransport> {
    bus: &'a Mutex<B>,
    max_slave_count: usize,
    search_type: SearchType,
    cancel: Option<&'a CancellationToken>,
    last_rn: u64,
    branch_point: u32,
    rounds: usize,
    done: bool,
}

impl<'a, B: BusTransport> Search<'a, B> {
    /// Prepare a search bounded to `max_slave_count` rounds
    ///
    /// `cancel` is only given by the background scheduler; synchronous
    /// callers pass `None` and are never interrupted.
    pub fn new(
        bus: &'a Mutex<B>,
        max_slave_count: usize,
        search_type: SearchType,
        cancel: Option<&'a CancellationToken>,
    ) -> Self {
        Self {
            bus,
            max_slave_count,
            search_type,
            cancel,
            last_rn: 0,
            branch_point: NO_BRANCH,
            rounds: 0,
            done: false,
        }
    }

    /// Rounds run so far
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Run the next round; `Ok(None)` once the enumeration is complete
    pub async fn next(&mut self) -> Result<Option<u64>, SearchError> {
        if self.done || self.rounds >= self.max_slave_count {
            return Ok(None);
        }
        self.rounds += 1;

        let result = self.round().await;
        if result.is_err() {
            self.done = true;
        }
        result
    }

    async fn round(&mut self) -> Result<Option<u64>, SearchError> {
        let mut bus = self.bus.lock().await;

        if !bus.reset().await? {
            debug!("No devices present on the wire");
            self.done = true;
            return Ok(None);
        }

        // Single slave bus: read the ROM directly
        if self.max_slave_count == 1 {
            bus.write_byte(READ_ROM).await?;
            let rom = bus.read_block(8).await?;
            drop(bus);

            self.done = true;
            let rn = <[u8; 8]>::try_from(rom.as_slice())
                .map(u64::from_le_bytes)
                .unwrap_or(0);
            return Ok((rn != 0).then_some(rn));
        }

        bus.write_byte(self.search_type.command()).await?;

        let mut rn = 0u64;
        let mut last_zero: Option<u32> = None;
        for i in 0..64u32 {
            let search_bit = if i == self.branch_point {
                // took the 0 path here last time, take the 1 path now
                true
            } else if i > self.branch_point {
                false
            } else {
                (self.last_rn >> i) & 1 == 1
            };

            let triplet = bus.triplet(search_bit).await?;
            trace!(bit = i, bits = triplet.to_bits(), "Search triplet");

            if triplet.no_response() {
                debug!(round = self.rounds, bit = i, "No device responded, aborting search");
                return Err(SearchError::NoResponse {
                    round: self.rounds,
                    bit: i,
                });
            }

            if triplet.is_branch() && !triplet.direction {
                last_zero = Some(i);
            }

            rn |= (triplet.direction as u64) << i;

            if self.cancel.is_some_and(|token| token.is_cancelled()) {
                debug!(round = self.rounds, "Search cancelled");
                return Err(SearchError::Cancelled);
            }
        }
        drop(bus);

        match last_zero {
            Some(bit) if bit != self.branch_point => self.branch_point = bit,
            _ => self.done = true,
        }
        self.last_rn = rn;

        debug!(round = self.rounds, rom = %format!("{rn:016x}"), "Search round complete");
        Ok(Some(rn))
    }
}

/// Enumerate the bus, calling `on_found` once per device
///
/// Returns the number of devices reported.
pub async fn search<B, F>(
    bus: &Mutex<B>,
    max_slave_count: usize,
    search_type: SearchType,
    cancel: Option<&CancellationToken>,
    mut on_found: F,
) -> Result<usize, SearchError>
where
    B: BusTransport,
    F: FnMut(u64),
{
    let mut search = Search::new(bus, max_slave_count, search_type, cancel);
    let mut found = 0;
    while let Some(rn) = search.next().await? {
        on_found(rn);
        found += 1;
    }
    Ok(found)
}
