//! Persistent parameter layout over an EEPROM-like byte store
//!
//! The store is split into consecutive blocks, one per [`BlockId`]. A block's
//! address is the sum of the sizes of the blocks before it, and each block
//! reports its real size back through [`Settings::update_block_size`] once it
//! has been read or written.
//!
//! Parameter blocks (sensor calibration, PID gains) are stored as a
//! little-endian `u16` count followed by that many little-endian `f32`
//! values. The regulator block holds a `postcard`-encoded
//! [`RegulatorConfig`] behind a `u16` length. Any block that does not decode
//! is rewritten with the caller's defaults.

use log::{debug, warn};

use crate::config::{PidGains, RegulatorConfig, SensorParams};
use crate::error::SettingsError;
use crate::sensors::SensorId;

/// Raw byte store, typically an EEPROM or a flash page
pub trait SettingsStore {
    fn capacity(&self) -> usize;

    fn load(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), SettingsError>;

    fn store(&mut self, addr: usize, bytes: &[u8]) -> Result<(), SettingsError>;
}

/// Blocks in address order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Sensors = 0,
    Charger = 1,
    Regulator = 2,
}

impl BlockId {
    pub const COUNT: usize = 3;
}

/// Result of reading a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Stored values were applied
    Loaded,
    /// Stored data was missing or stale; defaults were written back
    Defaulted,
}

const COUNT_LEN: usize = 2;
const RECORD_CAPACITY: usize = 128;
const REGULATOR_CAPACITY: usize = 96;

/// Bytes taken by a parameter record of `count` values
pub const fn record_len(count: usize) -> usize {
    COUNT_LEN + count * 4
}

/// Parameters persisted in the sensor block, in [`SensorId`] order
pub const SENSOR_PARAM_COUNT: usize = SensorId::COUNT * SensorParams::PARAM_COUNT;

pub struct Settings<S: SettingsStore> {
    store: S,
    block_sizes: [usize; BlockId::COUNT],
}

impl<S: SettingsStore> Settings<S> {
    /// Lay the blocks out with the sizes of the compiled-in records
    pub fn new(store: S) -> Self {
        Self {
            store,
            block_sizes: [
                record_len(SENSOR_PARAM_COUNT),
                record_len(PidGains::PARAM_COUNT),
                COUNT_LEN + REGULATOR_CAPACITY,
            ],
        }
    }

    pub fn block_address(&self, id: BlockId) -> usize {
        self.block_sizes[..id as usize].iter().sum()
    }

    pub fn block_size(&self, id: BlockId) -> usize {
        self.block_sizes[id as usize]
    }

    pub fn update_block_size(&mut self, id: BlockId, len: usize) {
        self.block_sizes[id as usize] = len;
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    /// Write `params` as a counted `f32` record
    pub fn save_params(&mut self, id: BlockId, params: &[f32]) -> Result<(), SettingsError> {
        let len = record_len(params.len());
        if len > RECORD_CAPACITY || params.len() > usize::from(u16::MAX) {
            return Err(SettingsError::BlockTooLarge(id));
        }
        let mut buf = [0u8; RECORD_CAPACITY];
        buf[..COUNT_LEN].copy_from_slice(&(params.len() as u16).to_le_bytes());
        for (chunk, value) in buf[COUNT_LEN..len].chunks_exact_mut(4).zip(params) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }

        let addr = self.block_address(id);
        self.store.store(addr, &buf[..len])?;
        self.update_block_size(id, len);
        Ok(())
    }

    /// Read a counted `f32` record into `params`
    ///
    /// `params` holds the defaults on entry. If the stored count differs from
    /// `params.len()` the defaults are saved and left in place.
    pub fn load_params(&mut self, id: BlockId, params: &mut [f32]) -> Result<LoadOutcome, SettingsError> {
        let len = record_len(params.len());
        if len > RECORD_CAPACITY {
            return Err(SettingsError::BlockTooLarge(id));
        }
        let addr = self.block_address(id);

        let mut count = [0u8; COUNT_LEN];
        self.store.load(addr, &mut count)?;
        let count = u16::from_le_bytes(count);
        if usize::from(count) != params.len() {
            warn!(
                "Block {:?} holds {} parameters, expected {}; restoring defaults",
                id,
                count,
                params.len()
            );
            self.save_params(id, params)?;
            return Ok(LoadOutcome::Defaulted);
        }

        let mut buf = [0u8; RECORD_CAPACITY];
        self.store.load(addr + COUNT_LEN, &mut buf[..len - COUNT_LEN])?;
        for (value, chunk) in params.iter_mut().zip(buf.chunks_exact(4)) {
            *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        self.update_block_size(id, len);
        debug!("Loaded {} parameters from block {:?}", count, id);
        Ok(LoadOutcome::Loaded)
    }

    pub fn save_sensor_params(&mut self, params: &[SensorParams; SensorId::COUNT]) -> Result<(), SettingsError> {
        self.save_params(BlockId::Sensors, &flatten_sensor_params(params))
    }

    pub fn load_sensor_params(
        &mut self,
        params: &mut [SensorParams; SensorId::COUNT],
    ) -> Result<LoadOutcome, SettingsError> {
        let mut flat = flatten_sensor_params(params);
        let outcome = self.load_params(BlockId::Sensors, &mut flat)?;
        for (p, chunk) in params
            .iter_mut()
            .zip(flat.chunks_exact(SensorParams::PARAM_COUNT))
        {
            *p = SensorParams::from_params([chunk[0], chunk[1]]);
        }
        Ok(outcome)
    }

    pub fn save_gains(&mut self, gains: &PidGains) -> Result<(), SettingsError> {
        self.save_params(BlockId::Charger, &gains.to_params())
    }

    pub fn load_gains(&mut self, gains: &mut PidGains) -> Result<LoadOutcome, SettingsError> {
        let mut params = gains.to_params();
        let outcome = self.load_params(BlockId::Charger, &mut params)?;
        *gains = PidGains::from_params(params);
        Ok(outcome)
    }

    pub fn save_regulator(&mut self, config: &RegulatorConfig) -> Result<(), SettingsError> {
        let mut buf = [0u8; COUNT_LEN + REGULATOR_CAPACITY];
        let used = postcard::to_slice(config, &mut buf[COUNT_LEN..])
            .map_err(|_| SettingsError::Encode(BlockId::Regulator))?
            .len();
        buf[..COUNT_LEN].copy_from_slice(&(used as u16).to_le_bytes());

        let addr = self.block_address(BlockId::Regulator);
        self.store.store(addr, &buf[..COUNT_LEN + used])?;
        self.update_block_size(BlockId::Regulator, COUNT_LEN + used);
        Ok(())
    }

    /// Read the regulator block into `config`, which holds the defaults on entry
    pub fn load_regulator(&mut self, config: &mut RegulatorConfig) -> Result<LoadOutcome, SettingsError> {
        let addr = self.block_address(BlockId::Regulator);
        let mut len = [0u8; COUNT_LEN];
        self.store.load(addr, &mut len)?;
        let len = usize::from(u16::from_le_bytes(len));

        let mut buf = [0u8; REGULATOR_CAPACITY];
        let decoded = if len > 0 && len <= REGULATOR_CAPACITY {
            self.store.load(addr + COUNT_LEN, &mut buf[..len])?;
            postcard::from_bytes::<RegulatorConfig>(&buf[..len])
                .ok()
                .filter(|c| c.validate().is_ok())
        } else {
            None
        };

        match decoded {
            Some(stored) => {
                *config = stored;
                self.update_block_size(BlockId::Regulator, COUNT_LEN + len);
                Ok(LoadOutcome::Loaded)
            }
            None => {
                warn!("Regulator block unreadable, restoring defaults");
                self.save_regulator(config)?;
                Ok(LoadOutcome::Defaulted)
            }
        }
    }
}

fn flatten_sensor_params(params: &[SensorParams; SensorId::COUNT]) -> [f32; SENSOR_PARAM_COUNT] {
    let mut flat = [0.0; SENSOR_PARAM_COUNT];
    for (chunk, p) in flat
        .chunks_exact_mut(SensorParams::PARAM_COUNT)
        .zip(params)
    {
        chunk.copy_from_slice(&p.to_params());
    }
    flat
}

/// In-RAM store for hosts and tests; starts erased to `0xFF`
pub struct MemoryStore<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> MemoryStore<N> {
    pub const fn new() -> Self {
        Self { bytes: [0xFF; N] }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn check(&self, addr: usize, len: usize) -> Result<(), SettingsError> {
        match addr.checked_add(len) {
            Some(end) if end <= N => Ok(()),
            _ => Err(SettingsError::OutOfRange {
                addr,
                len,
                capacity: N,
            }),
        }
    }
}

impl<const N: usize> Default for MemoryStore<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> SettingsStore for MemoryStore<N> {
    fn capacity(&self) -> usize {
        N
    }

    fn load(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), SettingsError> {
        self.check(addr, buf.len())?;
        buf.copy_from_slice(&self.bytes[addr..addr + buf.len()]);
        Ok(())
    }

    fn store(&mut self, addr: usize, bytes: &[u8]) -> Result<(), SettingsError> {
        self.check(addr, bytes.len())?;
        self.bytes[addr..addr + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}
