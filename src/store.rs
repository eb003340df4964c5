//! Per-CPU frequency records

use crate::{
    error::{Error, Result},
    CpuId,
};

/// What we know about the frequency of a logical CPU slot, in MHz
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FrequencyRecord {
    /// Last sampled frequency (0 if never sampled)
    pub current: u32,

    /// Highest frequency ever sampled
    pub maximum: u32,

    /// Lowest nonzero frequency ever sampled (0 if not set yet)
    pub minimum: u32,
}

impl FrequencyRecord {
    /// Account for a new frequency sample
    pub fn observe(&mut self, mhz: u32) {
        self.current = mhz;
        self.maximum = self.maximum.max(mhz);
        if self.minimum == 0 || mhz < self.minimum {
            self.minimum = mhz;
        }
    }

    /// Truth that `minimum <= current <= maximum`, or that no minimum was set
    pub fn is_consistent(&self) -> bool {
        self.minimum == 0 || (self.minimum <= self.current && self.current <= self.maximum)
    }
}

/// Fixed-capacity arena of frequency records, indexed by logical CPU id
///
/// All slots are allocated and zeroed upfront. The store never grows, so the
/// capacity must be picked so that it exceeds the largest logical CPU id that
/// the host can ever report.
///
pub struct FrequencyStore {
    // INVARIANT: Never resized after construction
    records: Box<[FrequencyRecord]>,
}

impl FrequencyStore {
    /// Allocate a store with `capacity` zeroed slots
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidCapacity);
        }
        Ok(Self {
            records: vec![FrequencyRecord::default(); capacity].into_boxed_slice(),
        })
    }

    /// Number of logical CPU slots
    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Record for a logical CPU, if it is within capacity
    pub fn get(&self, cpu: CpuId) -> Option<&FrequencyRecord> {
        self.records.get(cpu)
    }

    /// Feed a new frequency sample to a logical CPU's record
    pub fn update(&mut self, cpu: CpuId, mhz: u32) -> Result<&FrequencyRecord> {
        let capacity = self.capacity();
        let record = self
            .records
            .get_mut(cpu)
            .ok_or(Error::CpuOutOfRange { cpu, capacity })?;
        record.observe(mhz);
        Ok(record)
    }

    /// Iterate over all slots, in logical CPU order
    pub fn iter(&self) -> impl Iterator<Item = (CpuId, &FrequencyRecord)> + '_ {
        self.records.iter().enumerate()
    }
}
