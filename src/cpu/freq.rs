//! Query CPU frequency information

use super::{msr::RegisterReader, topology::Representatives};

use crate::{store::FrequencyStore, CpuId};

use slog::{debug, o, warn, Logger};

use std::io;

/// Conversion from a raw register value to a frequency in MHz
///
/// The encoding of frequency-related registers varies from one CPU family to
/// another, so this is kept pluggable.
///
pub trait FrequencyDecoder {
    /// Derive a frequency in MHz from a raw register value
    fn decode(&self, raw: u64) -> u32;
}

/// Frequency encoded as a ratio field multiplied by a bus clock
///
/// The default configuration extracts bits 8-15 of IA32_PERF_STATUS and
/// multiplies them by a 100 MHz bus clock. That is only a coarse
/// approximation on most modern CPUs.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RatioDecoder {
    /// Position of the least significant bit of the ratio field
    pub shift: u32,

    /// Mask applied to the ratio field after shifting
    pub mask: u64,

    /// Frequency of one ratio unit, in MHz
    pub bus_mhz: u32,
}

impl Default for RatioDecoder {
    fn default() -> Self {
        Self {
            shift: 8,
            mask: 0xff,
            bus_mhz: 100,
        }
    }
}

impl FrequencyDecoder for RatioDecoder {
    fn decode(&self, raw: u64) -> u32 {
        let ratio = raw.checked_shr(self.shift).unwrap_or(0) & self.mask;
        (ratio as u32).saturating_mul(self.bus_mhz)
    }
}

/// Outcome of a sampling pass
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SampleSummary {
    /// Number of representative CPUs whose record was updated
    pub sampled: usize,

    /// Number of representative CPUs that could not be sampled
    pub failed: usize,
}

/// Frequency sampling mechanism
pub struct Sampler {
    /// Hardware register access
    reader: Box<dyn RegisterReader + Send>,

    /// Register value interpretation
    decoder: Box<dyn FrequencyDecoder + Send>,
}

impl Sampler {
    /// Set up frequency sampling
    pub fn new(
        reader: impl RegisterReader + Send + 'static,
        decoder: impl FrequencyDecoder + Send + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            decoder: Box::new(decoder),
        }
    }

    /// Read the frequency of one logical CPU
    pub fn read_mhz(&self, cpu: CpuId) -> io::Result<u32> {
        self.reader
            .read_register(cpu)
            .map(|raw| self.decoder.decode(raw))
    }

    /// Sample the frequency of each representative CPU into the store
    ///
    /// A CPU that cannot be sampled keeps its previous record, and does not
    /// prevent the other CPUs from being sampled.
    ///
    pub fn sample(
        &self,
        log: &Logger,
        representatives: &Representatives,
        store: &mut FrequencyStore,
    ) -> SampleSummary {
        let mut summary = SampleSummary::default();
        for (core, &cpu) in representatives {
            let cpu_log = log.new(o!("cpu" => cpu, "package" => core.package, "core" => core.core));
            let mhz = match self.read_mhz(cpu) {
                Ok(mhz) => mhz,
                Err(err) => {
                    warn!(cpu_log, "Failed to read CPU frequency register";
                          "error" => %err);
                    summary.failed += 1;
                    continue;
                }
            };
            match store.update(cpu, mhz) {
                Ok(record) => {
                    debug!(cpu_log, "Sampled CPU frequency";
                           "current (MHz)" => record.current,
                           "max (MHz)" => record.maximum,
                           "min (MHz)" => record.minimum);
                    summary.sampled += 1;
                }
                Err(err) => {
                    warn!(cpu_log, "Dropped CPU frequency sample"; "error" => %err);
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}
