//! Daemon configuration

use crate::{
    cpu::freq::RatioDecoder,
    error::{Error, Result},
    monitor::DEFAULT_INTERVAL,
};

use std::{num::ParseIntError, path::PathBuf, time::Duration};

use structopt::StructOpt;

/// Default frequency store capacity, matching the largest common NR_CPUS
pub const DEFAULT_MAX_CPUS: usize = 8192;

/// Command-line options of the frequency monitoring daemon
#[derive(Debug, StructOpt)]
#[structopt(about = "Per-core CPU frequency telemetry probe")]
pub struct Options {
    /// Delay between two refreshes of the frequency report, in milliseconds
    #[structopt(long, default_value = "1000")]
    pub interval_ms: u64,

    /// Number of logical CPU slots in the frequency store
    #[structopt(long, default_value = "8192")]
    pub max_cpus: usize,

    /// Unix socket on which the frequency report is served
    #[structopt(long, parse(from_os_str), default_value = "/run/freqmon.sock")]
    pub socket: PathBuf,

    /// Mount point of sysfs, used for CPU topology queries
    #[structopt(long, parse(from_os_str), default_value = "/sys")]
    pub sysfs_root: PathBuf,

    /// Mount point of devfs, used for MSR access
    #[structopt(long, parse(from_os_str), default_value = "/dev")]
    pub devfs_root: PathBuf,

    /// Position of the frequency ratio field within the register
    #[structopt(long, default_value = "8")]
    pub ratio_shift: u32,

    /// Mask of the frequency ratio field, after shifting
    #[structopt(long, default_value = "0xff", parse(try_from_str = parse_mask))]
    pub ratio_mask: u64,

    /// Frequency of one ratio unit, in MHz
    #[structopt(long, default_value = "100")]
    pub bus_mhz: u32,

    /// Log every refresh cycle
    #[structopt(short, long)]
    pub verbose: bool,
}

/// Parse a register mask, in decimal or 0x-prefixed hexadecimal
fn parse_mask(mask: &str) -> std::result::Result<u64, ParseIntError> {
    match mask.strip_prefix("0x").or_else(|| mask.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => mask.parse(),
    }
}

/// Validated daemon configuration
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Delay between two refreshes of the frequency report
    pub interval: Duration,

    /// Number of logical CPU slots in the frequency store
    pub max_cpus: usize,

    /// Unix socket on which the frequency report is served
    pub socket: PathBuf,

    /// Mount point of sysfs
    pub sysfs_root: PathBuf,

    /// Mount point of devfs
    pub devfs_root: PathBuf,

    /// Frequency register interpretation
    pub decoder: RatioDecoder,

    /// Truth that every refresh cycle should be logged
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_cpus: DEFAULT_MAX_CPUS,
            socket: PathBuf::from("/run/freqmon.sock"),
            sysfs_root: PathBuf::from("/sys"),
            devfs_root: PathBuf::from("/dev"),
            decoder: RatioDecoder::default(),
            verbose: false,
        }
    }
}

impl Options {
    /// Check the options and turn them into a configuration
    pub fn into_config(self) -> Result<Config> {
        if self.interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "refresh interval must be nonzero".to_owned(),
            ));
        }
        if self.max_cpus == 0 {
            return Err(Error::InvalidCapacity);
        }
        if self.ratio_shift >= u64::BITS {
            return Err(Error::InvalidConfig(format!(
                "ratio shift {} does not fit in a 64-bit register",
                self.ratio_shift
            )));
        }
        Ok(Config {
            interval: Duration::from_millis(self.interval_ms),
            max_cpus: self.max_cpus,
            socket: self.socket,
            sysfs_root: self.sysfs_root,
            devfs_root: self.devfs_root,
            decoder: RatioDecoder {
                shift: self.ratio_shift,
                mask: self.ratio_mask,
                bus_mhz: self.bus_mhz,
            },
            verbose: self.verbose,
        })
    }
}
