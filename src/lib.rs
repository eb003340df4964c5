//! Per-core CPU frequency telemetry
//!
//! `freqmon` periodically samples the operating frequency of every physical
//! CPU core, keeps track of the current, highest and lowest frequency seen on
//! each core, and publishes the result as a plain text report:
//!
//! ```text
//! CPU 0 Frequency: 2500 MHz, Max: 3400 MHz, Min: 1200 MHz
//! CPU 2 Frequency: 1800 MHz, Max: 1800 MHz, Min: 1800 MHz
//! ```
//!
//! Only one hardware thread per physical core is sampled, since sibling
//! threads share a frequency domain.

pub mod config;
pub mod cpu;
pub mod error;
pub mod format;
pub mod monitor;
pub mod report;
pub mod server;
pub mod store;

/// Identifier of a logical CPU, as numbered by the operating system
pub type CpuId = usize;

pub use crate::{
    config::{Config, Options},
    cpu::{
        freq::{FrequencyDecoder, RatioDecoder, Sampler},
        msr::{MsrDevice, RegisterReader},
        topology::{CoreId, SysfsTopology, Topology},
    },
    error::{Error, Result},
    monitor::{DriverState, Refresher, Service},
    report::{Report, ReportEndpoint},
    server::SocketServer,
    store::{FrequencyRecord, FrequencyStore},
};
