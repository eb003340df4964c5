//! Query and display CPU information

pub mod freq;
pub mod msr;
pub mod topology;

use futures_util::join;

use heim::{cpu::CpuFrequency, units::frequency::megahertz};

use slog::{info, warn, Logger};

/// Report on the host's CPU configuration
///
/// This is purely informative: the frequency monitor does not need any of
/// this information to run, so failures are logged and otherwise ignored.
///
pub async fn startup_report(log: &Logger) {
    let (logical_cpus, physical_cpus, global_cpu_freq) = join!(
        heim::cpu::logical_count(),
        heim::cpu::physical_count(),
        heim::cpu::frequency()
    );

    match (logical_cpus, physical_cpus) {
        (Ok(logical_cpus), Ok(physical_cpus)) => {
            info!(log, "Received CPU configuration information";
                  "logical CPU count" => logical_cpus,
                  "physical CPU count" => physical_cpus);
        }
        (logical_cpus, physical_cpus) => {
            warn!(log, "Some CPU configuration information is missing";
                  "logical CPU count" => ?logical_cpus.ok(),
                  "physical CPU count" => ?physical_cpus.ok().flatten());
        }
    }

    match global_cpu_freq {
        Ok(freq) => log_freq_range(log, &freq),
        Err(err) => warn!(log, "Failed to query the CPU frequency range";
                          "error" => %err),
    }
}

/// Log the frequency range advertised by the OS's frequency scaling driver
fn log_freq_range(log: &Logger, freq: &CpuFrequency) {
    if let (Some(min), Some(max)) = (freq.min(), freq.max()) {
        info!(log, "Found CPU frequency range";
              "min frequency (MHz)" => min.get::<megahertz>(),
              "max frequency (MHz)" => max.get::<megahertz>());
    } else {
        warn!(log, "Some CPU frequency range data is missing";
              "min frequency" => ?freq.min(),
              "max frequency" => ?freq.max());
    }
}
