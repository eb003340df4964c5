//! Text rendering of the frequency store

use crate::{
    cpu::topology::Representatives,
    error::{Error, Result},
    store::{FrequencyRecord, FrequencyStore},
    CpuId,
};

use std::fmt::{self, Write};

/// Delay the display of something until we know what it should be displayed to
///
/// This allows us to support all of `write!`, `print!` and `format!` without
/// unnecessary memory allocations or error-handling boilerplate.
///
struct DelayedDisplay<DisplayFn: Fn(&mut fmt::Formatter<'_>) -> fmt::Result>(DisplayFn);

impl<DisplayFn> fmt::Display for DelayedDisplay<DisplayFn>
where
    DisplayFn: Fn(&mut fmt::Formatter<'_>) -> fmt::Result,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0(f)
    }
}

/// Display the report line of a logical CPU, including the line terminator
pub fn display_line(cpu: CpuId, record: &FrequencyRecord) -> impl fmt::Display {
    let record = *record;
    DelayedDisplay(move |dest| {
        writeln!(
            dest,
            "CPU {} Frequency: {} MHz, Max: {} MHz, Min: {} MHz",
            cpu, record.current, record.maximum, record.minimum
        )
    })
}

/// Longest report line that a store of the given capacity can produce
pub fn max_line_len(capacity: usize) -> usize {
    let widest = FrequencyRecord {
        current: u32::MAX,
        maximum: u32::MAX,
        minimum: u32::MAX,
    };
    display_line(capacity.saturating_sub(1), &widest)
        .to_string()
        .len()
}

/// Bounded-size renderer of the frequency report
pub struct ReportFormatter {
    /// Maximal report size in bytes
    limit: usize,
}

impl ReportFormatter {
    /// Set up a formatter which can render one line per slot of a store with
    /// the given capacity, with every field at its maximal width.
    pub fn new(capacity: usize) -> Self {
        Self::with_limit(capacity.saturating_mul(max_line_len(capacity)))
    }

    /// Set up a formatter with an explicit report size limit in bytes
    pub fn with_limit(limit: usize) -> Self {
        Self { limit }
    }

    /// Report size limit in bytes
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Render one line per representative CPU, in ascending CPU id order
    ///
    /// A representative without a slot in the store is rendered with zeroed
    /// readings. If the report would exceed the size limit, nothing is
    /// returned.
    ///
    pub fn format(
        &self,
        representatives: &Representatives,
        store: &FrequencyStore,
    ) -> Result<String> {
        let mut cpus = representatives.values().copied().collect::<Vec<_>>();
        cpus.sort_unstable();

        let mut report = String::with_capacity(self.limit.min(cpus.len() * 64));
        for cpu in cpus {
            let record = store.get(cpu).copied().unwrap_or_default();
            write!(report, "{}", display_line(cpu, &record))
                .expect("Writing to a String cannot fail");
        }

        if report.len() > self.limit {
            return Err(Error::ReportOverflow {
                limit: self.limit,
                needed: report.len(),
            });
        }
        Ok(report)
    }
}
