//! Error handling for the frequency monitor

use crate::CpuId;

use std::{fmt, io, path::PathBuf};

/// Result type used throughout the frequency monitor
pub type Result<T> = std::result::Result<T, Error>;

/// Something went wrong while setting up or running the frequency monitor
#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// An I/O operation on the host's topology or device files failed
    Io {
        /// What we were trying to do at the time
        context: String,

        /// Underlying I/O error
        source: io::Error,
    },

    /// A kernel CPU list (e.g. "0-3,8") could not be parsed
    CpuListParse(String),

    /// The frequency store was configured with zero slots
    InvalidCapacity,

    /// A configuration setting is out of its valid range
    InvalidConfig(String),

    /// The host can report more logical CPUs than the store can hold
    CapacityExceeded {
        /// Configured store capacity
        capacity: usize,

        /// Number of logical CPUs that the host can report
        required: usize,
    },

    /// A logical CPU id does not map into the store
    CpuOutOfRange {
        /// Offending logical CPU
        cpu: CpuId,

        /// Configured store capacity
        capacity: usize,
    },

    /// The formatted report did not fit in the report buffer
    ReportOverflow {
        /// Report buffer size in bytes
        limit: usize,

        /// Number of bytes that the report needed
        needed: usize,
    },

    /// The report endpoint could not be installed
    EndpointRegistration {
        /// Where we tried to install it
        path: PathBuf,

        /// Underlying I/O error
        source: io::Error,
    },
}

impl Error {
    /// Wrap an I/O error with a description of the failed operation
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io { context, source } => write!(f, "{}: {}", context, source),
            Error::CpuListParse(list) => write!(f, "failed to parse CPU list {:?}", list),
            Error::InvalidCapacity => write!(f, "frequency store capacity must be nonzero"),
            Error::InvalidConfig(what) => write!(f, "invalid configuration: {}", what),
            Error::CapacityExceeded { capacity, required } => write!(
                f,
                "host reports up to {} logical CPUs, but the frequency store \
                 only has {} slots",
                required, capacity
            ),
            Error::CpuOutOfRange { cpu, capacity } => write!(
                f,
                "logical CPU {} is out of the frequency store's range (0..{})",
                cpu, capacity
            ),
            Error::ReportOverflow { limit, needed } => write!(
                f,
                "report needs {} bytes, but the report buffer only holds {}",
                needed, limit
            ),
            Error::EndpointRegistration { path, .. } => {
                write!(f, "failed to install report endpoint at {}", path.display())
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } | Error::EndpointRegistration { source, .. } => Some(source),
            _ => None,
        }
    }
}
