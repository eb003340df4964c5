//! Hardware register access

use crate::CpuId;

use std::{
    fs::File,
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

/// Address of the IA32_PERF_STATUS model-specific register
pub const IA32_PERF_STATUS: u64 = 0x198;

/// Mechanism for reading a 64-bit hardware register on a given logical CPU
pub trait RegisterReader {
    /// Read the register, as seen by logical CPU `cpu`
    fn read_register(&self, cpu: CpuId) -> io::Result<u64>;
}

impl<F> RegisterReader for F
where
    F: Fn(CpuId) -> io::Result<u64>,
{
    fn read_register(&self, cpu: CpuId) -> io::Result<u64> {
        self(cpu)
    }
}

/// Model-specific register access through the Linux `msr` driver
///
/// Each logical CPU gets a `/dev/cpu/<N>/msr` device node, where reading 8
/// bytes at offset X reads MSR X on that CPU. This requires the `msr` kernel
/// module to be loaded and, usually, root privileges.
///
pub struct MsrDevice {
    /// Path to the `cpu` directory of the device filesystem
    cpu_dev_dir: PathBuf,

    /// MSR to be read
    address: u64,
}

impl MsrDevice {
    /// Read MSR `address` through the device tree mounted at `devfs_root`
    pub fn new(devfs_root: impl AsRef<Path>, address: u64) -> Self {
        Self {
            cpu_dev_dir: devfs_root.as_ref().join("cpu"),
            address,
        }
    }

    /// Device node of a given logical CPU
    pub fn device_path(&self, cpu: CpuId) -> PathBuf {
        self.cpu_dev_dir.join(cpu.to_string()).join("msr")
    }
}

impl RegisterReader for MsrDevice {
    fn read_register(&self, cpu: CpuId) -> io::Result<u64> {
        let device = File::open(self.device_path(cpu))?;
        let mut bytes = [0; 8];
        device.read_exact_at(&mut bytes, self.address)?;
        Ok(u64::from_ne_bytes(bytes))
    }
}
