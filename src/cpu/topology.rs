//! Map logical CPUs to physical cores and pick one thread per core

use crate::{
    error::{Error, Result},
    CpuId,
};

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

/// Identifier of a physical core
///
/// Linux only guarantees `core_id` to be unique within a physical package, so
/// the package id is part of the identifier. Otherwise, core 0 of socket 1
/// would be mistaken for a sibling of core 0 of socket 0.
///
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CoreId {
    /// Physical package (socket) that the core belongs to
    pub package: u32,

    /// Core number within that package
    pub core: u32,
}

impl CoreId {
    /// Core of a single-package system
    pub fn new(core: u32) -> Self {
        Self { package: 0, core }
    }
}

/// Representative logical CPU of each physical core
pub type Representatives = BTreeMap<CoreId, CpuId>;

/// Source of CPU topology information
pub trait Topology {
    /// Currently online logical CPUs, in ascending order
    fn online_cpus(&self) -> Result<Vec<CpuId>>;

    /// Physical core that a logical CPU belongs to
    fn core_id_of(&self, cpu: CpuId) -> Result<CoreId>;

    /// Number of logical CPU ids that the host may ever bring online
    fn possible_cpu_count(&self) -> Result<usize>;
}

/// Pick the lowest-numbered online logical CPU of each physical core
///
/// `online` must be sorted in ascending order, which is what
/// `Topology::online_cpus()` provides. The first CPU that is seen for a given
/// core becomes its representative, later siblings are skipped. Cores with no
/// online thread do not appear in the output.
///
pub fn resolve_representatives(
    online: &[CpuId],
    mut core_id_of: impl FnMut(CpuId) -> Result<CoreId>,
) -> Result<Representatives> {
    debug_assert!(online.windows(2).all(|w| w[0] < w[1]));
    let mut representatives = Representatives::new();
    for &cpu in online {
        representatives.entry(core_id_of(cpu)?).or_insert(cpu);
    }
    Ok(representatives)
}

/// Ask a `Topology` for this cycle's representative CPUs
pub fn representatives<T: Topology + ?Sized>(topology: &T) -> Result<Representatives> {
    let online = topology.online_cpus()?;
    resolve_representatives(&online, |cpu| topology.core_id_of(cpu))
}

/// Parse a kernel CPU list such as "0-3,8,10-11"
pub fn parse_cpu_list(list: &str) -> Result<Vec<CpuId>> {
    let list = list.trim().trim_end_matches('\0');
    if list.is_empty() {
        return Ok(Vec::new());
    }

    let bad_list = || Error::CpuListParse(list.to_owned());
    let parse_id = |id: &str| id.trim().parse::<CpuId>().map_err(|_| bad_list());
    let mut cpus = Vec::new();
    for group in list.split(',') {
        let (first, last) = match group.split_once('-') {
            Some((first, last)) => (parse_id(first)?, parse_id(last)?),
            None => {
                let cpu = parse_id(group)?;
                (cpu, cpu)
            }
        };
        if first > last {
            return Err(bad_list());
        }
        cpus.extend(first..=last);
    }
    Ok(cpus)
}

/// CPU topology as exposed by Linux sysfs
pub struct SysfsTopology {
    /// Path to `devices/system/cpu` within the sysfs mount
    cpu_dir: PathBuf,
}

impl SysfsTopology {
    /// Use the sysfs tree mounted at `sysfs_root` (usually "/sys")
    pub fn new(sysfs_root: impl AsRef<Path>) -> Self {
        Self {
            cpu_dir: sysfs_root.as_ref().join("devices/system/cpu"),
        }
    }

    fn read(&self, relative_path: &str) -> io::Result<String> {
        fs::read_to_string(self.cpu_dir.join(relative_path))
    }

    fn read_cpu_list(&self, name: &str) -> Result<Vec<CpuId>> {
        let contents = self
            .read(name)
            .map_err(|e| Error::io(format!("failed to read {} CPU list", name), e))?;
        parse_cpu_list(&contents)
    }

    fn read_topology_id(&self, cpu: CpuId, name: &str) -> io::Result<u32> {
        let contents = self.read(&format!("cpu{}/topology/{}", cpu, name))?;
        contents
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Topology for SysfsTopology {
    fn online_cpus(&self) -> Result<Vec<CpuId>> {
        let mut cpus = self.read_cpu_list("online")?;
        cpus.sort_unstable();
        cpus.dedup();
        Ok(cpus)
    }

    fn core_id_of(&self, cpu: CpuId) -> Result<CoreId> {
        let core = self
            .read_topology_id(cpu, "core_id")
            .map_err(|e| Error::io(format!("failed to read core id of CPU {}", cpu), e))?;
        // Some virtual machines and architectures do not report packages
        let package = match self.read_topology_id(cpu, "physical_package_id") {
            Ok(package) => package,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(Error::io(
                    format!("failed to read package id of CPU {}", cpu),
                    e,
                ))
            }
        };
        Ok(CoreId { package, core })
    }

    fn possible_cpu_count(&self) -> Result<usize> {
        let possible = self.read_cpu_list("possible")?;
        Ok(possible.iter().max().map_or(0, |&max| max + 1))
    }
}
