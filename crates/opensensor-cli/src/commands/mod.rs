pub mod calibrate;
pub mod poll;
pub mod scan;

use std::collections::BTreeMap;

use opensensor_core::{CpuFeatures, CpuidLeaf, EngineConfig, HardwareId, Package, Vendor};

/// Load the engine config, or defaults when no path is given.
/// Exits on an unreadable or malformed file.
pub fn load_config(path: Option<&str>) -> EngineConfig {
    match path {
        Some(p) => match EngineConfig::load(std::path::Path::new(p)) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        },
        None => EngineConfig::default(),
    }
}

/// Register access needs root on Linux; say so once instead of letting every
/// sensor silently go missing.
pub fn warn_if_unprivileged() {
    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions and cannot fail.
        let euid = unsafe { libc::geteuid() };
        if euid != 0 {
            eprintln!("Warning: not running as root; MSR, PCI and SMU reads will likely fail.");
            eprintln!("         Try: sudo modprobe msr && sudo opensensor ...");
            eprintln!();
        }
    }
}

// ---------------------------------------------------------------------------
// /proc/cpuinfo enumeration
// ---------------------------------------------------------------------------

/// Parse `/proc/cpuinfo` into one record per logical CPU.
///
/// `node_of` maps a logical CPU to its NUMA node.
pub fn parse_cpuinfo(text: &str, node_of: impl Fn(usize) -> u32) -> Vec<HardwareId> {
    let mut records = Vec::new();
    for block in text.split("\n\n") {
        let fields: BTreeMap<&str, &str> = block
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();
        let Some(cpu) = fields.get("processor").and_then(|v| v.parse::<usize>().ok()) else {
            continue;
        };
        let number = |key: &str| fields.get(key).and_then(|v| v.parse::<u32>().ok());

        let vendor = Vendor::from_vendor_string(fields.get("vendor_id").copied().unwrap_or(""));
        let mut record = HardwareId::new(
            vendor,
            number("cpu family").unwrap_or(0),
            number("model").unwrap_or(0),
            cpu,
        )
        .with_package(number("physical id").unwrap_or(0))
        .with_ids(node_of(cpu), number("core id").unwrap_or(cpu as u32))
        .with_brand(fields.get("model name").copied().unwrap_or(""));
        record.stepping = number("stepping").unwrap_or(0);
        record.apic_id = number("apicid").unwrap_or(cpu as u32);
        record.features =
            CpuFeatures::from_flags(fields.get("flags").copied().unwrap_or("").split_whitespace());
        records.push(record);
    }
    records
}

/// Group records into packages by physical id, in first-seen order.
pub fn group_packages(records: Vec<HardwareId>) -> Vec<Package> {
    let mut groups: Vec<(u32, Vec<HardwareId>)> = Vec::new();
    for record in records {
        match groups.iter_mut().find(|(id, _)| *id == record.package_id) {
            Some((_, group)) => group.push(record),
            None => groups.push((record.package_id, vec![record])),
        }
    }
    groups
        .into_iter()
        .filter_map(|(_, group)| Package::from_records(group))
        .collect()
}

/// NUMA node of `cpu` from `/sys/devices/system/cpu/cpuN/nodeM`.
#[cfg(target_os = "linux")]
fn sysfs_node(cpu: usize) -> u32 {
    let dir = format!("/sys/devices/system/cpu/cpu{cpu}");
    std::fs::read_dir(dir)
        .ok()
        .and_then(|entries| {
            entries.flatten().find_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|n| n.strip_prefix("node"))
                    .and_then(|n| n.parse().ok())
            })
        })
        .unwrap_or(0)
}

/// Attach CPUID leaves to every record. `read_on` runs once per package,
/// on that package's first logical CPU; `None` leaves the package's records
/// as parsed.
pub fn attach_leaves(
    records: Vec<HardwareId>,
    mut read_on: impl FnMut(usize) -> Option<Vec<CpuidLeaf>>,
) -> Vec<HardwareId> {
    let mut by_package: Vec<(u32, Option<Vec<CpuidLeaf>>)> = Vec::new();
    records
        .into_iter()
        .map(|record| {
            let pos = match by_package.iter().position(|(id, _)| *id == record.package_id) {
                Some(pos) => pos,
                None => {
                    let leaves = record.affinity.first_cpu().and_then(&mut read_on);
                    by_package.push((record.package_id, leaves));
                    by_package.len() - 1
                }
            };
            match &by_package[pos].1 {
                Some(leaves) => record.with_leaves(leaves.clone()),
                None => record,
            }
        })
        .collect()
}

/// CPUID leaves 1, 0x8000_0001 and 0x8000_0007 on the calling CPU.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn read_leaves() -> Vec<CpuidLeaf> {
    // SAFETY: CPUID is available on every x86_64 processor.
    #[allow(unused_unsafe)]
    let query = |leaf: u32| unsafe { core::arch::x86_64::__cpuid(leaf) };
    let max_extended = query(0x8000_0000).eax;
    [1, 0x8000_0001, 0x8000_0007]
        .into_iter()
        .filter(|&leaf| leaf < 0x8000_0000 || leaf <= max_extended)
        .map(|leaf| {
            let r = query(leaf);
            CpuidLeaf {
                leaf,
                subleaf: 0,
                eax: r.eax,
                ebx: r.ebx,
                ecx: r.ecx,
                edx: r.edx,
            }
        })
        .collect()
}

#[cfg(all(target_os = "linux", not(target_arch = "x86_64")))]
fn read_leaves() -> Vec<CpuidLeaf> {
    Vec::new()
}

/// Read the leaves bound to `cpu`, so each package reports its own socket.
#[cfg(target_os = "linux")]
fn pinned_leaves(cpu: usize) -> Option<Vec<CpuidLeaf>> {
    use opensensor_core::{Affinity, AffinityScope, OsAffinity};

    match AffinityScope::enter(&OsAffinity, Affinity::single(cpu)) {
        Ok(scope) => {
            let leaves = read_leaves();
            if let Err(e) = scope.exit() {
                log::warn!("{e}");
            }
            Some(leaves)
        }
        Err(e) => {
            log::warn!("cpu {cpu}: CPUID not read: {e}");
            None
        }
    }
}

/// Enumerate the packages of this machine.
#[cfg(target_os = "linux")]
pub fn detect_packages() -> std::io::Result<Vec<Package>> {
    let text = std::fs::read_to_string("/proc/cpuinfo")?;
    let records = attach_leaves(parse_cpuinfo(&text, sysfs_node), pinned_leaves);
    Ok(group_packages(records))
}

#[cfg(not(target_os = "linux"))]
pub fn detect_packages() -> std::io::Result<Vec<Package>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "CPU enumeration is only implemented for Linux",
    ))
}

/// Build one processor per detected package over the Linux driver.
#[cfg(target_os = "linux")]
pub fn make_processors(config: &EngineConfig) -> Vec<opensensor_core::Processor> {
    use std::sync::Arc;

    use opensensor_core::{LinuxDriver, OsAffinity, Processor, RegisterBus};

    let packages = match detect_packages() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error reading /proc/cpuinfo: {e}");
            std::process::exit(1);
        }
    };
    if !LinuxDriver::msr_available() {
        log::warn!("/dev/cpu/*/msr missing; load the msr module for per-core sensors");
    }

    let bus = Arc::new(RegisterBus::with_timeout(
        Arc::new(LinuxDriver::new()),
        config.bus_timeout(),
    ));
    let affinity = Arc::new(OsAffinity);
    packages
        .into_iter()
        .map(|package| Processor::new(package, bus.clone(), affinity.clone(), config.clone()))
        .collect()
}

#[cfg(not(target_os = "linux"))]
pub fn make_processors(_config: &EngineConfig) -> Vec<opensensor_core::Processor> {
    eprintln!("Error: register access is only implemented for Linux");
    std::process::exit(1);
}
