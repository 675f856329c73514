//! Package → Node → Core → Thread structural model.
//!
//! A [`Package`] is built once from per-logical-CPU [`HardwareId`] records
//! supplied by an external enumeration step. Nodes and cores keep the order
//! in which their hardware ids were first seen, and threads are appended in
//! record order. Ownership is strictly downward; nothing holds a reference
//! back to its parent.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::affinity::Affinity;

/// CPU vendor as reported by CPUID leaf 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vendor {
    Intel,
    Amd,
    Unknown,
}

impl Vendor {
    pub fn from_vendor_string(s: &str) -> Self {
        match s.trim() {
            "GenuineIntel" => Self::Intel,
            "AuthenticAMD" | "HygonGenuine" => Self::Amd,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Intel => write!(f, "Intel"),
            Self::Amd => write!(f, "AMD"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Capability flags decided at detection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CpuFeatures {
    pub msr: bool,
    pub tsc: bool,
    pub invariant_tsc: bool,
}

impl CpuFeatures {
    /// Decode from CPUID leaf 1 EDX and leaf 0x8000_0007 EDX.
    pub fn from_cpuid(leaf1_edx: u32, leaf_8000_0007_edx: u32) -> Self {
        Self {
            tsc: leaf1_edx & (1 << 4) != 0,
            msr: leaf1_edx & (1 << 5) != 0,
            invariant_tsc: leaf_8000_0007_edx & (1 << 8) != 0,
        }
    }

    /// Decode from a `/proc/cpuinfo`-style flag list.
    pub fn from_flags<'a>(flags: impl IntoIterator<Item = &'a str>) -> Self {
        let mut features = Self::default();
        let mut constant = false;
        let mut nonstop = false;
        for flag in flags {
            match flag {
                "msr" => features.msr = true,
                "tsc" => features.tsc = true,
                "constant_tsc" => constant = true,
                "nonstop_tsc" => nonstop = true,
                _ => {}
            }
        }
        features.invariant_tsc = constant && nonstop;
        features
    }
}

/// One raw CPUID result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuidLeaf {
    pub leaf: u32,
    pub subleaf: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Identification record for one logical CPU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareId {
    pub vendor: Vendor,
    pub brand: String,
    pub family: u32,
    pub model: u32,
    pub stepping: u32,
    /// Socket/package type code (AMD: CPUID 0x8000_0001 EBX bits 31:28).
    pub package_type: u32,
    pub features: CpuFeatures,
    /// Physical package (socket) index.
    #[serde(default)]
    pub package_id: u32,
    pub apic_id: u32,
    pub node_id: u32,
    pub core_id: u32,
    pub affinity: Affinity,
    #[serde(default)]
    pub leaves: Vec<CpuidLeaf>,
}

impl HardwareId {
    /// Record for logical CPU `cpu` with everything but the ids defaulted.
    pub fn new(vendor: Vendor, family: u32, model: u32, cpu: usize) -> Self {
        Self {
            vendor,
            brand: String::new(),
            family,
            model,
            stepping: 0,
            package_type: 0,
            features: CpuFeatures {
                msr: true,
                tsc: true,
                invariant_tsc: true,
            },
            package_id: 0,
            apic_id: cpu as u32,
            node_id: 0,
            core_id: cpu as u32,
            affinity: Affinity::single(cpu),
            leaves: Vec::new(),
        }
    }

    pub fn with_ids(mut self, node_id: u32, core_id: u32) -> Self {
        self.node_id = node_id;
        self.core_id = core_id;
        self
    }

    pub fn with_package(mut self, package_id: u32) -> Self {
        self.package_id = package_id;
        self
    }

    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = brand.into();
        self
    }

    /// Attach raw CPUID results and re-derive what they decide: the AMD
    /// socket type (leaf 0x8000_0001 EBX bits 31:28) and, when both leaf 1
    /// and leaf 0x8000_0007 are present, the capability flags.
    pub fn with_leaves(mut self, leaves: Vec<CpuidLeaf>) -> Self {
        self.leaves = leaves;
        let ext = self.leaf(0x8000_0001, 0).copied();
        if let (Vendor::Amd, Some(ext)) = (self.vendor, ext) {
            self.package_type = ext.ebx >> 28;
        }
        let basic = self.leaf(1, 0).copied();
        let power = self.leaf(0x8000_0007, 0).copied();
        if let (Some(basic), Some(power)) = (basic, power) {
            self.features = CpuFeatures::from_cpuid(basic.edx, power.edx);
        }
        self
    }

    pub fn leaf(&self, leaf: u32, subleaf: u32) -> Option<&CpuidLeaf> {
        self.leaves
            .iter()
            .find(|l| l.leaf == leaf && l.subleaf == subleaf)
    }
}

/// One logical CPU.
#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    id: HardwareId,
}

impl Thread {
    pub fn affinity(&self) -> Affinity {
        self.id.affinity
    }

    pub fn hardware_id(&self) -> &HardwareId {
        &self.id
    }
}

/// Last values sampled for a core. `None` until the first good read.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CoreReadings {
    pub multiplier: Option<f64>,
    pub clock_mhz: Option<f64>,
    pub voltage: Option<f64>,
    pub temperature: Option<f64>,
    pub power: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Core {
    id: u32,
    threads: Vec<Thread>,
    pub readings: CoreReadings,
}

impl Core {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    /// The thread per-core registers are read on.
    pub fn first_thread(&self) -> Option<&Thread> {
        self.threads.first()
    }
}

/// A NUMA grouping of cores.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    id: u32,
    cores: Vec<Core>,
}

impl Node {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    pub fn cores_mut(&mut self) -> &mut [Core] {
        &mut self.cores
    }

    /// Highest cached core temperature in this node.
    pub fn max_temperature(&self) -> Option<f64> {
        self.cores
            .iter()
            .filter_map(|c| c.readings.temperature)
            .reduce(f64::max)
    }
}

/// One physical processor.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    id: u32,
    vendor: Vendor,
    brand: String,
    family: u32,
    model: u32,
    stepping: u32,
    package_type: u32,
    features: CpuFeatures,
    tsc_frequency_mhz: Option<f64>,
    nodes: Vec<Node>,
}

impl Package {
    /// Group detection records into nodes and cores.
    ///
    /// Identification fields are taken from the first record. Returns `None`
    /// for an empty record list.
    pub fn from_records(records: impl IntoIterator<Item = HardwareId>) -> Option<Self> {
        let mut records = records.into_iter().peekable();
        let first = records.peek()?.clone();

        let mut nodes: Vec<Node> = Vec::new();
        for record in records {
            let node_pos = match nodes.iter().position(|n| n.id == record.node_id) {
                Some(pos) => pos,
                None => {
                    nodes.push(Node {
                        id: record.node_id,
                        cores: Vec::new(),
                    });
                    nodes.len() - 1
                }
            };
            let node = &mut nodes[node_pos];
            let core_pos = match node.cores.iter().position(|c| c.id == record.core_id) {
                Some(pos) => pos,
                None => {
                    node.cores.push(Core {
                        id: record.core_id,
                        threads: Vec::new(),
                        readings: CoreReadings::default(),
                    });
                    node.cores.len() - 1
                }
            };
            node.cores[core_pos].threads.push(Thread { id: record });
        }

        Some(Self {
            id: first.package_id,
            vendor: first.vendor,
            brand: first.brand,
            family: first.family,
            model: first.model,
            stepping: first.stepping,
            package_type: first.package_type,
            features: first.features,
            tsc_frequency_mhz: None,
            nodes,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn brand(&self) -> &str {
        &self.brand
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn model(&self) -> u32 {
        self.model
    }

    pub fn stepping(&self) -> u32 {
        self.stepping
    }

    pub fn package_type(&self) -> u32 {
        self.package_type
    }

    pub fn features(&self) -> CpuFeatures {
        self.features
    }

    /// Calibrated TSC frequency in cycles per microsecond.
    pub fn tsc_frequency(&self) -> Option<f64> {
        self.tsc_frequency_mhz
    }

    pub(crate) fn set_tsc_frequency(&mut self, mhz: f64) {
        self.tsc_frequency_mhz = Some(mhz);
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    /// All cores in topology order.
    pub fn cores(&self) -> impl Iterator<Item = &Core> {
        self.nodes.iter().flat_map(|n| n.cores.iter())
    }

    pub fn cores_mut(&mut self) -> impl Iterator<Item = &mut Core> {
        self.nodes.iter_mut().flat_map(|n| n.cores.iter_mut())
    }

    pub fn core_count(&self) -> usize {
        self.nodes.iter().map(|n| n.cores.len()).sum()
    }

    pub fn thread_count(&self) -> usize {
        self.cores().map(|c| c.threads.len()).sum()
    }

    pub fn first_thread(&self) -> Option<&Thread> {
        self.cores().find_map(Core::first_thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(core_ids: &[u32], node_ids: &[u32]) -> Vec<HardwareId> {
        core_ids
            .iter()
            .zip(node_ids)
            .enumerate()
            .map(|(cpu, (&core, &node))| {
                HardwareId::new(Vendor::Amd, 0x17, 0x71, cpu).with_ids(node, core)
            })
            .collect()
    }

    #[test]
    fn groups_records_by_node_and_core() {
        let package = Package::from_records(records(&[2, 2, 5, 5, 7], &[0, 0, 0, 0, 1])).unwrap();

        assert_eq!(package.nodes().len(), 2);
        let node0 = &package.nodes()[0];
        assert_eq!(node0.id(), 0);
        assert_eq!(
            node0.cores().iter().map(Core::id).collect::<Vec<_>>(),
            vec![2, 5]
        );
        assert!(node0.cores().iter().all(|c| c.threads().len() == 2));

        let node1 = &package.nodes()[1];
        assert_eq!(node1.id(), 1);
        assert_eq!(node1.cores().len(), 1);
        assert_eq!(node1.cores()[0].id(), 7);
        assert_eq!(node1.cores()[0].threads().len(), 1);

        assert_eq!(package.core_count(), 3);
        assert_eq!(package.thread_count(), 5);
    }

    #[test]
    fn threads_keep_detection_order() {
        let package = Package::from_records(records(&[0, 1, 0, 1], &[0, 0, 0, 0])).unwrap();
        let core0 = &package.nodes()[0].cores()[0];
        let cpus: Vec<_> = core0
            .threads()
            .iter()
            .filter_map(|t| t.affinity().first_cpu())
            .collect();
        assert_eq!(cpus, vec![0, 2]);
        assert_eq!(package.first_thread().unwrap().affinity(), Affinity::single(0));
    }

    #[test]
    fn non_contiguous_node_ids_keep_first_seen_order() {
        let package = Package::from_records(records(&[0, 8, 16], &[3, 1, 3])).unwrap();
        let ids: Vec<_> = package.nodes().iter().map(Node::id).collect();
        assert_eq!(ids, vec![3, 1]);
        assert_eq!(package.nodes()[0].cores().len(), 2);
    }

    #[test]
    fn empty_records_make_no_package() {
        assert!(Package::from_records(Vec::new()).is_none());
    }

    #[test]
    fn features_from_cpuid_bits() {
        let f = CpuFeatures::from_cpuid((1 << 4) | (1 << 5), 1 << 8);
        assert!(f.msr && f.tsc && f.invariant_tsc);
        let f = CpuFeatures::from_cpuid(1 << 4, 0);
        assert!(f.tsc && !f.msr && !f.invariant_tsc);
    }

    #[test]
    fn features_from_cpuinfo_flags() {
        let f = CpuFeatures::from_flags("fpu tsc msr constant_tsc nonstop_tsc".split(' '));
        assert!(f.msr && f.tsc && f.invariant_tsc);
        let f = CpuFeatures::from_flags(["tsc", "constant_tsc"]);
        assert!(!f.invariant_tsc);
    }

    #[test]
    fn vendor_strings() {
        assert_eq!(Vendor::from_vendor_string("GenuineIntel"), Vendor::Intel);
        assert_eq!(Vendor::from_vendor_string("AuthenticAMD\n"), Vendor::Amd);
        assert_eq!(Vendor::from_vendor_string("CentaurHauls"), Vendor::Unknown);
    }

    #[test]
    fn node_max_temperature_ignores_missing() {
        let mut package = Package::from_records(records(&[0, 1, 2], &[0, 0, 0])).unwrap();
        let cores = package.nodes_mut()[0].cores_mut();
        cores[0].readings.temperature = Some(41.0);
        cores[2].readings.temperature = Some(55.5);
        assert_eq!(package.nodes()[0].max_temperature(), Some(55.5));
    }

    #[test]
    fn package_id_comes_from_first_record() {
        let records = (0..2).map(|cpu| HardwareId::new(Vendor::Amd, 0x17, 0x31, cpu).with_package(1));
        let package = Package::from_records(records).unwrap();
        assert_eq!(package.id(), 1);
        assert_eq!(package.thread_count(), 2);
    }

    fn leaf(leaf: u32, ebx: u32, edx: u32) -> CpuidLeaf {
        CpuidLeaf {
            leaf,
            subleaf: 0,
            eax: 0,
            ebx,
            ecx: 0,
            edx,
        }
    }

    #[test]
    fn leaves_decide_socket_type_and_features() {
        let record = HardwareId::new(Vendor::Amd, 0x17, 0x31, 0).with_leaves(vec![
            leaf(1, 0, 1 << 4),
            leaf(0x8000_0001, 4 << 28, 0),
            leaf(0x8000_0007, 0, 1 << 8),
        ]);
        assert_eq!(record.package_type, 4);
        assert_eq!(
            record.features,
            CpuFeatures {
                msr: false,
                tsc: true,
                invariant_tsc: true,
            }
        );
        assert_eq!(record.leaf(0x8000_0001, 0).map(|l| l.ebx), Some(4 << 28));
        assert!(record.leaf(0x8000_0001, 1).is_none());
    }

    #[test]
    fn partial_leaves_keep_existing_features() {
        let record = HardwareId::new(Vendor::Intel, 6, 0x9E, 0)
            .with_leaves(vec![leaf(1, 0, 0), leaf(0x8000_0001, 7 << 28, 0)]);
        // Intel records ignore the AMD socket field; leaf 0x8000_0007 missing.
        assert_eq!(record.package_type, 0);
        assert!(record.features.msr && record.features.invariant_tsc);
    }
}
