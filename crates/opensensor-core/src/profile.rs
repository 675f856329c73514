//! Per-family register tables and decode strategies.
//!
//! Hardware families differ only in data: which MSRs hold what, where the
//! SMU mailbox lives, how raw fields scale. A [`FamilyProfile`] is looked up
//! once from (vendor, family, model) and then consumed by the one generic
//! [`Processor`](crate::processor::Processor).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bus::SmnPort;
use crate::driver::{MsrValue, PciAddress};
use crate::mailbox::{PmTableCommands, SmuAddresses, SmuLayout};
use crate::topology::{Package, Vendor};

// ---------------------------------------------------------------------------
// Register addresses
// ---------------------------------------------------------------------------

pub mod intel {
    pub const IA32_PERF_STATUS: u32 = 0x198;
    pub const IA32_THERM_STATUS: u32 = 0x19C;
    pub const MSR_TEMPERATURE_TARGET: u32 = 0x1A2;
    pub const IA32_PACKAGE_THERM_STATUS: u32 = 0x1B1;
    pub const MSR_PLATFORM_INFO: u32 = 0xCE;
    pub const MSR_RAPL_POWER_UNIT: u32 = 0x606;
    pub const MSR_PKG_ENERGY_STATUS: u32 = 0x611;
    pub const MSR_PP0_ENERGY_STATUS: u32 = 0x639;
    pub const MSR_PP1_ENERGY_STATUS: u32 = 0x641;
    pub const MSR_DRAM_ENERGY_STATUS: u32 = 0x619;

    /// TjMax assumed when `MSR_TEMPERATURE_TARGET` is unreadable or zero.
    pub const DEFAULT_TJ_MAX: f64 = 100.0;
}

pub mod amd {
    pub const P_STATE_STATUS: u32 = 0xC001_0293;
    pub const PWR_UNIT: u32 = 0xC001_0299;
    pub const CORE_ENERGY_STAT: u32 = 0xC001_029A;
    pub const PKG_ENERGY_STAT: u32 = 0xC001_029B;

    pub const THM_TCON_CUR_TMP: u32 = 0x0005_9800;
    pub const CCD_TEMP_ZEN2: u32 = 0x0005_9954;
    pub const CCD_TEMP_ZEN4: u32 = 0x0005_9B08;

    pub const BUS_CLOCK_MHZ: f64 = 100.0;
}

/// Host bridge index/data pair used for thermal SMN reads.
pub const THERMAL_SMN_PORT: SmnPort = SmnPort {
    device: PciAddress::HOST_BRIDGE,
    index_register: 0x60,
    data_register: 0x64,
};

/// Host bridge index/data pair used for SMU mailbox traffic.
pub const SMU_SMN_PORT: SmnPort = SmnPort {
    device: PciAddress::HOST_BRIDGE,
    index_register: 0xC4,
    data_register: 0xC8,
};

// ---------------------------------------------------------------------------
// Code names
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeName {
    // Zen / Zen+
    SummitRidge,
    Whitehaven,
    Naples,
    PinnacleRidge,
    Colfax,
    RavenRidge,
    Picasso,
    Dali,
    // Zen 2
    Matisse,
    CastlePeak,
    Rome,
    Renoir,
    Lucienne,
    // Zen 3
    Vermeer,
    Chagall,
    Milan,
    Cezanne,
    Rembrandt,
    // Zen 4 / Zen 5
    Raphael,
    GraniteRidge,
    /// Intel family 6 with the Nehalem-era thermal/perf MSR layout.
    IntelCore,
    Undefined,
}

/// AMD socket codes from CPUID 0x8000_0001 EBX[31:28].
const PKG_SP3: u32 = 0x4;
const PKG_SP3R2: u32 = 0x7;

impl CodeName {
    pub fn detect(vendor: Vendor, family: u32, model: u32, package_type: u32) -> Self {
        match vendor {
            Vendor::Intel if family == 0x06 && model >= 0x1A => Self::IntelCore,
            Vendor::Amd => Self::detect_amd(family, model, package_type),
            _ => Self::Undefined,
        }
    }

    fn detect_amd(family: u32, model: u32, package_type: u32) -> Self {
        match (family, model) {
            (0x17, 0x01) => match package_type {
                PKG_SP3 => Self::Naples,
                PKG_SP3R2 => Self::Whitehaven,
                _ => Self::SummitRidge,
            },
            (0x17, 0x08) if package_type == PKG_SP3R2 => Self::Colfax,
            (0x17, 0x08) => Self::PinnacleRidge,
            (0x17, 0x11) => Self::RavenRidge,
            (0x17, 0x18) => Self::Picasso,
            (0x17, 0x20) => Self::Dali,
            (0x17, 0x31) if package_type == PKG_SP3 => Self::Rome,
            (0x17, 0x31) => Self::CastlePeak,
            (0x17, 0x60) => Self::Renoir,
            (0x17, 0x68) => Self::Lucienne,
            (0x17, 0x71) => Self::Matisse,
            (0x19, 0x01) if package_type == PKG_SP3 => Self::Milan,
            (0x19, 0x01) | (0x19, 0x08) => Self::Chagall,
            (0x19, 0x21) => Self::Vermeer,
            (0x19, 0x44) => Self::Rembrandt,
            (0x19, 0x50) => Self::Cezanne,
            (0x19, 0x61) => Self::Raphael,
            (0x1A, 0x44) => Self::GraniteRidge,
            _ => Self::Undefined,
        }
    }

    pub fn is_zen(self) -> bool {
        !matches!(self, Self::IntelCore | Self::Undefined)
    }
}

impl fmt::Display for CodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// SMU address tables
// ---------------------------------------------------------------------------

const fn mailbox(command: u32, response: u32, args: u32) -> SmuAddresses {
    SmuAddresses {
        port: SMU_SMN_PORT,
        command,
        response,
        args,
        arg_stride: 4,
    }
}

const ZEN1_RSMU: SmuAddresses = mailbox(0x03B1_051C, 0x03B1_0568, 0x03B1_0590);
const ZEN2_RSMU: SmuAddresses = mailbox(0x03B1_0524, 0x03B1_0570, 0x03B1_0A40);
const APU_RSMU: SmuAddresses = mailbox(0x03B1_0A20, 0x03B1_0A80, 0x03B1_0A88);

const PM_DESKTOP: PmTableCommands = PmTableCommands {
    get_version: 0x08,
    transfer_to_dram: 0x05,
    get_dram_address: 0x06,
    table_selector: 0,
};

const PM_APU0: PmTableCommands = PmTableCommands {
    get_version: 0x0C,
    transfer_to_dram: 0x3D,
    get_dram_address: 0x0B,
    table_selector: 3,
};

const PM_APU1: PmTableCommands = PmTableCommands {
    get_version: 0x06,
    transfer_to_dram: 0x65,
    get_dram_address: 0x66,
    table_selector: 0,
};

const PM_ZEN4: PmTableCommands = PmTableCommands {
    get_version: 0x05,
    transfer_to_dram: 0x03,
    get_dram_address: 0x04,
    table_selector: 0,
};

/// SMU mailbox layout for `code_name`, or `None` where it is not known.
pub fn smu_layout(code_name: CodeName) -> Option<SmuLayout> {
    use CodeName::*;
    let (mailbox, pm_table) = match code_name {
        SummitRidge | PinnacleRidge | Whitehaven | Colfax | Naples => (ZEN1_RSMU, None),
        RavenRidge | Picasso | Dali => (APU_RSMU, Some(PM_APU0)),
        Renoir | Lucienne | Cezanne | Rembrandt => (APU_RSMU, Some(PM_APU1)),
        Matisse | Vermeer | CastlePeak | Chagall => (ZEN2_RSMU, Some(PM_DESKTOP)),
        Rome | Milan => (ZEN2_RSMU, None),
        Raphael | GraniteRidge => (ZEN2_RSMU, Some(PM_ZEN4)),
        IntelCore | Undefined => return None,
    };
    Some(SmuLayout { mailbox, pm_table })
}

// ---------------------------------------------------------------------------
// Family profiles
// ---------------------------------------------------------------------------

/// Where the bus (reference) clock comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BusClockSource {
    Fixed(f64),
    /// Calibrated TSC frequency divided by the maximum non-turbo ratio.
    TscRatio,
    /// The calibrated TSC frequency itself.
    Tsc,
}

/// Thermal layout of a Zen part.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZenThermal {
    /// Subtracted from Tctl to get Tdie.
    pub tctl_offset: f64,
    /// First CCD temperature register and number of CCD slots.
    pub ccd_base: Option<u32>,
    pub ccd_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Strategy {
    Intel,
    AmdZen(ZenThermal),
    /// Only the calibrated TSC is known.
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FamilyProfile {
    pub code_name: CodeName,
    pub strategy: Strategy,
    pub bus_clock: Option<BusClockSource>,
    pub smu: Option<SmuLayout>,
}

/// Tctl offsets keyed by brand string fragment.
const TCTL_OFFSETS: &[(&str, f64)] = &[
    ("AMD Ryzen 5 1600X", 20.0),
    ("AMD Ryzen 7 1700X", 20.0),
    ("AMD Ryzen 7 1800X", 20.0),
    ("AMD Ryzen 7 2700X", 10.0),
    ("AMD Ryzen Threadripper 19", 27.0),
    ("AMD Ryzen Threadripper 29", 27.0),
];

impl FamilyProfile {
    pub fn generic() -> Self {
        Self {
            code_name: CodeName::Undefined,
            strategy: Strategy::Generic,
            bus_clock: Some(BusClockSource::Tsc),
            smu: None,
        }
    }

    pub fn detect(package: &Package) -> Self {
        let code_name = CodeName::detect(
            package.vendor(),
            package.family(),
            package.model(),
            package.package_type(),
        );
        Self::for_code_name(code_name, package.brand())
    }

    pub fn for_code_name(code_name: CodeName, brand: &str) -> Self {
        match code_name {
            CodeName::IntelCore => Self {
                code_name,
                strategy: Strategy::Intel,
                bus_clock: Some(BusClockSource::TscRatio),
                smu: None,
            },
            CodeName::Undefined => Self::generic(),
            zen => Self {
                code_name: zen,
                strategy: Strategy::AmdZen(ZenThermal {
                    tctl_offset: tctl_offset(brand),
                    ccd_base: ccd_base(zen),
                    ccd_count: if ccd_base(zen).is_some() { 8 } else { 0 },
                }),
                bus_clock: Some(BusClockSource::Fixed(amd::BUS_CLOCK_MHZ)),
                smu: smu_layout(zen),
            },
        }
    }
}

fn tctl_offset(brand: &str) -> f64 {
    TCTL_OFFSETS
        .iter()
        .find(|(fragment, _)| brand.contains(fragment))
        .map_or(0.0, |&(_, offset)| offset)
}

fn ccd_base(code_name: CodeName) -> Option<u32> {
    use CodeName::*;
    match code_name {
        Matisse | CastlePeak | Rome | Vermeer | Chagall | Milan => Some(amd::CCD_TEMP_ZEN2),
        Raphael | GraniteRidge => Some(amd::CCD_TEMP_ZEN4),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Decoders
// ---------------------------------------------------------------------------

/// Plausible die temperatures in °C: above `MIN_TEMPERATURE`, at most
/// `MAX_TEMPERATURE`. Anything outside is a bad read, not a reading.
pub const MIN_TEMPERATURE: f64 = -40.0;
pub const MAX_TEMPERATURE: f64 = 150.0;

fn sane_temperature(t: f64) -> Option<f64> {
    (t > MIN_TEMPERATURE && t <= MAX_TEMPERATURE).then_some(t)
}

/// Current ratio from `IA32_PERF_STATUS` bits 15:8.
pub fn intel_multiplier(perf_status: MsrValue) -> Option<f64> {
    let ratio = perf_status.field(8, 8);
    (ratio != 0).then_some(ratio as f64)
}

/// Core voltage from `IA32_PERF_STATUS` bits 47:32 in units of 2^-13 V.
pub fn intel_voltage(perf_status: MsrValue) -> Option<f64> {
    let vid = perf_status.field(32, 16);
    (vid != 0).then(|| vid as f64 / 8192.0)
}

/// TjMax from `MSR_TEMPERATURE_TARGET` bits 23:16.
pub fn intel_tj_max(target: MsrValue) -> Option<f64> {
    let tj = target.field(16, 8);
    (tj != 0).then_some(tj as f64)
}

/// Temperature from a (package) thermal status register: TjMax minus the
/// digital readout, only when the reading-valid bit is set and the readout
/// does not exceed TjMax.
pub fn intel_temperature(tj_max: f64, therm_status: MsrValue) -> Option<f64> {
    if therm_status.field(31, 1) == 0 {
        return None;
    }
    let readout = therm_status.field(16, 7) as f64;
    if readout > tj_max {
        return None;
    }
    sane_temperature(tj_max - readout)
}

/// Maximum non-turbo ratio from `MSR_PLATFORM_INFO` bits 15:8.
pub fn intel_base_ratio(platform_info: MsrValue) -> Option<f64> {
    let ratio = platform_info.field(8, 8);
    (ratio != 0).then_some(ratio as f64)
}

/// Joules per energy-counter increment from a RAPL-style unit register
/// (energy status units in bits 12:8). Same layout on Intel and AMD.
pub fn energy_unit(power_unit: MsrValue) -> f64 {
    1.0 / (1u64 << power_unit.field(8, 5)) as f64
}

/// Core multiplier `2 * FID / DFS` from the Zen P-state status register.
pub fn zen_multiplier(p_state: MsrValue) -> Option<f64> {
    let fid = p_state.field(0, 8);
    let dfs = p_state.field(8, 6);
    (fid != 0 && dfs != 0).then(|| 2.0 * fid as f64 / dfs as f64)
}

/// SVI2 voltage `1.55 - 0.00625 * VID` from P-state status bits 21:14.
pub fn zen_voltage(p_state: MsrValue) -> Option<f64> {
    let vid = p_state.field(14, 8);
    let volts = 1.55 - 0.00625 * vid as f64;
    (volts > 0.0).then_some(volts)
}

/// Tctl from `THM_TCON_CUR_TMP`: bits 31:21 in eighths of a degree, shifted
/// down by 49 when the range-select bit 19 is set.
///
/// All-zero and all-ones reads (dead or absent device) give `None`, as does
/// anything outside the plausible temperature range.
pub fn zen_tctl(raw: u32) -> Option<f64> {
    if raw == 0 || raw == u32::MAX {
        return None;
    }
    let mut t = ((raw >> 21) & 0x7FF) as f64 / 8.0;
    if raw & (1 << 19) != 0 {
        t -= 49.0;
    }
    sane_temperature(t)
}

/// One CCD temperature register. `None` unless the valid bit 11 is set.
pub fn zen_ccd_temperature(raw: u32) -> Option<f64> {
    if raw == u32::MAX || raw & (1 << 11) == 0 {
        return None;
    }
    sane_temperature((raw & 0x7FF) as f64 / 8.0 - 49.0)
}
