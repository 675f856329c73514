//! One package's refresh cycle.
//!
//! [`Processor`] owns a [`Package`] and the per-package state derived from it
//! at construction (TjMax per core, energy units and accumulators, bus clock,
//! mailbox client). Each [`Processor::update`] walks the topology:
//!
//! 1. for every core, bind to its first thread, read the family's MSRs,
//!    release the binding, and store derived clock/voltage/temperature/power
//! 2. read package-level MSRs the same way on the package's first thread
//! 3. read SMN thermal registers through the bus (no binding needed)
//! 4. refresh the SMU power-management table, if there is one
//! 5. aggregate and publish
//!
//! A failed read leaves the previous value in place. Nothing here returns an
//! error across the cycle boundary; the [`UpdateReport`] says what was skipped.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::affinity::{Affinity, AffinityController, AffinityScope};
use crate::bus::RegisterBus;
use crate::calibration::{CycleClock, FrequencyCalibrator, SystemClock};
use crate::config::{EngineConfig, PmTableLayout};
use crate::driver::MsrValue;
use crate::energy::EnergyAccumulator;
use crate::error::Result;
use crate::mailbox::{MailboxClient, SmuVersion};
use crate::profile::{
    self, BusClockSource, FamilyProfile, Strategy, THERMAL_SMN_PORT, ZenThermal, amd, intel,
};
use crate::sensor::{SensorKind, SensorSet, SensorSnapshot};
use crate::topology::{CoreReadings, Package, Thread, Vendor};

/// What happened to the SMU side of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxOutcome {
    /// No mailbox layout for this family.
    #[default]
    Unavailable,
    /// Mailbox present but no PM table (or no configured layout for it).
    NoTable,
    Refreshed,
    /// Transient failure; previous values kept.
    Failed,
}

/// Summary of one refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateReport {
    pub cores_read: usize,
    /// Cores whose thread could not be bound this cycle.
    pub cores_skipped: usize,
    /// Individual register reads that failed.
    pub register_failures: usize,
    pub mailbox: MailboxOutcome,
}

/// A package-level energy counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PowerDomain {
    Package,
    Cores,
    Graphics,
    Memory,
}

impl PowerDomain {
    fn name(self) -> &'static str {
        match self {
            Self::Package => "CPU Package",
            Self::Cores => "CPU Cores",
            Self::Graphics => "CPU Graphics",
            Self::Memory => "CPU Memory",
        }
    }
}

struct EnergyCounter {
    domain: PowerDomain,
    msr: u32,
    accumulator: EnergyAccumulator,
    power: Option<f64>,
}

enum PmTableState {
    Unsupported,
    Unresolved,
    Ready {
        address: u64,
        layout: PmTableLayout,
        values: Vec<Option<f64>>,
    },
}

#[derive(Default)]
struct PackageReadings {
    temperature: Option<f64>,
    tctl: Option<f64>,
    ccd: Vec<Option<f64>>,
}

/// Raw MSR values read for one core under its affinity scope.
#[derive(Default)]
struct CoreSample {
    perf: Option<MsrValue>,
    therm: Option<MsrValue>,
    energy: Option<(u32, Instant)>,
}

pub struct Processor {
    package: Package,
    profile: FamilyProfile,
    bus: Arc<RegisterBus>,
    affinity: Arc<dyn AffinityController>,
    config: EngineConfig,
    bus_clock_mhz: Option<f64>,
    /// Per core, topology order. Intel only.
    tj_max: Vec<f64>,
    /// Per core, topology order. AMD only.
    core_energy: Vec<EnergyAccumulator>,
    package_energy: Vec<EnergyCounter>,
    readings: PackageReadings,
    mailbox: Option<MailboxClient>,
    smu_version: Option<SmuVersion>,
    pm_table: PmTableState,
    sensors: SensorSet,
}

impl Processor {
    /// Detect the family profile and calibrate against the system clock.
    pub fn new(
        package: Package,
        bus: Arc<RegisterBus>,
        affinity: Arc<dyn AffinityController>,
        config: EngineConfig,
    ) -> Self {
        let profile = FamilyProfile::detect(&package);
        let clock = SystemClock::new();
        Self::with_parts(
            package,
            profile,
            bus,
            affinity,
            config,
            clock.as_ref().map(|c| c as &dyn CycleClock),
        )
    }

    pub fn with_parts(
        mut package: Package,
        profile: FamilyProfile,
        bus: Arc<RegisterBus>,
        affinity: Arc<dyn AffinityController>,
        config: EngineConfig,
        clock: Option<&dyn CycleClock>,
    ) -> Self {
        let first = package.first_thread().map(Thread::affinity);

        if package.features().tsc {
            if let Some(clock) = clock {
                let calibrator = FrequencyCalibrator::new(config.calibration.clone());
                let estimate = match first {
                    Some(target) => pinned(&*affinity, target, |_| calibrator.estimate(clock))
                        .unwrap_or_else(|e| {
                            log::debug!("calibrating unpinned: {e}");
                            calibrator.estimate(clock)
                        }),
                    None => calibrator.estimate(clock),
                };
                if let Some(estimate) = estimate {
                    package.set_tsc_frequency(estimate.frequency_mhz);
                }
            }
        } else {
            log::warn!("{}: no timestamp counter; clocks unavailable", package.brand());
        }

        let msr = package.features().msr;
        if !msr {
            log::warn!(
                "{}: no MSR support; per-core sensors unavailable",
                package.brand()
            );
        }

        let root = match package.vendor() {
            Vendor::Intel => "intelcpu",
            Vendor::Amd => "amdcpu",
            Vendor::Unknown => "cpu",
        };
        let prefix = format!("/{root}/{}", package.id());
        let sensors = SensorSet::new(prefix, config.renames.clone());

        let mut processor = Self {
            package,
            profile,
            bus,
            affinity,
            config,
            bus_clock_mhz: None,
            tj_max: Vec::new(),
            core_energy: Vec::new(),
            package_energy: Vec::new(),
            readings: PackageReadings::default(),
            mailbox: None,
            smu_version: None,
            pm_table: PmTableState::Unsupported,
            sensors,
        };

        if msr {
            processor.probe_msrs();
        }
        processor.bus_clock_mhz = processor.resolve_bus_clock();
        processor.open_mailbox();
        processor
    }

    // -----------------------------------------------------------------------
    // Construction-time probing
    // -----------------------------------------------------------------------

    fn probe_msrs(&mut self) {
        match self.profile.strategy {
            Strategy::Intel => {
                let mut tj_max = Vec::with_capacity(self.package.core_count());
                for core in self.package.cores() {
                    let tj = core
                        .first_thread()
                        .and_then(|t| {
                            pinned(&*self.affinity, t.affinity(), |scope| {
                                self.bus.read_msr(scope, intel::MSR_TEMPERATURE_TARGET)
                            })
                            .and_then(|r| r)
                            .ok()
                        })
                        .and_then(profile::intel_tj_max)
                        .unwrap_or(intel::DEFAULT_TJ_MAX);
                    tj_max.push(tj);
                }
                self.tj_max = tj_max;
                self.package_energy = self.probe_energy(
                    intel::MSR_RAPL_POWER_UNIT,
                    &[
                        (PowerDomain::Package, intel::MSR_PKG_ENERGY_STATUS),
                        (PowerDomain::Cores, intel::MSR_PP0_ENERGY_STATUS),
                        (PowerDomain::Graphics, intel::MSR_PP1_ENERGY_STATUS),
                        (PowerDomain::Memory, intel::MSR_DRAM_ENERGY_STATUS),
                    ],
                );
            }
            Strategy::AmdZen(_) => {
                self.package_energy = self.probe_energy(
                    amd::PWR_UNIT,
                    &[(PowerDomain::Package, amd::PKG_ENERGY_STAT)],
                );
                if let Some(unit) = self.package_energy.first().map(|c| c.accumulator.unit_joules()) {
                    self.core_energy = (0..self.package.core_count())
                        .map(|_| EnergyAccumulator::new(unit))
                        .collect();
                }
            }
            Strategy::Generic => {}
        }
    }

    /// Read the energy unit and keep the domains whose counters answer.
    fn probe_energy(&self, unit_msr: u32, domains: &[(PowerDomain, u32)]) -> Vec<EnergyCounter> {
        let Some(target) = self.package.first_thread().map(Thread::affinity) else {
            return Vec::new();
        };
        let probed = pinned(&*self.affinity, target, |scope| -> Result<_> {
            let unit = self.bus.read_msr(scope, unit_msr).map(profile::energy_unit)?;
            let present: Vec<_> = domains
                .iter()
                .filter(|(_, msr)| self.bus.read_msr(scope, *msr).is_ok())
                .copied()
                .collect();
            Ok((unit, present))
        });
        match probed.and_then(|r| r) {
            Ok((unit, present)) => present
                .into_iter()
                .map(|(domain, msr)| EnergyCounter {
                    domain,
                    msr,
                    accumulator: EnergyAccumulator::new(unit),
                    power: None,
                })
                .collect(),
            Err(e) => {
                log::warn!("energy counters unavailable: {e}");
                Vec::new()
            }
        }
    }

    fn resolve_bus_clock(&self) -> Option<f64> {
        let tsc = self.package.tsc_frequency();
        match self.profile.bus_clock? {
            BusClockSource::Fixed(mhz) => Some(mhz),
            BusClockSource::Tsc => tsc,
            BusClockSource::TscRatio => {
                let tsc = tsc?;
                if !self.package.features().msr {
                    return None;
                }
                let target = self.package.first_thread()?.affinity();
                let ratio = pinned(&*self.affinity, target, |scope| {
                    self.bus.read_msr(scope, intel::MSR_PLATFORM_INFO)
                })
                .and_then(|r| r)
                .map_err(|e| log::warn!("bus clock unavailable: {e}"))
                .ok()
                .and_then(profile::intel_base_ratio)?;
                Some(tsc / ratio)
            }
        }
    }

    fn open_mailbox(&mut self) {
        let Some(layout) = self.profile.smu else {
            if self.profile.code_name.is_zen() {
                log::warn!(
                    "no SMU mailbox layout for {}; SMU sensors unavailable",
                    self.profile.code_name
                );
            }
            return;
        };
        let client = MailboxClient::new(Arc::clone(&self.bus), layout, self.config.smu_retries);
        match client.version() {
            Ok(version) => {
                log::info!("SMU firmware {version}");
                self.smu_version = Some(version);
            }
            Err(e) => log::debug!("SMU version query failed: {e}"),
        }
        if layout.pm_table.is_some() {
            self.pm_table = PmTableState::Unresolved;
        }
        self.mailbox = Some(client);
    }

    // -----------------------------------------------------------------------
    // Refresh cycle
    // -----------------------------------------------------------------------

    /// Run one refresh cycle.
    pub fn update(&mut self) -> UpdateReport {
        let mut report = UpdateReport::default();
        if self.package.features().msr {
            self.update_cores(&mut report);
            self.update_package_msrs(&mut report);
        }
        if let Strategy::AmdZen(thermal) = self.profile.strategy {
            self.update_smn_thermal(thermal, &mut report);
        }
        report.mailbox = self.update_mailbox();
        self.publish();
        report
    }

    fn update_cores(&mut self, report: &mut UpdateReport) {
        let strategy = self.profile.strategy;
        if matches!(strategy, Strategy::Generic) {
            return;
        }
        let bus: &RegisterBus = &self.bus;
        let affinity: &dyn AffinityController = &*self.affinity;
        let bus_clock = self.bus_clock_mhz;
        let tj_max = &self.tj_max;
        let core_energy = &mut self.core_energy;

        for (index, core) in self.package.cores_mut().enumerate() {
            let Some(target) = core.first_thread().map(Thread::affinity) else {
                continue;
            };
            let mut failures = 0;
            let sample = pinned(affinity, target, |scope| {
                read_core(bus, strategy, scope, &mut failures)
            });
            report.register_failures += failures;
            let sample = match sample {
                Ok(sample) => sample,
                Err(e) => {
                    log::debug!("skipping core {}: {e}", core.id());
                    report.cores_skipped += 1;
                    continue;
                }
            };
            report.cores_read += 1;

            let readings = &mut core.readings;
            match strategy {
                Strategy::Intel => {
                    if let Some(perf) = sample.perf {
                        keep(&mut readings.multiplier, profile::intel_multiplier(perf));
                        keep(&mut readings.voltage, profile::intel_voltage(perf));
                    }
                    if let Some(therm) = sample.therm {
                        let tj = tj_max.get(index).copied().unwrap_or(intel::DEFAULT_TJ_MAX);
                        keep(
                            &mut readings.temperature,
                            profile::intel_temperature(tj, therm),
                        );
                    }
                }
                Strategy::AmdZen(_) => {
                    if let Some(perf) = sample.perf {
                        keep(&mut readings.multiplier, profile::zen_multiplier(perf));
                        keep(&mut readings.voltage, profile::zen_voltage(perf));
                    }
                    if let (Some((raw, at)), Some(acc)) = (sample.energy, core_energy.get_mut(index)) {
                        keep(&mut readings.power, acc.sample_at(raw, at));
                    }
                }
                Strategy::Generic => {}
            }
            if sample.perf.is_some() {
                update_clock(readings, bus_clock);
            }
        }
    }

    fn update_package_msrs(&mut self, report: &mut UpdateReport) {
        let Some(target) = self.package.first_thread().map(Thread::affinity) else {
            return;
        };
        let strategy = self.profile.strategy;
        let tj = self.tj_max.first().copied().unwrap_or(intel::DEFAULT_TJ_MAX);
        let bus: &RegisterBus = &self.bus;
        let package_energy = &mut self.package_energy;
        let readings = &mut self.readings;

        let mut failures = 0;
        let result = pinned(&*self.affinity, target, |scope| {
            if matches!(strategy, Strategy::Intel) {
                if let Some(therm) =
                    read_or_count(bus, scope, intel::IA32_PACKAGE_THERM_STATUS, &mut failures)
                {
                    keep(
                        &mut readings.temperature,
                        profile::intel_temperature(tj, therm),
                    );
                }
            }
            for counter in package_energy.iter_mut() {
                if let Some(raw) = read_or_count(bus, scope, counter.msr, &mut failures) {
                    let power = counter.accumulator.sample_at(raw.low, Instant::now());
                    keep(&mut counter.power, power);
                }
            }
        });
        report.register_failures += failures;
        if let Err(e) = result {
            log::debug!("skipping package registers: {e}");
        }
    }

    fn update_smn_thermal(&mut self, thermal: ZenThermal, report: &mut UpdateReport) {
        match self.bus.read_smn(THERMAL_SMN_PORT, amd::THM_TCON_CUR_TMP) {
            Ok(raw) => keep(&mut self.readings.tctl, profile::zen_tctl(raw)),
            Err(e) => {
                log::debug!("Tctl unavailable: {e}");
                report.register_failures += 1;
            }
        }

        let Some(base) = thermal.ccd_base else {
            return;
        };
        self.readings.ccd.resize(thermal.ccd_count as usize, None);
        for i in 0..thermal.ccd_count {
            match self.bus.read_smn(THERMAL_SMN_PORT, base + 4 * i) {
                Ok(raw) => keep(
                    &mut self.readings.ccd[i as usize],
                    profile::zen_ccd_temperature(raw),
                ),
                Err(e) => {
                    log::debug!("CCD{} temperature unavailable: {e}", i + 1);
                    report.register_failures += 1;
                }
            }
        }
    }

    fn update_mailbox(&mut self) -> MailboxOutcome {
        let Some(mailbox) = &self.mailbox else {
            return MailboxOutcome::Unavailable;
        };

        if let PmTableState::Unresolved = self.pm_table {
            match resolve_pm_table(mailbox, &self.config) {
                Ok(state) => self.pm_table = state,
                Err(e) => {
                    log::debug!("PM table not resolved this cycle: {e}");
                    return MailboxOutcome::Failed;
                }
            }
        }

        let PmTableState::Ready {
            address,
            layout,
            values,
        } = &mut self.pm_table
        else {
            return MailboxOutcome::NoTable;
        };

        match mailbox.read_pm_table(*address, layout.entries()) {
            Ok(table) => {
                for (slot, sensor) in values.iter_mut().zip(&layout.sensors) {
                    let value = table
                        .get(sensor.offset / 4)
                        .map(|&v| f64::from(v) * sensor.scale)
                        .filter(|v| v.is_finite());
                    keep(slot, value);
                }
                MailboxOutcome::Refreshed
            }
            Err(e) => {
                log::debug!("PM table refresh failed: {e}");
                MailboxOutcome::Failed
            }
        }
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    fn publish(&mut self) {
        let sensors = &mut self.sensors;
        let package = &self.package;
        let mut next = KindIndex::default();

        // Clocks
        if let Some(source) = self.profile.bus_clock {
            let name = match source {
                BusClockSource::Tsc => "Time Stamp Counter",
                _ => "Bus Speed",
            };
            sensors.publish(SensorKind::Clock, next.take(SensorKind::Clock), name, self.bus_clock_mhz);
        }
        for (i, core) in package.cores().enumerate() {
            let name = core_name(i);
            sensors.publish(SensorKind::Clock, next.take(SensorKind::Clock), &name, core.readings.clock_mhz);
        }
        sensors.publish(
            SensorKind::Clock,
            next.take(SensorKind::Clock),
            "Average Clock",
            average(package.cores().filter_map(|c| c.readings.clock_mhz)),
        );

        // Voltages
        for (i, core) in package.cores().enumerate() {
            let name = format!("{} VID", core_name(i));
            sensors.publish(SensorKind::Voltage, next.take(SensorKind::Voltage), &name, core.readings.voltage);
        }

        // Temperatures
        for (i, core) in package.cores().enumerate() {
            sensors.publish(
                SensorKind::Temperature,
                next.take(SensorKind::Temperature),
                &core_name(i),
                core.readings.temperature,
            );
        }
        sensors.publish(
            SensorKind::Temperature,
            next.take(SensorKind::Temperature),
            "CPU Package",
            self.readings.temperature,
        );
        let core_temps = || package.cores().filter_map(|c| c.readings.temperature);
        sensors.publish(
            SensorKind::Temperature,
            next.take(SensorKind::Temperature),
            "Core Max",
            core_temps().reduce(f64::max),
        );
        sensors.publish(
            SensorKind::Temperature,
            next.take(SensorKind::Temperature),
            "Core Average",
            average(core_temps()),
        );
        if package.nodes().len() > 1 {
            for node in package.nodes() {
                let name = format!("Node #{} Max", node.id());
                sensors.publish(
                    SensorKind::Temperature,
                    next.take(SensorKind::Temperature),
                    &name,
                    node.max_temperature(),
                );
            }
        }
        if let Strategy::AmdZen(thermal) = self.profile.strategy {
            let tctl = self.readings.tctl;
            if thermal.tctl_offset == 0.0 {
                sensors.publish(
                    SensorKind::Temperature,
                    next.take(SensorKind::Temperature),
                    "Core (Tctl/Tdie)",
                    tctl,
                );
            } else {
                sensors.publish(SensorKind::Temperature, next.take(SensorKind::Temperature), "Core (Tctl)", tctl);
                sensors.publish(
                    SensorKind::Temperature,
                    next.take(SensorKind::Temperature),
                    "Core (Tdie)",
                    tctl.map(|t| t - thermal.tctl_offset),
                );
            }
            for (i, ccd) in self.readings.ccd.iter().enumerate() {
                let name = format!("CCD{} (Tdie)", i + 1);
                sensors.publish(SensorKind::Temperature, next.take(SensorKind::Temperature), &name, *ccd);
            }
        }

        // Powers
        for counter in &self.package_energy {
            let name = match (self.profile.strategy, counter.domain) {
                (Strategy::AmdZen(_), PowerDomain::Package) => "Package",
                (_, domain) => domain.name(),
            };
            sensors.publish(SensorKind::Power, next.take(SensorKind::Power), name, counter.power);
        }
        for (i, core) in package.cores().enumerate() {
            sensors.publish(SensorKind::Power, next.take(SensorKind::Power), &core_name(i), core.readings.power);
        }

        // SMU table
        if let PmTableState::Ready { layout, values, .. } = &self.pm_table {
            for (sensor, value) in layout.sensors.iter().zip(values) {
                sensors.publish(sensor.kind, next.take(sensor.kind), &sensor.name, *value);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn package(&self) -> &Package {
        &self.package
    }

    pub fn profile(&self) -> &FamilyProfile {
        &self.profile
    }

    pub fn bus_clock(&self) -> Option<f64> {
        self.bus_clock_mhz
    }

    pub fn smu_version(&self) -> Option<SmuVersion> {
        self.smu_version
    }

    /// Whether an SMU mailbox was resolved for this package.
    pub fn mailbox_available(&self) -> bool {
        self.mailbox.is_some()
    }

    pub fn sensors(&self) -> &SensorSet {
        &self.sensors
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        SensorSnapshot {
            collected_unix_ms: crate::sensor::unix_ms_now(),
            package: self.package.brand().to_string(),
            vendor: self.package.vendor().to_string(),
            code_name: self.profile.code_name.to_string(),
            tsc_frequency_mhz: self.package.tsc_frequency(),
            smu_version: self.smu_version.map(|v| v.to_string()),
            sensors: self.sensors.iter().cloned().collect(),
        }
    }
}

/// Run `f` with the calling thread bound to `target`, restoring afterwards.
fn pinned<T>(
    affinity: &dyn AffinityController,
    target: Affinity,
    f: impl FnOnce(&AffinityScope<'_>) -> T,
) -> Result<T> {
    let scope = AffinityScope::enter(affinity, target)?;
    let out = f(&scope);
    if let Err(e) = scope.exit() {
        log::warn!("{e}");
    }
    Ok(out)
}

fn read_or_count(
    bus: &RegisterBus,
    scope: &AffinityScope<'_>,
    index: u32,
    failures: &mut usize,
) -> Option<MsrValue> {
    match bus.read_msr(scope, index) {
        Ok(v) => Some(v),
        Err(e) => {
            log::debug!("{e}");
            *failures += 1;
            None
        }
    }
}

fn read_core(
    bus: &RegisterBus,
    strategy: Strategy,
    scope: &AffinityScope<'_>,
    failures: &mut usize,
) -> CoreSample {
    match strategy {
        Strategy::Intel => CoreSample {
            perf: read_or_count(bus, scope, intel::IA32_PERF_STATUS, failures),
            therm: read_or_count(bus, scope, intel::IA32_THERM_STATUS, failures),
            energy: None,
        },
        Strategy::AmdZen(_) => CoreSample {
            perf: read_or_count(bus, scope, amd::P_STATE_STATUS, failures),
            therm: None,
            energy: read_or_count(bus, scope, amd::CORE_ENERGY_STAT, failures)
                .map(|v| (v.low, Instant::now())),
        },
        Strategy::Generic => CoreSample::default(),
    }
}

fn resolve_pm_table(mailbox: &MailboxClient, config: &EngineConfig) -> Result<PmTableState> {
    let version = mailbox.pm_table_version()?;
    let Some(layout) = config.pm_table_layout(version) else {
        log::warn!("no PM table layout configured for version 0x{version:06X}");
        return Ok(PmTableState::Unsupported);
    };
    let address = mailbox.pm_table_address()?;
    log::debug!("PM table v0x{version:06X} at 0x{address:X}");
    Ok(PmTableState::Ready {
        address,
        values: vec![None; layout.sensors.len()],
        layout: layout.clone(),
    })
}

fn update_clock(readings: &mut CoreReadings, bus_clock: Option<f64>) {
    if let (Some(multiplier), Some(bus)) = (readings.multiplier, bus_clock) {
        readings.clock_mhz = Some(multiplier * bus);
    }
}

/// Overwrite only with a fresh value; otherwise the stale one stays.
fn keep(slot: &mut Option<f64>, value: Option<f64>) {
    if let Some(v) = value.filter(|v| v.is_finite()) {
        *slot = Some(v);
    }
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn core_name(index: usize) -> String {
    format!("Core #{}", index + 1)
}

/// Per-kind running index, so every cycle assigns the same indices.
#[derive(Default)]
struct KindIndex {
    counts: Vec<(SensorKind, usize)>,
}

impl KindIndex {
    fn take(&mut self, kind: SensorKind) -> usize {
        match self.counts.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, n)) => {
                *n += 1;
                *n - 1
            }
            None => {
                self.counts.push((kind, 1));
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::SmuStatus;
    use crate::mock::{MockClock, MockMachine};
    use crate::profile::CodeName;
    use crate::topology::HardwareId;

    /// 1 node, `cores` cores with 2 threads each; core `i` owns CPUs 2i and 2i+1.
    fn records(vendor: Vendor, family: u32, model: u32, cores: usize) -> Vec<HardwareId> {
        (0..cores * 2)
            .map(|cpu| {
                HardwareId::new(vendor, family, model, cpu)
                    .with_ids(0, (cpu / 2) as u32)
                    .with_brand("Test CPU")
            })
            .collect()
    }

    fn zen_p_state(multiplier: u64) -> u64 {
        // DFS 8 makes FID = 4 * multiplier; VID 0x30 = 1.25 V.
        (0x30 << 14) | (8 << 8) | (4 * multiplier)
    }

    fn build(
        machine: &Arc<MockMachine>,
        package: Package,
        config: EngineConfig,
        clock: Option<&dyn CycleClock>,
    ) -> Processor {
        let profile = FamilyProfile::detect(&package);
        let bus = Arc::new(RegisterBus::with_timeout(machine.clone(), config.bus_timeout()));
        Processor::with_parts(package, profile, bus, machine.clone(), config, clock)
    }

    fn matisse(machine: &Arc<MockMachine>) -> Processor {
        let package = Package::from_records(records(Vendor::Amd, 0x17, 0x71, 2)).unwrap();
        machine.set_msr_all(amd::PWR_UNIT, 0x000A_1003);
        machine.set_msr_all(amd::PKG_ENERGY_STAT, 1000);
        machine.set_msr_all(amd::CORE_ENERGY_STAT, 1000);
        build(machine, package, EngineConfig::default(), None)
    }

    fn clocks(p: &Processor) -> Vec<Option<f64>> {
        p.package().cores().map(|c| c.readings.clock_mhz).collect()
    }

    #[test]
    fn zen_clock_is_multiplier_times_fixed_bus_clock() {
        let machine = Arc::new(MockMachine::new(4));
        let mut p = matisse(&machine);
        machine.set_msr(0, amd::P_STATE_STATUS, zen_p_state(36));
        machine.set_msr(2, amd::P_STATE_STATUS, zen_p_state(40));

        let report = p.update();
        assert_eq!(report.cores_read, 2);
        assert_eq!(report.cores_skipped, 0);
        assert_eq!(p.bus_clock(), Some(100.0));
        assert_eq!(clocks(&p), vec![Some(3600.0), Some(4000.0)]);

        let core = p.package().cores().next().unwrap();
        assert!((core.readings.voltage.unwrap() - 1.25).abs() < 1e-9);
        assert_eq!(
            p.sensors().find(SensorKind::Clock, "Core #2").unwrap().value,
            Some(4000.0)
        );
        assert_eq!(
            p.sensors().find(SensorKind::Clock, "Average Clock").unwrap().value,
            Some(3800.0)
        );
    }

    #[test]
    fn intel_clock_uses_calibrated_bus_clock() {
        let machine = Arc::new(MockMachine::new(4));
        let package = Package::from_records(records(Vendor::Intel, 0x06, 0x9E, 2)).unwrap();
        machine.set_msr_all(intel::MSR_PLATFORM_INFO, 30 << 8);
        machine.set_msr_all(intel::MSR_TEMPERATURE_TARGET, 100 << 16);
        machine.set_msr(0, intel::IA32_PERF_STATUS, 36 << 8);
        machine.set_msr(2, intel::IA32_PERF_STATUS, 42 << 8);
        machine.set_msr(0, intel::IA32_THERM_STATUS, (1 << 31) | (40 << 16));
        machine.set_msr(2, intel::IA32_THERM_STATUS, (1 << 31) | (30 << 16));

        let clock = MockClock::new(3.0e9, 100);
        let mut p = build(&machine, package, EngineConfig::default(), Some(&clock));
        let tsc = p.package().tsc_frequency().unwrap();
        assert!((tsc - 3000.0).abs() / 3000.0 < 0.01, "tsc {tsc}");

        p.update();
        let bus = p.bus_clock().unwrap();
        assert_eq!(bus, tsc / 30.0);
        assert_eq!(clocks(&p), vec![Some(36.0 * bus), Some(42.0 * bus)]);

        let temps: Vec<_> = p.package().cores().map(|c| c.readings.temperature).collect();
        assert_eq!(temps, vec![Some(60.0), Some(70.0)]);
        assert_eq!(
            p.sensors().find(SensorKind::Temperature, "Core Max").unwrap().value,
            Some(70.0)
        );
        assert_eq!(
            p.sensors().find(SensorKind::Temperature, "Core Average").unwrap().value,
            Some(65.0)
        );
    }

    #[test]
    fn offline_core_keeps_stale_values() {
        let machine = Arc::new(MockMachine::new(4));
        let mut p = matisse(&machine);
        machine.set_msr_all(amd::P_STATE_STATUS, zen_p_state(36));
        p.update();

        machine.set_offline(2, true);
        machine.set_msr_all(amd::P_STATE_STATUS, zen_p_state(20));
        let report = p.update();

        assert_eq!(report.cores_read, 1);
        assert_eq!(report.cores_skipped, 1);
        assert_eq!(clocks(&p), vec![Some(2000.0), Some(3600.0)]);
    }

    #[test]
    fn failed_register_keeps_stale_value() {
        let machine = Arc::new(MockMachine::new(4));
        let mut p = matisse(&machine);
        machine.set_msr_all(amd::P_STATE_STATUS, zen_p_state(36));
        p.update();

        machine.fail_msr(0, amd::P_STATE_STATUS);
        let report = p.update();
        assert_eq!(report.cores_read, 2);
        assert!(report.register_failures >= 1);
        assert_eq!(clocks(&p)[0], Some(3600.0));
    }

    #[test]
    fn affinity_is_restored_after_update() {
        let machine = Arc::new(MockMachine::new(4));
        let mut p = matisse(&machine);
        let before = machine.current().unwrap();
        machine.set_offline(2, true);
        p.update();
        assert_eq!(machine.current().unwrap(), before);
    }

    #[test]
    fn zen_thermal_from_smn() {
        let machine = Arc::new(MockMachine::new(4));
        machine.set_smn(amd::THM_TCON_CUR_TMP, 440 << 21);
        machine.set_smn(amd::CCD_TEMP_ZEN2, 0x800 | 800);
        let mut p = matisse(&machine);
        p.update();

        let s = p.sensors();
        assert_eq!(
            s.find(SensorKind::Temperature, "Core (Tctl/Tdie)").unwrap().value,
            Some(55.0)
        );
        assert_eq!(s.find(SensorKind::Temperature, "CCD1 (Tdie)").unwrap().value, Some(51.0));
        assert!(s.find(SensorKind::Temperature, "CCD2 (Tdie)").is_none());
    }

    #[test]
    fn busy_bus_keeps_stale_smn_values() {
        let machine = Arc::new(MockMachine::new(4));
        machine.set_smn(amd::THM_TCON_CUR_TMP, 440 << 21);
        let mut p = matisse(&machine);
        p.update();

        machine.set_smn(amd::THM_TCON_CUR_TMP, 480 << 21);
        let bus = Arc::clone(&p.bus);
        let _held = bus.lock().unwrap();
        let report = p.update();
        assert!(report.register_failures > 0);
        assert_eq!(
            p.sensors()
                .find(SensorKind::Temperature, "Core (Tctl/Tdie)")
                .unwrap()
                .value,
            Some(55.0)
        );
    }

    #[test]
    fn implausible_thermal_reads_are_suppressed() {
        let machine = Arc::new(MockMachine::new(4));
        let mut p = matisse(&machine);

        // Tctl register never written: reads 0.
        p.update();
        assert!(p.sensors().find(SensorKind::Temperature, "Core (Tctl/Tdie)").is_none());

        // Absent device: all ones.
        machine.set_smn(amd::THM_TCON_CUR_TMP, u32::MAX);
        machine.set_smn(amd::CCD_TEMP_ZEN2, u32::MAX);
        p.update();
        assert!(p.sensors().find(SensorKind::Temperature, "Core (Tctl/Tdie)").is_none());
        assert!(p.sensors().find(SensorKind::Temperature, "CCD1 (Tdie)").is_none());

        machine.set_smn(amd::THM_TCON_CUR_TMP, 440 << 21);
        p.update();
        machine.set_smn(amd::THM_TCON_CUR_TMP, u32::MAX);
        p.update();
        let tctl = p.sensors().find(SensorKind::Temperature, "Core (Tctl/Tdie)").unwrap();
        assert_eq!(tctl.value, Some(55.0));
        assert_eq!(tctl.max, Some(55.0));
    }

    #[test]
    fn zero_fid_keeps_previous_clock() {
        let machine = Arc::new(MockMachine::new(4));
        let mut p = matisse(&machine);
        machine.set_msr_all(amd::P_STATE_STATUS, zen_p_state(36));
        p.update();

        machine.set_msr(0, amd::P_STATE_STATUS, (0x30 << 14) | (8 << 8));
        p.update();
        assert_eq!(clocks(&p), vec![Some(3600.0), Some(3600.0)]);
        assert_eq!(
            p.sensors().find(SensorKind::Clock, "Core #1").unwrap().min,
            Some(3600.0)
        );
    }

    #[test]
    fn zen_core_power_survives_counter_wrap() {
        let machine = Arc::new(MockMachine::new(4));
        let mut p = matisse(&machine);
        machine.set_msr_all(amd::CORE_ENERGY_STAT, 0xFFFF_0000);
        p.update();
        assert!(p.sensors().find(SensorKind::Power, "Core #1").is_none());

        let pause = std::time::Duration::from_millis(10);
        std::thread::sleep(pause);
        // 0xFFFF + 1 + 0xFFFF increments of 2^-16 J across the wrap.
        machine.set_msr_all(amd::CORE_ENERGY_STAT, 0x0000_FFFF);
        p.update();

        let joules = 0x1_FFFF as f64 / 65_536.0;
        let ceiling = joules / pause.as_secs_f64();
        for core in p.package().cores() {
            let watts = core.readings.power.unwrap();
            assert!(watts > 0.0 && watts <= ceiling, "core power {watts}");
        }
        let published = p.sensors().find(SensorKind::Power, "Core #2").unwrap().value;
        assert_eq!(published, p.package().cores().nth(1).unwrap().readings.power);
    }

    #[test]
    fn intel_rapl_publishes_only_answering_domains() {
        let machine = Arc::new(MockMachine::new(4));
        let package = Package::from_records(records(Vendor::Intel, 0x06, 0x9E, 2)).unwrap();
        machine.set_msr_all(intel::MSR_RAPL_POWER_UNIT, 0x000A_0E03);
        machine.set_msr_all(intel::MSR_PKG_ENERGY_STATUS, 5_000);
        machine.set_msr_all(intel::MSR_PP0_ENERGY_STATUS, 3_000);
        machine.set_msr_all(intel::MSR_DRAM_ENERGY_STATUS, 1_000);
        machine.fail_msr(0, intel::MSR_DRAM_ENERGY_STATUS);
        // PP1 (graphics) never answers.

        let mut p = build(&machine, package, EngineConfig::default(), None);
        let domains: Vec<_> = p.package_energy.iter().map(|c| c.domain).collect();
        assert_eq!(domains, vec![PowerDomain::Package, PowerDomain::Cores]);

        p.update();
        std::thread::sleep(std::time::Duration::from_millis(5));
        machine.set_msr_all(intel::MSR_PKG_ENERGY_STATUS, 5_000 + 16_384);
        machine.set_msr_all(intel::MSR_PP0_ENERGY_STATUS, 3_000 + 8_192);
        p.update();

        let powers: Vec<_> = p
            .sensors()
            .iter()
            .filter(|s| s.kind == SensorKind::Power)
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(powers, vec!["CPU Package", "CPU Cores"]);
        let package_watts = p.sensors().find(SensorKind::Power, "CPU Package").unwrap().value.unwrap();
        let core_watts = p.sensors().find(SensorKind::Power, "CPU Cores").unwrap().value.unwrap();
        assert!(package_watts > core_watts && core_watts > 0.0);
    }

    #[test]
    fn package_power_needs_two_samples() {
        let machine = Arc::new(MockMachine::new(4));
        let mut p = matisse(&machine);
        p.update();
        assert!(p.sensors().find(SensorKind::Power, "Package").is_none());

        std::thread::sleep(std::time::Duration::from_millis(5));
        machine.set_msr_all(amd::PKG_ENERGY_STAT, 1000 + 65_536);
        p.update();
        let watts = p.sensors().find(SensorKind::Power, "Package").unwrap().value.unwrap();
        assert!(watts.is_finite() && watts > 0.0);
    }

    #[test]
    fn mailbox_refreshes_configured_pm_table() {
        let machine = Arc::new(MockMachine::new(4));
        let layout = profile::smu_layout(CodeName::Matisse).unwrap();
        let cmds = layout.pm_table.unwrap();
        machine.install_smu(layout.mailbox);
        machine.on_smu_command(0x02, SmuStatus::Ok, [0x002E_3C00, 0, 0, 0, 0, 0]);
        machine.on_smu_command(cmds.get_version, SmuStatus::Ok, [0x0038_0804, 0, 0, 0, 0, 0]);
        machine.on_smu_command(cmds.get_dram_address, SmuStatus::Ok, [0x2000, 0, 0, 0, 0, 0]);
        machine.on_smu_command(cmds.transfer_to_dram, SmuStatus::Ok, [0; 6]);
        let table: Vec<u8> = [88.5f32, 1.1, 20.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        machine.set_physical_memory(0x2000, &table);

        let config: EngineConfig = serde_json::from_str(
            r#"{"pm_tables": [{"version": 3672068, "size": 12, "sensors": [
                {"offset": 0, "name": "Package Power", "kind": "power"},
                {"offset": 8, "name": "SoC Current", "kind": "current", "scale": 0.5}
            ]}]}"#,
        )
        .unwrap();
        let package = Package::from_records(records(Vendor::Amd, 0x17, 0x71, 2)).unwrap();
        let mut p = build(&machine, package, config, None);
        assert_eq!(p.smu_version().unwrap().to_string(), "46.60.0");

        let report = p.update();
        assert_eq!(report.mailbox, MailboxOutcome::Refreshed);
        let s = p.sensors();
        assert_eq!(s.find(SensorKind::Power, "Package Power").unwrap().value, Some(88.5));
        assert_eq!(s.find(SensorKind::Current, "SoC Current").unwrap().value, Some(10.0));
    }

    #[test]
    fn unknown_table_version_disables_table() {
        let machine = Arc::new(MockMachine::new(4));
        let layout = profile::smu_layout(CodeName::Matisse).unwrap();
        machine.install_smu(layout.mailbox);
        machine.on_smu_command(
            layout.pm_table.unwrap().get_version,
            SmuStatus::Ok,
            [0x0024_0903, 0, 0, 0, 0, 0],
        );
        let mut p = matisse(&machine);
        assert_eq!(p.update().mailbox, MailboxOutcome::NoTable);
        assert_eq!(p.update().mailbox, MailboxOutcome::NoTable);
    }

    #[test]
    fn unresponsive_smu_fails_transiently() {
        let machine = Arc::new(MockMachine::new(4));
        let layout = profile::smu_layout(CodeName::Matisse).unwrap();
        machine.install_smu(layout.mailbox);
        machine.set_smn(layout.mailbox.response, 0);
        let config = EngineConfig {
            smu_retries: 10,
            ..EngineConfig::default()
        };
        let package = Package::from_records(records(Vendor::Amd, 0x17, 0x71, 2)).unwrap();
        let mut p = build(&machine, package, config, None);
        assert!(p.mailbox_available());
        assert_eq!(p.update().mailbox, MailboxOutcome::Failed);
    }

    #[test]
    fn intel_has_no_mailbox() {
        let machine = Arc::new(MockMachine::new(2));
        let package = Package::from_records(records(Vendor::Intel, 0x06, 0x9E, 1)).unwrap();
        let mut p = build(&machine, package, EngineConfig::default(), None);
        assert!(!p.mailbox_available());
        assert_eq!(p.update().mailbox, MailboxOutcome::Unavailable);
    }

    #[test]
    fn generic_exposes_only_tsc() {
        let machine = Arc::new(MockMachine::new(2));
        let package = Package::from_records(records(Vendor::Unknown, 0x06, 0x0F, 1)).unwrap();
        let clock = MockClock::new(2.0e9, 100);
        let mut p = build(&machine, package, EngineConfig::default(), Some(&clock));
        assert_eq!(p.profile().strategy, Strategy::Generic);
        let report = p.update();
        assert_eq!(report.cores_read, 0);
        assert_eq!(machine.msr_reads(), 0);

        let names: Vec<_> = p.sensors().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Time Stamp Counter"]);
        let snapshot = p.snapshot();
        assert_eq!(snapshot.code_name, "Undefined");
        assert!(snapshot.tsc_frequency_mhz.is_some());
    }

    #[test]
    fn missing_msr_feature_skips_core_reads() {
        let machine = Arc::new(MockMachine::new(4));
        let mut records = records(Vendor::Amd, 0x17, 0x71, 2);
        for r in &mut records {
            r.features.msr = false;
        }
        let package = Package::from_records(records).unwrap();
        let mut p = build(&machine, package, EngineConfig::default(), None);
        let report = p.update();
        assert_eq!(report.cores_read, 0);
        assert_eq!(machine.msr_reads(), 0);
    }
}
