//! Integration tests for opensensor-core.
//!
//! These drive the whole acquisition path against the in-memory machine:
//! detection records → package → processor → published sensors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use opensensor_core::mock::{MockClock, MockMachine};
use opensensor_core::profile::{self, amd, intel};
use opensensor_core::{
    CodeName, EngineConfig, HardwareId, MailboxClient, Package, Processor, RegisterBus,
    SensorKind, SmuStatus, Vendor,
};

fn two_by_two(vendor: Vendor, family: u32, model: u32) -> Package {
    let records = (0..4).map(|cpu| {
        HardwareId::new(vendor, family, model, cpu)
            .with_ids(0, (cpu / 2) as u32)
            .with_brand("Integration CPU")
    });
    Package::from_records(records).unwrap()
}

fn processor(machine: &Arc<MockMachine>, package: Package, config: EngineConfig) -> Processor {
    let profile = opensensor_core::FamilyProfile::detect(&package);
    let bus = Arc::new(RegisterBus::new(machine.clone()));
    let clock = MockClock::new(3.6e9, 100);
    Processor::with_parts(package, profile, bus, machine.clone(), config, Some(&clock))
}

#[test]
fn per_core_clock_is_multiplier_times_bus_clock() {
    let machine = Arc::new(MockMachine::new(4));
    // FID/DFS pairs encoding multipliers 38 and 45.5 with DFS 8.
    machine.set_msr(0, amd::P_STATE_STATUS, (8 << 8) | 152);
    machine.set_msr(2, amd::P_STATE_STATUS, (8 << 8) | 182);

    let mut cpu = processor(&machine, two_by_two(Vendor::Amd, 0x19, 0x21), EngineConfig::default());
    assert_eq!(cpu.profile().code_name, CodeName::Vermeer);
    let report = cpu.update();
    assert_eq!(report.cores_read, 2);

    let clocks: Vec<_> = cpu.package().cores().map(|c| c.readings.clock_mhz).collect();
    assert_eq!(clocks, vec![Some(3800.0), Some(4550.0)]);
}

#[test]
fn intel_clocks_follow_calibrated_tsc() {
    let machine = Arc::new(MockMachine::new(4));
    machine.set_msr_all(intel::MSR_PLATFORM_INFO, 36 << 8);
    machine.set_msr(0, intel::IA32_PERF_STATUS, 44 << 8);
    machine.set_msr(2, intel::IA32_PERF_STATUS, 12 << 8);

    let mut cpu = processor(&machine, two_by_two(Vendor::Intel, 0x06, 0xA5), EngineConfig::default());
    cpu.update();

    let bus = cpu.bus_clock().unwrap();
    assert!((bus - 100.0).abs() < 1.0, "bus clock {bus}");
    let clocks: Vec<_> = cpu.package().cores().map(|c| c.readings.clock_mhz).collect();
    assert_eq!(clocks, vec![Some(44.0 * bus), Some(12.0 * bus)]);
}

#[test]
fn topology_groups_nodes_and_cores() {
    let core_ids = [2, 2, 5, 5, 7];
    let node_ids = [0, 0, 0, 0, 1];
    let records = core_ids
        .iter()
        .zip(node_ids)
        .enumerate()
        .map(|(cpu, (&core, node))| HardwareId::new(Vendor::Intel, 6, 0x9E, cpu).with_ids(node, core));
    let package = Package::from_records(records).unwrap();

    assert_eq!(package.nodes().len(), 2);
    let node0: Vec<_> = package.nodes()[0]
        .cores()
        .iter()
        .map(|c| (c.id(), c.threads().len()))
        .collect();
    assert_eq!(node0, vec![(2, 2), (5, 2)]);
    let node1: Vec<_> = package.nodes()[1].cores().iter().map(|c| c.id()).collect();
    assert_eq!(node1, vec![7]);
}

#[test]
fn concurrent_mailbox_transactions_do_not_interleave() {
    let machine = Arc::new(MockMachine::new(1));
    let layout = profile::smu_layout(CodeName::Matisse).unwrap();
    machine.install_smu(layout.mailbox);
    for opcode in 0x40..0x48u32 {
        machine.on_smu_command(opcode, SmuStatus::Ok, [opcode * 10, opcode, 0, 0, 0, 0]);
    }
    let bus = Arc::new(RegisterBus::with_timeout(machine.clone(), Duration::from_secs(5)));
    let client = Arc::new(MailboxClient::new(bus, layout, 64));

    let handles: Vec<_> = (0x40..0x48u32)
        .map(|opcode| {
            let client = Arc::clone(&client);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let out = client.transaction(opcode, &[opcode]).unwrap();
                    assert_eq!(out[0], opcode * 10);
                    assert_eq!(out[1], opcode);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn snapshot_carries_renamed_sensors_as_json() {
    let machine = Arc::new(MockMachine::new(4));
    machine.set_msr_all(amd::P_STATE_STATUS, (8 << 8) | 160);
    machine.set_smn(amd::THM_TCON_CUR_TMP, 360 << 21);

    let config = EngineConfig {
        renames: BTreeMap::from([("Core (Tctl/Tdie)".to_string(), "CPU Die".to_string())]),
        ..EngineConfig::default()
    };
    let mut cpu = processor(&machine, two_by_two(Vendor::Amd, 0x17, 0x71), config);
    cpu.update();

    let snapshot = cpu.snapshot();
    assert_eq!(snapshot.code_name, "Matisse");
    let die = snapshot
        .sensors
        .iter()
        .find(|s| s.name == "CPU Die")
        .unwrap();
    assert_eq!(die.kind, SensorKind::Temperature);
    assert_eq!(die.value, Some(45.0));

    let json = serde_json::to_string(&snapshot).unwrap();
    assert!(json.contains("\"CPU Die\""));
    assert!(json.contains("\"Bus Speed\""));
}

#[cfg(target_os = "linux")]
#[test]
#[ignore] // Run with: cargo test -- --ignored (needs root and the msr module)
fn linux_driver_reads_tsc_msr() {
    use opensensor_core::{Affinity, AffinityScope, LinuxDriver, OsAffinity};

    if !LinuxDriver::msr_available() {
        return;
    }
    let bus = RegisterBus::new(Arc::new(LinuxDriver::new()));
    let scope = AffinityScope::enter(&OsAffinity, Affinity::single(0)).unwrap();
    // IA32_TIME_STAMP_COUNTER
    let tsc = bus.read_msr(&scope, 0x10).unwrap();
    assert!(tsc.bits() > 0);
}
