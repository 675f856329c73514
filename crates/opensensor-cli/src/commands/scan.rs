use opensensor_core::{Package, Processor, Strategy};

pub fn run(config_path: Option<&str>) {
    super::warn_if_unprivileged();
    let config = super::load_config(config_path);
    let processors = super::make_processors(&config);

    if processors.is_empty() {
        println!("No processor packages found.");
        return;
    }

    println!("Found {} package(s):\n", processors.len());
    for cpu in &processors {
        print_package(cpu);
        println!();
    }
}

fn print_package(cpu: &Processor) {
    let package = cpu.package();
    let profile = cpu.profile();

    println!("Package #{}: {}", package.id(), package.brand());
    println!(
        "  Vendor:     {} (family {:#x}, model {:#x}, stepping {})",
        package.vendor(),
        package.family(),
        package.model(),
        package.stepping()
    );
    println!("  Code name:  {}", profile.code_name);
    let strategy = match profile.strategy {
        Strategy::Intel => "Intel MSR".to_string(),
        Strategy::AmdZen(t) => format!(
            "AMD Zen (Tctl offset {} °C, {} CCD sensors)",
            t.tctl_offset, t.ccd_count
        ),
        Strategy::Generic => "generic (TSC only)".to_string(),
    };
    println!("  Readout:    {strategy}");
    println!(
        "  Topology:   {} node(s), {} core(s), {} thread(s)",
        package.nodes().len(),
        package.core_count(),
        package.thread_count()
    );

    let features = package.features();
    println!(
        "  Features:   msr={} tsc={} invariant_tsc={}",
        features.msr, features.tsc, features.invariant_tsc
    );
    match package.tsc_frequency() {
        Some(mhz) => println!("  TSC:        {mhz:.2} MHz"),
        None => println!("  TSC:        not calibrated"),
    }
    if let Some(bus) = cpu.bus_clock() {
        println!("  Bus clock:  {bus:.2} MHz");
    }
    match (cpu.mailbox_available(), cpu.smu_version()) {
        (true, Some(v)) => println!("  SMU:        firmware {v}"),
        (true, None) => println!("  SMU:        mailbox present, version unavailable"),
        (false, _) => println!("  SMU:        none"),
    }

    print_topology(package);
}

fn print_topology(package: &Package) {
    for node in package.nodes() {
        println!("  Node #{}", node.id());
        for core in node.cores() {
            let threads: Vec<String> = core
                .threads()
                .iter()
                .filter_map(|t| t.affinity().first_cpu())
                .map(|cpu| cpu.to_string())
                .collect();
            println!("    Core #{:<4} cpus {}", core.id(), threads.join(","));
        }
    }
}
