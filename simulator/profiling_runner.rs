// Profiling Runner - Experiment runner with timing instrumentation
//
// Usage:
//   cargo run --bin profiling_runner --release scenarios/strategies.yaml

use dissec_sim::ds_export::{export_file_name, CsvResultSink};
use dissec_sim::{ExperimentFile, ExperimentRunner, Manager};
use std::env;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <experiment.yaml>", args[0]);
        eprintln!("\nExample:");
        eprintln!("  {} scenarios/strategies.yaml", args[0]);
        std::process::exit(1);
    }

    let path = Path::new(&args[1]);

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  PROFILING RUNNER                                      ║");
    println!("╚════════════════════════════════════════════════════════╝\n");

    let total_start = Instant::now();

    // Time: Loading YAML
    let load_start = Instant::now();
    println!("Loading experiment from: {}", path.display());

    let yaml_content = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {}", path.display(), e);
        std::process::exit(1);
    });

    let load_time = load_start.elapsed();
    println!("  ✓ File read: {:?}", load_time);

    // Time: Parsing YAML
    let parse_start = Instant::now();
    let experiment = ExperimentFile::from_yaml(&yaml_content).unwrap_or_else(|e| {
        eprintln!("Failed to parse {}: {}", path.display(), e);
        std::process::exit(1);
    });
    let parse_time = parse_start.elapsed();
    println!("  ✓ YAML parsed: {:?}", parse_time);

    // Time: Expanding the sweep
    let config_start = Instant::now();
    let configs = experiment.run_configs().unwrap_or_else(|e| {
        eprintln!("Invalid experiment {}: {}", path.display(), e);
        std::process::exit(1);
    });
    let config_time = config_start.elapsed();
    println!("  ✓ Configs built: {:?}", config_time);

    // Time: Building trees and schedules
    let build_start = Instant::now();
    let mut managers: Vec<Manager> = Vec::with_capacity(configs.len());
    for config in &configs {
        match ExperimentRunner::build_manager(config) {
            Ok(manager) => managers.push(manager),
            Err(e) => {
                eprintln!("Failed to build run \"{}\": {}", config.seed, e);
                std::process::exit(1);
            }
        }
    }
    let build_time = build_start.elapsed();
    println!("  ✓ Runs built: {:?}", build_time);

    println!("\nConfiguration:");
    println!("  Runs: {}", configs.len());
    println!("  Base tree: depth {}, fanout {}, groups of {}", experiment.base.depth, experiment.base.fanout, experiment.base.group_size);

    // Time: Running simulation
    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  SIMULATION                                            ║");
    println!("╚════════════════════════════════════════════════════════╝\n");

    let sim_start = Instant::now();
    let mut results = Vec::with_capacity(managers.len());
    for mut manager in managers {
        if let Err(e) = manager.run() {
            eprintln!("Run \"{}\" aborted: {}", manager.config().seed, e);
            continue;
        }
        results.push(manager.into_result());
    }
    let sim_time = sim_start.elapsed();

    for result in &results {
        result.print_summary();
    }

    // Time: Export
    let export_start = Instant::now();
    let file = std::env::temp_dir().join(export_file_name(&configs, "profile"));
    let exported = CsvResultSink::create(&file, experiment.output.full_export).and_then(|mut sink| {
        for result in &results {
            sink.write(result)?;
        }
        sink.flush()
    });
    if let Err(e) = exported {
        eprintln!("Failed to write {}: {}", file.display(), e);
    }
    let export_time = export_start.elapsed();

    // Print profiling results
    let total_time = total_start.elapsed();
    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  PROFILING RESULTS                                     ║");
    println!("╚════════════════════════════════════════════════════════╝\n");

    println!("Time Breakdown:");
    print_timing("  File I/O", load_time, total_time);
    print_timing("  YAML Parsing", parse_time, total_time);
    print_timing("  Config Setup", config_time, total_time);
    print_timing("  Tree Build", build_time, total_time);
    print_timing("  Simulation", sim_time, total_time);
    print_timing("  CSV Export", export_time, total_time);
    println!("  ─────────────────────────────────────────");
    println!("  Total:           {:>10.3?}  (100.0%)", total_time);

    let runs = results.len();
    let total_messages: usize = results.iter().map(|r| r.traffic.messages_sent).sum();
    let simulated: f64 = results.iter().map(|r| r.latency).sum();

    println!("\nSimulation Metrics:");
    println!("  Runs:            {:>10}", runs);
    println!("  Total Messages:  {:>10}", total_messages);
    println!("  Simulated ms:    {:>10.0}", simulated);
    println!();

    if sim_time.as_secs_f64() > 0.0 && runs > 0 {
        let runs_per_sec = runs as f64 / sim_time.as_secs_f64();
        let messages_per_sec = total_messages as f64 / sim_time.as_secs_f64();

        println!("Performance:");
        println!("  Runs/sec:        {:>10.1}", runs_per_sec);
        println!("  Messages/sec:    {:>10.0}", messages_per_sec);
        println!("  Time/run:        {:>10.3?}", sim_time / runs as u32);

        if total_messages > 0 {
            let ns_per_message = sim_time.as_nanos() / total_messages as u128;
            println!("  Time/message:    {:>10}ns", ns_per_message);
        }
    }

    println!("\n✓ Profiling complete!\n");
}

fn print_timing(label: &str, time: Duration, total: Duration) {
    let percent = (time.as_secs_f64() / total.as_secs_f64()) * 100.0;
    println!("  {:<15}  {:>10.3?}  ({:>5.1}%)", label, time, percent);
}
