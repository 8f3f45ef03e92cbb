// Experiment Runner - Load and execute experiment YAML files
//
// Usage:
//   cargo run --bin experiment_runner scenarios/strategies.yaml
//   cargo run --bin experiment_runner scenarios/  (runs all .yaml files in directory)
//   cargo run --bin experiment_runner scenarios/failures.yaml --seed run- --revision abc123 --retries 2
//
// Each experiment writes `dissec-{digest}-{revision}.csv` to its output
// directory. Set RUST_LOG=info for per-run progress.

use dissec_sim::ds_export::{export_file_name, CsvResultSink};
use dissec_sim::{ExperimentFile, ExperimentRunner, RunResult};
use log::{error, info};
use simple_logger::SimpleLogger;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

struct Options {
    seed_prefix: Option<String>,
    revision: String,
    retries: usize,
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <experiment.yaml | directory/> [--seed PREFIX] [--revision REV] [--retries N]", args[0]);
        eprintln!("\nExamples:");
        eprintln!("  {} scenarios/strategies.yaml", args[0]);
        eprintln!("  {} scenarios/", args[0]);
        eprintln!("  {} scenarios/failures.yaml --seed run- --retries 2", args[0]);
        std::process::exit(1);
    }

    SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .env()
        .init()
        .unwrap_or_else(|e| eprintln!("Logger unavailable: {}", e));

    let options = parse_options(&args[2..]);
    let path = Path::new(&args[1]);

    let failed = if path.is_file() {
        !run_experiment_file(path, &options)
    } else if path.is_dir() {
        run_experiment_directory(path, &options) > 0
    } else {
        eprintln!("Error: Path does not exist: {}", path.display());
        std::process::exit(1);
    };

    if failed {
        std::process::exit(2);
    }
}

fn parse_options(args: &[String]) -> Options {
    let mut options = Options {
        seed_prefix: None,
        revision: "dev".to_string(),
        retries: 0,
    };

    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let Some(value) = iter.next() else {
            eprintln!("Missing value for {}", flag);
            std::process::exit(1);
        };
        match flag.as_str() {
            "--seed" => options.seed_prefix = Some(value.clone()),
            "--revision" => options.revision = value.clone(),
            "--retries" => {
                options.retries = value.parse().unwrap_or_else(|e| {
                    eprintln!("Invalid --retries {}: {}", value, e);
                    std::process::exit(1);
                });
            }
            other => {
                eprintln!("Unknown option: {}", other);
                std::process::exit(1);
            }
        }
    }

    options
}

/// Returns the number of experiments that did not complete.
fn run_experiment_directory(dir: &Path, options: &Options) -> usize {
    let mut experiments: Vec<PathBuf> = Vec::new();

    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let extension = path.extension().and_then(|s| s.to_str());
            if extension == Some("yaml") || extension == Some("yml") {
                experiments.push(path);
            }
        }
    }

    experiments.sort();

    if experiments.is_empty() {
        eprintln!("No .yaml files found in {}", dir.display());
        std::process::exit(1);
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  EXPERIMENT RUNNER - Multiple Experiments              ║");
    println!("╚════════════════════════════════════════════════════════╝\n");
    println!("Found {} experiment(s) to run\n", experiments.len());

    let mut failures = 0;
    for (i, experiment_path) in experiments.iter().enumerate() {
        println!("\n{}/{} Running: {}\n", i + 1, experiments.len(), experiment_path.display());
        if !run_experiment_file(experiment_path, options) {
            failures += 1;
        }
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    if failures == 0 {
        println!("║  All experiments complete!                             ║");
    } else {
        println!("║  {} experiment(s) aborted", failures);
    }
    println!("╚════════════════════════════════════════════════════════╝\n");

    failures
}

/// Runs every configuration of one file; false when a run aborted or the
/// export could not be written.
fn run_experiment_file(path: &Path, options: &Options) -> bool {
    println!("Loading experiment from: {}", path.display());

    let yaml_content = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {}", path.display(), e);
        std::process::exit(1);
    });

    let mut experiment = ExperimentFile::from_yaml(&yaml_content).unwrap_or_else(|e| {
        eprintln!("Failed to parse {}: {}", path.display(), e);
        std::process::exit(1);
    });

    if let Some(ref prefix) = options.seed_prefix {
        experiment.sweep.seed_prefix = prefix.clone();
    }

    // Print experiment header
    let name = experiment
        .meta
        .name
        .clone()
        .or_else(|| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
        .unwrap_or_default();
    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  {}{}║", name, " ".repeat(54_usize.saturating_sub(name.len())));
    println!("╚════════════════════════════════════════════════════════╝\n");

    if let Some(ref desc) = experiment.meta.description {
        println!("{}\n", desc);
    }

    let configs = match experiment.run_configs() {
        Ok(configs) => configs,
        Err(e) => {
            error!("{}: {}", path.display(), e);
            return false;
        }
    };

    println!("Configuration:");
    println!("  Runs: {}", configs.len());
    println!("  Base tree: depth {}, fanout {}, groups of {}", experiment.base.depth, experiment.base.fanout, experiment.base.group_size);
    println!("  Output: {}", experiment.output.directory);
    println!("\nStarting simulation...\n");

    let runner = ExperimentRunner::with_retries(options.retries);
    let mut results: Vec<RunResult> = Vec::with_capacity(configs.len());
    let mut aborted = 0;

    for (index, config) in configs.iter().enumerate() {
        info!("run {}/{} seed \"{}\"", index + 1, configs.len(), config.seed);
        match runner.single_run(config) {
            Ok(result) => {
                result.print_summary();
                results.push(result);
            }
            Err(e) => {
                error!("run {}/{} (seed \"{}\") aborted: {}", index + 1, configs.len(), config.seed, e);
                aborted += 1;
            }
        }
    }

    // Export
    let directory = Path::new(&experiment.output.directory);
    let file = directory.join(export_file_name(&configs, &options.revision));
    let exported = fs::create_dir_all(directory)
        .and_then(|_| CsvResultSink::create(&file, experiment.output.full_export || experiment.base.full_export))
        .and_then(|mut sink| {
            for result in &results {
                sink.write(result)?;
            }
            sink.flush()
        });

    if let Err(e) = exported {
        error!("Failed to write {}: {}", file.display(), e);
        return false;
    }

    let successes = results.iter().filter(|r| r.is_success()).count();
    println!("\n{} of {} run(s) succeeded, {} aborted", successes, configs.len(), aborted);
    println!("Results written to {}", file.display());
    println!("\n✓ Experiment complete!\n");

    aborted == 0
}
