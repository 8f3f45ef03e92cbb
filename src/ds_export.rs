// CSV export of run results
//
// Semicolon separated, decimals written with a comma so spreadsheets in the
// usual locales read them as numbers.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::ds_config::RunConfig;
use crate::ds_interface::Message;
use crate::ds_metrics::RunResult;

const RUN_HEADER: &str = "strategy;depth;fanout;group_size;concentration;failure_rate;model_size;seed;\
status;latency;work;completeness;observed;expected;messages;bandwidth_out;bandwidth_in";

const MESSAGE_HEADER: &str = "id;emission_time;reception_time;emitter;receiver;type";

fn decimal(value: f64) -> String {
    format!("{:.3}", value).replace('.', ",")
}

/// Configuration keys written to the file name digest when they vary.
fn varying_keys(config: &RunConfig) -> [(&'static str, String); 8] {
    [
        ("strategy", config.building_blocks.label().to_string()),
        ("depth", config.depth.to_string()),
        ("fanout", config.fanout.to_string()),
        ("group_size", config.group_size.to_string()),
        ("concentration", config.concentration.to_string()),
        ("failure_rate", config.failure_rate.to_string()),
        ("model_size", config.model_size.to_string()),
        ("seed", config.seed.clone()),
    ]
}

/// `dissec-{digest}-{revision}.csv`, the digest covering every key whose
/// value differs between the runs of the experiment.
pub fn export_file_name(configs: &[RunConfig], revision: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    if let Some(first) = configs.first() {
        let reference = varying_keys(first);
        for (index, (key, _)) in reference.iter().enumerate() {
            let mut values: Vec<String> = configs.iter().map(|c| varying_keys(c)[index].1.clone()).collect();
            values.sort();
            values.dedup();
            if values.len() > 1 {
                hasher.update(key.as_bytes());
                for value in values {
                    hasher.update(b"=");
                    hasher.update(value.as_bytes());
                }
            }
        }
    }
    let digest = hasher.finalize().to_hex();
    format!("dissec-{}-{}.csv", &digest.as_str()[..8], revision)
}

/// Writes one row per run, or one row per processed message when the run
/// kept its archive.
pub struct CsvResultSink<W: Write> {
    writer: W,
    full_export: bool,
}

impl CsvResultSink<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P, full_export: bool) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file), full_export)
    }
}

impl<W: Write> CsvResultSink<W> {
    pub fn new(mut writer: W, full_export: bool) -> std::io::Result<Self> {
        if full_export {
            writeln!(writer, "{};{}", RUN_HEADER, MESSAGE_HEADER)?;
        } else {
            writeln!(writer, "{}", RUN_HEADER)?;
        }
        Ok(Self { writer, full_export })
    }

    pub fn write(&mut self, result: &RunResult) -> std::io::Result<()> {
        let run = Self::run_columns(result);
        if !self.full_export {
            return writeln!(self.writer, "{}", run);
        }
        for message in &result.messages {
            writeln!(self.writer, "{};{}", run, Self::message_columns(message))?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn run_columns(result: &RunResult) -> String {
        let config = &result.config;
        format!(
            "{};{};{};{};{};{};{};{};{:?};{};{};{};{};{};{};{};{}",
            config.building_blocks.label(),
            config.depth,
            config.fanout,
            config.group_size,
            config.concentration,
            decimal(config.failure_rate),
            decimal(config.model_size),
            config.seed,
            result.status,
            decimal(result.latency),
            decimal(result.work),
            decimal(result.completeness),
            result.observed_contributors,
            result.expected_contributors,
            result.traffic.messages_sent,
            decimal(result.traffic.bandwidth_out),
            decimal(result.traffic.bandwidth_in),
        )
    }

    fn message_columns(message: &Message) -> String {
        format!(
            "{};{};{};{};{};{}",
            message.id,
            decimal(message.emission_time),
            message.reception_time.map(decimal).unwrap_or_default(),
            message.emitter,
            message.receiver,
            message.kind(),
        )
    }
}
