// Experiment definition files
//
// Format (every section optional):
//
//   meta:
//     name: strategies
//     description: failure-free comparison of the named strategies
//   base:            # any subset of RunConfig
//     depth: 3
//     fanout: 4
//   sweep:
//     strategies: [Eager, Optimistic]
//     failures: [0.0, 0.001]
//     repetitions: 5
//     full_space: true
//     seed_prefix: "run-"
//   output:
//     directory: results
//     full_export: false

use crate::ds_config::{create_run_configs, ExperimentSweep, RunConfig};
use crate::ds_error::SimError;

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ExperimentMeta {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory of the CSV export (default: "results")
    pub directory: String,

    /// One CSV row per message instead of one per run (default: false)
    pub full_export: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: "results".to_string(),
            full_export: false,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ExperimentFile {
    #[serde(default)]
    pub meta: ExperimentMeta,

    #[serde(default)]
    pub base: RunConfig,

    #[serde(default)]
    pub sweep: ExperimentSweep,

    #[serde(default)]
    pub output: OutputConfig,
}

impl ExperimentFile {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Every run of the experiment, with the output's export mode applied.
    pub fn run_configs(&self) -> Result<Vec<RunConfig>, SimError> {
        let mut base = self.base.clone();
        base.full_export = base.full_export || self.output.full_export;
        create_run_configs(&base, &self.sweep)
    }
}
