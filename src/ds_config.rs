use crate::ds_error::SimError;
use crate::ds_interface::{Share, SimTime};
use crate::ds_tree::TreeShape;

// ============================================================================
// Building blocks
// ============================================================================

/// How far a failure that cannot be recovered travels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FailurePropagation {
    /// Stop the whole run
    Full,
    /// The group gives up and its parents continue without it
    Local,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FailureHandling {
    /// Search a backup for every failed aggregator
    Replace,
    /// Only replace aggregators that have not finished, drop everything else
    Drop,
}

/// What a node does once it has forwarded its result.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Standby {
    Stop,
    Continue,
}

/// Forwarding policy, see the table in the crate docs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Synchronization {
    None,
    NonBlocking,
    LeavesSynchronization,
    FullSynchronization,
}

impl Synchronization {
    /// Leaves exchange contributor lists
    pub fn shares_contributors(self) -> bool {
        self != Synchronization::None
    }

    /// Leaves wait for every member's contributor list before forwarding
    pub fn synchronizes_leaves(self) -> bool {
        matches!(
            self,
            Synchronization::LeavesSynchronization | Synchronization::FullSynchronization
        )
    }

    pub fn synchronizes_aggregators(self) -> bool {
        self == Synchronization::FullSynchronization
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BuildingBlocks {
    pub failure_propagation: FailurePropagation,
    pub failure_handling: FailureHandling,
    pub standby: Standby,
    pub synchronization: Synchronization,
}

impl Default for BuildingBlocks {
    fn default() -> Self {
        Self {
            failure_propagation: FailurePropagation::Local,
            failure_handling: FailureHandling::Replace,
            standby: Standby::Continue,
            synchronization: Synchronization::NonBlocking,
        }
    }
}

/// Named strategies, in the order the experiment tooling lists them.
pub const STRATEGIES: [(&str, BuildingBlocks); 6] = [
    (
        "Eager",
        BuildingBlocks {
            failure_propagation: FailurePropagation::Full,
            failure_handling: FailureHandling::Drop,
            standby: Standby::Stop,
            synchronization: Synchronization::None,
        },
    ),
    (
        "Optimistic",
        BuildingBlocks {
            failure_propagation: FailurePropagation::Local,
            failure_handling: FailureHandling::Replace,
            standby: Standby::Continue,
            synchronization: Synchronization::NonBlocking,
        },
    ),
    (
        "Pessimistic",
        BuildingBlocks {
            failure_propagation: FailurePropagation::Full,
            failure_handling: FailureHandling::Replace,
            standby: Standby::Stop,
            synchronization: Synchronization::FullSynchronization,
        },
    ),
    (
        "LeavesSync",
        BuildingBlocks {
            failure_propagation: FailurePropagation::Local,
            failure_handling: FailureHandling::Replace,
            standby: Standby::Continue,
            synchronization: Synchronization::LeavesSynchronization,
        },
    ),
    (
        "Strawman",
        BuildingBlocks {
            failure_propagation: FailurePropagation::Full,
            failure_handling: FailureHandling::Replace,
            standby: Standby::Stop,
            synchronization: Synchronization::None,
        },
    ),
    (
        "Degraded",
        BuildingBlocks {
            failure_propagation: FailurePropagation::Local,
            failure_handling: FailureHandling::Drop,
            standby: Standby::Continue,
            synchronization: Synchronization::NonBlocking,
        },
    ),
];

pub fn strategy(name: &str) -> Result<BuildingBlocks, SimError> {
    STRATEGIES
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, blocks)| *blocks)
        .ok_or_else(|| SimError::UnknownStrategy(name.to_string()))
}

impl BuildingBlocks {
    /// Name of the strategy with exactly these blocks, "Custom" otherwise.
    pub fn label(&self) -> &'static str {
        STRATEGIES
            .iter()
            .find(|(_, blocks)| blocks == self)
            .map(|(name, _)| *name)
            .unwrap_or("Custom")
    }
}

// ============================================================================
// Run configuration
// ============================================================================

/// Parameters of one simulation run. Times are in abstract simulation units.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RunConfig {
    // ===== Tree Shape =====
    /// Depth of the root group; contributor groups are at depth 0 (default: 3)
    pub depth: usize,

    /// Child groups per aggregator group (default: 4)
    pub fanout: usize,

    /// Members per aggregator group (default: 3)
    pub group_size: usize,

    /// Contributors per contributor group is `fanout^concentration` (default: 0)
    pub concentration: u32,

    /// Randomize contributor group sizes around `fanout^concentration` (default: false)
    pub random: bool,

    // ===== Cost Model =====
    /// Mean single-hop latency (default: 100)
    pub average_latency: SimTime,

    /// Model units transmitted per time unit (default: 1)
    pub average_bandwidth: f64,

    /// Cost of one simulated cryptographic operation (default: 100)
    pub average_crypto_time: SimTime,

    /// Cost of one simulated local computation (default: 100)
    pub average_compute_time: SimTime,

    /// MAX_LATENCY = average_latency * max_to_average_ratio (default: 10)
    pub max_to_average_ratio: f64,

    // ===== Protocol Parameters =====
    /// Period of the liveness resampling (default: 100)
    pub fail_check_period: SimTime,

    /// Period of parent to child health checks, 0 disables them (default: 3000)
    pub health_check_period: SimTime,

    /// Backups contacted per multicast round (default: 5)
    pub multicast_size: usize,

    /// Size of a contribution or aggregate in model units (default: 1)
    pub model_size: f64,

    /// Local time after which a node stops the run (default: 100000)
    pub deadline: SimTime,

    // ===== Faults =====
    /// Per-period failure probability, or a percentage when `adapted_failures` is set (default: 0)
    pub failure_rate: f64,

    pub adapted_failures: bool,

    /// Backup pool size relative to the aggregator count (default: 1)
    pub backup_to_aggregators_ratio: f64,

    pub building_blocks: BuildingBlocks,

    // ===== Run =====
    /// Value every contributor shares (default: 50)
    pub secret_value: Share,

    /// Name of the random stream (default: "42")
    pub seed: String,

    /// Keep the full message archive in the result (default: false)
    pub full_export: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            // Tree shape
            depth: 3,
            fanout: 4,
            group_size: 3,
            concentration: 0,
            random: false,

            // Cost model
            average_latency: 100.0,
            average_bandwidth: 1.0,
            average_crypto_time: 100.0,
            average_compute_time: 100.0,
            max_to_average_ratio: 10.0,

            // Protocol
            fail_check_period: 100.0,
            health_check_period: 3000.0,
            multicast_size: 5,
            model_size: 1.0,
            deadline: 100_000.0,

            // Faults
            failure_rate: 0.0,
            adapted_failures: false,
            backup_to_aggregators_ratio: 1.0,
            building_blocks: BuildingBlocks::default(),

            secret_value: 50,
            seed: "42".to_string(),
            full_export: false,
        }
    }
}

impl RunConfig {
    pub fn with_strategy(mut self, name: &str) -> Result<Self, SimError> {
        self.building_blocks = strategy(name)?;
        Ok(self)
    }

    pub fn tree_shape(&self) -> TreeShape {
        TreeShape {
            depth: self.depth,
            fanout: self.fanout,
            group_size: self.group_size,
            concentration: self.concentration,
            random: self.random,
        }
    }

    pub fn max_latency(&self) -> SimTime {
        self.average_latency * self.max_to_average_ratio
    }

    /// Time to push one model-sized payload through the uplink.
    pub fn transmission_time(&self) -> SimTime {
        if self.average_bandwidth > 0.0 {
            self.model_size / self.average_bandwidth
        } else {
            0.0
        }
    }

    /// Delay between a failure and the parents being told about it.
    pub fn detection_delay(&self) -> SimTime {
        2.0 * self.max_latency()
    }

    /// Estimated duration of a failure-free run.
    pub fn base_protocol_latency(&self) -> SimTime {
        let contribution = 3.0 * self.max_latency();
        let per_level =
            2.0 * self.average_latency + 3.0 * self.average_crypto_time + self.transmission_time();
        contribution + self.depth as f64 * per_level
    }

    /// Probability for a live node to fail during one `fail_check_period`.
    ///
    /// With `adapted_failures`, `failure_rate` is the percentage of nodes
    /// expected to fail over one base protocol latency.
    pub fn failure_probability(&self) -> f64 {
        if self.failure_rate <= 0.0 {
            return 0.0;
        }
        if !self.adapted_failures {
            return self.failure_rate.min(1.0);
        }

        let fraction = (self.failure_rate / 100.0).min(1.0);
        if fraction >= 1.0 {
            return 1.0;
        }
        let periods = (self.base_protocol_latency() / self.fail_check_period).max(1.0);
        1.0 - (1.0 - fraction).powf(1.0 / periods)
    }

    pub fn validate(&self) -> Result<(), SimError> {
        if self.depth == 0 {
            return Err(SimError::invalid_config("depth must be at least 1"));
        }
        if self.fanout == 0 || self.group_size == 0 {
            return Err(SimError::invalid_config("fanout and group_size must be positive"));
        }
        if self.average_latency <= 0.0 || self.fail_check_period <= 0.0 {
            return Err(SimError::invalid_config(
                "average_latency and fail_check_period must be positive",
            ));
        }
        if self.multicast_size == 0 {
            return Err(SimError::invalid_config("multicast_size must be positive"));
        }
        if self.health_check_period > 0.0 && self.health_check_period <= 2.0 * self.max_latency() {
            return Err(SimError::invalid_config(
                "health_check_period must exceed the health check timeout (2 * max latency)",
            ));
        }
        if self.backup_to_aggregators_ratio < 0.0 {
            return Err(SimError::invalid_config("backup_to_aggregators_ratio must not be negative"));
        }
        Ok(())
    }
}

// ============================================================================
// Experiment sweeps
// ============================================================================

/// Values used for the axes that are not being varied when `full_space` is
/// false.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SweepDefaults {
    pub depth: usize,
    pub failure: f64,
    pub model_size: f64,
    pub group_size: usize,
}

#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ExperimentSweep {
    pub strategies: Vec<String>,
    pub depths: Vec<usize>,
    pub failures: Vec<f64>,
    pub group_sizes: Vec<usize>,
    pub model_sizes: Vec<f64>,
    /// Repetitions, each with seed `{seed_prefix}{index}`; without a prefix
    /// the base seed is kept, suffixed with `-{index}` after the first
    pub repetitions: usize,
    /// Cartesian product of every axis instead of one axis at a time
    pub full_space: bool,
    pub seed_prefix: String,
    pub defaults: Option<SweepDefaults>,
}

/// Expands a sweep over `base` into individual run configurations.
pub fn create_run_configs(base: &RunConfig, sweep: &ExperimentSweep) -> Result<Vec<RunConfig>, SimError> {
    let strategies = if sweep.strategies.is_empty() {
        vec![(base.building_blocks.label().to_string(), base.building_blocks)]
    } else {
        sweep
            .strategies
            .iter()
            .map(|name| Ok((name.clone(), strategy(name)?)))
            .collect::<Result<Vec<_>, SimError>>()?
    };
    let repetitions = sweep.repetitions.max(1);

    let variant = |blocks: BuildingBlocks, depth: usize, failure: f64, group_size: usize, model_size: f64, repetition: usize| {
        let mut config = base.clone();
        config.building_blocks = blocks;
        config.depth = depth;
        config.failure_rate = failure;
        config.group_size = group_size;
        config.model_size = model_size;
        config.seed = match (sweep.seed_prefix.is_empty(), repetition) {
            (true, 0) => base.seed.clone(),
            (true, _) => format!("{}-{}", base.seed, repetition),
            (false, _) => format!("{}{}", sweep.seed_prefix, repetition),
        };
        config
    };

    let mut configs = Vec::new();

    if sweep.full_space {
        let depths = non_empty(&sweep.depths, base.depth);
        let failures = non_empty(&sweep.failures, base.failure_rate);
        let group_sizes = non_empty(&sweep.group_sizes, base.group_size);
        let model_sizes = non_empty(&sweep.model_sizes, base.model_size);

        for depth in &depths {
            for failure in &failures {
                for group_size in &group_sizes {
                    for model_size in &model_sizes {
                        for repetition in 0..repetitions {
                            for (_, blocks) in &strategies {
                                configs.push(variant(*blocks, *depth, *failure, *group_size, *model_size, repetition));
                            }
                        }
                    }
                }
            }
        }
    } else {
        let defaults = sweep.defaults.clone().unwrap_or(SweepDefaults {
            depth: base.depth,
            failure: base.failure_rate,
            model_size: base.model_size,
            group_size: base.group_size,
        });

        let no_axis = sweep.depths.is_empty()
            && sweep.failures.is_empty()
            && sweep.group_sizes.is_empty()
            && sweep.model_sizes.is_empty();

        for repetition in 0..repetitions {
            for (_, blocks) in &strategies {
                if no_axis {
                    configs.push(variant(*blocks, defaults.depth, defaults.failure, defaults.group_size, defaults.model_size, repetition));
                }
                for depth in &sweep.depths {
                    configs.push(variant(*blocks, *depth, defaults.failure, defaults.group_size, defaults.model_size, repetition));
                }
                for failure in &sweep.failures {
                    configs.push(variant(*blocks, defaults.depth, *failure, defaults.group_size, defaults.model_size, repetition));
                }
                for group_size in &sweep.group_sizes {
                    configs.push(variant(*blocks, defaults.depth, defaults.failure, *group_size, defaults.model_size, repetition));
                }
                for model_size in &sweep.model_sizes {
                    configs.push(variant(*blocks, defaults.depth, defaults.failure, defaults.group_size, *model_size, repetition));
                }
            }
        }
    }

    Ok(configs)
}

fn non_empty<T: Copy>(values: &[T], fallback: T) -> Vec<T> {
    if values.is_empty() {
        vec![fallback]
    } else {
        values.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_latency(), 1000.0);
        assert_eq!(config.detection_delay(), 2000.0);
        assert_eq!(config.failure_probability(), 0.0);
        assert_eq!(config.building_blocks.label(), "Optimistic");
    }

    #[test]
    fn test_strategy_lookup() {
        let blocks = strategy("pessimistic").unwrap();
        assert_eq!(blocks.synchronization, Synchronization::FullSynchronization);
        assert_eq!(blocks.label(), "Pessimistic");
        assert_eq!(
            strategy("Nope"),
            Err(SimError::UnknownStrategy("Nope".to_string()))
        );
    }

    #[test]
    fn test_adapted_failure_probability() {
        let mut config = RunConfig::default();
        config.failure_rate = 10.0;
        config.adapted_failures = true;

        let p = config.failure_probability();
        let periods = config.base_protocol_latency() / config.fail_check_period;
        let survived = (1.0 - p).powf(periods);
        assert!((survived - 0.9).abs() < 1e-9);

        config.adapted_failures = false;
        config.failure_rate = 0.25;
        assert_eq!(config.failure_probability(), 0.25);
    }

    #[test]
    fn test_validate_rejects_short_health_period() {
        let mut config = RunConfig::default();
        config.health_check_period = 1500.0;
        assert!(config.validate().is_err());

        config.health_check_period = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "depth: 2\nbuilding_blocks:\n  synchronization: FullSynchronization\n";
        let config: RunConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.depth, 2);
        assert_eq!(config.fanout, 4);
        assert_eq!(config.building_blocks.synchronization, Synchronization::FullSynchronization);
        assert_eq!(config.building_blocks.failure_handling, FailureHandling::Replace);
    }

    #[test]
    fn test_full_space_sweep() {
        let sweep = ExperimentSweep {
            strategies: vec!["Eager".into(), "Optimistic".into()],
            depths: vec![2, 3],
            failures: vec![0.0, 0.001],
            group_sizes: vec![3],
            model_sizes: vec![1.0],
            repetitions: 2,
            full_space: true,
            seed_prefix: "s".into(),
            defaults: None,
        };

        let configs = create_run_configs(&RunConfig::default(), &sweep).unwrap();
        assert_eq!(configs.len(), 2 * 2 * 2 * 2);
        assert_eq!(configs[0].seed, "s0");
        assert_eq!(configs[0].building_blocks.label(), "Eager");
        assert_eq!(configs[1].building_blocks.label(), "Optimistic");
    }

    #[test]
    fn test_one_axis_sweep() {
        let sweep = ExperimentSweep {
            strategies: vec!["Strawman".into()],
            depths: vec![2, 3, 4],
            failures: vec![0.01],
            repetitions: 1,
            ..ExperimentSweep::default()
        };

        let configs = create_run_configs(&RunConfig::default(), &sweep).unwrap();
        assert_eq!(configs.len(), 4);
        assert_eq!(configs[2].depth, 4);
        assert_eq!(configs[3].failure_rate, 0.01);
        assert_eq!(configs[3].depth, 3);
    }

    #[test]
    fn test_sweep_without_axes_repeats_base() {
        let sweep = ExperimentSweep {
            strategies: vec!["Eager".into(), "Pessimistic".into()],
            repetitions: 2,
            ..ExperimentSweep::default()
        };

        let configs = create_run_configs(&RunConfig::default(), &sweep).unwrap();
        assert_eq!(configs.len(), 4);
        assert_eq!(configs[0].seed, "42");
        assert_eq!(configs[2].seed, "42-1");
        assert_eq!(configs[3].building_blocks.label(), "Pessimistic");
    }

    #[test]
    fn test_unknown_strategy_in_sweep() {
        let sweep = ExperimentSweep {
            strategies: vec!["Bogus".into()],
            ..ExperimentSweep::default()
        };
        assert!(create_run_configs(&RunConfig::default(), &sweep).is_err());
    }
}
