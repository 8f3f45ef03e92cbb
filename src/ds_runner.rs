//! Experiment runner: builds a run from its configuration and drives it to
//! completion.

use std::collections::BTreeMap;

use log::{info, warn};

use crate::ds_backups::BackupPool;
use crate::ds_config::RunConfig;
use crate::ds_error::SimError;
use crate::ds_interface::{Message, MessageContent, NodeId, NodeRole};
use crate::ds_manager::Manager;
use crate::ds_metrics::RunResult;
use crate::ds_node::Node;
use crate::ds_random::GeneratorRegistry;
use crate::ds_tree::GroupTree;

/// Runs configurations one after the other.
#[derive(Debug, Clone, Default)]
pub struct ExperimentRunner {
    /// Reruns of an aborted run, each with a perturbed seed (default: 0)
    pub retries: usize,
}

impl ExperimentRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retries(retries: usize) -> Self {
        Self { retries }
    }

    /// Creates the tree, the nodes, the backup pool and the initial schedule.
    pub fn build_manager(config: &RunConfig) -> Result<Manager, SimError> {
        config.validate()?;

        let mut registry = GeneratorRegistry::new();
        let generator = registry.get(&config.seed);

        let mut groups = GroupTree::build(&config.tree_shape(), 0, &mut *generator.borrow_mut());
        let querier = groups.next_id();
        let querier_group = groups.attach_querier(querier, config.group_size)?;

        // ===== Nodes =====
        let mut nodes = BTreeMap::new();
        for group in groups.iter() {
            let role = if group.id == querier_group {
                NodeRole::Querier
            } else {
                match group.depth {
                    0 => NodeRole::Contributor,
                    1 => NodeRole::LeafAggregator,
                    _ => NodeRole::Aggregator,
                }
            };
            for member in &group.members {
                if nodes.contains_key(member) {
                    continue;
                }
                let mut node = Node::new(*member, generator.clone(), config.secret_value);
                node.assign(role, Some(group.id))?;
                nodes.insert(*member, node);
            }
        }

        // ===== Backups =====
        let backup_count = (groups.aggregator_count() as f64 * config.backup_to_aggregators_ratio).round() as u64;
        let first_backup = groups.next_id();
        let backup_ids: Vec<NodeId> = (first_backup..first_backup + backup_count).collect();
        for id in &backup_ids {
            let mut node = Node::new(*id, generator.clone(), config.secret_value);
            node.assign(NodeRole::Backup, None)?;
            nodes.insert(*id, node);
        }

        info!(
            "run \"{}\" ({}): {} contributors, {} aggregators, {} backups",
            config.seed,
            config.building_blocks.label(),
            groups.contributor_count(),
            groups.aggregator_count(),
            backup_ids.len()
        );

        let leaf_groups = groups.groups_at_depth(1);
        let checked_groups: Vec<Vec<NodeId>> = groups
            .iter()
            .filter(|g| g.depth >= 2 || g.id == querier_group)
            .map(|g| g.members.clone())
            .collect();

        let mut manager = Manager::new(
            config.clone(),
            nodes,
            groups,
            BackupPool::new(backup_ids),
            querier,
            generator,
        );

        // ===== Initial schedule =====
        let max_latency = config.max_latency();
        for group in leaf_groups {
            let members = manager.groups.distinct_members(group)?;
            let contributors = manager.groups.contributors_of(group)?;
            let Some(first) = members.first().copied() else {
                continue;
            };

            for contributor in contributors {
                manager.transmit(Message::new(first, contributor, 0.0, MessageContent::RequestContribution))?;
            }
            for member in members {
                let delay = if member == first { 3.0 * max_latency } else { 2.0 * max_latency };
                manager.enqueue(Message::new(member, member, 0.0, MessageContent::ContributionTimeout).at(delay))?;
            }
        }

        if config.health_check_period > 0.0 {
            let mut scheduled = Vec::new();
            for members in checked_groups {
                for member in members {
                    if scheduled.contains(&member) {
                        continue;
                    }
                    scheduled.push(member);
                    manager.enqueue(Message::new(member, member, 0.0, MessageContent::RequestHealthChecks).at(0.0))?;
                }
            }
        }

        Ok(manager)
    }

    pub fn single_run(&self, config: &RunConfig) -> Result<RunResult, SimError> {
        let mut attempt = 0;
        let mut current = config.clone();
        loop {
            let outcome = Self::build_manager(&current).and_then(|mut manager| {
                manager.run()?;
                Ok(manager.into_result())
            });
            match outcome {
                Ok(result) => return Ok(result),
                Err(e @ SimError::InvalidConfig(_)) => return Err(e),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    current.seed = format!("{}-retry-{}", config.seed, attempt);
                    warn!("run \"{}\" aborted ({}), retrying as \"{}\"", config.seed, e, current.seed);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs every configuration, stopping at the first aborted run.
    pub fn run_all(&self, configs: &[RunConfig]) -> Result<Vec<RunResult>, SimError> {
        let mut results = Vec::with_capacity(configs.len());
        for (index, config) in configs.iter().enumerate() {
            info!("run {}/{}", index + 1, configs.len());
            results.push(self.single_run(config)?);
        }
        Ok(results)
    }
}
