// Run statistics

use std::collections::BTreeMap;

use crate::ds_config::RunConfig;
use crate::ds_interface::{Aggregate, Message, MessageContent, NodeId, NodeRole, SimTime, StopStatus};
use crate::ds_node::Node;

// ============================================================================
// Counters
// ============================================================================

/// Node population per role.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct RoleCounts {
    pub contributors: usize,
    pub leaf_aggregators: usize,
    pub aggregators: usize,
    pub backups: usize,
    /// Dead nodes, whatever their role
    pub dead: usize,
}

impl RoleCounts {
    pub fn count(nodes: &BTreeMap<NodeId, Node>) -> Self {
        let mut counts = RoleCounts::default();
        for node in nodes.values() {
            if !node.alive {
                counts.dead += 1;
            }
            match node.role {
                NodeRole::Contributor => counts.contributors += 1,
                NodeRole::LeafAggregator => counts.leaf_aggregators += 1,
                NodeRole::Aggregator => counts.aggregators += 1,
                NodeRole::Backup => counts.backups += 1,
                NodeRole::Querier | NodeRole::Unassigned => {}
            }
        }
        counts
    }
}

/// Network usage of a run. Timers (messages to self) are not counted.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct TrafficStats {
    pub messages_sent: usize,
    pub messages_delivered: usize,
    /// Sent by or to a dead node
    pub messages_dropped: usize,
    /// Model units leaving nodes
    pub bandwidth_out: f64,
    /// Model units reaching live nodes
    pub bandwidth_in: f64,
    pub by_kind: BTreeMap<&'static str, usize>,
}

impl TrafficStats {
    /// Size of a message on the wire: data messages carry a model, control
    /// messages count as one unit.
    pub fn size_of(content: &MessageContent, model_size: f64) -> f64 {
        if content.carries_data() {
            model_size
        } else {
            1.0
        }
    }

    pub fn record_sent(&mut self, message: &Message, model_size: f64) {
        if message.emitter == message.receiver {
            return;
        }
        self.messages_sent += 1;
        self.bandwidth_out += Self::size_of(&message.content, model_size);
        *self.by_kind.entry(message.kind()).or_insert(0) += 1;
    }

    pub fn record_delivered(&mut self, message: &Message, model_size: f64) {
        if message.emitter == message.receiver {
            return;
        }
        self.messages_delivered += 1;
        self.bandwidth_in += Self::size_of(&message.content, model_size);
    }
}

// ============================================================================
// Run Result
// ============================================================================

/// Outcome of one simulation run
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunResult {
    pub config: RunConfig,

    pub status: StopStatus,

    /// Global time when the run stopped
    pub latency: SimTime,

    /// Simulated crypto and compute time, summed over every node
    pub work: SimTime,

    /// Contributors counted in the final aggregate
    pub observed_contributors: u64,

    /// Contributors in the initial tree
    pub expected_contributors: usize,

    /// observed / expected, in percent
    pub completeness: f64,

    pub final_aggregate: Option<Aggregate>,

    pub traffic: TrafficStats,

    pub initial_roles: RoleCounts,
    pub final_roles: RoleCounts,

    /// Every processed message, only kept with `full_export`
    pub messages: Vec<Message>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn print_summary(&self) {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║    DISSEC AGGREGATION RUN                              ║");
        println!("╚════════════════════════════════════════════════════════╝\n");

        println!(
            "Strategy: {} | depth {} | fanout {} | group size {} | seed \"{}\"",
            self.config.building_blocks.label(),
            self.config.depth,
            self.config.fanout,
            self.config.group_size,
            self.config.seed
        );
        println!();

        println!("═══ Outcome ═══");
        println!("  Status: {:?}", self.status);
        println!("  Latency: {:.1}", self.latency);
        println!(
            "  Completeness: {:.1}% ({} / {} contributors)",
            self.completeness, self.observed_contributors, self.expected_contributors
        );
        if let Some(aggregate) = &self.final_aggregate {
            println!("  Aggregate: sum {} over {} contributions", aggregate.data, aggregate.counter);
        }
        println!("  Work: {:.1}", self.work);
        println!();

        println!("═══ Population ═══");
        println!(
            "  Initial: {} contributors, {} leaf aggregators, {} aggregators, {} backups",
            self.initial_roles.contributors,
            self.initial_roles.leaf_aggregators,
            self.initial_roles.aggregators,
            self.initial_roles.backups
        );
        println!(
            "  Final: {} contributors, {} leaf aggregators, {} aggregators, {} backups, {} dead",
            self.final_roles.contributors,
            self.final_roles.leaf_aggregators,
            self.final_roles.aggregators,
            self.final_roles.backups,
            self.final_roles.dead
        );
        println!();

        println!("═══ Traffic ═══");
        println!(
            "  Messages: {} sent, {} delivered, {} dropped",
            self.traffic.messages_sent, self.traffic.messages_delivered, self.traffic.messages_dropped
        );
        println!(
            "  Bandwidth: {:.1} out, {:.1} in",
            self.traffic.bandwidth_out, self.traffic.bandwidth_in
        );
        for (kind, count) in &self.traffic.by_kind {
            println!("    {:<24} {}", kind, count);
        }
        println!();
    }
}
