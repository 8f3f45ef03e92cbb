//! Discrete-event loop.
//!
//! The manager owns every node, the group table, the backup pool and the
//! message queue. It pops one message at a time, advances the global clock,
//! samples node failures up to that time and hands the message to its
//! receiver. Outputs of a handler get an id and, when the emitter left it
//! open, a sampled network latency before going back into the queue.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use rand::Rng;

use crate::ds_backups::BackupPool;
use crate::ds_config::{FailureHandling, FailurePropagation, RunConfig};
use crate::ds_error::SimError;
use crate::ds_interface::{Aggregate, Message, MessageContent, MessageId, NodeId, NodeRole, SimTime, StopStatus};
use crate::ds_metrics::{RoleCounts, RunResult, TrafficStats};
use crate::ds_node::{Node, SimContext};
use crate::ds_queue::MessageQueue;
use crate::ds_random::GeneratorHandle;
use crate::ds_tree::GroupTree;

pub struct Manager {
    config: RunConfig,
    pub nodes: BTreeMap<NodeId, Node>,
    pub groups: GroupTree,
    backups: BackupPool,
    queue: MessageQueue,
    archive: Vec<Message>,
    generator: GeneratorHandle,
    message_counter: MessageId,

    pub global_time: SimTime,
    last_failure_update: SimTime,
    failure_probability: f64,
    querier: NodeId,

    status: Option<StopStatus>,
    final_aggregate: Option<Aggregate>,
    expected_contributors: usize,
    initial_roles: RoleCounts,
    traffic: TrafficStats,
}

impl Manager {
    pub fn new(
        config: RunConfig,
        nodes: BTreeMap<NodeId, Node>,
        groups: GroupTree,
        backups: BackupPool,
        querier: NodeId,
        generator: GeneratorHandle,
    ) -> Self {
        let failure_probability = config.failure_probability();
        let expected_contributors = groups.contributor_count();
        let initial_roles = RoleCounts::count(&nodes);
        Self {
            config,
            nodes,
            groups,
            backups,
            queue: MessageQueue::new(),
            archive: Vec::new(),
            generator,
            message_counter: 0,
            global_time: 0.0,
            last_failure_update: 0.0,
            failure_probability,
            querier,
            status: None,
            final_aggregate: None,
            expected_contributors,
            initial_roles,
            traffic: TrafficStats::default(),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn querier(&self) -> NodeId {
        self.querier
    }

    pub fn status(&self) -> Option<StopStatus> {
        self.status
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_some()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn archive(&self) -> &[Message] {
        &self.archive
    }

    pub fn traffic(&self) -> &TrafficStats {
        &self.traffic
    }

    // ========================================================================
    // Queueing
    // ========================================================================

    fn next_id(&mut self) -> MessageId {
        let id = self.message_counter;
        self.message_counter += 1;
        id
    }

    /// Queues a message emitted by a node, sampling its latency if needed.
    /// Messages from dead emitters are lost.
    pub fn transmit(&mut self, mut message: Message) -> Result<(), SimError> {
        if let Some(emitter) = self.nodes.get(&message.emitter) {
            if !emitter.alive {
                self.traffic.messages_dropped += 1;
                return Ok(());
            }
        }

        message.id = self.next_id();
        if message.reception_time.is_none() {
            let spread: f64 = self.generator.borrow_mut().gen();
            let latency = 2.0 * self.config.average_latency * spread;
            message.reception_time = Some(message.emission_time + latency);
        }
        self.traffic.record_sent(&message, self.config.model_size);
        self.queue.push(message)
    }

    /// Queues a message as is. Used for messages the event loop itself
    /// originates (failure notices, stops, the initial schedule).
    pub fn enqueue(&mut self, mut message: Message) -> Result<(), SimError> {
        message.id = self.next_id();
        self.queue.push(message)
    }

    fn finish(&mut self, status: StopStatus, aggregate: Option<Aggregate>) {
        let dropped = self.queue.flush();
        if status.is_success() {
            info!(
                "[{:.1}] run stopped: {:?} ({} pending messages dropped)",
                self.global_time, status, dropped
            );
        } else {
            warn!(
                "[{:.1}] run stopped: {:?} ({} pending messages dropped)",
                self.global_time, status, dropped
            );
        }
        self.status = Some(status);
        self.final_aggregate = aggregate;
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    pub fn run(&mut self) -> Result<(), SimError> {
        while !self.is_finished() {
            self.handle_next_message()?;
        }
        Ok(())
    }

    pub fn handle_next_message(&mut self) -> Result<(), SimError> {
        if self.is_finished() {
            return Ok(());
        }
        let Some(next_time) = self.queue.peek_time() else {
            warn!("[{:.1}] queue ran dry before the querier concluded", self.global_time);
            self.finish(StopStatus::ExceededDeadline, None);
            return Ok(());
        };

        self.sample_failures(next_time)?;

        let Some(message) = self.queue.pop() else {
            return Ok(());
        };
        let time = message.reception_time.ok_or(SimError::MissingReceptionTime(message.id))?;
        if time > self.global_time {
            self.global_time = time;
        }
        if self.config.full_export {
            self.archive.push(message.clone());
        }

        match &message.content {
            MessageContent::StopSimulator { status, aggregate } => {
                self.finish(*status, *aggregate);
                Ok(())
            }
            MessageContent::Failing => self.handle_failing(message.receiver),
            _ => self.deliver_to_node(&message),
        }
    }

    fn deliver_to_node(&mut self, message: &Message) -> Result<(), SimError> {
        let node = self
            .nodes
            .get(&message.receiver)
            .ok_or(SimError::UnknownNode(message.receiver))?;
        if !node.alive {
            self.traffic.messages_dropped += 1;
            return Ok(());
        }
        if node.local_time > self.config.deadline {
            debug!("node {} passed the deadline at {:.1}", node.id, node.local_time);
            self.queue.flush();
            let stop = Message::new(
                message.receiver,
                message.receiver,
                self.global_time,
                MessageContent::StopSimulator {
                    status: StopStatus::ExceededDeadline,
                    aggregate: None,
                },
            )
            .at(self.global_time);
            return self.enqueue(stop);
        }

        self.traffic.record_delivered(message, self.config.model_size);
        let outputs = self.deliver(message)?;
        for output in outputs {
            self.transmit(output)?;
        }
        Ok(())
    }

    /// Runs the receiver's handler and returns what it emitted, without
    /// queueing anything.
    pub fn deliver(&mut self, message: &Message) -> Result<Vec<Message>, SimError> {
        let mut node = self
            .nodes
            .remove(&message.receiver)
            .ok_or(SimError::UnknownNode(message.receiver))?;
        let result = {
            let mut ctx = SimContext {
                config: &self.config,
                groups: &mut self.groups,
                backups: &mut self.backups,
                peers: &self.nodes,
            };
            node.receive_message(message, &mut ctx)
        };
        self.nodes.insert(message.receiver, node);
        result
    }

    // ========================================================================
    // Failures
    // ========================================================================

    /// Resamples liveness every `fail_check_period` up to `until`.
    fn sample_failures(&mut self, until: SimTime) -> Result<(), SimError> {
        if self.failure_probability <= 0.0 {
            return Ok(());
        }
        let period = self.config.fail_check_period;
        while self.last_failure_update + period <= until {
            self.last_failure_update += period;
            let tick = self.last_failure_update;

            let candidates: Vec<NodeId> = self
                .nodes
                .values()
                .filter(|n| n.alive && n.id != self.querier)
                .map(|n| n.id)
                .collect();
            for id in candidates {
                let draw: f64 = self.generator.borrow_mut().gen();
                if draw < self.failure_probability {
                    self.fail_node(id, tick)?;
                }
            }
            if self.is_finished() {
                break;
            }
        }
        Ok(())
    }

    /// Kills a node at `time` and schedules its failure notice.
    pub fn fail_node(&mut self, id: NodeId, time: SimTime) -> Result<(), SimError> {
        let node = self.nodes.get_mut(&id).ok_or(SimError::UnknownNode(id))?;
        if !node.alive {
            return Ok(());
        }
        node.kill(time);
        debug!("[{:.1}] {:?} {} dies", time, node.role, id);

        let notice = Message::new(id, id, time, MessageContent::Failing).at(time);
        self.enqueue(notice)?;
        self.check_group_dead(id, time)
    }

    /// Stops the run when every member of an unfinished aggregator group is
    /// dead.
    fn check_group_dead(&mut self, id: NodeId, time: SimTime) -> Result<(), SimError> {
        let Some(group) = self.nodes.get(&id).and_then(|n| n.position) else {
            return Ok(());
        };
        if !self.groups.contains(group, id) || Some(group) == self.groups.querier_group() {
            return Ok(());
        }
        if self.groups.group(group)?.depth == 0 {
            return Ok(());
        }

        let members = self.groups.distinct_members(group)?;
        let all_dead = members
            .iter()
            .all(|m| self.nodes.get(m).map(|n| !n.alive).unwrap_or(true));
        let none_finished = members
            .iter()
            .all(|m| self.nodes.get(m).map(|n| !n.finished_working).unwrap_or(true));
        if all_dead && none_finished {
            warn!("[{:.1}] every member of group {} is dead", time, group);
            let stop = Message::new(id, id, time, MessageContent::StopSimulator {
                status: StopStatus::GroupDead,
                aggregate: None,
            })
            .at(time);
            self.enqueue(stop)?;
        }
        Ok(())
    }

    /// Tells the parents of a dead node about it, once the detection delay
    /// elapsed, unless the failure no longer matters.
    fn handle_failing(&mut self, id: NodeId) -> Result<(), SimError> {
        let Some(node) = self.nodes.get(&id) else {
            return Err(SimError::UnknownNode(id));
        };
        let Some(group) = node.position else {
            return Ok(());
        };
        let Some(index) = self.groups.position_of(group, id) else {
            // already replaced or dropped
            return Ok(());
        };
        let role = node.role;
        let finished = node.finished_working;
        let parents = self.groups.parents(group)?.to_vec();
        let detected_at = self.global_time + self.config.detection_delay();
        let blocks = self.config.building_blocks;

        let mut notified: Vec<NodeId> = Vec::new();
        match role {
            NodeRole::Contributor => {
                let delivered = parents.iter().all(|p| {
                    self.nodes
                        .get(p)
                        .map(|parent| parent.contributions.contains_key(&id))
                        .unwrap_or(false)
                });
                if finished && delivered {
                    debug!("contributor {} died after delivering every share", id);
                    return Ok(());
                }
                for parent in parents {
                    if !notified.contains(&parent) {
                        notified.push(parent);
                    }
                }
            }
            NodeRole::LeafAggregator | NodeRole::Aggregator => {
                let Some(parent) = parents.get(index).copied() else {
                    return Ok(());
                };
                if blocks.failure_handling == FailureHandling::Drop && finished {
                    let parent_done = self
                        .nodes
                        .get(&parent)
                        .map(|p| p.finished_working || p.aggregates.contains_key(&id))
                        .unwrap_or(false);
                    match blocks.failure_propagation {
                        FailurePropagation::Local => return Ok(()),
                        FailurePropagation::Full if parent_done => return Ok(()),
                        FailurePropagation::Full => {
                            let stop = Message::new(id, id, self.global_time, MessageContent::StopSimulator {
                                status: StopStatus::FullFailurePropagation,
                                aggregate: None,
                            })
                            .at(self.global_time);
                            return self.enqueue(stop);
                        }
                    }
                }
                notified.push(parent);
            }
            _ => return Ok(()),
        }

        for parent in notified {
            let notice = Message::new(id, parent, self.global_time, MessageContent::HandleFailure { failed: id, group })
                .at(detected_at);
            self.enqueue(notice)?;
        }
        Ok(())
    }

    // ========================================================================
    // Result
    // ========================================================================

    pub fn into_result(self) -> RunResult {
        let status = self.status.unwrap_or(StopStatus::ExceededDeadline);
        let observed_contributors = match (status, self.final_aggregate) {
            (StopStatus::Success | StopStatus::BadResult, Some(aggregate)) => aggregate.counter,
            _ => 0,
        };
        let completeness = if self.expected_contributors > 0 {
            100.0 * observed_contributors as f64 / self.expected_contributors as f64
        } else {
            0.0
        };
        let work = self.nodes.values().map(|n| n.work).sum();
        let final_roles = RoleCounts::count(&self.nodes);
        let messages = if self.config.full_export { self.archive } else { Vec::new() };

        RunResult {
            config: self.config,
            status,
            latency: self.global_time,
            work,
            observed_contributors,
            expected_contributors: self.expected_contributors,
            completeness,
            final_aggregate: self.final_aggregate,
            traffic: self.traffic,
            initial_roles: self.initial_roles,
            final_roles,
            messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ds_random::generator_from_name;
    use crate::ds_runner::ExperimentRunner;
    use crate::ds_tree::TreeShape;

    #[test]
    fn test_empty_queue_exceeds_deadline() {
        let config = RunConfig::default();
        let shape = TreeShape {
            depth: 1,
            fanout: 2,
            group_size: 3,
            concentration: 0,
            random: false,
        };
        let generator = generator_from_name("empty");
        let groups = GroupTree::build(&shape, 0, &mut *generator.borrow_mut());
        let mut manager = Manager::new(config, BTreeMap::new(), groups, BackupPool::default(), 0, generator);

        manager.handle_next_message().unwrap();

        assert_eq!(manager.status(), Some(StopStatus::ExceededDeadline));
        assert!(manager.archive().is_empty());
    }

    #[test]
    fn test_dead_receiver_drops_message() {
        let config = RunConfig::default();
        let mut manager = ExperimentRunner::build_manager(&config).unwrap();
        let leaf = manager.groups.groups_at_depth(1)[0];
        let contributor = manager.groups.contributors_of(leaf).unwrap()[0];

        manager.fail_node(contributor, 0.0).unwrap();
        manager.run().unwrap();

        assert!(manager.is_finished());
        assert!(manager.traffic().messages_dropped >= 1);
        assert!(!manager.nodes[&contributor].alive);
    }

    #[test]
    fn test_querier_never_fails() {
        let mut config = RunConfig::default();
        config.failure_rate = 1.0;
        let mut manager = ExperimentRunner::build_manager(&config).unwrap();
        let querier = manager.querier();

        manager.run().unwrap();

        assert!(manager.nodes[&querier].alive);
        assert!(manager.nodes.values().filter(|n| n.id != querier).all(|n| !n.alive));
        assert_ne!(manager.status(), Some(StopStatus::Success));
    }

    fn finished_leaf_dies(parent_finished: bool) -> (usize, usize) {
        let config = RunConfig::default().with_strategy("Eager").unwrap();
        let mut manager = ExperimentRunner::build_manager(&config).unwrap();
        let leaf = manager.groups.groups_at_depth(1)[0];
        let member = manager.groups.group(leaf).unwrap().members[0];
        let parent = manager.groups.parents(leaf).unwrap()[0];

        manager.nodes.get_mut(&member).unwrap().finished_working = true;
        manager.nodes.get_mut(&parent).unwrap().finished_working = parent_finished;

        let before = manager.pending();
        manager.handle_failing(member).unwrap();
        (before, manager.pending())
    }

    #[test]
    fn test_dropped_member_stops_run_while_parent_works() {
        let (before, after) = finished_leaf_dies(false);
        assert_eq!(after, before + 1);
    }

    #[test]
    fn test_dropped_member_ignored_once_parent_finished() {
        let (before, after) = finished_leaf_dies(true);
        assert_eq!(after, before);
    }

    #[test]
    fn test_archive_kept_only_for_full_export() {
        let mut config = RunConfig::default();
        config.deadline = 500.0;
        let mut manager = ExperimentRunner::build_manager(&config).unwrap();
        manager.run().unwrap();
        assert!(manager.archive().is_empty());

        config.full_export = true;
        let mut manager = ExperimentRunner::build_manager(&config).unwrap();
        manager.run().unwrap();
        assert!(!manager.archive().is_empty());
    }

    #[test]
    fn test_local_deadline_stops_run() {
        let mut config = RunConfig::default();
        config.deadline = 500.0;
        let mut manager = ExperimentRunner::build_manager(&config).unwrap();

        manager.run().unwrap();

        assert_eq!(manager.status(), Some(StopStatus::ExceededDeadline));
        assert_eq!(manager.pending(), 0);
        let result = manager.into_result();
        assert_eq!(result.completeness, 0.0);
        assert!(!result.is_success());
    }
}
