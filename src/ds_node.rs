//! Protocol agent.
//!
//! A node is a state machine: the event loop hands it one message at a time
//! together with a [`SimContext`], the handler updates the node and returns
//! the messages it emits. Waiting is modelled by timers (messages to self);
//! timer handlers re-check the state and do nothing when the awaited
//! condition already resolved.
//!
//! Handlers are spread over three files by concern:
//! - `ds_contribution`: contributors and leaf aggregators
//! - `ds_aggregation`: aggregators and the querier
//! - `ds_recovery`: health checks, failures and backups

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashSet;
use indexmap::IndexMap;
use log::debug;
use rand::Rng;

use crate::ds_backups::BackupPool;
use crate::ds_config::{RunConfig, Standby, Synchronization};
use crate::ds_error::SimError;
use crate::ds_interface::{
    Aggregate, AggregationId, GroupId, Message, MessageContent, NodeId, NodeRole, Share, SimTime,
    StopStatus, SHARE_NOISE_BOUND,
};
use crate::ds_random::GeneratorHandle;
use crate::ds_tree::GroupTree;

/// What a handler may see and touch besides its own node.
pub struct SimContext<'a> {
    pub config: &'a RunConfig,
    pub groups: &'a mut GroupTree,
    pub backups: &'a mut BackupPool,
    /// Every other node, read only
    pub peers: &'a BTreeMap<NodeId, Node>,
}

/// Additive secret sharing: `parts - 1` random shares plus one that brings
/// the (wrapping) sum back to `secret`.
pub fn split_secret<R: Rng>(secret: Share, parts: usize, rng: &mut R) -> Vec<Share> {
    if parts == 0 {
        return Vec::new();
    }
    let mut shares: Vec<Share> = (0..parts - 1)
        .map(|_| rng.gen_range(-SHARE_NOISE_BOUND..=SHARE_NOISE_BOUND))
        .collect();
    let noise = shares.iter().fold(0i64, |acc, s| acc.wrapping_add(*s));
    shares.push(secret.wrapping_sub(noise));
    shares
}

pub(crate) fn normalized<T: Ord + Copy>(list: &[T]) -> Vec<T> {
    let mut sorted = list.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
}

#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub position: Option<GroupId>,
    pub role: NodeRole,
    pub local_time: SimTime,
    pub alive: bool,
    pub death_time: Option<SimTime>,
    /// Simulated crypto and compute time spent
    pub work: SimTime,

    pub finished_working: bool,
    pub contacted_as_a_backup: bool,
    /// Knows its children or contributors. False for a backup until its new
    /// group answered.
    pub synchronized: bool,

    pub(crate) generator: GeneratorHandle,
    pub(crate) secret: Share,

    // ===== Contributor =====
    pub(crate) shares: Vec<Share>,
    pub(crate) sent_contributions: HashSet<NodeId>,

    // ===== Leaf aggregator =====
    pub contributions: IndexMap<NodeId, Share>,
    pub expected_contributors: Vec<NodeId>,
    /// Contributor list per group member, own list under `self.id`
    pub contributors_list: IndexMap<NodeId, Vec<NodeId>>,
    pub(crate) ping_list: Vec<NodeId>,
    pub(crate) queried_nodes: BTreeSet<NodeId>,
    pub(crate) announced_contributors: Option<AggregationId>,
    pub(crate) confirmations_sent_to: HashSet<NodeId>,

    // ===== Aggregator / querier =====
    pub aggregates: IndexMap<NodeId, Aggregate>,
    /// Confirmed child groups per group member, own list under `self.id`
    pub confirmed_children: IndexMap<NodeId, Vec<GroupId>>,
    pub(crate) final_aggregates: IndexMap<AggregationId, IndexMap<NodeId, Aggregate>>,
    pub(crate) given_up_children: BTreeSet<GroupId>,

    pub last_sent_aggregate: Option<Aggregate>,
    pub parent_last_received_aggregate_id: Option<AggregationId>,

    // ===== Recovery =====
    pub(crate) ongoing_health_checks: BTreeSet<NodeId>,
    /// Failed node -> group, for every running backup search
    pub(crate) looking_for_backup: BTreeMap<NodeId, GroupId>,
    pub replaced_node: Option<NodeId>,
}

impl Node {
    pub fn new(id: NodeId, generator: GeneratorHandle, secret: Share) -> Self {
        Self {
            id,
            position: None,
            role: NodeRole::Unassigned,
            local_time: 0.0,
            alive: true,
            death_time: None,
            work: 0.0,
            finished_working: false,
            contacted_as_a_backup: false,
            synchronized: true,
            generator,
            secret,
            shares: Vec::new(),
            sent_contributions: HashSet::new(),
            contributions: IndexMap::new(),
            expected_contributors: Vec::new(),
            contributors_list: IndexMap::new(),
            ping_list: Vec::new(),
            queried_nodes: BTreeSet::new(),
            announced_contributors: None,
            confirmations_sent_to: HashSet::new(),
            aggregates: IndexMap::new(),
            confirmed_children: IndexMap::new(),
            final_aggregates: IndexMap::new(),
            given_up_children: BTreeSet::new(),
            last_sent_aggregate: None,
            parent_last_received_aggregate_id: None,
            ongoing_health_checks: BTreeSet::new(),
            looking_for_backup: BTreeMap::new(),
            replaced_node: None,
        }
    }

    /// One-way role change, see [`NodeRole::can_become`].
    pub fn assign(&mut self, role: NodeRole, position: Option<GroupId>) -> Result<(), SimError> {
        if !self.role.can_become(role) {
            return Err(SimError::InvalidTransition {
                node: self.id,
                from: self.role,
                to: role,
            });
        }
        self.role = role;
        self.position = position;
        Ok(())
    }

    pub fn last_sent_aggregate_id(&self) -> Option<AggregationId> {
        self.last_sent_aggregate.map(|a| a.id)
    }

    pub fn own_contributors(&self) -> Option<&Vec<NodeId>> {
        self.contributors_list.get(&self.id)
    }

    pub fn shares(&self) -> &[Share] {
        &self.shares
    }

    pub fn is_searching_backup(&self) -> bool {
        !self.looking_for_backup.is_empty()
    }

    pub fn kill(&mut self, time: SimTime) {
        if self.alive {
            self.alive = false;
            self.death_time = Some(time);
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    pub fn receive_message(&mut self, message: &Message, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        if let Some(reception) = message.reception_time {
            if reception > self.local_time {
                self.local_time = reception;
            }
        }

        debug!(
            "[{:.1}] {:?} {} <- {} : {}",
            self.local_time,
            self.role,
            self.id,
            message.emitter,
            message.kind()
        );

        if self.role == NodeRole::Backup && !Self::reaches_backup(&message.content) {
            self.buffer_before_join(message);
            return Ok(Vec::new());
        }

        let emitter = message.emitter;
        match &message.content {
            MessageContent::RequestContribution => self.handle_request_contribution(ctx),
            MessageContent::PrepareContribution => self.handle_prepare_contribution(ctx),
            MessageContent::ContributorPing => self.handle_contributor_ping(emitter, ctx),
            MessageContent::PingTimeout => self.handle_ping_timeout(ctx),
            MessageContent::SendContribution { share } => self.handle_send_contribution(emitter, *share, ctx),
            MessageContent::ContributionTimeout => self.handle_contribution_timeout(ctx),
            MessageContent::ConfirmContributors { contributors } => {
                self.handle_confirm_contributors(emitter, contributors, ctx)
            }
            MessageContent::SynchronizationTimeout => self.handle_synchronization_timeout(ctx),
            MessageContent::SendAggregate { aggregate } => self.handle_send_aggregate(emitter, *aggregate, ctx),
            MessageContent::ConfirmChildren { children } => self.handle_confirm_children(emitter, children, ctx),
            MessageContent::RequestHealthChecks => self.handle_request_health_checks(ctx),
            MessageContent::CheckHealth => Ok(vec![self.health_check_response(message)]),
            MessageContent::HealthCheckResponse => {
                self.ongoing_health_checks.remove(&emitter);
                Ok(Vec::new())
            }
            MessageContent::HealthCheckTimeout => self.handle_health_check_timeout(ctx),
            // the event loop acts on failures, nothing to do locally
            MessageContent::Failing => Ok(Vec::new()),
            MessageContent::HandleFailure { failed, group } => self.handle_failure(*failed, *group, ctx),
            MessageContent::GiveUpChild { group } => self.handle_give_up_child(*group, ctx),
            MessageContent::ContactBackup { failed, group } => Ok(vec![self.handle_contact_backup(emitter, *failed, *group, ctx)]),
            MessageContent::BackupResponse { available, failed, group } => {
                self.handle_backup_response(emitter, *available, *failed, *group, ctx)
            }
            MessageContent::ConfirmBackup { decision } => self.handle_confirm_backup(decision, ctx),
            MessageContent::ContinueMulticast { failed, group } => self.handle_continue_multicast(*failed, *group, ctx),
            MessageContent::NotifyGroup { group } => self.handle_notify_group(emitter, *group, ctx),
            MessageContent::NotifyGroupTimeout => self.handle_notify_group_timeout(),
            MessageContent::SendChildren => self.handle_send_children(ctx),
            MessageContent::RequestData => self.handle_request_data(emitter, ctx),
            MessageContent::StopSimulator { .. } => Err(self.unexpected(message.kind())),
        }
    }

    fn reaches_backup(content: &MessageContent) -> bool {
        matches!(
            content,
            MessageContent::ContactBackup { .. }
                | MessageContent::ConfirmBackup { .. }
                | MessageContent::CheckHealth
                | MessageContent::Failing
        )
    }

    /// A backup is written into the group table before it learns it was
    /// accepted, so members and children may already talk to it. Keep what
    /// they send for when it takes the slot.
    fn buffer_before_join(&mut self, message: &Message) {
        let emitter = message.emitter;
        match &message.content {
            MessageContent::SendContribution { share } => {
                self.contributions.insert(emitter, *share);
            }
            MessageContent::SendAggregate { aggregate } => {
                self.aggregates.insert(emitter, *aggregate);
            }
            MessageContent::ConfirmContributors { contributors } => {
                self.contributors_list.insert(emitter, normalized(contributors));
            }
            MessageContent::ConfirmChildren { children } => {
                self.confirmed_children.insert(emitter, normalized(children));
            }
            MessageContent::ContributorPing => {
                if !self.ping_list.contains(&emitter) {
                    self.ping_list.push(emitter);
                }
            }
            _ => debug!("backup {} ignores {}", self.id, message.kind()),
        }
    }

    // ========================================================================
    // Helpers shared by the handlers
    // ========================================================================

    pub(crate) fn unexpected(&self, message: &'static str) -> SimError {
        SimError::UnexpectedMessage {
            node: self.id,
            role: self.role,
            message,
        }
    }

    pub(crate) fn expect_role(&self, roles: &[NodeRole], message: &'static str) -> Result<(), SimError> {
        if roles.contains(&self.role) {
            Ok(())
        } else {
            Err(self.unexpected(message))
        }
    }

    /// Group and position of this node.
    pub(crate) fn slot(&self, ctx: &SimContext, message: &'static str) -> Result<(GroupId, usize), SimError> {
        let group = self.position.ok_or(SimError::not_in_tree(self.id, message))?;
        let index = ctx
            .groups
            .position_of(group, self.id)
            .ok_or(SimError::not_in_tree(self.id, message))?;
        Ok((group, index))
    }

    pub(crate) fn spend(&mut self, cost: SimTime) {
        self.local_time += cost;
        self.work += cost;
    }

    pub(crate) fn crypto(&mut self, ctx: &SimContext, operations: f64) {
        self.spend(operations * ctx.config.average_crypto_time);
    }

    pub(crate) fn send(&self, receiver: NodeId, content: MessageContent) -> Message {
        Message::new(self.id, receiver, self.local_time, content)
    }

    pub(crate) fn timer(&self, delay: SimTime, content: MessageContent) -> Message {
        Message::new(self.id, self.id, self.local_time, content).at(self.local_time + delay)
    }

    pub(crate) fn stop(&self, status: StopStatus) -> Message {
        self.timer(0.0, MessageContent::StopSimulator { status, aggregate: None })
    }

    /// Same content to every other member of the group.
    pub(crate) fn to_group(&self, ctx: &SimContext, group: GroupId, content: MessageContent) -> Result<Vec<Message>, SimError> {
        Ok(ctx
            .groups
            .distinct_members(group)?
            .into_iter()
            .filter(|m| *m != self.id)
            .map(|m| self.send(m, content.clone()))
            .collect())
    }

    /// Whether an aggregate with this id may go up, given what was sent before.
    pub(crate) fn should_forward(&self, ctx: &SimContext, id: AggregationId) -> bool {
        let blocks = &ctx.config.building_blocks;
        if blocks.synchronization == Synchronization::None {
            return self.last_sent_aggregate.is_none();
        }
        if blocks.standby == Standby::Stop && self.finished_working {
            return false;
        }
        self.last_sent_aggregate_id() != Some(id)
    }

    /// Sends an aggregate to the parent at this node's position, unless the
    /// parent already holds it.
    pub(crate) fn forward_aggregate(
        &mut self,
        ctx: &SimContext,
        group: GroupId,
        index: usize,
        aggregate: Aggregate,
    ) -> Result<Vec<Message>, SimError> {
        self.last_sent_aggregate = Some(aggregate);
        self.finished_working = true;

        if self.parent_last_received_aggregate_id == Some(aggregate.id) {
            debug!("{} skips forwarding, parent already has {:x}", self.id, aggregate.id);
            return Ok(Vec::new());
        }

        let parent = ctx
            .groups
            .parent_at(group, index)?
            .ok_or(SimError::not_in_tree(self.id, "SendAggregate"))?;
        Ok(vec![self.upload(ctx, parent, MessageContent::SendAggregate { aggregate })])
    }

    /// Data message, emitted once the payload went through the uplink.
    pub(crate) fn upload(&mut self, ctx: &SimContext, receiver: NodeId, content: MessageContent) -> Message {
        self.local_time += ctx.config.transmission_time();
        self.send(receiver, content)
    }

    /// Gives up on this node's group according to the propagation block.
    pub(crate) fn propagate_failure(&mut self, ctx: &SimContext, group: GroupId) -> Result<Vec<Message>, SimError> {
        use crate::ds_config::FailurePropagation;

        self.finished_working = true;
        match ctx.config.building_blocks.failure_propagation {
            FailurePropagation::Full => Ok(vec![self.stop(StopStatus::FullFailurePropagation)]),
            FailurePropagation::Local => {
                let mut parents = ctx.groups.parents(group)?.to_vec();
                parents.dedup();
                Ok(parents
                    .into_iter()
                    .map(|p| self.send(p, MessageContent::GiveUpChild { group }))
                    .collect())
            }
        }
    }

    /// Whether a peer finished its work and went on standby. Under the `Stop`
    /// block such a peer no longer answers data requests.
    pub(crate) fn peer_on_standby(ctx: &SimContext, peer: NodeId) -> bool {
        ctx.peers
            .get(&peer)
            .map(|p| p.alive && p.finished_working)
            .unwrap_or(false)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_assign_is_one_way() {
        let fixture = Fixture::new(RunConfig::default());
        let mut node = fixture.node(0);

        assert_eq!(node.role, NodeRole::Aggregator);
        assert!(node.assign(NodeRole::Backup, None).is_err());

        let mut backup = Node::new(900, crate::ds_random::generator_from_name("t"), 50);
        backup.assign(NodeRole::Backup, None).unwrap();
        backup.assign(NodeRole::LeafAggregator, Some(1)).unwrap();
        assert!(backup.assign(NodeRole::Backup, None).is_err());
    }

    #[test]
    fn test_check_health_answers_at_reception() {
        let mut fixture = Fixture::new(RunConfig::default());
        let mut node = fixture.node(3);
        node.local_time = 5000.0;

        let check = Message::new(0, 3, 100.0, MessageContent::CheckHealth).at(150.0);
        let replies = node.receive_message(&check, &mut fixture.ctx()).unwrap();

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].receiver, 0);
        assert_eq!(replies[0].emission_time, 150.0);
        assert_eq!(replies[0].content, MessageContent::HealthCheckResponse);
    }

    #[test]
    fn test_backup_buffers_data_before_joining() {
        let mut fixture = Fixture::new(RunConfig::default());
        let mut backup = Node::new(900, crate::ds_random::generator_from_name("t"), 50);
        backup.assign(NodeRole::Backup, None).unwrap();

        let aggregate = Aggregate::from_shares(&[1], &[5]);
        let out = deliver(&mut backup, &mut fixture, 7, MessageContent::SendAggregate { aggregate });

        assert!(out.is_empty());
        assert_eq!(backup.aggregates.get(&7), Some(&aggregate));
    }

    #[test]
    fn test_stop_simulator_is_not_for_nodes() {
        let mut fixture = Fixture::new(RunConfig::default());
        let mut node = fixture.node(0);
        let message = Message::new(0, 0, 0.0, MessageContent::StopSimulator {
            status: StopStatus::Success,
            aggregate: None,
        })
        .at(0.0);

        assert!(node.receive_message(&message, &mut fixture.ctx()).is_err());
    }

    #[test]
    fn test_split_secret_single_part() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(split_secret(42, 1, &mut rng), vec![42]);
        assert!(split_secret(42, 0, &mut rng).is_empty());
    }

    proptest! {
        #[test]
        fn shares_sum_to_secret(secret in any::<i64>(), parts in 1usize..12, seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let shares = split_secret(secret, parts, &mut rng);

            prop_assert_eq!(shares.len(), parts);
            let sum = shares.iter().fold(0i64, |acc, s| acc.wrapping_add(*s));
            prop_assert_eq!(sum, secret);
        }
    }
}
