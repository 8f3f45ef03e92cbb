//! Liveness checks, failure handling and the backup join protocol.
//!
//! A parent that detects a dead child (through a health check or a failure
//! notice from the event loop) multicasts to a few backups from the pool.
//! The first available backup takes the failed slot in the group table and
//! learns the group state from the surviving members, or from the table alone
//! when it is the last member.

use log::{debug, info, warn};

use crate::ds_config::{FailureHandling, Standby};
use crate::ds_error::SimError;
use crate::ds_interface::{BackupDecision, GroupId, Message, MessageContent, NodeId, NodeRole, StopStatus};
use crate::ds_node::{Node, SimContext};

impl Node {
    // ========================================================================
    // Health checks
    // ========================================================================

    /// Children watched by this node: its position in every child group, or
    /// every root member for the querier.
    fn watched(&self, ctx: &SimContext) -> Result<Vec<(GroupId, NodeId)>, SimError> {
        if self.role == NodeRole::Querier {
            let root = ctx.groups.root().ok_or(SimError::not_in_tree(self.id, "RequestHealthChecks"))?;
            return Ok(ctx
                .groups
                .distinct_members(root)?
                .into_iter()
                .map(|m| (root, m))
                .collect());
        }
        let (group, index) = self.slot(ctx, "RequestHealthChecks")?;
        ctx.groups.children_at(group, index)
    }

    pub(crate) fn handle_request_health_checks(&mut self, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        self.expect_role(&[NodeRole::Aggregator, NodeRole::Querier], "RequestHealthChecks")?;
        let period = ctx.config.health_check_period;
        if period <= 0.0 {
            return Ok(Vec::new());
        }
        if ctx.config.building_blocks.standby == Standby::Stop && self.finished_working {
            return Ok(Vec::new());
        }

        let mut messages = Vec::new();
        for (_, child) in self.watched(ctx)? {
            if self.looking_for_backup.contains_key(&child) {
                continue;
            }
            self.ongoing_health_checks.insert(child);
            messages.push(self.send(child, MessageContent::CheckHealth));
        }
        messages.push(self.timer(2.0 * ctx.config.max_latency(), MessageContent::HealthCheckTimeout));
        messages.push(self.timer(period, MessageContent::RequestHealthChecks));
        Ok(messages)
    }

    /// Emitted at the reception time of the check, whatever the local clock
    /// says.
    pub(crate) fn health_check_response(&self, check: &Message) -> Message {
        let at = check.reception_time.unwrap_or(self.local_time);
        Message::new(self.id, check.emitter, at, MessageContent::HealthCheckResponse)
    }

    pub(crate) fn handle_health_check_timeout(&mut self, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        self.expect_role(&[NodeRole::Aggregator, NodeRole::Querier], "HealthCheckTimeout")?;
        let silent = std::mem::take(&mut self.ongoing_health_checks);
        if silent.is_empty() {
            return Ok(Vec::new());
        }

        let watched = self.watched(ctx)?;
        let mut messages = Vec::new();
        for child in silent {
            let Some((group, _)) = watched.iter().find(|(_, m)| *m == child).copied() else {
                continue;
            };
            if ctx.config.building_blocks.failure_handling == FailureHandling::Drop
                && self.aggregates.contains_key(&child)
            {
                debug!("{} drops silent child {} that already delivered", self.id, child);
                continue;
            }
            info!("{:?} {} lost contact with {}", self.role, self.id, child);
            messages.extend(self.start_backup_search(child, group, ctx)?);
        }
        Ok(messages)
    }

    // ========================================================================
    // Failures
    // ========================================================================

    pub(crate) fn handle_failure(&mut self, failed: NodeId, group: GroupId, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        match self.role {
            NodeRole::LeafAggregator => self.drop_contributor(failed, group, ctx),
            NodeRole::Aggregator | NodeRole::Querier => self.start_backup_search(failed, group, ctx),
            _ => Err(self.unexpected("HandleFailure")),
        }
    }

    fn start_backup_search(&mut self, failed: NodeId, group: GroupId, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        if self.looking_for_backup.contains_key(&failed) || !ctx.groups.contains(group, failed) {
            return Ok(Vec::new());
        }
        self.looking_for_backup.insert(failed, group);
        // the replacement's data has to go up again
        self.finished_working = false;
        self.crypto(ctx, 1.0);
        self.multicast_round(failed, group, ctx)
    }

    fn multicast_round(&mut self, failed: NodeId, group: GroupId, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        let generator = self.generator.clone();
        let drawn = ctx
            .backups
            .draw(ctx.config.multicast_size, &mut *generator.borrow_mut());
        if drawn.is_empty() {
            warn!("{} found no backup left to replace {}", self.id, failed);
            self.looking_for_backup.remove(&failed);
            return Ok(vec![self.stop(StopStatus::OutOfBackup)]);
        }

        debug!("{} contacts {} backups for {}", self.id, drawn.len(), failed);
        let mut messages: Vec<Message> = drawn
            .into_iter()
            .map(|b| self.send(b, MessageContent::ContactBackup { failed, group }))
            .collect();
        messages.push(self.timer(
            2.0 * ctx.config.max_latency(),
            MessageContent::ContinueMulticast { failed, group },
        ));
        Ok(messages)
    }

    pub(crate) fn handle_continue_multicast(&mut self, failed: NodeId, group: GroupId, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        if self.looking_for_backup.get(&failed) != Some(&group) || !ctx.groups.contains(group, failed) {
            return Ok(Vec::new());
        }
        self.multicast_round(failed, group, ctx)
    }

    // ========================================================================
    // Backup join
    // ========================================================================

    pub(crate) fn handle_contact_backup(&mut self, searcher: NodeId, failed: NodeId, group: GroupId, ctx: &mut SimContext) -> Message {
        self.crypto(ctx, 2.0);
        let available = self.role == NodeRole::Backup && !self.contacted_as_a_backup;
        if available {
            self.contacted_as_a_backup = true;
        }
        self.send(searcher, MessageContent::BackupResponse { available, failed, group })
    }

    pub(crate) fn handle_backup_response(
        &mut self,
        backup: NodeId,
        available: bool,
        failed: NodeId,
        group: GroupId,
        ctx: &mut SimContext,
    ) -> Result<Vec<Message>, SimError> {
        self.expect_role(&[NodeRole::Aggregator, NodeRole::Querier], "BackupResponse")?;

        let still_needed = self.looking_for_backup.get(&failed) == Some(&group) && ctx.groups.contains(group, failed);
        if !available {
            return Ok(Vec::new());
        }
        if !still_needed {
            ctx.backups.release(backup);
            return Ok(vec![self.send(backup, MessageContent::ConfirmBackup { decision: BackupDecision::Declined })]);
        }

        self.looking_for_backup.remove(&failed);
        self.crypto(ctx, 3.0);
        ctx.groups.replace_member(group, failed, backup)?;
        self.ongoing_health_checks.remove(&failed);

        // data of the failed child now belongs to its replacement
        let held = self.aggregates.shift_remove(&failed);
        if let Some(aggregate) = held {
            self.aggregates.insert(backup, aggregate);
        }
        for by_member in self.final_aggregates.values_mut() {
            if let Some(aggregate) = by_member.shift_remove(&failed) {
                by_member.insert(backup, aggregate);
            }
        }

        info!("{:?} {} replaces {} with backup {} in group {}", self.role, self.id, failed, backup, group);
        let decision = BackupDecision::Accepted {
            group,
            failed,
            parent_last_received_aggregate_id: held.map(|a| a.id),
        };
        Ok(vec![self.send(backup, MessageContent::ConfirmBackup { decision })])
    }

    pub(crate) fn handle_confirm_backup(&mut self, decision: &BackupDecision, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        let (group, failed, parent_id) = match decision {
            BackupDecision::Declined => {
                self.contacted_as_a_backup = false;
                return Ok(Vec::new());
            }
            BackupDecision::Accepted {
                group,
                failed,
                parent_last_received_aggregate_id,
            } => (*group, *failed, *parent_last_received_aggregate_id),
        };
        if self.role != NodeRole::Backup {
            debug!("{} already joined, ignores a second acceptance", self.id);
            return Ok(Vec::new());
        }

        let role = if ctx.groups.group(group)?.depth <= 1 {
            NodeRole::LeafAggregator
        } else {
            NodeRole::Aggregator
        };
        self.assign(role, Some(group))?;
        self.replaced_node = Some(failed);
        self.parent_last_received_aggregate_id = parent_id;
        self.synchronized = false;
        self.finished_working = false;
        self.crypto(ctx, 3.0);

        let mut messages = self.to_group(ctx, group, MessageContent::NotifyGroup { group })?;
        if messages.is_empty() {
            // last member standing, the table is all there is to learn from
            return match role {
                NodeRole::LeafAggregator => {
                    let contributors = ctx.groups.contributors_of(group)?;
                    self.adopt_contributors(ctx, contributors)
                }
                _ => self.learn_children(ctx),
            };
        }
        let delay = 2.0 * ctx.config.max_latency() + 3.0 * ctx.config.average_crypto_time;
        messages.push(self.timer(delay, MessageContent::NotifyGroupTimeout));
        Ok(messages)
    }

    pub(crate) fn handle_notify_group(&mut self, backup: NodeId, group: GroupId, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        if self.position != Some(group) || !self.synchronized {
            return Ok(Vec::new());
        }
        self.crypto(ctx, 3.0);

        match self.role {
            NodeRole::LeafAggregator => {
                let contributors = match self.own_contributors() {
                    Some(own) => own.clone(),
                    None => ctx.groups.contributors_of(group)?,
                };
                self.confirmations_sent_to.insert(backup);
                Ok(vec![self.send(backup, MessageContent::ConfirmContributors { contributors })])
            }
            NodeRole::Aggregator => {
                // the backup reads its children from the table once told to
                Ok(vec![self.send(backup, MessageContent::SendChildren)])
            }
            _ => Err(self.unexpected("NotifyGroup")),
        }
    }

    pub(crate) fn handle_send_children(&mut self, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        if self.role != NodeRole::Aggregator || self.synchronized {
            return Ok(Vec::new());
        }
        debug!("backup {} learns its children", self.id);
        self.learn_children(ctx)
    }

    /// Asks the children at this position for the aggregates the backup does
    /// not hold yet and resumes health checks.
    fn learn_children(&mut self, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        self.synchronized = true;
        self.crypto(ctx, 3.0);
        let (group, index) = self.slot(ctx, "SendChildren")?;
        let children = ctx.groups.children_at(group, index)?;

        let missing: Vec<NodeId> = children
            .iter()
            .map(|(_, child)| *child)
            .filter(|child| !self.aggregates.contains_key(child))
            .collect();

        if ctx.config.building_blocks.standby == Standby::Stop
            && missing.iter().any(|child| Self::peer_on_standby(ctx, *child))
        {
            info!("backup {} cannot recover aggregates from stopped children", self.id);
            return self.propagate_failure(ctx, group);
        }

        let mut messages = Vec::new();
        for child in missing {
            if self.queried_nodes.insert(child) {
                messages.push(self.send(child, MessageContent::RequestData));
            }
        }
        if ctx.config.health_check_period > 0.0 {
            messages.push(self.timer(0.0, MessageContent::RequestHealthChecks));
        }
        messages.extend(self.try_forward_interior(ctx)?);
        Ok(messages)
    }

    pub(crate) fn handle_notify_group_timeout(&mut self) -> Result<Vec<Message>, SimError> {
        if self.synchronized {
            return Ok(Vec::new());
        }
        warn!("backup {} heard nothing from its group", self.id);
        Ok(vec![self.stop(StopStatus::SimultaneousFailures)])
    }
}

#[cfg(test)]
mod tests {
    use crate::ds_backups::BackupPool;
    use crate::ds_config::{FailureHandling, RunConfig};
    use crate::ds_interface::{aggregation_id, Aggregate, BackupDecision, Message, MessageContent, NodeRole, StopStatus};
    use crate::ds_node::test_support::*;
    use crate::ds_node::Node;
    use crate::ds_random::generator_from_name;

    fn config() -> RunConfig {
        let mut config = RunConfig::default();
        config.depth = 2;
        config.fanout = 2;
        config.group_size = 3;
        config.concentration = 1;
        config
    }

    // root members 0, 1, 2 with child groups 1 (3, 4, 5) and 4 (10, 11, 12)

    fn backup(id: u64) -> Node {
        let mut node = Node::new(id, generator_from_name("backup"), 50);
        node.assign(NodeRole::Backup, None).unwrap();
        node
    }

    #[test]
    fn test_failure_starts_single_search() {
        let mut fixture = Fixture::new(config());
        fixture.backups = BackupPool::new(vec![900, 901]);
        let mut aggregator = fixture.node(0);

        let out = deliver(&mut aggregator, &mut fixture, 3, MessageContent::HandleFailure { failed: 3, group: 1 });
        assert_eq!(kinds(&out), vec!["ContactBackup", "ContactBackup", "ContinueMulticast"]);
        assert!(fixture.backups.is_empty());
        assert!(aggregator.is_searching_backup());

        // a second notice for the same failure does nothing
        assert!(deliver(&mut aggregator, &mut fixture, 3, MessageContent::HandleFailure { failed: 3, group: 1 }).is_empty());

        let out = deliver(&mut aggregator, &mut fixture, 900, MessageContent::BackupResponse { available: true, failed: 3, group: 1 });
        assert_eq!(out[0].receiver, 900);
        assert!(matches!(
            out[0].content,
            MessageContent::ConfirmBackup { decision: BackupDecision::Accepted { group: 1, failed: 3, .. } }
        ));
        assert_eq!(fixture.groups.find_node(900), Some((1, 0)));
        assert!(!aggregator.is_searching_backup());

        // the slower backup goes back to the pool
        let out = deliver(&mut aggregator, &mut fixture, 901, MessageContent::BackupResponse { available: true, failed: 3, group: 1 });
        assert_eq!(out[0].content, MessageContent::ConfirmBackup { decision: BackupDecision::Declined });
        assert_eq!(fixture.backups.len(), 1);

        // the search is over
        assert!(deliver(&mut aggregator, &mut fixture, 0, MessageContent::ContinueMulticast { failed: 3, group: 1 }).is_empty());
    }

    #[test]
    fn test_unanswered_search_contacts_more_backups() {
        let mut fixture = Fixture::new(config());
        fixture.config.multicast_size = 5;
        fixture.backups = BackupPool::new((900..=905).collect());
        let mut aggregator = fixture.node(0);

        let out = deliver(&mut aggregator, &mut fixture, 3, MessageContent::HandleFailure { failed: 3, group: 1 });
        assert_eq!(out.iter().filter(|m| m.kind() == "ContactBackup").count(), 5);
        assert_eq!(out.last().map(|m| m.kind()), Some("ContinueMulticast"));

        // nobody answered in time
        let out = deliver(&mut aggregator, &mut fixture, 0, MessageContent::ContinueMulticast { failed: 3, group: 1 });
        assert_eq!(kinds(&out), vec!["ContactBackup", "ContinueMulticast"]);
        assert!(fixture.backups.is_empty());
        assert!(aggregator.is_searching_backup());

        let out = deliver(&mut aggregator, &mut fixture, 0, MessageContent::ContinueMulticast { failed: 3, group: 1 });
        assert_eq!(
            out[0].content,
            MessageContent::StopSimulator { status: StopStatus::OutOfBackup, aggregate: None }
        );
    }

    #[test]
    fn test_replacement_inherits_held_aggregate() {
        let mut fixture = Fixture::new(config());
        fixture.backups = BackupPool::new(vec![900]);
        let mut aggregator = fixture.node(0);
        let held = Aggregate::from_shares(&[6, 7], &[1, 2]);
        aggregator.aggregates.insert(3, held);

        deliver(&mut aggregator, &mut fixture, 3, MessageContent::HandleFailure { failed: 3, group: 1 });
        let out = deliver(&mut aggregator, &mut fixture, 900, MessageContent::BackupResponse { available: true, failed: 3, group: 1 });

        assert_eq!(aggregator.aggregates.get(&900), Some(&held));
        assert!(aggregator.aggregates.get(&3).is_none());
        assert!(matches!(
            out[0].content,
            MessageContent::ConfirmBackup {
                decision: BackupDecision::Accepted { parent_last_received_aggregate_id: Some(id), .. }
            } if id == aggregation_id(&[6, 7])
        ));
    }

    #[test]
    fn test_out_of_backups() {
        let mut fixture = Fixture::new(config());
        let mut aggregator = fixture.node(0);

        let out = deliver(&mut aggregator, &mut fixture, 3, MessageContent::HandleFailure { failed: 3, group: 1 });
        assert_eq!(
            out[0].content,
            MessageContent::StopSimulator { status: StopStatus::OutOfBackup, aggregate: None }
        );
    }

    #[test]
    fn test_backup_answers_once() {
        let mut fixture = Fixture::new(config());
        let mut node = backup(900);

        let out = deliver(&mut node, &mut fixture, 0, MessageContent::ContactBackup { failed: 3, group: 1 });
        assert_eq!(out[0].content, MessageContent::BackupResponse { available: true, failed: 3, group: 1 });

        let out = deliver(&mut node, &mut fixture, 2, MessageContent::ContactBackup { failed: 5, group: 1 });
        assert_eq!(out[0].content, MessageContent::BackupResponse { available: false, failed: 5, group: 1 });

        deliver(&mut node, &mut fixture, 0, MessageContent::ConfirmBackup { decision: BackupDecision::Declined });
        assert!(!node.contacted_as_a_backup);
    }

    #[test]
    fn test_aggregator_backup_joins() {
        let mut fixture = Fixture::new(config());
        let root = fixture.groups.root().unwrap();
        fixture.groups.replace_member(root, 1, 900).unwrap();
        let mut node = backup(900);
        node.contacted_as_a_backup = true;

        let decision = BackupDecision::Accepted { group: root, failed: 1, parent_last_received_aggregate_id: None };
        let out = deliver(&mut node, &mut fixture, 17, MessageContent::ConfirmBackup { decision });
        assert_eq!(kinds(&out), vec!["NotifyGroup", "NotifyGroup", "NotifyGroupTimeout"]);
        assert_eq!(node.role, NodeRole::Aggregator);
        assert_eq!(node.replaced_node, Some(1));
        assert!(!node.synchronized);

        let out = deliver(&mut node, &mut fixture, 0, MessageContent::SendChildren);
        assert_eq!(kinds(&out), vec!["RequestData", "RequestData", "RequestHealthChecks"]);
        let asked: Vec<u64> = out.iter().take(2).map(|m| m.receiver).collect();
        assert_eq!(asked, vec![4, 11]);

        assert!(deliver(&mut node, &mut fixture, 900, MessageContent::NotifyGroupTimeout).is_empty());
    }

    #[test]
    fn test_silent_group_stops_the_run() {
        let mut fixture = Fixture::new(config());
        fixture.groups.replace_member(1, 4, 900).unwrap();
        let mut node = backup(900);

        let decision = BackupDecision::Accepted { group: 1, failed: 4, parent_last_received_aggregate_id: None };
        deliver(&mut node, &mut fixture, 1, MessageContent::ConfirmBackup { decision });
        assert_eq!(node.role, NodeRole::LeafAggregator);

        let out = deliver(&mut node, &mut fixture, 900, MessageContent::NotifyGroupTimeout);
        assert_eq!(
            out[0].content,
            MessageContent::StopSimulator { status: StopStatus::SimultaneousFailures, aggregate: None }
        );
    }

    #[test]
    fn test_leaf_member_shares_its_list() {
        let mut fixture = Fixture::new(config());
        let mut leaf = fixture.node(3);

        let out = deliver(&mut leaf, &mut fixture, 900, MessageContent::NotifyGroup { group: 1 });
        assert_eq!(out[0].receiver, 900);
        assert_eq!(out[0].content, MessageContent::ConfirmContributors { contributors: vec![6, 7, 8, 9] });
    }

    #[test]
    fn test_health_check_round() {
        let mut fixture = Fixture::new(config());
        fixture.backups = BackupPool::new(vec![900]);
        let mut aggregator = fixture.node(0);

        let out = deliver(&mut aggregator, &mut fixture, 0, MessageContent::RequestHealthChecks);
        assert_eq!(kinds(&out), vec!["CheckHealth", "CheckHealth", "HealthCheckTimeout", "RequestHealthChecks"]);

        let reply = Message::new(3, 0, 0.0, MessageContent::HealthCheckResponse).at(aggregator.local_time);
        aggregator.receive_message(&reply, &mut fixture.ctx()).unwrap();

        let out = deliver(&mut aggregator, &mut fixture, 0, MessageContent::HealthCheckTimeout);
        assert_eq!(kinds(&out), vec!["ContactBackup", "ContinueMulticast"]);
        assert_eq!(out[0].content, MessageContent::ContactBackup { failed: 10, group: 4 });
    }

    #[test]
    fn test_drop_ignores_delivered_silent_child() {
        let mut config = config();
        config.building_blocks.failure_handling = FailureHandling::Drop;
        let mut fixture = Fixture::new(config);
        fixture.backups = BackupPool::new(vec![900]);
        let mut aggregator = fixture.node(0);
        aggregator.aggregates.insert(3, Aggregate::from_shares(&[6], &[1]));
        aggregator.aggregates.insert(10, Aggregate::from_shares(&[13], &[1]));

        deliver(&mut aggregator, &mut fixture, 0, MessageContent::RequestHealthChecks);
        let out = deliver(&mut aggregator, &mut fixture, 0, MessageContent::HealthCheckTimeout);

        assert!(out.is_empty());
        assert_eq!(fixture.backups.len(), 1);
    }
}
