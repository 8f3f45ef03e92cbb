//! Contributor and leaf aggregator handlers.
//!
//! Every leaf aggregator member keeps its own contributor list under its own
//! id in `contributors_list`. With contributor sharing enabled, members
//! announce that list to each other and shrink it to the intersection of what
//! they hear, so all of them end up aggregating the same contributor set.
//!
//! When the leaves synchronize, a contributor pings every parent but pushes
//! its share to the first one only. The other members collect the pings for
//! a while, take the pingers as their preliminary contributor list and ask
//! each of them for the share of their position.

use log::{debug, info};

use crate::ds_config::Standby;
use crate::ds_error::SimError;
use crate::ds_interface::{aggregation_id, Aggregate, GroupId, Message, MessageContent, NodeId, NodeRole, Share, StopStatus};
use crate::ds_node::{normalized, split_secret, Node, SimContext};

impl Node {
    // ========================================================================
    // Contributor
    // ========================================================================

    pub(crate) fn handle_request_contribution(&mut self, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        self.expect_role(&[NodeRole::Contributor], "RequestContribution")?;
        if !self.shares.is_empty() {
            return Ok(Vec::new());
        }

        let (group, _) = self.slot(ctx, "RequestContribution")?;
        let parents = ctx.groups.parents(group)?.to_vec();

        let mut messages = Vec::new();
        if ctx.config.building_blocks.synchronization.synchronizes_leaves() {
            for parent in &parents {
                messages.push(self.send(*parent, MessageContent::ContributorPing));
            }
        }

        self.prepare_shares(ctx, parents.len());
        let per_share = ctx.config.average_crypto_time + ctx.config.average_compute_time;
        messages.push(self.timer(per_share * parents.len() as f64, MessageContent::PrepareContribution));
        Ok(messages)
    }

    fn prepare_shares(&mut self, ctx: &SimContext, parts: usize) {
        self.crypto(ctx, 2.0);
        self.spend(ctx.config.average_compute_time);
        let generator = self.generator.clone();
        self.shares = split_secret(self.secret, parts, &mut *generator.borrow_mut());
    }

    pub(crate) fn handle_prepare_contribution(&mut self, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        self.expect_role(&[NodeRole::Contributor], "PrepareContribution")?;
        let (group, _) = self.slot(ctx, "PrepareContribution")?;
        let parents = ctx.groups.parents(group)?.to_vec();

        let first_only = ctx.config.building_blocks.synchronization.synchronizes_leaves();

        let mut messages = Vec::new();
        for (index, parent) in parents.iter().enumerate() {
            if first_only && index > 0 {
                break;
            }
            if self.sent_contributions.contains(parent) {
                continue;
            }
            let Some(share) = self.shares.get(index).copied() else {
                continue;
            };
            self.sent_contributions.insert(*parent);
            messages.push(self.upload(ctx, *parent, MessageContent::SendContribution { share }));
        }
        self.finished_working = self.served_every_parent(&parents);
        Ok(messages)
    }

    fn served_every_parent(&self, parents: &[NodeId]) -> bool {
        parents.iter().all(|p| self.sent_contributions.contains(p))
    }

    /// Answers a (new) parent asking for the share of its position.
    fn contributor_request_data(&mut self, requester: NodeId, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        let (group, _) = self.slot(ctx, "RequestData")?;
        let parents = ctx.groups.parents(group)?.to_vec();
        let Some(index) = parents.iter().position(|p| *p == requester) else {
            debug!("contributor {} ignores data request from non-parent {}", self.id, requester);
            return Ok(Vec::new());
        };

        if self.shares.is_empty() {
            self.prepare_shares(ctx, parents.len());
        }
        let Some(share) = self.shares.get(index).copied() else {
            return Ok(Vec::new());
        };

        self.crypto(ctx, 3.0);
        self.sent_contributions.insert(requester);
        self.finished_working = self.served_every_parent(&parents);
        Ok(vec![self.upload(ctx, requester, MessageContent::SendContribution { share })])
    }

    // ========================================================================
    // Leaf aggregator
    // ========================================================================

    pub(crate) fn handle_contributor_ping(&mut self, contributor: NodeId, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        self.expect_role(&[NodeRole::LeafAggregator], "ContributorPing")?;
        let first = self.ping_list.is_empty();
        if !self.ping_list.contains(&contributor) {
            self.ping_list.push(contributor);
        }
        if first && self.own_contributors().is_none() {
            return Ok(vec![self.timer(ctx.config.max_latency(), MessageContent::PingTimeout)]);
        }
        Ok(Vec::new())
    }

    /// Turns the pings heard so far into the preliminary contributor list.
    /// Members other than the first ask every pinger for their share.
    pub(crate) fn handle_ping_timeout(&mut self, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        self.expect_role(&[NodeRole::LeafAggregator], "PingTimeout")?;
        let (group, index) = self.slot(ctx, "PingTimeout")?;
        if self.own_contributors().is_some() {
            return Ok(Vec::new());
        }

        let expected = ctx.groups.contributors_of(group)?;
        let pinged: Vec<NodeId> = self
            .ping_list
            .iter()
            .copied()
            .filter(|c| expected.contains(c))
            .collect();
        if pinged.is_empty() {
            // left to the contribution timeout
            return Ok(Vec::new());
        }
        self.expected_contributors = expected;
        self.set_own_contributors(pinged.clone());

        let mut messages = Vec::new();
        if index > 0 {
            for contributor in pinged {
                if !self.contributions.contains_key(&contributor) && self.queried_nodes.insert(contributor) {
                    messages.push(self.send(contributor, MessageContent::RequestData));
                }
            }
            if !messages.is_empty() {
                self.crypto(ctx, 2.0);
            }
        }

        messages.extend(self.announce_contributors(ctx, group)?);
        messages.extend(self.try_forward_leaf(ctx)?);
        Ok(messages)
    }

    pub(crate) fn handle_send_contribution(
        &mut self,
        contributor: NodeId,
        share: Share,
        ctx: &mut SimContext,
    ) -> Result<Vec<Message>, SimError> {
        self.expect_role(&[NodeRole::LeafAggregator], "SendContribution")?;
        let (group, _) = self.slot(ctx, "SendContribution")?;

        self.crypto(ctx, 3.0);
        self.contributions.insert(contributor, share);

        if self.own_contributors().is_none() {
            let expected = ctx.groups.contributors_of(group)?;
            self.expected_contributors = expected.clone();
            if !expected.is_empty() && expected.iter().all(|c| self.contributions.contains_key(c)) {
                self.set_own_contributors(expected);
            }
        }

        let mut messages = self.announce_contributors(ctx, group)?;
        messages.extend(self.try_forward_leaf(ctx)?);
        Ok(messages)
    }

    pub(crate) fn handle_confirm_contributors(
        &mut self,
        member: NodeId,
        contributors: &[NodeId],
        ctx: &mut SimContext,
    ) -> Result<Vec<Message>, SimError> {
        self.expect_role(&[NodeRole::LeafAggregator], "ConfirmContributors")?;
        let (group, _) = self.slot(ctx, "ConfirmContributors")?;

        let list = normalized(contributors);
        self.contributors_list.insert(member, list.clone());

        let Some(own) = self.own_contributors().cloned() else {
            if self.contacted_as_a_backup {
                return self.adopt_contributors(ctx, list);
            }
            // kept until this node's own list is known
            return Ok(Vec::new());
        };

        if !ctx.config.building_blocks.synchronization.shares_contributors() {
            return Ok(Vec::new());
        }

        let intersection: Vec<NodeId> = own.iter().copied().filter(|c| list.contains(c)).collect();
        if intersection != own {
            debug!("leaf {} narrows its contributors {} -> {}", self.id, own.len(), intersection.len());
            self.set_own_contributors(intersection);
        }

        let mut messages = self.announce_contributors(ctx, group)?;

        // a member that joined after the last announcement has not heard it
        if !self.confirmations_sent_to.contains(&member) {
            if let Some(own) = self.own_contributors().cloned() {
                self.confirmations_sent_to.insert(member);
                messages.push(self.send(member, MessageContent::ConfirmContributors { contributors: own }));
            }
        }

        messages.extend(self.try_forward_leaf(ctx)?);
        Ok(messages)
    }

    /// A backup that took a leaf slot learns the contributor set from its new
    /// group and asks the contributors for the shares it is missing.
    pub(crate) fn adopt_contributors(&mut self, ctx: &mut SimContext, contributors: Vec<NodeId>) -> Result<Vec<Message>, SimError> {
        let (group, _) = self.slot(ctx, "ConfirmContributors")?;
        self.synchronized = true;
        self.expected_contributors = contributors.clone();

        if ctx.config.building_blocks.standby == Standby::Stop
            && contributors.iter().any(|c| Self::peer_on_standby(ctx, *c))
        {
            info!("leaf backup {} cannot recover shares from stopped contributors", self.id);
            return self.propagate_failure(ctx, group);
        }

        self.set_own_contributors(contributors.clone());

        let mut messages = Vec::new();
        for contributor in contributors {
            if !self.contributions.contains_key(&contributor) && self.queried_nodes.insert(contributor) {
                messages.push(self.send(contributor, MessageContent::RequestData));
            }
        }
        if !messages.is_empty() {
            let delay = ctx.config.max_latency() + 3.0 * ctx.config.average_crypto_time;
            messages.push(self.timer(delay, MessageContent::SynchronizationTimeout));
        }

        messages.extend(self.announce_contributors(ctx, group)?);
        messages.extend(self.try_forward_leaf(ctx)?);
        Ok(messages)
    }

    pub(crate) fn handle_contribution_timeout(&mut self, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        self.expect_role(&[NodeRole::LeafAggregator], "ContributionTimeout")?;
        let (group, _) = self.slot(ctx, "ContributionTimeout")?;

        let expected = ctx.groups.contributors_of(group)?;
        let received: Vec<NodeId> = expected
            .into_iter()
            .filter(|c| self.contributions.contains_key(c))
            .collect();

        let synchronizes = ctx.config.building_blocks.synchronization.synchronizes_leaves();
        let own = match self.own_contributors() {
            // shares asked from the pingers may still be on their way
            Some(own) if synchronizes => own.clone(),
            Some(own) => own.iter().copied().filter(|c| received.contains(c)).collect(),
            None => received,
        };
        if own.is_empty() {
            info!("leaf {} received no contribution", self.id);
            return Ok(vec![self.stop(StopStatus::AllContributorsDead)]);
        }
        self.set_own_contributors(own);

        let mut messages = self.announce_contributors(ctx, group)?;
        if synchronizes {
            messages.push(self.timer(2.0 * ctx.config.max_latency(), MessageContent::SynchronizationTimeout));
        }
        messages.extend(self.try_forward_leaf(ctx)?);
        Ok(messages)
    }

    /// Last resort of the reconciliation: forward whatever data is at hand.
    pub(crate) fn handle_synchronization_timeout(&mut self, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        self.expect_role(&[NodeRole::LeafAggregator], "SynchronizationTimeout")?;
        let (group, index) = self.slot(ctx, "SynchronizationTimeout")?;

        let Some(own) = self.own_contributors().cloned() else {
            return Ok(Vec::new());
        };
        let available: Vec<NodeId> = own
            .into_iter()
            .filter(|c| self.contributions.contains_key(c))
            .collect();
        if available.is_empty() {
            info!("leaf {} has no share left after synchronization", self.id);
            return Ok(vec![self.stop(StopStatus::AllContributorsDead)]);
        }
        self.set_own_contributors(available);

        let mut messages = self.announce_contributors(ctx, group)?;
        if let Some(aggregate) = self.leaf_aggregate() {
            if self.should_forward(ctx, aggregate.id) {
                messages.extend(self.forward_aggregate(ctx, group, index, aggregate)?);
            }
        }
        Ok(messages)
    }

    pub(crate) fn resend_last_aggregate(&mut self, requester: NodeId, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        let Some(aggregate) = self.last_sent_aggregate else {
            // the regular forward goes to the new parent through the table
            return Ok(Vec::new());
        };
        self.crypto(ctx, 3.0);
        Ok(vec![self.upload(ctx, requester, MessageContent::SendAggregate { aggregate })])
    }

    /// Drops a failed contributor everywhere in the group and carries on
    /// with the others.
    pub(crate) fn drop_contributor(&mut self, failed: NodeId, child: GroupId, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        let (group, _) = self.slot(ctx, "HandleFailure")?;

        if ctx.groups.remove_member(child, failed) && ctx.groups.group(child)?.members.is_empty() {
            ctx.groups.remove_child(group, child);
        }
        self.contributions.shift_remove(&failed);
        if let Some(own) = self.own_contributors().cloned() {
            self.set_own_contributors(own.into_iter().filter(|c| *c != failed).collect());
        }

        let expected = ctx.groups.contributors_of(group)?;
        self.expected_contributors = expected.clone();
        if expected.is_empty() {
            info!("leaf {} lost all its contributors", self.id);
            return self.propagate_failure(ctx, group);
        }
        if self.own_contributors().is_none() && expected.iter().all(|c| self.contributions.contains_key(c)) {
            self.set_own_contributors(expected);
        }

        let mut messages = self.announce_contributors(ctx, group)?;
        messages.extend(self.try_forward_leaf(ctx)?);
        Ok(messages)
    }

    // ========================================================================
    // Leaf helpers
    // ========================================================================

    fn set_own_contributors(&mut self, contributors: Vec<NodeId>) {
        self.contributors_list.insert(self.id, normalized(&contributors));
    }

    /// Aggregate over the own contributor list, if every share is there.
    fn leaf_aggregate(&self) -> Option<Aggregate> {
        let own = self.own_contributors()?;
        if own.is_empty() {
            return None;
        }
        let shares = own
            .iter()
            .map(|c| self.contributions.get(c).copied())
            .collect::<Option<Vec<Share>>>()?;
        Some(Aggregate::from_shares(own, &shares))
    }

    /// Sends the own contributor list to the other members when it changed
    /// since the last announcement.
    fn announce_contributors(&mut self, ctx: &SimContext, group: GroupId) -> Result<Vec<Message>, SimError> {
        if !ctx.config.building_blocks.synchronization.shares_contributors() {
            return Ok(Vec::new());
        }
        let Some(own) = self.own_contributors().cloned() else {
            return Ok(Vec::new());
        };
        let id = aggregation_id(&own);
        if self.announced_contributors == Some(id) {
            return Ok(Vec::new());
        }
        self.announced_contributors = Some(id);

        let messages = self.to_group(ctx, group, MessageContent::ConfirmContributors { contributors: own })?;
        for message in &messages {
            self.confirmations_sent_to.insert(message.receiver);
        }
        Ok(messages)
    }

    fn try_forward_leaf(&mut self, ctx: &SimContext) -> Result<Vec<Message>, SimError> {
        let (group, index) = self.slot(ctx, "SendAggregate")?;
        let Some(aggregate) = self.leaf_aggregate() else {
            return Ok(Vec::new());
        };

        if ctx.config.building_blocks.synchronization.synchronizes_leaves() {
            let own = self.own_contributors().cloned().unwrap_or_default();
            for member in ctx.groups.distinct_members(group)? {
                if member != self.id && self.contributors_list.get(&member) != Some(&own) {
                    return Ok(Vec::new());
                }
            }
        }

        if !self.should_forward(ctx, aggregate.id) {
            return Ok(Vec::new());
        }
        self.forward_aggregate(ctx, group, index, aggregate)
    }

    pub(crate) fn handle_request_data(&mut self, requester: NodeId, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        if ctx.config.building_blocks.standby == Standby::Stop && self.finished_working {
            debug!("{} is on standby, ignores data request from {}", self.id, requester);
            return Ok(Vec::new());
        }
        match self.role {
            NodeRole::Contributor => self.contributor_request_data(requester, ctx),
            NodeRole::LeafAggregator | NodeRole::Aggregator => self.resend_last_aggregate(requester, ctx),
            _ => Err(self.unexpected("RequestData")),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ds_config::{RunConfig, Synchronization};
    use crate::ds_interface::{aggregation_id, Aggregate, MessageContent, StopStatus};
    use crate::ds_node::test_support::*;

    fn config(synchronization: Synchronization) -> RunConfig {
        let mut config = RunConfig::default();
        config.depth = 2;
        config.fanout = 2;
        config.group_size = 3;
        config.concentration = 1;
        config.building_blocks.synchronization = synchronization;
        config
    }

    // depth 2, fanout 2, group size 3: root 0..3, leaf groups 3..6 and 10..13,
    // contributor groups [6, 7], [8, 9], [13, 14], [15, 16]

    #[test]
    fn test_contributor_shares_to_every_parent() {
        let mut fixture = Fixture::new(config(Synchronization::NonBlocking));
        let mut contributor = fixture.node(6);

        let out = deliver(&mut contributor, &mut fixture, 3, MessageContent::RequestContribution);
        assert_eq!(kinds(&out), vec!["PrepareContribution"]);
        assert_eq!(contributor.shares().len(), 3);
        assert_eq!(contributor.shares().iter().fold(0i64, |a, s| a.wrapping_add(*s)), 50);

        // a second request is ignored
        assert!(deliver(&mut contributor, &mut fixture, 3, MessageContent::RequestContribution).is_empty());

        let out = deliver(&mut contributor, &mut fixture, 6, MessageContent::PrepareContribution);
        let receivers: Vec<u64> = out.iter().map(|m| m.receiver).collect();
        assert_eq!(receivers, vec![3, 4, 5]);
        assert!(contributor.finished_working);

        // each parent gets the share of its position, once
        for (message, share) in out.iter().zip(contributor.shares()) {
            assert_eq!(message.content, MessageContent::SendContribution { share: *share });
        }
        assert!(deliver(&mut contributor, &mut fixture, 6, MessageContent::PrepareContribution).is_empty());
    }

    #[test]
    fn test_synchronized_contributor_pushes_to_first_parent_only() {
        let mut fixture = Fixture::new(config(Synchronization::LeavesSynchronization));
        let mut contributor = fixture.node(6);

        let out = deliver(&mut contributor, &mut fixture, 3, MessageContent::RequestContribution);
        assert_eq!(kinds(&out), vec!["ContributorPing", "ContributorPing", "ContributorPing", "PrepareContribution"]);
        let pinged: Vec<u64> = out[..3].iter().map(|m| m.receiver).collect();
        assert_eq!(pinged, vec![3, 4, 5]);

        let out = deliver(&mut contributor, &mut fixture, 6, MessageContent::PrepareContribution);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].receiver, 3);
        assert_eq!(out[0].content, MessageContent::SendContribution { share: contributor.shares()[0] });
        assert!(!contributor.finished_working);

        // the other members pull the share of their position
        let out = deliver(&mut contributor, &mut fixture, 4, MessageContent::RequestData);
        assert_eq!(out[0].content, MessageContent::SendContribution { share: contributor.shares()[1] });
        assert!(!contributor.finished_working);

        let out = deliver(&mut contributor, &mut fixture, 5, MessageContent::RequestData);
        assert_eq!(out[0].receiver, 5);
        assert_eq!(out[0].content, MessageContent::SendContribution { share: contributor.shares()[2] });
        assert!(contributor.finished_working);
    }

    #[test]
    fn test_pinged_member_requests_shares_after_ping_timeout() {
        let mut fixture = Fixture::new(config(Synchronization::LeavesSynchronization));
        let mut leaf = fixture.node(4);

        let out = deliver(&mut leaf, &mut fixture, 6, MessageContent::ContributorPing);
        assert_eq!(kinds(&out), vec!["PingTimeout"]);
        for c in [7, 8, 9, 6] {
            assert!(deliver(&mut leaf, &mut fixture, c, MessageContent::ContributorPing).is_empty());
        }
        assert_eq!(leaf.own_contributors(), None);

        let out = deliver(&mut leaf, &mut fixture, 4, MessageContent::PingTimeout);
        assert_eq!(
            kinds(&out),
            vec!["RequestData", "RequestData", "RequestData", "RequestData", "ConfirmContributors", "ConfirmContributors"]
        );
        let asked: Vec<u64> = out[..4].iter().map(|m| m.receiver).collect();
        assert_eq!(asked, vec![6, 7, 8, 9]);
        assert_eq!(leaf.own_contributors(), Some(&vec![6, 7, 8, 9]));

        // the list survives the contribution timeout while shares are pending
        deliver(&mut leaf, &mut fixture, 6, MessageContent::SendContribution { share: 1 });
        let out = deliver(&mut leaf, &mut fixture, 4, MessageContent::ContributionTimeout);
        assert_eq!(kinds(&out), vec!["SynchronizationTimeout"]);
        assert_eq!(leaf.own_contributors(), Some(&vec![6, 7, 8, 9]));
    }

    #[test]
    fn test_first_member_waits_for_pushed_shares() {
        let mut fixture = Fixture::new(config(Synchronization::LeavesSynchronization));
        let mut leaf = fixture.node(3);

        deliver(&mut leaf, &mut fixture, 6, MessageContent::ContributorPing);
        deliver(&mut leaf, &mut fixture, 7, MessageContent::ContributorPing);
        let out = deliver(&mut leaf, &mut fixture, 3, MessageContent::PingTimeout);

        assert_eq!(kinds(&out), vec!["ConfirmContributors", "ConfirmContributors"]);
        assert_eq!(leaf.own_contributors(), Some(&vec![6, 7]));
        assert!(deliver(&mut leaf, &mut fixture, 3, MessageContent::PingTimeout).is_empty());
    }

    #[test]
    fn test_leaf_forwards_once_without_synchronization() {
        let mut fixture = Fixture::new(config(Synchronization::None));
        let mut leaf = fixture.node(3);

        assert!(deliver(&mut leaf, &mut fixture, 6, MessageContent::SendContribution { share: 10 }).is_empty());
        assert!(deliver(&mut leaf, &mut fixture, 7, MessageContent::SendContribution { share: 11 }).is_empty());
        assert!(deliver(&mut leaf, &mut fixture, 8, MessageContent::SendContribution { share: 12 }).is_empty());
        let out = deliver(&mut leaf, &mut fixture, 9, MessageContent::SendContribution { share: 13 });

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].receiver, 0);
        let expected = Aggregate::from_shares(&[6, 7, 8, 9], &[10, 11, 12, 13]);
        assert_eq!(out[0].content, MessageContent::SendAggregate { aggregate: expected });

        assert!(deliver(&mut leaf, &mut fixture, 0, MessageContent::ContributionTimeout).is_empty());
    }

    #[test]
    fn test_leaf_waits_for_members_under_leaves_synchronization() {
        let mut fixture = Fixture::new(config(Synchronization::LeavesSynchronization));
        let mut leaf = fixture.node(4);

        for (c, share) in [(6, 1), (7, 2), (8, 3)] {
            deliver(&mut leaf, &mut fixture, c, MessageContent::SendContribution { share });
        }
        let out = deliver(&mut leaf, &mut fixture, 9, MessageContent::SendContribution { share: 4 });
        // complete: announce to the two other members, no forward yet
        assert_eq!(kinds(&out), vec!["ConfirmContributors", "ConfirmContributors"]);

        let list = vec![6, 7, 8, 9];
        let out = deliver(&mut leaf, &mut fixture, 3, MessageContent::ConfirmContributors { contributors: list.clone() });
        assert!(out.is_empty());

        let out = deliver(&mut leaf, &mut fixture, 5, MessageContent::ConfirmContributors { contributors: list });
        assert_eq!(kinds(&out), vec!["SendAggregate"]);
        assert_eq!(out[0].receiver, 1);
    }

    #[test]
    fn test_non_blocking_resends_on_narrower_set() {
        let mut fixture = Fixture::new(config(Synchronization::NonBlocking));
        let mut leaf = fixture.node(3);

        for (c, share) in [(6, 1), (7, 2), (8, 3)] {
            deliver(&mut leaf, &mut fixture, c, MessageContent::SendContribution { share });
        }
        let out = deliver(&mut leaf, &mut fixture, 9, MessageContent::SendContribution { share: 4 });
        assert_eq!(kinds(&out), vec!["ConfirmContributors", "ConfirmContributors", "SendAggregate"]);

        // a member missed contributor 9
        let out = deliver(&mut leaf, &mut fixture, 4, MessageContent::ConfirmContributors { contributors: vec![6, 7, 8] });
        assert_eq!(kinds(&out), vec!["ConfirmContributors", "ConfirmContributors", "SendAggregate"]);
        let narrowed = Aggregate::from_shares(&[6, 7, 8], &[1, 2, 3]);
        assert_eq!(out[2].content, MessageContent::SendAggregate { aggregate: narrowed });

        // same list again changes nothing
        let out = deliver(&mut leaf, &mut fixture, 5, MessageContent::ConfirmContributors { contributors: vec![6, 7, 8] });
        assert!(out.is_empty());
    }

    #[test]
    fn test_replacement_skips_aggregate_parent_already_has() {
        let mut fixture = Fixture::new(config(Synchronization::None));
        let mut leaf = fixture.node(3);
        leaf.parent_last_received_aggregate_id = Some(aggregation_id(&[6, 7, 8, 9]));

        for (c, share) in [(6, 1), (7, 2), (8, 3)] {
            deliver(&mut leaf, &mut fixture, c, MessageContent::SendContribution { share });
        }
        let out = deliver(&mut leaf, &mut fixture, 9, MessageContent::SendContribution { share: 4 });

        assert!(out.is_empty());
        assert!(leaf.finished_working);
        assert_eq!(leaf.last_sent_aggregate.map(|a| a.id), Some(aggregation_id(&[6, 7, 8, 9])));
    }

    #[test]
    fn test_timeout_without_contributions() {
        let mut fixture = Fixture::new(config(Synchronization::NonBlocking));
        let mut leaf = fixture.node(3);

        let out = deliver(&mut leaf, &mut fixture, 3, MessageContent::ContributionTimeout);
        assert_eq!(
            out[0].content,
            MessageContent::StopSimulator { status: StopStatus::AllContributorsDead, aggregate: None }
        );
    }

    #[test]
    fn test_timeout_forwards_partial_set() {
        let mut fixture = Fixture::new(config(Synchronization::NonBlocking));
        let mut leaf = fixture.node(3);

        deliver(&mut leaf, &mut fixture, 6, MessageContent::SendContribution { share: 5 });
        let out = deliver(&mut leaf, &mut fixture, 3, MessageContent::ContributionTimeout);

        assert_eq!(kinds(&out), vec!["ConfirmContributors", "ConfirmContributors", "SendAggregate"]);
        assert_eq!(leaf.own_contributors(), Some(&vec![6]));
    }

    #[test]
    fn test_dropped_contributor_completes_leaf() {
        let mut fixture = Fixture::new(config(Synchronization::None));
        let mut leaf = fixture.node(3);

        for (c, share) in [(6, 1), (7, 2), (8, 3)] {
            deliver(&mut leaf, &mut fixture, c, MessageContent::SendContribution { share });
        }
        let child = fixture.groups.find_node(9).unwrap().0;
        let out = deliver(&mut leaf, &mut fixture, 9, MessageContent::HandleFailure { failed: 9, group: child });

        assert_eq!(kinds(&out), vec!["SendAggregate"]);
        assert!(fixture.groups.find_node(9).is_none());
    }
}
