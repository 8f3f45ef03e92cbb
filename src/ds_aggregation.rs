//! Aggregator and querier handlers.

use log::{debug, info, warn};

use crate::ds_error::SimError;
use crate::ds_interface::{Aggregate, GroupId, Message, MessageContent, NodeId, NodeRole, StopStatus, RESULT_TOLERANCE};
use crate::ds_node::{normalized, Node, SimContext};

impl Node {
    pub(crate) fn handle_send_aggregate(
        &mut self,
        child: NodeId,
        aggregate: Aggregate,
        ctx: &mut SimContext,
    ) -> Result<Vec<Message>, SimError> {
        match self.role {
            NodeRole::Aggregator => {
                self.aggregates.insert(child, aggregate);
                self.try_forward_interior(ctx)
            }
            NodeRole::Querier => self.querier_receive(child, aggregate, ctx),
            _ => Err(self.unexpected("SendAggregate")),
        }
    }

    /// Forwards once every child at this node's position has sent something.
    pub(crate) fn try_forward_interior(&mut self, ctx: &SimContext) -> Result<Vec<Message>, SimError> {
        if !self.synchronized {
            return Ok(Vec::new());
        }
        let (group, index) = self.slot(ctx, "SendAggregate")?;
        let children = ctx.groups.children_at(group, index)?;
        if children.is_empty() {
            return Ok(Vec::new());
        }

        let mut parts = Vec::with_capacity(children.len());
        for (_, child) in &children {
            match self.aggregates.get(child) {
                Some(aggregate) => parts.push(*aggregate),
                None => return Ok(Vec::new()),
            }
        }

        if ctx.config.building_blocks.synchronization.synchronizes_aggregators() {
            let own: Vec<GroupId> = normalized(&children.iter().map(|(g, _)| *g).collect::<Vec<_>>());
            let mut messages = Vec::new();
            if self.confirmed_children.get(&self.id) != Some(&own) {
                self.confirmed_children.insert(self.id, own.clone());
                messages = self.to_group(ctx, group, MessageContent::ConfirmChildren { children: own })?;
                for message in &messages {
                    self.confirmations_sent_to.insert(message.receiver);
                }
            }
            messages.extend(self.try_forward_confirmed(ctx)?);
            return Ok(messages);
        }

        let aggregate = Aggregate::combine(&parts);
        if !self.should_forward(ctx, aggregate.id) {
            return Ok(Vec::new());
        }
        self.forward_aggregate(ctx, group, index, aggregate)
    }

    /// Full synchronization: forward the children every member confirmed.
    fn try_forward_confirmed(&mut self, ctx: &SimContext) -> Result<Vec<Message>, SimError> {
        let (group, index) = self.slot(ctx, "ConfirmChildren")?;
        let Some(mut agreed) = self.confirmed_children.get(&self.id).cloned() else {
            return Ok(Vec::new());
        };

        for member in ctx.groups.distinct_members(group)? {
            if member == self.id {
                continue;
            }
            let Some(confirmed) = self.confirmed_children.get(&member) else {
                return Ok(Vec::new());
            };
            agreed.retain(|g| confirmed.contains(g));
        }
        if agreed.is_empty() {
            return Ok(Vec::new());
        }

        let mut parts = Vec::with_capacity(agreed.len());
        for (child_group, child) in ctx.groups.children_at(group, index)? {
            if !agreed.contains(&child_group) {
                continue;
            }
            match self.aggregates.get(&child) {
                Some(aggregate) => parts.push(*aggregate),
                None => return Ok(Vec::new()),
            }
        }

        let aggregate = Aggregate::combine(&parts);
        if !self.should_forward(ctx, aggregate.id) {
            return Ok(Vec::new());
        }
        self.forward_aggregate(ctx, group, index, aggregate)
    }

    pub(crate) fn handle_confirm_children(
        &mut self,
        member: NodeId,
        children: &[GroupId],
        ctx: &mut SimContext,
    ) -> Result<Vec<Message>, SimError> {
        self.expect_role(&[NodeRole::Aggregator], "ConfirmChildren")?;
        self.confirmed_children.insert(member, normalized(children));

        let mut messages = Vec::new();
        if !self.confirmations_sent_to.contains(&member) {
            if let Some(own) = self.confirmed_children.get(&self.id).cloned() {
                self.confirmations_sent_to.insert(member);
                messages.push(self.send(member, MessageContent::ConfirmChildren { children: own }));
            }
        }
        messages.extend(self.try_forward_confirmed(ctx)?);
        Ok(messages)
    }

    pub(crate) fn handle_give_up_child(&mut self, child: GroupId, ctx: &mut SimContext) -> Result<Vec<Message>, SimError> {
        self.expect_role(&[NodeRole::Aggregator, NodeRole::Querier], "GiveUpChild")?;
        if !self.given_up_children.insert(child) {
            return Ok(Vec::new());
        }

        let (group, _) = self.slot(ctx, "GiveUpChild")?;
        ctx.groups.remove_child(group, child);
        info!("{:?} {} gives up child group {}", self.role, self.id, child);

        if ctx.groups.group(group)?.children.is_empty() {
            if self.role == NodeRole::Querier {
                warn!("querier {} lost the whole tree", self.id);
                self.finished_working = true;
                return Ok(vec![self.stop(StopStatus::AllContributorsDead)]);
            }
            return self.propagate_failure(ctx, group);
        }

        match self.role {
            NodeRole::Aggregator => self.try_forward_interior(ctx),
            _ => Ok(Vec::new()),
        }
    }

    // ========================================================================
    // Querier
    // ========================================================================

    fn querier_receive(&mut self, member: NodeId, aggregate: Aggregate, ctx: &SimContext) -> Result<Vec<Message>, SimError> {
        if self.finished_working {
            return Ok(Vec::new());
        }
        self.aggregates.insert(member, aggregate);
        self.final_aggregates
            .entry(aggregate.id)
            .or_default()
            .insert(member, aggregate);
        self.try_finalize(ctx)
    }

    /// Ends the run once every root member delivered an aggregate over the
    /// same contributor set.
    pub(crate) fn try_finalize(&mut self, ctx: &SimContext) -> Result<Vec<Message>, SimError> {
        let root = ctx.groups.root().ok_or(SimError::not_in_tree(self.id, "SendAggregate"))?;
        let members = ctx.groups.distinct_members(root)?;

        let complete = self
            .final_aggregates
            .values()
            .find(|by_member| members.iter().all(|m| by_member.contains_key(m)));
        let Some(by_member) = complete else {
            return Ok(Vec::new());
        };

        let parts: Vec<Aggregate> = members.iter().filter_map(|m| by_member.get(m).copied()).collect();
        let total = Aggregate::combine(&parts);
        let contributors = total.counter / members.len().max(1) as u64;

        let status = if contributors == 0 {
            StopStatus::BadResult
        } else {
            let mean = total.data as f64 / contributors as f64;
            let secret = ctx.config.secret_value as f64;
            if (mean - secret).abs() <= secret.abs() * RESULT_TOLERANCE {
                StopStatus::Success
            } else {
                StopStatus::BadResult
            }
        };
        debug!("querier {} finalizes over {} contributors: {:?}", self.id, contributors, status);

        self.finished_working = true;
        let result = Aggregate {
            counter: contributors,
            data: total.data,
            id: parts.first().map(|a| a.id).unwrap_or(total.id),
        };
        Ok(vec![self.timer(
            0.0,
            MessageContent::StopSimulator { status, aggregate: Some(result) },
        )])
    }
}
