//! Group tree topology.
//!
//! The tree is an indexed table of groups owned by the event loop. Nodes only
//! keep the id of the group they occupy; membership changes during recovery go
//! through [`GroupTree::replace_member`] and friends, so every member of a
//! group sees the same edit.

use hashbrown::HashMap;
use rand::Rng;

use crate::ds_error::SimError;
use crate::ds_interface::{GroupId, NodeId};

#[derive(Clone, Debug, PartialEq)]
pub struct Group {
    pub id: GroupId,
    /// Positions of this group, in order
    pub members: Vec<NodeId>,
    pub children: Vec<GroupId>,
    pub parent: Option<GroupId>,
    /// 0 for contributor groups
    pub depth: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TreeShape {
    pub depth: usize,
    pub fanout: usize,
    pub group_size: usize,
    pub concentration: u32,
    pub random: bool,
}

/// Number of contributors per contributor group.
///
/// `fanout^concentration`, or when `random` is set a seeded draw between half
/// and one and a half times that (at least one).
pub fn contributors_per_group<R: Rng>(shape: &TreeShape, rng: &mut R) -> usize {
    let base = (shape.fanout as f64).powi(shape.concentration as i32);
    if shape.random {
        let spread: f64 = rng.gen();
        ((base * (0.5 + spread)).round() as usize).max(1)
    } else {
        (base.round() as usize).max(1)
    }
}

#[derive(Clone, Debug, Default)]
pub struct GroupTree {
    groups: Vec<Group>,
    root: Option<GroupId>,
    querier_group: Option<GroupId>,
    slots: HashMap<NodeId, GroupId>,
    next_id: NodeId,
}

impl GroupTree {
    /// Builds the tree depth first, handing out contiguous id ranges starting
    /// at `first_id`.
    ///
    /// Contributor groups first get `group_size` ids like every other group,
    /// then their list is truncated or extended to the contributor count of
    /// [`contributors_per_group`]. The next group starts right after the kept
    /// members, so ids cut by a truncation go to the next sibling and ids added
    /// by an extension follow the group's last id.
    pub fn build<R: Rng>(shape: &TreeShape, first_id: NodeId, rng: &mut R) -> GroupTree {
        let mut tree = GroupTree::default();
        let (root, next_id) = tree.create_group(shape.depth, first_id, None, shape, rng);
        tree.root = Some(root);
        tree.next_id = next_id;
        tree
    }

    fn create_group<R: Rng>(
        &mut self,
        depth: usize,
        start: NodeId,
        parent: Option<GroupId>,
        shape: &TreeShape,
        rng: &mut R,
    ) -> (GroupId, NodeId) {
        let mut members: Vec<NodeId> = (start..start + shape.group_size as NodeId).collect();

        if depth == 0 {
            let count = contributors_per_group(shape, rng);
            if count < members.len() {
                members.truncate(count);
            } else {
                let extension = start + members.len() as NodeId;
                members.extend(extension..start + count as NodeId);
            }
        }

        let id = self.groups.len();
        let mut next = start + members.len() as NodeId;
        for member in &members {
            self.slots.insert(*member, id);
        }
        self.groups.push(Group {
            id,
            members,
            children: Vec::new(),
            parent,
            depth,
        });

        if depth > 0 {
            for _ in 0..shape.fanout {
                let (child, after) = self.create_group(depth - 1, next, Some(id), shape, rng);
                self.groups[id].children.push(child);
                next = after;
            }
        }

        (id, next)
    }

    /// Puts a single querier on top of the root group. The querier group lists
    /// the querier once per root member so every root position has a parent.
    pub fn attach_querier(&mut self, querier: NodeId, group_size: usize) -> Result<GroupId, SimError> {
        let root = self.root.ok_or(SimError::UnknownGroup(0))?;
        let id = self.groups.len();
        let depth = self.groups[root].depth + 1;

        self.groups.push(Group {
            id,
            members: vec![querier; group_size.max(1)],
            children: vec![root],
            parent: None,
            depth,
        });
        self.groups[root].parent = Some(id);
        self.slots.insert(querier, id);
        self.querier_group = Some(id);
        if querier >= self.next_id {
            self.next_id = querier + 1;
        }
        Ok(id)
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    pub fn next_id(&self) -> NodeId {
        self.next_id
    }

    pub fn root(&self) -> Option<GroupId> {
        self.root
    }

    pub fn querier_group(&self) -> Option<GroupId> {
        self.querier_group
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }

    pub fn group(&self, id: GroupId) -> Result<&Group, SimError> {
        self.groups.get(id).ok_or(SimError::UnknownGroup(id))
    }

    /// Group and position of a node.
    pub fn find_node(&self, node: NodeId) -> Option<(GroupId, usize)> {
        let group = *self.slots.get(&node)?;
        let index = self.groups[group].members.iter().position(|m| *m == node)?;
        Some((group, index))
    }

    pub fn position_of(&self, group: GroupId, node: NodeId) -> Option<usize> {
        self.groups.get(group)?.members.iter().position(|m| *m == node)
    }

    pub fn contains(&self, group: GroupId, node: NodeId) -> bool {
        self.position_of(group, node).is_some()
    }

    /// Members of the parent group, empty for the top group.
    pub fn parents(&self, group: GroupId) -> Result<&[NodeId], SimError> {
        match self.group(group)?.parent {
            Some(parent) => Ok(&self.group(parent)?.members),
            None => Ok(&[]),
        }
    }

    pub fn parent_at(&self, group: GroupId, index: usize) -> Result<Option<NodeId>, SimError> {
        Ok(self.parents(group)?.get(index).copied())
    }

    /// Members of a group without repetitions, in position order.
    pub fn distinct_members(&self, group: GroupId) -> Result<Vec<NodeId>, SimError> {
        let mut seen = Vec::new();
        for member in &self.group(group)?.members {
            if !seen.contains(member) {
                seen.push(*member);
            }
        }
        Ok(seen)
    }

    /// Sorted members of every child group (the contributors of a leaf
    /// aggregator group).
    pub fn contributors_of(&self, group: GroupId) -> Result<Vec<NodeId>, SimError> {
        let mut contributors = Vec::new();
        for child in &self.group(group)?.children {
            contributors.extend_from_slice(&self.group(*child)?.members);
        }
        contributors.sort_unstable();
        contributors.dedup();
        Ok(contributors)
    }

    /// Member at `index` of each child group, paired with the child group.
    pub fn children_at(&self, group: GroupId, index: usize) -> Result<Vec<(GroupId, NodeId)>, SimError> {
        let mut result = Vec::new();
        for child in &self.group(group)?.children {
            if let Some(member) = self.group(*child)?.members.get(index) {
                result.push((*child, *member));
            }
        }
        Ok(result)
    }

    /// Ids of groups at `level`, counted from the root (level 0).
    pub fn groups_at_level(&self, level: usize) -> Vec<GroupId> {
        let Some(root) = self.root else {
            return Vec::new();
        };
        let root_depth = self.groups[root].depth;
        if level > root_depth {
            return Vec::new();
        }
        self.groups_at_depth(root_depth - level)
    }

    /// Ids of tree groups at `depth` (0 = contributor groups), querier excluded.
    pub fn groups_at_depth(&self, depth: usize) -> Vec<GroupId> {
        self.groups
            .iter()
            .filter(|g| g.depth == depth && Some(g.id) != self.querier_group)
            .map(|g| g.id)
            .collect()
    }

    pub fn contributor_count(&self) -> usize {
        self.groups_at_depth(0)
            .iter()
            .map(|g| self.groups[*g].members.len())
            .sum()
    }

    pub fn aggregator_count(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.depth > 0 && Some(g.id) != self.querier_group)
            .map(|g| g.members.len())
            .sum()
    }

    // ------------------------------------------------------------------------
    // Recovery edits
    // ------------------------------------------------------------------------

    /// Puts `replacement` at the position `failed` held. Returns the position.
    pub fn replace_member(&mut self, group: GroupId, failed: NodeId, replacement: NodeId) -> Result<usize, SimError> {
        let index = self
            .position_of(group, failed)
            .ok_or(SimError::NotAMember { node: failed, group })?;
        self.groups[group].members[index] = replacement;
        self.slots.remove(&failed);
        self.slots.insert(replacement, group);
        Ok(index)
    }

    /// Drops a member from a group. Returns false when it was not there.
    pub fn remove_member(&mut self, group: GroupId, node: NodeId) -> bool {
        let Some(index) = self.position_of(group, node) else {
            return false;
        };
        self.groups[group].members.remove(index);
        self.slots.remove(&node);
        true
    }

    /// Detaches a child group from its parent. Returns false when it was not a
    /// child.
    pub fn remove_child(&mut self, parent: GroupId, child: GroupId) -> bool {
        let Some(group) = self.groups.get_mut(parent) else {
            return false;
        };
        let before = group.children.len();
        group.children.retain(|c| *c != child);
        before != group.children.len()
    }
}
