//! Errors aborting a simulation run.
//!
//! Protocol stops (`StopSimulator`) are not errors; they end up in the run
//! result. A `SimError` means the simulated state is inconsistent and the run
//! cannot continue.

use thiserror::Error;

use crate::ds_interface::{GroupId, NodeId, NodeRole};

#[derive(Debug, Error, PartialEq)]
pub enum SimError {
    /// A handler needs a tree position the node does not have
    #[error("node {node} is not in the tree (while handling {message})")]
    NotInTree { node: NodeId, message: &'static str },

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    /// Node {node} is not a member of group {group}
    #[error("node {node} is not a member of group {group}")]
    NotAMember { node: NodeId, group: GroupId },

    /// Message delivered to a role that has no handler for it
    #[error("{role:?} {node} cannot handle {message}")]
    UnexpectedMessage { node: NodeId, role: NodeRole, message: &'static str },

    #[error("invalid role transition {from:?} -> {to:?} for node {node}")]
    InvalidTransition { node: NodeId, from: NodeRole, to: NodeRole },

    #[error("message {0} has no reception time")]
    MissingReceptionTime(u64),

    #[error("unknown strategy {0}")]
    UnknownStrategy(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SimError {
    pub fn not_in_tree(node: NodeId, message: &'static str) -> Self {
        Self::NotInTree { node, message }
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
