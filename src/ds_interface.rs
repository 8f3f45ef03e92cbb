pub type NodeId = u64;
pub type GroupId = usize;
pub type MessageId = u64;

pub type SimTime = f64;
pub type Share = i64;

// lower 64 bits of a blake3 digest
pub type AggregationId = u64;

// bound of the additive noise used when splitting a secret into shares
pub const SHARE_NOISE_BOUND: i64 = 1 << 40;

// relative tolerance of the querier on the mean of the final aggregate
pub const RESULT_TOLERANCE: f64 = 0.0001;

// ============================================================================
// Roles
// ============================================================================

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum NodeRole {
    Unassigned,
    Contributor,
    LeafAggregator,
    Aggregator,
    Querier,
    Backup,
}

impl NodeRole {
    pub const ALL: [NodeRole; 6] = [
        NodeRole::Unassigned,
        NodeRole::Contributor,
        NodeRole::LeafAggregator,
        NodeRole::Aggregator,
        NodeRole::Querier,
        NodeRole::Backup,
    ];

    /// Role transitions are one-way: an unassigned node takes any role once,
    /// a backup is promoted into a vacated aggregator slot once.
    pub fn can_become(self, next: NodeRole) -> bool {
        match (self, next) {
            (NodeRole::Unassigned, NodeRole::Unassigned) => false,
            (NodeRole::Unassigned, _) => true,
            (NodeRole::Backup, NodeRole::LeafAggregator) => true,
            (NodeRole::Backup, NodeRole::Aggregator) => true,
            _ => false,
        }
    }

    pub fn is_aggregator(self) -> bool {
        matches!(self, NodeRole::LeafAggregator | NodeRole::Aggregator)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum StopStatus {
    Success,
    BadResult,
    GroupDead,
    SimultaneousFailures,
    ExceededDeadline,
    AllContributorsDead,
    OutOfBackup,
    FullFailurePropagation,
}

impl StopStatus {
    pub fn is_success(self) -> bool {
        self == StopStatus::Success
    }
}

// ============================================================================
// Aggregates
// ============================================================================

/// Partial sum travelling up the tree.
///
/// `counter` is the number of contributions folded in, `data` the wrapping sum
/// of the shares, `id` a digest of the contributor set (see [`aggregation_id`]).
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Aggregate {
    pub counter: u64,
    pub data: i64,
    pub id: AggregationId,
}

impl Aggregate {
    /// Aggregate over a leaf's contributions. The id only depends on the set of
    /// contributors, not on the order they are listed in.
    pub fn from_shares(contributors: &[NodeId], shares: &[Share]) -> Aggregate {
        let data = shares.iter().fold(0i64, |acc, s| acc.wrapping_add(*s));
        Aggregate {
            counter: contributors.len() as u64,
            data,
            id: aggregation_id(contributors),
        }
    }

    /// Combines child aggregates of disjoint subtrees.
    pub fn combine(parts: &[Aggregate]) -> Aggregate {
        let mut ids: Vec<AggregationId> = parts.iter().map(|a| a.id).collect();
        Aggregate {
            counter: parts.iter().map(|a| a.counter).sum(),
            data: parts.iter().fold(0i64, |acc, a| acc.wrapping_add(a.data)),
            id: combined_aggregation_id(&mut ids),
        }
    }
}

fn digest_to_id(hash: &blake3::Hash) -> AggregationId {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(bytes)
}

/// Digest of the sorted, de-duplicated contributor set.
pub fn aggregation_id(contributors: &[NodeId]) -> AggregationId {
    let mut sorted = contributors.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = blake3::Hasher::new();
    hasher.update(b"contributors");
    for id in &sorted {
        hasher.update(&id.to_le_bytes());
    }
    digest_to_id(&hasher.finalize())
}

/// Digest of the sorted ids of combined aggregates.
pub fn combined_aggregation_id(ids: &mut [AggregationId]) -> AggregationId {
    ids.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    hasher.update(b"aggregates");
    for id in ids.iter() {
        hasher.update(&id.to_le_bytes());
    }
    digest_to_id(&hasher.finalize())
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub enum BackupDecision {
    Accepted {
        group: GroupId,
        failed: NodeId,
        // what the parent already holds from the failed member
        parent_last_received_aggregate_id: Option<AggregationId>,
    },
    Declined,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub enum MessageContent {
    // contribution phase
    RequestContribution,
    PrepareContribution,
    ContributorPing,
    PingTimeout,
    SendContribution { share: Share },
    ContributionTimeout,

    // reconciliation
    ConfirmContributors { contributors: Vec<NodeId> },
    SynchronizationTimeout,
    SendAggregate { aggregate: Aggregate },
    ConfirmChildren { children: Vec<GroupId> },

    // liveness
    RequestHealthChecks,
    CheckHealth,
    HealthCheckResponse,
    HealthCheckTimeout,

    // failures and recovery
    Failing,
    HandleFailure { failed: NodeId, group: GroupId },
    GiveUpChild { group: GroupId },
    ContactBackup { failed: NodeId, group: GroupId },
    BackupResponse { available: bool, failed: NodeId, group: GroupId },
    ConfirmBackup { decision: BackupDecision },
    ContinueMulticast { failed: NodeId, group: GroupId },
    NotifyGroup { group: GroupId },
    NotifyGroupTimeout,
    SendChildren,
    RequestData,

    StopSimulator { status: StopStatus, aggregate: Option<Aggregate> },
}

impl MessageContent {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageContent::RequestContribution => "RequestContribution",
            MessageContent::PrepareContribution => "PrepareContribution",
            MessageContent::ContributorPing => "ContributorPing",
            MessageContent::PingTimeout => "PingTimeout",
            MessageContent::SendContribution { .. } => "SendContribution",
            MessageContent::ContributionTimeout => "ContributionTimeout",
            MessageContent::ConfirmContributors { .. } => "ConfirmContributors",
            MessageContent::SynchronizationTimeout => "SynchronizationTimeout",
            MessageContent::SendAggregate { .. } => "SendAggregate",
            MessageContent::ConfirmChildren { .. } => "ConfirmChildren",
            MessageContent::RequestHealthChecks => "RequestHealthChecks",
            MessageContent::CheckHealth => "CheckHealth",
            MessageContent::HealthCheckResponse => "HealthCheckResponse",
            MessageContent::HealthCheckTimeout => "HealthCheckTimeout",
            MessageContent::Failing => "Failing",
            MessageContent::HandleFailure { .. } => "HandleFailure",
            MessageContent::GiveUpChild { .. } => "GiveUpChild",
            MessageContent::ContactBackup { .. } => "ContactBackup",
            MessageContent::BackupResponse { .. } => "BackupResponse",
            MessageContent::ConfirmBackup { .. } => "ConfirmBackup",
            MessageContent::ContinueMulticast { .. } => "ContinueMulticast",
            MessageContent::NotifyGroup { .. } => "NotifyGroup",
            MessageContent::NotifyGroupTimeout => "NotifyGroupTimeout",
            MessageContent::SendChildren => "SendChildren",
            MessageContent::RequestData => "RequestData",
            MessageContent::StopSimulator { .. } => "StopSimulator",
        }
    }

    /// Messages that carry model-sized payloads.
    pub fn carries_data(&self) -> bool {
        matches!(
            self,
            MessageContent::SendContribution { .. } | MessageContent::SendAggregate { .. }
        )
    }

    /// Messages interpreted by the event loop instead of a node handler.
    pub fn is_manager_message(&self) -> bool {
        matches!(
            self,
            MessageContent::Failing | MessageContent::StopSimulator { .. }
        )
    }
}

/// Timestamped envelope. The event loop assigns `id` on enqueue and samples a
/// reception time for messages emitted without one.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Message {
    pub id: MessageId,
    pub emission_time: SimTime,
    pub reception_time: Option<SimTime>,
    pub emitter: NodeId,
    pub receiver: NodeId,
    pub content: MessageContent,
}

impl Message {
    pub fn new(emitter: NodeId, receiver: NodeId, emission_time: SimTime, content: MessageContent) -> Self {
        Message {
            id: 0,
            emission_time,
            reception_time: None,
            emitter,
            receiver,
            content,
        }
    }

    pub fn at(mut self, reception_time: SimTime) -> Self {
        self.reception_time = Some(reception_time);
        self
    }

    pub fn kind(&self) -> &'static str {
        self.content.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_role_transitions_are_one_way() {
        assert!(NodeRole::Unassigned.can_become(NodeRole::Contributor));
        assert!(NodeRole::Unassigned.can_become(NodeRole::Backup));
        assert!(NodeRole::Backup.can_become(NodeRole::Aggregator));
        assert!(NodeRole::Backup.can_become(NodeRole::LeafAggregator));

        assert!(!NodeRole::Backup.can_become(NodeRole::Querier));
        assert!(!NodeRole::Aggregator.can_become(NodeRole::Backup));
        assert!(!NodeRole::LeafAggregator.can_become(NodeRole::Aggregator));
        assert!(!NodeRole::Querier.can_become(NodeRole::Aggregator));
    }

    #[test]
    fn test_aggregation_id_ignores_duplicates() {
        assert_eq!(aggregation_id(&[3, 1, 2]), aggregation_id(&[1, 2, 3, 3]));
        assert_ne!(aggregation_id(&[1, 2, 3]), aggregation_id(&[1, 2]));
    }

    #[test]
    fn test_combine_sums_counters_and_data() {
        let a = Aggregate::from_shares(&[1, 2], &[10, -4]);
        let b = Aggregate::from_shares(&[3], &[7]);

        let ab = Aggregate::combine(&[a, b]);
        let ba = Aggregate::combine(&[b, a]);

        assert_eq!(ab.counter, 3);
        assert_eq!(ab.data, 13);
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_manager_messages() {
        assert!(MessageContent::Failing.is_manager_message());
        assert!(!MessageContent::RequestData.is_manager_message());
        assert!(MessageContent::SendContribution { share: 1 }.carries_data());
    }

    proptest! {
        #[test]
        fn aggregation_id_is_order_independent(mut ids in proptest::collection::vec(0u64..10_000, 0..40), seed in any::<u64>()) {
            let before = aggregation_id(&ids);
            // deterministic permutation driven by the seed
            let len = ids.len();
            if len > 1 {
                for i in 0..len {
                    let j = ((seed.wrapping_mul(i as u64 + 1)) % len as u64) as usize;
                    ids.swap(i, j);
                }
            }
            prop_assert_eq!(before, aggregation_id(&ids));
        }
    }
}
