//! Committee view from a single operator's perspective.

use crate::crypto::BlsPublicKey;
use crate::identifiers::OperatorId;

/// Validator public key bytes (compressed G1).
pub type ValidatorPublicKey = [u8; 48];

/// A committee member: id plus the BLS public key its share signs with.
#[derive(Debug, Clone)]
pub struct Operator {
    pub id: OperatorId,
    pub public_key: BlsPublicKey,
}

/// One operator's view of a validator committee.
///
/// Immutable for the lifetime of an instance: committees are fixed at
/// instance creation and never change mid-height.
#[derive(Debug, Clone)]
pub struct Share {
    /// The local operator's id.
    pub operator_id: OperatorId,
    /// The validator this committee operates.
    pub validator_pk: ValidatorPublicKey,
    /// Ordered committee roster.
    pub committee: Vec<Operator>,
}

impl Share {
    /// Committee size `N`.
    pub fn committee_size(&self) -> usize {
        self.committee.len()
    }

    /// Number of tolerated Byzantine faults `f = (N - 1) / 3`.
    pub fn fault_tolerance(&self) -> usize {
        (self.committee_size().saturating_sub(1)) / 3
    }

    /// Quorum threshold `N - f`, which equals `2f + 1` for `N = 3f + 1`.
    pub fn quorum_size(&self) -> usize {
        self.committee_size() - self.fault_tolerance()
    }

    /// Partial quorum threshold `f + 1`.
    pub fn partial_quorum_size(&self) -> usize {
        self.fault_tolerance() + 1
    }

    /// Whether `count` signers reach quorum.
    pub fn has_quorum(&self, count: usize) -> bool {
        count >= self.quorum_size()
    }

    /// Whether `count` signers reach a partial quorum.
    pub fn has_partial_quorum(&self, count: usize) -> bool {
        count >= self.partial_quorum_size()
    }

    /// Whether an operator belongs to the committee.
    pub fn is_member(&self, id: OperatorId) -> bool {
        self.committee.iter().any(|op| op.id == id)
    }

    /// Ordered operator ids.
    pub fn operator_ids(&self) -> Vec<OperatorId> {
        self.committee.iter().map(|op| op.id).collect()
    }

    /// Public key of one committee member.
    pub fn public_key(&self, id: OperatorId) -> Option<&BlsPublicKey> {
        self.committee
            .iter()
            .find(|op| op.id == id)
            .map(|op| &op.public_key)
    }

    /// Resolve public keys for a signer set, in signer order.
    ///
    /// Fails if any signer is not a committee member.
    pub fn public_keys(&self, signers: &[OperatorId]) -> Option<Vec<BlsPublicKey>> {
        signers
            .iter()
            .map(|id| self.public_key(*id).cloned())
            .collect()
    }
}
