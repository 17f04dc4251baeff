//! QBFT consensus messages.

use dvq_types::{
    compute_signing_root, AggregateError, BlsSignature, DomainType, Height, MessageId, OperatorId,
    Round, SignatureBytes, SIG_TYPE_QBFT,
};
use serde::{Deserialize, Serialize};
use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};

/// Codec and signer-set errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("ssz decode failed: {0:?}")]
    Ssz(ssz::DecodeError),
    #[error("json codec failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message data is empty")]
    EmptyData,
    #[error("message has no signers")]
    NoSigners,
    #[error("duplicate signer {0}")]
    DuplicateSigner(OperatorId),
    #[error("overlapping signer sets")]
    OverlappingSigners,
    #[error("message roots differ, cannot aggregate")]
    RootMismatch,
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl From<ssz::DecodeError> for CodecError {
    fn from(e: ssz::DecodeError) -> Self {
        CodecError::Ssz(e)
    }
}

/// The four QBFT message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u64)]
pub enum MessageType {
    Proposal = 0,
    Prepare = 1,
    Commit = 2,
    RoundChange = 3,
}

impl MessageType {
    /// All types, in container-index order.
    pub const ALL: [MessageType; 4] = [
        MessageType::Proposal,
        MessageType::Prepare,
        MessageType::Commit,
        MessageType::RoundChange,
    ];

    fn from_u64(v: u64) -> Result<MessageType, ssz::DecodeError> {
        match v {
            0 => Ok(MessageType::Proposal),
            1 => Ok(MessageType::Prepare),
            2 => Ok(MessageType::Commit),
            3 => Ok(MessageType::RoundChange),
            other => Err(ssz::DecodeError::BytesInvalid(format!(
                "unknown message type {other}"
            ))),
        }
    }
}

impl ssz::Encode for MessageType {
    fn is_ssz_fixed_len() -> bool {
        true
    }

    fn ssz_fixed_len() -> usize {
        8
    }

    fn ssz_bytes_len(&self) -> usize {
        8
    }

    fn ssz_append(&self, buf: &mut Vec<u8>) {
        (*self as u64).ssz_append(buf)
    }
}

impl ssz::Decode for MessageType {
    fn is_ssz_fixed_len() -> bool {
        true
    }

    fn ssz_fixed_len() -> usize {
        8
    }

    fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, ssz::DecodeError> {
        MessageType::from_u64(u64::from_ssz_bytes(bytes)?)
    }
}

/// A QBFT message. `data` carries the SSZ-encoded type-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Message {
    pub msg_type: MessageType,
    pub height: Height,
    pub round: Round,
    pub identifier: MessageId,
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
}

fn u64_leaf(v: u64) -> [u8; 32] {
    let mut leaf = [0u8; 32];
    leaf[..8].copy_from_slice(&v.to_le_bytes());
    leaf
}

impl Message {
    /// Tree-hash root of the message, signed by every operator.
    pub fn hash_tree_root(&self) -> [u8; 32] {
        let mut leaves = Vec::with_capacity(5 * 32);
        leaves.extend_from_slice(&u64_leaf(self.msg_type as u64));
        leaves.extend_from_slice(&u64_leaf(self.height.0));
        leaves.extend_from_slice(&u64_leaf(self.round.0));
        leaves.extend_from_slice(&tree_hash::merkle_root(&self.identifier.0, 0).0);
        leaves.extend_from_slice(&tree_hash::merkle_root(&self.data, 0).0);
        tree_hash::merkle_root(&leaves, 0).0
    }

    /// Decode the payload as [`ProposalData`].
    pub fn proposal_data(&self) -> Result<ProposalData, CodecError> {
        Ok(ProposalData::from_ssz_bytes(&self.data)?)
    }

    /// Decode the payload as [`PrepareData`].
    pub fn prepare_data(&self) -> Result<PrepareData, CodecError> {
        Ok(PrepareData::from_ssz_bytes(&self.data)?)
    }

    /// Decode the payload as [`CommitData`].
    pub fn commit_data(&self) -> Result<CommitData, CodecError> {
        Ok(CommitData::from_ssz_bytes(&self.data)?)
    }

    /// Decode the payload as [`RoundChangeData`].
    pub fn round_change_data(&self) -> Result<RoundChangeData, CodecError> {
        Ok(RoundChangeData::from_ssz_bytes(&self.data)?)
    }

    /// The agreed-upon value this message carries, independent of type.
    ///
    /// For proposals this is the proposed value, for prepares/commits the
    /// echoed value. Round-change messages carry no current value.
    pub fn value(&self) -> Result<Vec<u8>, CodecError> {
        match self.msg_type {
            MessageType::Proposal => Ok(self.proposal_data()?.data),
            MessageType::Prepare => Ok(self.prepare_data()?.data),
            MessageType::Commit => Ok(self.commit_data()?.data),
            MessageType::RoundChange => Err(CodecError::EmptyData),
        }
    }
}

/// Payload of a PROPOSAL: the proposed value plus the evidence justifying it
/// for rounds above the first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode)]
pub struct ProposalData {
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
    pub round_change_justification: Vec<SignedMessage>,
    pub prepare_justification: Vec<SignedMessage>,
}

impl ProposalData {
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.data.is_empty() {
            return Err(CodecError::EmptyData);
        }
        Ok(())
    }
}

/// Payload of a PREPARE: the value being prepared.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode)]
pub struct PrepareData {
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
}

impl PrepareData {
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.data.is_empty() {
            return Err(CodecError::EmptyData);
        }
        Ok(())
    }
}

/// Payload of a COMMIT: the value being committed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode)]
pub struct CommitData {
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
}

impl CommitData {
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.data.is_empty() {
            return Err(CodecError::EmptyData);
        }
        Ok(())
    }
}

/// Payload of a ROUND-CHANGE: the sender's prepared state, if any, plus the
/// PREPARE quorum justifying it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode)]
pub struct RoundChangeData {
    #[serde(with = "hex::serde")]
    pub prepared_value: Vec<u8>,
    pub prepared_round: Round,
    pub prepare_justification: Vec<SignedMessage>,
}

impl RoundChangeData {
    /// Whether the sender was prepared when the round changed.
    pub fn prepared(&self) -> bool {
        self.prepared_round.0 > 0 && !self.prepared_value.is_empty()
    }

    pub fn validate(&self) -> Result<(), CodecError> {
        if self.prepared() && self.prepare_justification.is_empty() {
            return Err(CodecError::NoSigners);
        }
        Ok(())
    }
}

/// A message with its signature and signer set.
///
/// A message with one signer is primitive; multiple signers mean the
/// signature is the BLS aggregate over the same message root (a commit
/// certificate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct SignedMessage {
    pub signature: SignatureBytes,
    pub signers: Vec<OperatorId>,
    pub message: Message,
}

impl SignedMessage {
    /// Structural validation: at least one signer, no duplicates.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.signers.is_empty() {
            return Err(CodecError::NoSigners);
        }
        let mut seen = self.signers.clone();
        seen.sort_unstable();
        for pair in seen.windows(2) {
            if pair[0] == pair[1] {
                return Err(CodecError::DuplicateSigner(pair[0]));
            }
        }
        Ok(())
    }

    /// Root of the inner message.
    pub fn root(&self) -> [u8; 32] {
        self.message.hash_tree_root()
    }

    /// The root actually signed, under the given domain.
    pub fn signing_root(&self, domain: DomainType) -> [u8; 32] {
        compute_signing_root(&self.root(), domain, SIG_TYPE_QBFT)
    }

    /// Whether the signer set matches `ids` exactly (order-insensitive).
    pub fn matched_signers(&self, ids: &[OperatorId]) -> bool {
        let mut a = self.signers.clone();
        let mut b = ids.to_vec();
        a.sort_unstable();
        b.sort_unstable();
        a == b
    }

    /// Whether any signer is shared with `ids`.
    pub fn common_signers(&self, ids: &[OperatorId]) -> bool {
        self.signers.iter().any(|s| ids.contains(s))
    }

    /// Fold another signed message over the same root into this one:
    /// aggregate the signatures and union the signer sets.
    ///
    /// Signer sets must be disjoint. Aggregating a signer twice would
    /// leave the signature unverifiable against the deduplicated set.
    pub fn aggregate(&mut self, other: &SignedMessage) -> Result<(), CodecError> {
        if self.root() != other.root() {
            return Err(CodecError::RootMismatch);
        }
        if other.common_signers(&self.signers) {
            return Err(CodecError::OverlappingSigners);
        }
        let ours = self.signature.to_signature()?;
        let theirs = other.signature.to_signature()?;
        let folded = BlsSignature::aggregate(&[ours, theirs])?;
        self.signature = folded.into();
        self.signers.extend_from_slice(&other.signers);
        self.signers.sort_unstable();
        Ok(())
    }

    /// SSZ encoding.
    pub fn encode(&self) -> Vec<u8> {
        self.as_ssz_bytes()
    }

    /// SSZ decoding.
    pub fn decode(bytes: &[u8]) -> Result<SignedMessage, CodecError> {
        Ok(SignedMessage::from_ssz_bytes(bytes)?)
    }
}

/// Aggregate a set of signed messages over the same root into a certificate.
///
/// The first message is deep-copied and the rest folded in, so the input is
/// left untouched.
pub fn aggregate_messages(msgs: &[SignedMessage]) -> Result<SignedMessage, CodecError> {
    let mut iter = msgs.iter();
    let mut ret = iter.next().ok_or(CodecError::NoSigners)?.clone();
    for m in iter {
        ret.aggregate(m)?;
    }
    Ok(ret)
}
