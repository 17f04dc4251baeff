//! Message identifiers.

use crate::share::ValidatorPublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a [`MessageId`]: 48-byte validator public key plus 8-byte role.
pub const MESSAGE_ID_LENGTH: usize = 56;

/// Duty role a committee runs consensus for.
///
/// Encoded as a little-endian `u64` in the message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u64)]
pub enum Role {
    Attester = 0,
    Aggregator = 1,
    Proposer = 2,
    SyncCommittee = 3,
    SyncCommitteeContribution = 4,
}

impl Role {
    /// Decode from the wire representation.
    pub fn from_u64(v: u64) -> Option<Role> {
        match v {
            0 => Some(Role::Attester),
            1 => Some(Role::Aggregator),
            2 => Some(Role::Proposer),
            3 => Some(Role::SyncCommittee),
            4 => Some(Role::SyncCommitteeContribution),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Attester => "ATTESTER",
            Role::Aggregator => "AGGREGATOR",
            Role::Proposer => "PROPOSER",
            Role::SyncCommittee => "SYNC_COMMITTEE",
            Role::SyncCommitteeContribution => "SYNC_COMMITTEE_CONTRIBUTION",
        };
        f.write_str(s)
    }
}

/// 56-byte identifier shared by every message of one (validator, role) duty
/// stream: the validator public key concatenated with the role tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(#[serde(with = "hex::serde")] pub [u8; MESSAGE_ID_LENGTH]);

impl MessageId {
    /// Build an identifier from a validator public key and a duty role.
    pub fn new(validator_pk: &ValidatorPublicKey, role: Role) -> MessageId {
        let mut bytes = [0u8; MESSAGE_ID_LENGTH];
        bytes[..48].copy_from_slice(validator_pk);
        bytes[48..].copy_from_slice(&(role as u64).to_le_bytes());
        MessageId(bytes)
    }

    /// The validator public key part.
    pub fn validator_pk(&self) -> ValidatorPublicKey {
        let mut pk = [0u8; 48];
        pk.copy_from_slice(&self.0[..48]);
        pk
    }

    /// The role part, if the tag is known.
    pub fn role(&self) -> Option<Role> {
        let mut tag = [0u8; 8];
        tag.copy_from_slice(&self.0[48..]);
        Role::from_u64(u64::from_le_bytes(tag))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({}…)", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl ssz::Encode for MessageId {
    fn is_ssz_fixed_len() -> bool {
        true
    }

    fn ssz_fixed_len() -> usize {
        MESSAGE_ID_LENGTH
    }

    fn ssz_bytes_len(&self) -> usize {
        MESSAGE_ID_LENGTH
    }

    fn ssz_append(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0);
    }
}

impl ssz::Decode for MessageId {
    fn is_ssz_fixed_len() -> bool {
        true
    }

    fn ssz_fixed_len() -> usize {
        MESSAGE_ID_LENGTH
    }

    fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, ssz::DecodeError> {
        if bytes.len() != MESSAGE_ID_LENGTH {
            return Err(ssz::DecodeError::InvalidByteLength {
                len: bytes.len(),
                expected: MESSAGE_ID_LENGTH,
            });
        }
        let mut out = [0u8; MESSAGE_ID_LENGTH];
        out.copy_from_slice(bytes);
        Ok(MessageId(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_splits_back_into_parts() {
        let pk = [0xabu8; 48];
        let id = MessageId::new(&pk, Role::Proposer);
        assert_eq!(id.validator_pk(), pk);
        assert_eq!(id.role(), Some(Role::Proposer));
    }

    #[test]
    fn unknown_role_tag() {
        let mut bytes = [0u8; MESSAGE_ID_LENGTH];
        bytes[48..].copy_from_slice(&99u64.to_le_bytes());
        assert_eq!(MessageId(bytes).role(), None);
    }
}
