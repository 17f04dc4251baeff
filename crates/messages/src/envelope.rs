//! Outer transport envelope.

use crate::consensus::{CodecError, SignedMessage};
use dvq_types::MessageId;
use serde::{Deserialize, Serialize};
use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};

/// Classification of an envelope's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u64)]
pub enum SsvMsgType {
    /// In-flight consensus traffic (proposal/prepare/commit/round-change).
    Consensus = 0,
    /// Post-consensus partial signature shares.
    PartialSignature = 1,
    /// An aggregated decided certificate.
    Decided = 2,
    /// Sync request/response bodies.
    Sync = 3,
}

impl SsvMsgType {
    fn from_u64(v: u64) -> Result<SsvMsgType, ssz::DecodeError> {
        match v {
            0 => Ok(SsvMsgType::Consensus),
            1 => Ok(SsvMsgType::PartialSignature),
            2 => Ok(SsvMsgType::Decided),
            3 => Ok(SsvMsgType::Sync),
            other => Err(ssz::DecodeError::BytesInvalid(format!(
                "unknown ssv message type {other}"
            ))),
        }
    }
}

impl ssz::Encode for SsvMsgType {
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

impl ssz::Decode for SsvMsgType {
    fn is_ssz_fixed_len() -> bool {
        true
    }

    fn ssz_fixed_len() -> usize {
        8
    }

    fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, ssz::DecodeError> {
        SsvMsgType::from_u64(u64::from_ssz_bytes(bytes)?)
    }
}

/// The envelope every network message travels in.
///
/// `fork_version` tags the fork whose codec produced `data`; consumers
/// reject envelopes stamped for a fork they do not run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct SsvMessage {
    pub msg_type: SsvMsgType,
    pub msg_id: MessageId,
    pub fork_version: u64,
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
}

impl SsvMessage {
    /// Wrap a signed consensus message.
    pub fn consensus(msg_id: MessageId, signed: &SignedMessage, fork_version: u64) -> SsvMessage {
        SsvMessage {
            msg_type: SsvMsgType::Consensus,
            msg_id,
            fork_version,
            data: signed.encode(),
        }
    }

    /// Wrap a decided certificate.
    pub fn decided(msg_id: MessageId, signed: &SignedMessage, fork_version: u64) -> SsvMessage {
        SsvMessage {
            msg_type: SsvMsgType::Decided,
            msg_id,
            fork_version,
            data: signed.encode(),
        }
    }

    /// Decode the payload as a signed consensus message.
    pub fn signed_message(&self) -> Result<SignedMessage, CodecError> {
        SignedMessage::decode(&self.data)
    }

    /// SSZ encoding.
    pub fn encode(&self) -> Vec<u8> {
        self.as_ssz_bytes()
    }

    /// SSZ decoding.
    pub fn decode(bytes: &[u8]) -> Result<SsvMessage, CodecError> {
        Ok(SsvMessage::from_ssz_bytes(bytes)?)
    }
}
