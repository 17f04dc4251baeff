//! Buffer for messages ahead of the local height.
//!
//! One slot per signer, overwritten on every insert, so memory is bounded by
//! the committee size and a single operator cannot amplify sync traffic.

use dvq_types::{Height, OperatorId};
use std::collections::HashMap;

/// Per-signer record of the highest future height seen.
#[derive(Debug, Default)]
pub struct FutureMsgBuffer {
    by_signer: HashMap<OperatorId, Height>,
}

impl FutureMsgBuffer {
    pub fn new() -> FutureMsgBuffer {
        FutureMsgBuffer::default()
    }

    /// Record `height` for `signer`, dropping any entries no longer above
    /// `local`. Returns false when the signer already had a live entry.
    pub fn add(&mut self, signer: OperatorId, height: Height, local: Height) -> bool {
        self.by_signer.retain(|_, h| *h > local);
        if self.by_signer.contains_key(&signer) {
            return false;
        }
        self.by_signer.insert(signer, height);
        true
    }

    /// Number of signers currently claiming higher heights.
    pub fn len(&self) -> usize {
        self.by_signer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_signer.is_empty()
    }

    /// Drop everything (after a completed sync).
    pub fn clear(&mut self) {
        self.by_signer.clear();
    }
}
