//! Per-round signed-message storage.

use dvq_messages::SignedMessage;
use dvq_types::{OperatorId, Round};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Collects signed messages of a single type, keyed by round.
///
/// Messages are deduplicated by signer set: a second message for the same
/// round whose signers exactly match an already-stored one is dropped, which
/// makes message application idempotent. Insertion order is preserved so the
/// quorum search below is deterministic.
///
/// All operations take `&self`; the internal lock makes an add followed by a
/// search appear atomic to concurrent observers.
#[derive(Debug, Default)]
pub struct MessageContainer {
    by_round: Mutex<HashMap<Round, Vec<SignedMessage>>>,
}

impl MessageContainer {
    pub fn new() -> MessageContainer {
        MessageContainer::default()
    }

    /// Append `msg` under its round unless a message with an identical
    /// signer set already exists there. Returns whether it was added.
    pub fn add_message(&self, msg: &SignedMessage) -> bool {
        let mut by_round = self.by_round.lock();
        let round_msgs = by_round.entry(msg.message.round).or_default();
        if round_msgs.iter().any(|m| m.matched_signers(&msg.signers)) {
            return false;
        }
        round_msgs.push(msg.clone());
        true
    }

    /// Snapshot of the messages stored for a round, in insertion order.
    pub fn read_messages_by_round(&self, round: Round) -> Vec<SignedMessage> {
        self.by_round
            .lock()
            .get(&round)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of every stored message across all rounds.
    pub fn all_messages(&self) -> Vec<SignedMessage> {
        let by_round = self.by_round.lock();
        let mut rounds: Vec<&Round> = by_round.keys().collect();
        rounds.sort();
        rounds
            .into_iter()
            .flat_map(|r| by_round[r].iter().cloned())
            .collect()
    }

    /// Find a largest collection of messages for `round` whose payload equals
    /// `value` and whose signer sets are pairwise disjoint. Returns the union
    /// of their signers together with the messages themselves.
    ///
    /// This is the primitive that detects commit quorum across fragments of
    /// aggregated commits: two certificates with disjoint signer halves count
    /// as the union of both. Ties break toward the first candidate found, so
    /// the result is deterministic on insertion order.
    pub fn longest_unique_signers(
        &self,
        round: Round,
        value: &[u8],
    ) -> (Vec<OperatorId>, Vec<SignedMessage>) {
        let by_round = self.by_round.lock();
        let Some(msgs) = by_round.get(&round) else {
            return (vec![], vec![]);
        };

        let mut best_signers: Vec<OperatorId> = vec![];
        let mut best_msgs: Vec<SignedMessage> = vec![];

        for (i, m) in msgs.iter().enumerate() {
            if m.message.data != value {
                continue;
            }

            let mut signers: Vec<OperatorId> = m.signers.clone();
            let mut collected = vec![m.clone()];
            for m2 in &msgs[i + 1..] {
                if m2.message.data != value {
                    continue;
                }
                if !m2.common_signers(&signers) {
                    collected.push(m2.clone());
                    signers.extend_from_slice(&m2.signers);
                }
            }

            if signers.len() > best_signers.len() {
                best_signers = signers;
                best_msgs = collected;
            }
        }

        (best_signers, best_msgs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvq_messages::{Message, MessageType};
    use dvq_types::{Height, MessageId, Role, SignatureBytes};

    fn commit(round: u64, signers: &[u64], value: &[u8]) -> SignedMessage {
        SignedMessage {
            signature: SignatureBytes::ZERO,
            signers: signers.iter().copied().map(OperatorId).collect(),
            message: Message {
                msg_type: MessageType::Commit,
                height: Height(0),
                round: Round(round),
                identifier: MessageId::new(&[1u8; 48], Role::Attester),
                data: value.to_vec(),
            },
        }
    }

    #[test]
    fn dedupes_identical_signer_sets() {
        let c = MessageContainer::new();
        assert!(c.add_message(&commit(1, &[1], b"v")));
        assert!(!c.add_message(&commit(1, &[1], b"v")));
        // Different order, same set.
        assert!(c.add_message(&commit(1, &[2, 3], b"v")));
        assert!(!c.add_message(&commit(1, &[3, 2], b"v")));
        assert_eq!(c.read_messages_by_round(Round(1)).len(), 2);
    }

    #[test]
    fn disjoint_sets_union() {
        let c = MessageContainer::new();
        c.add_message(&commit(1, &[1, 2], b"v"));
        c.add_message(&commit(1, &[3, 4], b"v"));

        let (signers, msgs) = c.longest_unique_signers(Round(1), b"v");
        assert_eq!(
            signers,
            vec![OperatorId(1), OperatorId(2), OperatorId(3), OperatorId(4)]
        );
        assert_eq!(msgs.len(), 2);
    }

    #[test]
    fn overlapping_sets_pick_larger_alone() {
        let c = MessageContainer::new();
        c.add_message(&commit(1, &[1, 2], b"v"));
        c.add_message(&commit(1, &[2, 3, 4], b"v"));

        let (signers, msgs) = c.longest_unique_signers(Round(1), b"v");
        assert_eq!(signers, vec![OperatorId(2), OperatorId(3), OperatorId(4)]);
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn ignores_other_values_and_rounds() {
        let c = MessageContainer::new();
        c.add_message(&commit(1, &[1], b"v"));
        c.add_message(&commit(1, &[2], b"w"));
        c.add_message(&commit(2, &[3], b"v"));

        let (signers, msgs) = c.longest_unique_signers(Round(1), b"v");
        assert_eq!(signers, vec![OperatorId(1)]);
        assert_eq!(msgs.len(), 1);

        let (none, empty) = c.longest_unique_signers(Round(9), b"v");
        assert!(none.is_empty());
        assert!(empty.is_empty());
    }

    #[test]
    fn single_signer_chain_accumulates() {
        let c = MessageContainer::new();
        for signer in 1..=4u64 {
            c.add_message(&commit(1, &[signer], b"v"));
        }
        let (signers, msgs) = c.longest_unique_signers(Round(1), b"v");
        assert_eq!(signers.len(), 4);
        assert_eq!(msgs.len(), 4);
    }
}
