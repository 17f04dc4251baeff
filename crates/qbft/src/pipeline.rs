//! Composable message validation.
//!
//! Predicates are first-class values combined by sequential composition:
//! [`Pipeline::combine`] runs its checks in order and short-circuits on the
//! first failure. Each check carries a short name used only for diagnostics.

use dvq_messages::{CodecError, SignedMessage};
use dvq_types::{DomainType, Height, MessageId, OperatorId, Round, Share};
use dvq_messages::MessageType;
use std::sync::Arc;

/// How severely the transport should score the sender of a rejected message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Stale or duplicate traffic; may be honest latency.
    Low,
    /// Protocol violations that are unlikely to be honest.
    Medium,
    /// Cryptographic failures; almost certainly malicious or corrupt.
    High,
}

/// Structured validation failure.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid message signature")]
    InvalidSignature,
    #[error("unknown signer {0}")]
    UnknownSigner(OperatorId),
    #[error("wrong message type: expected {expected:?}, got {got:?}")]
    WrongMsgType {
        expected: MessageType,
        got: MessageType,
    },
    #[error("wrong identifier")]
    WrongIdentifier,
    #[error("wrong height: expected {expected}, got {got}")]
    WrongHeight { expected: Height, got: Height },
    #[error("wrong round: expected {expected}, got {got}")]
    WrongRound { expected: Round, got: Round },
    #[error("message allows 1 signer, got {0}")]
    TooManySigners(usize),
    #[error("proposal leader invalid")]
    InvalidLeader,
    #[error("proposal not justified: {0}")]
    NotJustified(String),
    #[error("proposal is not valid with current state")]
    InvalidState,
    #[error("duplicate message")]
    Duplicate,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ValidationError {
    /// Report level for the transport's peer scorer.
    pub fn severity(&self) -> Severity {
        match self {
            ValidationError::InvalidSignature | ValidationError::UnknownSigner(_) => Severity::High,
            ValidationError::WrongHeight { .. }
            | ValidationError::WrongRound { .. }
            | ValidationError::Duplicate => Severity::Low,
            ValidationError::WrongMsgType { .. }
            | ValidationError::WrongIdentifier
            | ValidationError::TooManySigners(_)
            | ValidationError::InvalidLeader
            | ValidationError::NotJustified(_)
            | ValidationError::InvalidState
            | ValidationError::Codec(_) => Severity::Medium,
        }
    }
}

type CheckFn = dyn Fn(&SignedMessage) -> Result<(), ValidationError> + Send + Sync;

/// A single named validation predicate.
pub struct Check {
    name: &'static str,
    run: Box<CheckFn>,
}

impl Check {
    pub fn new(
        name: &'static str,
        run: impl Fn(&SignedMessage) -> Result<(), ValidationError> + Send + Sync + 'static,
    ) -> Check {
        Check {
            name,
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn run(&self, msg: &SignedMessage) -> Result<(), ValidationError> {
        (self.run)(msg)
    }
}

impl std::fmt::Debug for Check {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Check({})", self.name)
    }
}

/// A sequence of checks applied in order.
#[derive(Debug)]
pub struct Pipeline {
    checks: Vec<Check>,
}

impl Pipeline {
    /// Compose checks; the pipeline fails with the first failing check's error.
    pub fn combine(checks: Vec<Check>) -> Pipeline {
        Pipeline { checks }
    }

    /// Run every check against the message.
    pub fn run(&self, msg: &SignedMessage) -> Result<(), ValidationError> {
        for check in &self.checks {
            if let Err(err) = check.run(msg) {
                tracing::debug!(check = check.name(), error = %err, "message failed validation");
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Structural sanity: signer set non-empty and free of duplicates.
pub fn basic() -> Check {
    Check::new("basic", |msg| {
        msg.validate()?;
        Ok(())
    })
}

/// The message must be of the expected type.
pub fn msg_type_check(expected: MessageType) -> Check {
    Check::new("msg type", move |msg| {
        if msg.message.msg_type != expected {
            return Err(ValidationError::WrongMsgType {
                expected,
                got: msg.message.msg_type,
            });
        }
        Ok(())
    })
}

/// The message must target this duty stream.
pub fn identifier_check(expected: MessageId) -> Check {
    Check::new("identifier", move |msg| {
        if msg.message.identifier != expected {
            return Err(ValidationError::WrongIdentifier);
        }
        Ok(())
    })
}

/// The message must be for this height.
pub fn sequence_check(expected: Height) -> Check {
    Check::new("sequence", move |msg| {
        if msg.message.height != expected {
            return Err(ValidationError::WrongHeight {
                expected,
                got: msg.message.height,
            });
        }
        Ok(())
    })
}

/// The message must be for this round.
pub fn round_check(expected: Round) -> Check {
    Check::new("round", move |msg| {
        if msg.message.round != expected {
            return Err(ValidationError::WrongRound {
                expected,
                got: msg.message.round,
            });
        }
        Ok(())
    })
}

/// Exactly one signer.
pub fn single_signer() -> Check {
    Check::new("single signer", |msg| {
        if msg.signers.len() != 1 {
            return Err(ValidationError::TooManySigners(msg.signers.len()));
        }
        Ok(())
    })
}

/// Every signer is a committee member and the signature verifies under the
/// aggregate of their public keys over the message's signing root.
pub fn authorize(share: Arc<Share>, domain: DomainType) -> Check {
    Check::new("authorize", move |msg| {
        verify_authorization(&share, domain, msg)
    })
}

/// Standalone authorization used outside pipelines (justifications, decided
/// certificates).
pub fn verify_authorization(
    share: &Share,
    domain: DomainType,
    msg: &SignedMessage,
) -> Result<(), ValidationError> {
    for signer in &msg.signers {
        if !share.is_member(*signer) {
            return Err(ValidationError::UnknownSigner(*signer));
        }
    }
    let pks = share
        .public_keys(&msg.signers)
        .ok_or(ValidationError::InvalidSignature)?;
    let sig = msg
        .signature
        .to_signature()
        .map_err(|_| ValidationError::InvalidSignature)?;
    let root = msg.signing_root(domain);
    if !sig.fast_aggregate_verify(&root, &pks) {
        return Err(ValidationError::InvalidSignature);
    }
    Ok(())
}

/// The sole signer must be the round's leader (proposals only).
pub fn leader_check(leader: OperatorId) -> Check {
    Check::new("leader", move |msg| {
        if !msg.matched_signers(&[leader]) {
            return Err(ValidationError::InvalidLeader);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvq_messages::Message;
    use dvq_types::{KeyPair, Operator, Role, SignatureBytes, DOMAIN_PRIMARY_NET};

    fn committee(n: u64) -> (Arc<Share>, Vec<KeyPair>) {
        let kps: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate()).collect();
        let share = Share {
            operator_id: OperatorId(1),
            validator_pk: [7u8; 48],
            committee: kps
                .iter()
                .enumerate()
                .map(|(i, kp)| Operator {
                    id: OperatorId(i as u64 + 1),
                    public_key: kp.public_key().clone(),
                })
                .collect(),
        };
        (Arc::new(share), kps)
    }

    fn signed_prepare(share: &Share, kp: &KeyPair, signer: u64, round: u64) -> SignedMessage {
        let msg = Message {
            msg_type: MessageType::Prepare,
            height: Height(3),
            round: Round(round),
            identifier: MessageId::new(&share.validator_pk, Role::Attester),
            data: vec![1, 2, 3],
        };
        let mut sm = SignedMessage {
            signature: SignatureBytes::ZERO,
            signers: vec![OperatorId(signer)],
            message: msg,
        };
        let root = sm.signing_root(DOMAIN_PRIMARY_NET);
        sm.signature = kp.sign(&root).into();
        sm
    }

    #[test]
    fn combine_short_circuits_in_order() {
        let (share, kps) = committee(4);
        let msg = signed_prepare(&share, &kps[0], 1, 2);

        let pipeline = Pipeline::combine(vec![
            basic(),
            msg_type_check(MessageType::Prepare),
            round_check(Round(5)),
            // Would also fail, but the round check fires first.
            msg_type_check(MessageType::Commit),
        ]);
        assert!(matches!(
            pipeline.run(&msg),
            Err(ValidationError::WrongRound { .. })
        ));
    }

    #[test]
    fn authorize_accepts_committee_signature() {
        let (share, kps) = committee(4);
        let msg = signed_prepare(&share, &kps[1], 2, 1);
        let check = authorize(share, DOMAIN_PRIMARY_NET);
        assert!(check.run(&msg).is_ok());
    }

    #[test]
    fn authorize_rejects_wrong_key() {
        let (share, kps) = committee(4);
        // Operator 2's message signed with operator 3's key.
        let msg = signed_prepare(&share, &kps[2], 2, 1);
        let check = authorize(share, DOMAIN_PRIMARY_NET);
        assert!(matches!(
            check.run(&msg),
            Err(ValidationError::InvalidSignature)
        ));
    }

    #[test]
    fn authorize_rejects_outsider() {
        let (share, kps) = committee(4);
        let msg = signed_prepare(&share, &kps[0], 9, 1);
        let check = authorize(share, DOMAIN_PRIMARY_NET);
        assert!(matches!(
            check.run(&msg),
            Err(ValidationError::UnknownSigner(OperatorId(9)))
        ));
    }

    #[test]
    fn leader_check_matches_sole_signer() {
        let (share, kps) = committee(4);
        let msg = signed_prepare(&share, &kps[1], 2, 1);
        assert!(leader_check(OperatorId(2)).run(&msg).is_ok());
        assert!(matches!(
            leader_check(OperatorId(1)).run(&msg),
            Err(ValidationError::InvalidLeader)
        ));
    }

    #[test]
    fn severity_classification() {
        assert_eq!(ValidationError::InvalidSignature.severity(), Severity::High);
        assert_eq!(
            ValidationError::WrongRound {
                expected: Round(1),
                got: Round(2)
            }
            .severity(),
            Severity::Low
        );
        assert_eq!(ValidationError::InvalidLeader.severity(), Severity::Medium);
    }
}
