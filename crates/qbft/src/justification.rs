//! Proposal justification.
//!
//! ```text
//! predicate JustifyProposal(⟨PROPOSAL, λ, round, value⟩):
//!     round = 1
//!     ∨ received a quorum Qrc of valid ⟨ROUND-CHANGE, λ, round, prⱼ, pvⱼ⟩ such that:
//!         ∀ members of Qrc: prⱼ = ⊥ ∧ pvⱼ = ⊥
//!         ∨ received a quorum of valid ⟨PREPARE, λ, pr, value⟩ where
//!           (pr, value) = HighestPrepared(Qrc)
//! ```

use crate::pipeline::{self, Pipeline, ValidationError};
use dvq_messages::{MessageType, RoundChangeData, SignedMessage};
use dvq_types::{DomainType, Height, Round, Share};
use std::sync::Arc;

/// Validate that a proposal for `round` carrying `proposed_value` is
/// justified by the accompanying round-change and prepare certificates.
pub fn justify_proposal(
    share: &Arc<Share>,
    domain: DomainType,
    height: Height,
    round: Round,
    round_changes: &[SignedMessage],
    prepares: &[SignedMessage],
    proposed_value: &[u8],
) -> Result<(), ValidationError> {
    if round == Round::FIRST {
        return Ok(());
    }

    let rc_pipeline = Pipeline::combine(vec![
        pipeline::basic(),
        pipeline::msg_type_check(MessageType::RoundChange),
        pipeline::sequence_check(height),
        pipeline::round_check(round),
        pipeline::single_signer(),
        pipeline::authorize(Arc::clone(share), domain),
    ]);
    for rc in round_changes {
        rc_pipeline
            .run(rc)
            .map_err(|e| ValidationError::NotJustified(format!("round change invalid: {e}")))?;
        rc.message
            .round_change_data()
            .and_then(|d| d.validate())
            .map_err(|e| ValidationError::NotJustified(format!("round change data: {e}")))?;
    }

    if !share.has_quorum(unique_signer_count(round_changes)) {
        return Err(ValidationError::NotJustified(
            "round change quorum missing".into(),
        ));
    }

    let highest = highest_prepared(round_changes)?;
    let Some(highest) = highest else {
        // Nobody was prepared, any value is admissible.
        return Ok(());
    };

    if proposed_value != highest.prepared_value.as_slice() {
        return Err(ValidationError::NotJustified(
            "proposed value does not match highest prepared".into(),
        ));
    }

    if !share.has_quorum(unique_signer_count(prepares)) {
        return Err(ValidationError::NotJustified(
            "prepare quorum missing".into(),
        ));
    }

    for prepare in prepares {
        validate_justification_prepare(
            share,
            domain,
            height,
            highest.prepared_round,
            &highest.prepared_value,
            prepare,
        )
        .map_err(|e| ValidationError::NotJustified(format!("signed prepare not valid: {e}")))?;
    }

    Ok(())
}

/// Among prepared round-change messages, pick the one with the maximum
/// prepared round. Returns `None` when none is prepared; several tying
/// messages are equivalent since the value must match either way.
pub fn highest_prepared(
    round_changes: &[SignedMessage],
) -> Result<Option<RoundChangeData>, ValidationError> {
    let mut best: Option<RoundChangeData> = None;
    for rc in round_changes {
        let data = rc.message.round_change_data()?;
        if !data.prepared() {
            continue;
        }
        match &best {
            Some(b) if b.prepared_round >= data.prepared_round => {}
            _ => best = Some(data),
        }
    }
    Ok(best)
}

/// A prepare inside a justification must target `(height, round)`, carry the
/// prepared value, and verify under its signers' aggregated keys.
fn validate_justification_prepare(
    share: &Share,
    domain: DomainType,
    height: Height,
    round: Round,
    value: &[u8],
    prepare: &SignedMessage,
) -> Result<(), ValidationError> {
    if prepare.message.msg_type != MessageType::Prepare {
        return Err(ValidationError::WrongMsgType {
            expected: MessageType::Prepare,
            got: prepare.message.msg_type,
        });
    }
    if prepare.message.height != height {
        return Err(ValidationError::WrongHeight {
            expected: height,
            got: prepare.message.height,
        });
    }
    if prepare.message.round != round {
        return Err(ValidationError::WrongRound {
            expected: round,
            got: prepare.message.round,
        });
    }

    let data = prepare.message.prepare_data()?;
    data.validate()?;
    if data.data != value {
        return Err(ValidationError::NotJustified(
            "prepare data != proposed data".into(),
        ));
    }

    if prepare.signers.len() != 1 {
        return Err(ValidationError::TooManySigners(prepare.signers.len()));
    }

    pipeline::verify_authorization(share, domain, prepare)
}

/// Validate the payload of an incoming round-change message.
///
/// An unprepared round-change carries nothing to check. A prepared one must
/// bring a PREPARE quorum for `(height, prepared_round, prepared_value)`,
/// each member verifying under its signer's key.
pub(crate) fn validate_round_change_data(
    share: &Share,
    domain: DomainType,
    height: Height,
    msg: &SignedMessage,
) -> Result<(), ValidationError> {
    let data = msg.message.round_change_data()?;
    data.validate()?;
    if !data.prepared() {
        return Ok(());
    }

    if !share.has_quorum(unique_signer_count(&data.prepare_justification)) {
        return Err(ValidationError::NotJustified(
            "round change prepared without prepare quorum".into(),
        ));
    }
    for prepare in &data.prepare_justification {
        validate_justification_prepare(
            share,
            domain,
            height,
            data.prepared_round,
            &data.prepared_value,
            prepare,
        )?;
    }
    Ok(())
}

fn unique_signer_count(msgs: &[SignedMessage]) -> usize {
    let mut signers: Vec<_> = msgs.iter().flat_map(|m| m.signers.iter().copied()).collect();
    signers.sort_unstable();
    signers.dedup();
    signers.len()
}
