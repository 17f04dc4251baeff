//! The per-height QBFT instance state machine.
//!
//! One instance drives a single (validator, role, height) decision through
//! PROPOSAL → PREPARE → COMMIT, falling back to ROUND-CHANGE on timeout.
//! All mutation goes through `&mut self`; the controller serializes access
//! behind a mutex, so the instance itself holds no locks besides the
//! per-container ones.

use crate::config::Config;
use crate::container::MessageContainer;
use crate::justification::{self, highest_prepared, justify_proposal};
use crate::pipeline::{self, Pipeline, ValidationError};
use crate::round_timer::{RoundTimeout, RoundTimer};
use dvq_messages::{
    aggregate_messages, CommitData, Message, MessageType, PrepareData, ProposalData,
    RoundChangeData, SignedMessage, SsvMessage,
};
use dvq_types::{Height, MessageId, OperatorId, Round, Share};
use serde::{Deserialize, Serialize};
use ssz::Encode;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Instance lifecycle stages, in protocol order.
///
/// `ChangeRound` is re-entrant (round+1 each entry); `Decided` and `Stopped`
/// are terminal for everything except late-commit merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    NotStarted,
    Proposal,
    Prepare,
    Commit,
    ChangeRound,
    Decided,
    Stopped,
}

/// Snapshot of an instance, persisted as part of [`crate::StoredInstance`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub identifier: MessageId,
    pub height: Height,
    pub round: Round,
    pub stage: Stage,
    pub prepared_round: Option<Round>,
    pub prepared_value: Option<Vec<u8>>,
    pub proposal_accepted_for_current_round: Option<SignedMessage>,
    pub decided: bool,
    pub decided_value: Option<Vec<u8>>,
}

/// Errors surfaced while processing instance inputs.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("signing failed: {0}")]
    Signing(#[from] dvq_types::KeyManagerError),
    #[error("broadcast failed: {0}")]
    Broadcast(#[from] crate::config::BroadcastError),
    #[error(transparent)]
    Codec(#[from] dvq_messages::CodecError),
    #[error("instance stopped")]
    Stopped,
    #[error("own operator key missing from committee")]
    MissingOwnKey,
}

/// The per-height protocol state machine.
pub struct Instance {
    state: InstanceState,
    share: Arc<Share>,
    config: Arc<Config>,
    /// One container per message type, indexed by `MessageType as usize`.
    containers: [MessageContainer; 4],
    /// The value handed to [`Instance::start`]; proposed when this operator
    /// leads a round with no prepared history.
    start_value: Vec<u8>,
    /// The aggregated decided certificate, once produced.
    decided_msg: Option<SignedMessage>,
    /// When the decision happened, bounding the late-commit grace window.
    decided_at: Option<Instant>,
    stage_tx: watch::Sender<Stage>,
    round_timer: RoundTimer,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("identifier", &self.state.identifier)
            .field("height", &self.state.height)
            .field("round", &self.state.round)
            .field("stage", &self.state.stage)
            .field("decided", &self.state.decided)
            .finish()
    }
}

impl Instance {
    /// Create an instance for one height. Timeouts are delivered on
    /// `timeout_tx`; the controller routes them back via
    /// [`Instance::on_round_timeout`].
    pub fn new(
        config: Arc<Config>,
        share: Arc<Share>,
        identifier: MessageId,
        height: Height,
        timeout_tx: mpsc::Sender<RoundTimeout>,
    ) -> Instance {
        let (stage_tx, _) = watch::channel(Stage::NotStarted);
        let round_timer = RoundTimer::new(
            config.instance.round_timeout_base,
            config.instance.round_timeout_max_exponent,
            timeout_tx,
        );
        Instance {
            state: InstanceState {
                identifier,
                height,
                round: Round::FIRST,
                stage: Stage::NotStarted,
                prepared_round: None,
                prepared_value: None,
                proposal_accepted_for_current_round: None,
                decided: false,
                decided_value: None,
            },
            share,
            config,
            containers: Default::default(),
            start_value: vec![],
            decided_msg: None,
            decided_at: None,
            stage_tx,
            round_timer,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn state(&self) -> &InstanceState {
        &self.state
    }

    pub fn height(&self) -> Height {
        self.state.height
    }

    pub fn round(&self) -> Round {
        self.state.round
    }

    pub fn is_decided(&self) -> bool {
        self.state.decided
    }

    pub fn decided_message(&self) -> Option<&SignedMessage> {
        self.decided_msg.as_ref()
    }

    /// One-slot stage signal with last-write-wins semantics. Consumers see
    /// collapsed transitions as a normal case.
    pub fn stage_receiver(&self) -> watch::Receiver<Stage> {
        self.stage_tx.subscribe()
    }

    /// Messages stored for a round and type (observability and tests).
    pub fn messages_by_round(&self, msg_type: MessageType, round: Round) -> Vec<SignedMessage> {
        self.container(msg_type).read_messages_by_round(round)
    }

    fn container(&self, msg_type: MessageType) -> &MessageContainer {
        &self.containers[msg_type as usize]
    }

    fn leader(&self, round: Round) -> OperatorId {
        self.config.leader_selector.leader(self.state.height, round)
    }

    fn is_leader(&self, round: Round) -> bool {
        self.leader(round) == self.share.operator_id
    }

    fn process_stage_change(&mut self, stage: Stage) {
        debug!(
            identifier = %self.state.identifier,
            height = %self.state.height,
            round = %self.state.round,
            ?stage,
            "stage change"
        );
        self.state.stage = stage;
        self.stage_tx.send_replace(stage);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Start and stop
    // ═══════════════════════════════════════════════════════════════════════

    /// Begin the instance with the duty value. The round-1 leader proposes
    /// immediately; everyone arms the round timer.
    pub fn start(&mut self, value: Vec<u8>) -> Result<(), InstanceError> {
        self.start_value = value;

        info!(
            identifier = %self.state.identifier,
            height = %self.state.height,
            leader = %self.leader(Round::FIRST),
            "starting instance"
        );

        if self.is_leader(Round::FIRST) {
            let proposal = ProposalData {
                data: self.start_value.clone(),
                round_change_justification: vec![],
                prepare_justification: vec![],
            };
            self.sign_and_broadcast(MessageType::Proposal, proposal.as_ssz_bytes())?;
        }

        self.round_timer
            .register(self.state.height, self.state.round);
        Ok(())
    }

    /// External stop: terminal, cancels the pending round timer.
    pub fn stop(&mut self) {
        if self.state.stage == Stage::Stopped {
            return;
        }
        self.round_timer.cancel();
        self.process_stage_change(Stage::Stopped);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Message processing
    // ═══════════════════════════════════════════════════════════════════════

    /// Apply a signed message. Returns the decided certificate when this
    /// message completed (or, for late commits, extended) it.
    pub fn process_msg(
        &mut self,
        msg: &SignedMessage,
    ) -> Result<Option<SignedMessage>, InstanceError> {
        if self.state.stage == Stage::Stopped {
            return Err(InstanceError::Stopped);
        }

        match msg.message.msg_type {
            MessageType::Proposal => self.upon_proposal(msg).map(|_| None),
            MessageType::Prepare => self.upon_prepare(msg).map(|_| None),
            MessageType::Commit => self.upon_commit(msg),
            MessageType::RoundChange => self.upon_round_change(msg).map(|_| None),
        }
    }

    /// ```text
    /// upon receiving a valid ⟨PROPOSAL, λ, r, value⟩ from leader(λ, r)
    /// such that JustifyProposal(m):
    ///     set timer to running and expire after t(r)
    ///     broadcast ⟨PREPARE, λ, r, value⟩
    /// ```
    fn upon_proposal(&mut self, msg: &SignedMessage) -> Result<(), InstanceError> {
        let msg_round = msg.message.round;
        Pipeline::combine(vec![
            pipeline::basic(),
            pipeline::msg_type_check(MessageType::Proposal),
            pipeline::identifier_check(self.state.identifier),
            pipeline::sequence_check(self.state.height),
            pipeline::single_signer(),
            pipeline::leader_check(self.leader(msg_round)),
            pipeline::authorize(Arc::clone(&self.share), self.config.domain),
        ])
        .run(msg)?;

        let proposal = msg.message.proposal_data()?;
        proposal.validate()?;
        justify_proposal(
            &self.share,
            self.config.domain,
            self.state.height,
            msg_round,
            &proposal.round_change_justification,
            &proposal.prepare_justification,
            &proposal.data,
        )?;

        // A proposal fits the current state either as the first one for the
        // current round, or as a justified proposal for a later round.
        let accepted = self.state.proposal_accepted_for_current_round.is_some();
        let fits = (!accepted && msg_round == self.state.round)
            || (accepted && msg_round > self.state.round);
        if !fits {
            return Err(ValidationError::InvalidState.into());
        }

        info!(
            identifier = %self.state.identifier,
            height = %self.state.height,
            round = %msg_round,
            signer = %msg.signers[0],
            "accepted proposal"
        );

        self.container(MessageType::Proposal).add_message(msg);
        self.state.proposal_accepted_for_current_round = Some(msg.clone());

        if msg_round > self.state.round {
            debug!(
                current = %self.state.round,
                future = %msg_round,
                "justified proposal for a later round, bumping"
            );
            self.state.round = msg_round;
            self.round_timer.register(self.state.height, msg_round);
        }

        self.process_stage_change(Stage::Proposal);

        let prepare = PrepareData {
            data: proposal.data,
        };
        self.sign_and_broadcast(MessageType::Prepare, prepare.as_ssz_bytes())?;
        Ok(())
    }

    /// ```text
    /// upon receiving a quorum of valid ⟨PREPARE, λ, r, value⟩:
    ///     set pr ← r, pv ← value
    ///     broadcast ⟨COMMIT, λ, r, value⟩
    /// ```
    fn upon_prepare(&mut self, msg: &SignedMessage) -> Result<(), InstanceError> {
        Pipeline::combine(vec![
            pipeline::basic(),
            pipeline::msg_type_check(MessageType::Prepare),
            pipeline::identifier_check(self.state.identifier),
            pipeline::sequence_check(self.state.height),
            pipeline::round_check(self.state.round),
            pipeline::single_signer(),
            pipeline::authorize(Arc::clone(&self.share), self.config.domain),
        ])
        .run(msg)?;

        // A prepare only counts against the accepted proposal's value.
        let accepted = self
            .state
            .proposal_accepted_for_current_round
            .as_ref()
            .ok_or(ValidationError::InvalidState)?;
        let accepted_value = accepted.message.proposal_data()?.data;
        let prepare = msg.message.prepare_data()?;
        prepare.validate()?;
        if prepare.data != accepted_value {
            return Err(ValidationError::InvalidState.into());
        }

        if !self.container(MessageType::Prepare).add_message(msg) {
            return Err(ValidationError::Duplicate.into());
        }

        let (signers, _) = self
            .container(MessageType::Prepare)
            .longest_unique_signers(self.state.round, &msg.message.data);
        if !self.share.has_quorum(signers.len()) {
            return Ok(());
        }

        // The quorum fires once per round; later prepares are merely stored.
        if self.state.prepared_round == Some(self.state.round) {
            return Ok(());
        }

        info!(
            identifier = %self.state.identifier,
            height = %self.state.height,
            round = %self.state.round,
            prepares = signers.len(),
            "prepared"
        );

        self.state.prepared_round = Some(self.state.round);
        self.state.prepared_value = Some(prepare.data.clone());
        self.process_stage_change(Stage::Prepare);

        // Checkpoint so a restart resumes with the prepared lock intact.
        if let Err(err) = self
            .config
            .storage
            .save_current_instance(&self.state.identifier, &self.state)
        {
            warn!(error = %err, "failed to checkpoint prepared state");
        }

        let commit = CommitData { data: prepare.data };
        self.sign_and_broadcast(MessageType::Commit, commit.as_ssz_bytes())?;
        Ok(())
    }

    /// ```text
    /// upon receiving a quorum Qcommit of valid ⟨COMMIT, λ, r, value⟩:
    ///     set timer to stopped
    ///     Decide(λ, value, Qcommit)
    /// ```
    fn upon_commit(&mut self, msg: &SignedMessage) -> Result<Option<SignedMessage>, InstanceError> {
        Pipeline::combine(vec![
            pipeline::basic(),
            pipeline::msg_type_check(MessageType::Commit),
            pipeline::identifier_check(self.state.identifier),
            pipeline::sequence_check(self.state.height),
            pipeline::round_check(self.state.round),
            pipeline::single_signer(),
            pipeline::authorize(Arc::clone(&self.share), self.config.domain),
        ])
        .run(msg)?;

        let commit = msg.message.commit_data()?;
        commit.validate()?;

        if self.state.decided {
            return self.merge_late_commit(msg, commit);
        }

        if !self.container(MessageType::Commit).add_message(msg) {
            return Err(ValidationError::Duplicate.into());
        }

        let (signers, commit_msgs) = self
            .container(MessageType::Commit)
            .longest_unique_signers(self.state.round, &msg.message.data);
        if !self.share.has_quorum(signers.len()) {
            return Ok(None);
        }

        // One-shot: `decided` flips exactly once, guarding re-aggregation.
        let agg = aggregate_messages(&commit_msgs)?;

        info!(
            identifier = %self.state.identifier,
            height = %self.state.height,
            round = %self.state.round,
            got_votes = commit_msgs.len(),
            signers = signers.len(),
            "decided"
        );

        self.state.decided = true;
        self.state.decided_value = Some(commit.data);
        self.decided_msg = Some(agg.clone());
        self.decided_at = Some(Instant::now());
        self.round_timer.cancel();
        self.process_stage_change(Stage::Decided);

        Ok(Some(agg))
    }

    /// After deciding, commits for the decided value keep merging their
    /// signers into the certificate for a bounded grace period. This grows
    /// the aggregated signature's weight without changing the decision.
    fn merge_late_commit(
        &mut self,
        msg: &SignedMessage,
        commit: CommitData,
    ) -> Result<Option<SignedMessage>, InstanceError> {
        let within_grace = self
            .decided_at
            .is_some_and(|at| at.elapsed() <= self.config.instance.late_commit_grace);
        if !within_grace {
            return Ok(None);
        }

        let Some(decided_msg) = self.decided_msg.as_mut() else {
            return Ok(None);
        };
        if Some(&commit.data) != self.state.decided_value.as_ref() {
            return Err(ValidationError::InvalidState.into());
        }
        if msg.common_signers(&decided_msg.signers) {
            // Already counted.
            return Ok(None);
        }

        decided_msg.aggregate(msg)?;
        let updated = decided_msg.clone();
        debug!(
            identifier = %self.state.identifier,
            height = %self.state.height,
            signers = updated.signers.len(),
            "late commit merged into decided certificate"
        );
        Ok(Some(updated))
    }

    /// Collect round-change messages; a quorum makes the new round's leader
    /// propose, and `f+1` higher rounds pull this operator forward.
    fn upon_round_change(&mut self, msg: &SignedMessage) -> Result<(), InstanceError> {
        Pipeline::combine(vec![
            pipeline::basic(),
            pipeline::msg_type_check(MessageType::RoundChange),
            pipeline::identifier_check(self.state.identifier),
            pipeline::sequence_check(self.state.height),
            pipeline::single_signer(),
            pipeline::authorize(Arc::clone(&self.share), self.config.domain),
        ])
        .run(msg)?;

        if msg.message.round < self.state.round {
            return Err(ValidationError::WrongRound {
                expected: self.state.round,
                got: msg.message.round,
            }
            .into());
        }

        justification::validate_round_change_data(
            &self.share,
            self.config.domain,
            self.state.height,
            msg,
        )?;

        if !self.container(MessageType::RoundChange).add_message(msg) {
            return Err(ValidationError::Duplicate.into());
        }

        debug!(
            identifier = %self.state.identifier,
            height = %self.state.height,
            round = %msg.message.round,
            signer = %msg.signers[0],
            "stored round change"
        );

        // f+1 distinct operators already in higher rounds: catch up to the
        // lowest of them rather than waiting out our own timer.
        if let Some(jump) = self.higher_round_partial_quorum() {
            info!(
                identifier = %self.state.identifier,
                from = %self.state.round,
                to = %jump,
                "partial quorum of higher round changes, catching up"
            );
            self.bump_to_round(jump)?;
            return Ok(());
        }

        self.try_propose_on_round_change_quorum()
    }

    /// Round-change quorum at the current round makes its leader propose.
    fn try_propose_on_round_change_quorum(&mut self) -> Result<(), InstanceError> {
        let round = self.state.round;
        if !self.is_leader(round) || round == Round::FIRST {
            return Ok(());
        }
        if self.state.proposal_accepted_for_current_round.is_some() {
            return Ok(());
        }
        // Never double-propose for a round.
        if !self
            .container(MessageType::Proposal)
            .read_messages_by_round(round)
            .is_empty()
        {
            return Ok(());
        }

        let round_changes = self
            .container(MessageType::RoundChange)
            .read_messages_by_round(round);
        let mut signers: Vec<OperatorId> = round_changes
            .iter()
            .flat_map(|m| m.signers.iter().copied())
            .collect();
        signers.sort_unstable();
        signers.dedup();
        if !self.share.has_quorum(signers.len()) {
            return Ok(());
        }

        // Re-propose the highest prepared value when one exists; otherwise
        // the duty value is free.
        let highest = highest_prepared(&round_changes)?;
        let (value, prepare_justification) = match highest {
            Some(data) => (data.prepared_value.clone(), data.prepare_justification),
            None => (self.start_value.clone(), vec![]),
        };

        info!(
            identifier = %self.state.identifier,
            height = %self.state.height,
            round = %round,
            prepared = self.state.prepared_round.is_some(),
            "leading round after round-change quorum"
        );

        let proposal = ProposalData {
            data: value,
            round_change_justification: round_changes,
            prepare_justification,
        };
        self.sign_and_broadcast(MessageType::Proposal, proposal.as_ssz_bytes())?;
        Ok(())
    }

    /// The lowest round above the current one backed by `f+1` unique signers.
    fn higher_round_partial_quorum(&self) -> Option<Round> {
        let all = self.container(MessageType::RoundChange).all_messages();
        let higher: Vec<&SignedMessage> = all
            .iter()
            .filter(|m| m.message.round > self.state.round)
            .collect();

        let mut signers: Vec<OperatorId> = higher
            .iter()
            .flat_map(|m| m.signers.iter().copied())
            .collect();
        signers.sort_unstable();
        signers.dedup();

        if !self.share.has_partial_quorum(signers.len()) {
            return None;
        }
        higher.iter().map(|m| m.message.round).min()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Round changes
    // ═══════════════════════════════════════════════════════════════════════

    /// Round timer expiry. Stale fires for earlier rounds are ignored.
    pub fn on_round_timeout(&mut self, timeout: RoundTimeout) -> Result<(), InstanceError> {
        if self.state.decided || self.state.stage == Stage::Stopped {
            return Ok(());
        }
        if timeout.height != self.state.height || timeout.round != self.state.round {
            return Ok(());
        }

        info!(
            identifier = %self.state.identifier,
            height = %self.state.height,
            expired = %timeout.round,
            "round timed out"
        );

        self.bump_to_round(self.state.round.next())
    }

    /// Enter `new_round`: reset the accepted proposal, broadcast our
    /// round-change (carrying prepared state if any), arm the longer timer.
    fn bump_to_round(&mut self, new_round: Round) -> Result<(), InstanceError> {
        self.state.round = new_round;
        self.state.proposal_accepted_for_current_round = None;
        self.process_stage_change(Stage::ChangeRound);

        let data = match (&self.state.prepared_round, &self.state.prepared_value) {
            (Some(pr), Some(pv)) => {
                // The prepare quorum that locked us serves as justification.
                let prepare_key = PrepareData {
                    data: pv.clone(),
                }
                .as_ssz_bytes();
                let (_, prepares) = self
                    .container(MessageType::Prepare)
                    .longest_unique_signers(*pr, &prepare_key);
                RoundChangeData {
                    prepared_value: pv.clone(),
                    prepared_round: *pr,
                    prepare_justification: prepares,
                }
            }
            _ => RoundChangeData::default(),
        };

        self.sign_and_broadcast(MessageType::RoundChange, data.as_ssz_bytes())?;
        self.round_timer.register(self.state.height, new_round);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Outbound
    // ═══════════════════════════════════════════════════════════════════════

    fn sign_and_broadcast(
        &mut self,
        msg_type: MessageType,
        payload: Vec<u8>,
    ) -> Result<(), InstanceError> {
        let message = Message {
            msg_type,
            height: self.state.height,
            round: self.state.round,
            identifier: self.state.identifier,
            data: payload,
        };
        let signed = self.sign_message(message)?;
        self.config.network.broadcast(SsvMessage::consensus(
            self.state.identifier,
            &signed,
            self.config.fork_version,
        ))?;
        Ok(())
    }

    /// Sign a message with the local operator's share key.
    pub fn sign_message(&self, message: Message) -> Result<SignedMessage, InstanceError> {
        let own_pk = self
            .share
            .public_key(self.share.operator_id)
            .ok_or(InstanceError::MissingOwnKey)?;
        let mut signed = SignedMessage {
            signature: dvq_types::SignatureBytes::ZERO,
            signers: vec![self.share.operator_id],
            message,
        };
        let root = signed.signing_root(self.config.domain);
        let signature = self.config.key_manager.sign_root(&root, own_pk)?;
        signed.signature = signature.into();
        Ok(signed)
    }
}
