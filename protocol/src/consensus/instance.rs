//! # Consensus Instance
//!
//! One instance drives one `(identifier, sequence)` through the four-stage
//! IBFT protocol: collect the leader's pre-prepare, a prepare quorum, a
//! commit quorum, done. A stalled round triggers a change-round with
//! exponentially backed-off timeouts; a partial quorum of change-rounds from
//! faster peers short-circuits the wait and jumps ahead.
//!
//! ## Message discipline
//!
//! Every inbound message runs a validation pipeline assembled from the
//! standard validators; anything that fails is dropped silently (logged at
//! debug) because a Byzantine-tolerant protocol must make progress under
//! adversarial noise, not crash on it. Messages for future stages of the
//! current round wait in the shared queue and are replayed when the stage is
//! entered; messages for abandoned rounds are purged on round change.
//!
//! Stage transitions are monotone within a round. The only regression the
//! state machine allows is a round advance, which resets the sub-stage to
//! `PrePrepare` for the new round.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::InstanceConfig;
use crate::consensus::container::MessageContainer;
use crate::consensus::message::{
    aggregate_messages, ChangeRoundData, Message, MessageError, MessageType, SignedMessage,
};
use crate::consensus::pipeline::{
    authorize_msg, basic_msg_validation, msg_type_check, validate_lambdas, validate_round,
    validate_sequence, Pipeline, PipelineError,
};
use crate::crypto::bls::BlsPublicKey;
use crate::network::queue::MessageQueue;
use crate::network::{Network, NetworkError};
use crate::share::Share;
use crate::signer::{KeyManager, SignerError};
use crate::tasks::Stopper;

// ---------------------------------------------------------------------------
// Stage & State
// ---------------------------------------------------------------------------

/// Where an instance stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    NotStarted,
    /// Waiting for the round leader's pre-prepare.
    PrePrepare,
    /// Pre-prepare accepted; collecting a prepare quorum.
    Prepare,
    /// Prepared; collecting a commit quorum.
    Commit,
    /// Terminal: a commit quorum was aggregated into a decided message.
    Decided,
    /// Transient marker while a round change is being performed.
    ChangeRound,
    /// Terminal: externally disposed by the controller.
    Stopped,
}

/// Mutable per-instance consensus state.
#[derive(Debug, Clone)]
pub struct InstanceState {
    pub stage: Stage,
    pub round: u64,
    /// 0 when nothing has been prepared yet.
    pub prepared_round: u64,
    pub prepared_value: Vec<u8>,
    pub input_value: Vec<u8>,
    pub identifier: Vec<u8>,
    pub sequence: u64,
}

// ---------------------------------------------------------------------------
// Errors & Options
// ---------------------------------------------------------------------------

/// Internal failures of an instance. Invalid inbound messages are not
/// errors — they are dropped.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("malformed share: {0}")]
    MalformedShare(String),
}

/// Everything an instance needs at construction. The fork-style knobs
/// (config, share) are plain values — the instance never reaches back into
/// its controller.
pub struct InstanceOptions {
    pub share: Share,
    pub identifier: Vec<u8>,
    pub sequence: u64,
    pub input_value: Vec<u8>,
    pub config: InstanceConfig,
    pub network: Arc<dyn Network>,
    pub signer: Arc<KeyManager>,
    pub queue: Arc<MessageQueue>,
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// A single `(identifier, sequence)` consensus instance.
pub struct Instance {
    state: InstanceState,
    share: Share,
    config: InstanceConfig,
    network: Arc<dyn Network>,
    signer: Arc<KeyManager>,
    queue: Arc<MessageQueue>,
    pub pre_prepare_messages: MessageContainer,
    pub prepare_messages: MessageContainer,
    pub commit_messages: MessageContainer,
    pub change_round_messages: MessageContainer,
    decided: Option<SignedMessage>,
    round_started_at: Instant,
}

impl Instance {
    pub fn new(opts: InstanceOptions) -> Self {
        let quorum = opts.share.threshold_size();
        let partial = opts.share.partial_threshold_size();
        Self {
            state: InstanceState {
                stage: Stage::NotStarted,
                round: 1,
                prepared_round: 0,
                prepared_value: Vec::new(),
                input_value: opts.input_value,
                identifier: opts.identifier,
                sequence: opts.sequence,
            },
            share: opts.share,
            config: opts.config,
            network: opts.network,
            signer: opts.signer,
            queue: opts.queue,
            pre_prepare_messages: MessageContainer::new(quorum, partial),
            prepare_messages: MessageContainer::new(quorum, partial),
            commit_messages: MessageContainer::new(quorum, partial),
            change_round_messages: MessageContainer::new(quorum, partial),
            decided: None,
            round_started_at: Instant::now(),
        }
    }

    pub fn state(&self) -> &InstanceState {
        &self.state
    }

    /// The decided aggregate, once the instance is terminal at `Decided`.
    pub fn decided_message(&self) -> Option<&SignedMessage> {
        self.decided.as_ref()
    }

    /// Leader of a round: seats rotate round-robin over the committee,
    /// offset by the sequence so leadership shifts between heights.
    pub fn leader_for_round(&self, round: u64) -> u64 {
        let n = self.share.committee_size() as u64;
        ((self.state.sequence + round - 2) % n) + 1
    }

    fn is_self_leader(&self, round: u64) -> bool {
        self.leader_for_round(round) == self.share.node_id
    }

    fn own_share_key(&self) -> Result<BlsPublicKey, InstanceError> {
        self.share
            .own_share_key()
            .cloned()
            .ok_or_else(|| InstanceError::MalformedShare("own seat missing from committee".into()))
    }

    /// Kicks the instance off: enters the first round and, as its leader,
    /// broadcasts the pre-prepare carrying the input value.
    pub async fn start(&mut self) -> Result<(), InstanceError> {
        self.state.stage = Stage::PrePrepare;
        self.round_started_at = Instant::now();
        info!(
            identifier = %String::from_utf8_lossy(&self.state.identifier),
            sequence = self.state.sequence,
            leader = self.leader_for_round(1),
            "consensus instance started"
        );
        if self.is_self_leader(1) {
            let value = self.state.input_value.clone();
            self.sign_and_broadcast(MessageType::PrePrepare, 1, value)
                .await?;
        }
        Ok(())
    }

    /// Marks the instance externally disposed.
    pub fn stop(&mut self) {
        self.state.stage = Stage::Stopped;
    }

    // -----------------------------------------------------------------------
    // Driving loop
    // -----------------------------------------------------------------------

    /// Runs the instance to `Decided`, feeding it from the shared queue and
    /// firing the round-change timer. Returns `None` when the stopper fires
    /// first.
    pub async fn run_until_decided(
        &mut self,
        stopper: &Stopper,
    ) -> Result<Option<SignedMessage>, InstanceError> {
        self.start().await?;
        loop {
            if stopper.is_stopped() {
                self.stop();
                return Ok(None);
            }
            if self.state.stage == Stage::Decided {
                return Ok(self.decided.clone());
            }

            let identifier = self.state.identifier.clone();
            let sequence = self.state.sequence;
            let round = self.state.round;
            let popped = self.queue.pop_by(|index| {
                index.identifier == identifier
                    && index.sequence == sequence
                    && (index.round == round || index.msg_type == MessageType::ChangeRound)
            });

            if let Some(envelope) = popped {
                if let Err(e) = self.process_message(envelope.msg).await {
                    warn!(error = %e, "message processing failed");
                }
                continue;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
            self.tick().await?;
        }
    }

    /// Fires the round-change timer when the current round has outlived its
    /// deadline (`base * factor^(round-1)`).
    pub async fn tick(&mut self) -> Result<(), InstanceError> {
        if matches!(self.state.stage, Stage::Decided | Stage::Stopped) {
            return Ok(());
        }
        let deadline = self.round_started_at + self.config.round_timeout(self.state.round);
        if Instant::now() >= deadline {
            let next = self.state.round + 1;
            debug!(
                round = self.state.round,
                next, "round timed out, changing round"
            );
            self.bump_round(next).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Message processing
    // -----------------------------------------------------------------------

    /// Routes one message through its stage handler. `Ok(true)` means the
    /// message passed validation and was recorded; `Ok(false)` means it was
    /// dropped.
    pub async fn process_message(&mut self, msg: SignedMessage) -> Result<bool, InstanceError> {
        if matches!(self.state.stage, Stage::Stopped) {
            return Ok(false);
        }
        match msg.message.msg_type {
            MessageType::PrePrepare => self.process_pre_prepare(msg).await,
            MessageType::Prepare => self.process_prepare(msg).await,
            MessageType::Commit => self.process_commit(msg).await,
            MessageType::ChangeRound => self.process_change_round(msg).await,
            // Decided aggregates are the controller's concern.
            MessageType::Decided => Ok(false),
        }
    }

    fn drop_invalid(&self, msg: &SignedMessage, err: &PipelineError) -> bool {
        match err {
            PipelineError::Unauthorized(reason) => {
                info!(
                    msg_type = %msg.message.msg_type,
                    round = msg.message.round,
                    reason, "dropping unauthorized message"
                );
            }
            PipelineError::InvalidMessage(reason) => {
                debug!(
                    msg_type = %msg.message.msg_type,
                    round = msg.message.round,
                    reason, "dropping invalid message"
                );
            }
        }
        false
    }

    fn stage_pipeline(&self, expected: MessageType) -> Pipeline {
        Pipeline::combine([
            basic_msg_validation(),
            msg_type_check(expected),
            validate_lambdas(self.state.identifier.clone()),
            validate_sequence(self.state.sequence),
            validate_round(self.state.round),
            authorize_msg(self.share.clone()),
        ])
    }

    async fn process_pre_prepare(&mut self, msg: SignedMessage) -> Result<bool, InstanceError> {
        if let Err(e) = self.stage_pipeline(MessageType::PrePrepare).run(&msg) {
            return Ok(self.drop_invalid(&msg, &e));
        }
        if self.state.stage != Stage::PrePrepare {
            debug!(stage = ?self.state.stage, "pre-prepare outside its stage, dropping");
            return Ok(false);
        }

        let leader = self.leader_for_round(self.state.round);
        if msg.signer_ids != [leader] {
            debug!(
                signers = ?msg.signer_ids,
                leader, "pre-prepare not signed by the round leader alone"
            );
            return Ok(false);
        }
        if !self
            .pre_prepare_messages
            .messages_by_round(self.state.round)
            .is_empty()
        {
            debug!("duplicate pre-prepare from leader, dropping");
            return Ok(false);
        }
        if !self.justify_pre_prepare(self.state.round, &msg.message.value) {
            debug!(round = self.state.round, "unjustified pre-prepare, dropping");
            return Ok(false);
        }

        self.pre_prepare_messages.add(&msg);
        let value = msg.message.value.clone();
        let round = self.state.round;
        debug!(round, "pre-prepare accepted, broadcasting prepare");
        self.sign_and_broadcast(MessageType::Prepare, round, value)
            .await?;
        self.state.stage = Stage::Prepare;
        Ok(true)
    }

    /// A round-change quorum justifies a pre-prepare for that round iff no
    /// certificate among it was prepared, or the pre-prepare's value equals
    /// the prepared value of the highest-round certificate. Round 1 needs no
    /// justification.
    fn justify_pre_prepare(&self, round: u64, value: &[u8]) -> bool {
        if round == 1 {
            return true;
        }
        let (achieved, msgs) = self.change_round_messages.change_round_quorum(round);
        if !achieved {
            return false;
        }
        match highest_prepared_certificate(&msgs) {
            Some(cert) => cert.prepared_value == value,
            None => true,
        }
    }

    async fn process_prepare(&mut self, msg: SignedMessage) -> Result<bool, InstanceError> {
        if let Err(e) = self.stage_pipeline(MessageType::Prepare).run(&msg) {
            return Ok(self.drop_invalid(&msg, &e));
        }

        self.prepare_messages.add(&msg);

        if self.state.stage != Stage::Prepare {
            return Ok(true);
        }
        let (achieved, _) = self
            .prepare_messages
            .quorum_achieved(self.state.round, &msg.message.value);
        if achieved {
            self.state.prepared_round = self.state.round;
            self.state.prepared_value = msg.message.value.clone();
            let round = self.state.round;
            let value = msg.message.value.clone();
            info!(round, "prepare quorum reached, broadcasting commit");
            self.sign_and_broadcast(MessageType::Commit, round, value.clone())
                .await?;
            self.state.stage = Stage::Commit;
            // Commits may already have been recorded while we were still
            // collecting prepares; the quorum check must not wait for the
            // next arrival.
            self.try_decide(&value)?;
        }
        Ok(true)
    }

    async fn process_commit(&mut self, msg: SignedMessage) -> Result<bool, InstanceError> {
        if let Err(e) = self.stage_pipeline(MessageType::Commit).run(&msg) {
            return Ok(self.drop_invalid(&msg, &e));
        }

        self.commit_messages.add(&msg);

        if self.state.stage != Stage::Commit {
            return Ok(true);
        }
        self.try_decide(&msg.message.value)?;
        Ok(true)
    }

    /// Moves to `Decided` when the commit container holds a quorum for the
    /// given value, aggregating the witnesses into the decided message.
    fn try_decide(&mut self, value: &[u8]) -> Result<(), InstanceError> {
        if self.state.stage != Stage::Commit {
            return Ok(());
        }
        let (achieved, witnesses) = self
            .commit_messages
            .quorum_achieved(self.state.round, value);
        if achieved {
            let witnesses = distinct_signer_witnesses(witnesses);
            let decided = aggregate_messages(&witnesses)?;
            info!(
                round = self.state.round,
                sequence = self.state.sequence,
                signers = decided.signer_ids.len(),
                "commit quorum reached, instance decided"
            );
            self.decided = Some(decided);
            self.state.stage = Stage::Decided;
        }
        Ok(())
    }

    async fn process_change_round(&mut self, msg: SignedMessage) -> Result<bool, InstanceError> {
        let pipeline = Pipeline::combine([
            basic_msg_validation(),
            msg_type_check(MessageType::ChangeRound),
            validate_lambdas(self.state.identifier.clone()),
            validate_sequence(self.state.sequence),
            authorize_msg(self.share.clone()),
        ]);
        if let Err(e) = pipeline.run(&msg) {
            return Ok(self.drop_invalid(&msg, &e));
        }
        if !self.validate_change_round_certificate(&msg) {
            debug!(round = msg.message.round, "invalid change-round certificate");
            return Ok(false);
        }
        if matches!(self.state.stage, Stage::Decided) {
            return Ok(true);
        }

        self.change_round_messages.add(&msg);

        // Accelerate: f+1 distinct peers beyond our round prove an honest
        // node is already ahead — jump to the lowest such round.
        let (found, lowest) = self
            .change_round_messages
            .partial_change_round_quorum(self.state.round);
        if found && lowest > self.state.round {
            info!(
                from = self.state.round,
                to = lowest,
                "partial change-round quorum, jumping ahead"
            );
            self.bump_round(lowest).await?;
        }

        // A full quorum for the current round makes its leader propose.
        let (achieved, msgs) = self
            .change_round_messages
            .change_round_quorum(self.state.round);
        if achieved && self.is_self_leader(self.state.round) {
            let value = highest_prepared_certificate(&msgs)
                .map(|cert| cert.prepared_value)
                .unwrap_or_else(|| self.state.input_value.clone());
            let round = self.state.round;
            info!(round, "change-round quorum as leader, broadcasting pre-prepare");
            self.sign_and_broadcast(MessageType::PrePrepare, round, value)
                .await?;
        }
        Ok(true)
    }

    /// A change-round message carrying a prepared certificate must prove it:
    /// the justification prepares must match the certificate, belong to this
    /// instance, verify against the committee, and reach a quorum of
    /// distinct signers.
    fn validate_change_round_certificate(&self, msg: &SignedMessage) -> bool {
        let data = match ChangeRoundData::decode(&msg.message.value) {
            Ok(d) => d,
            Err(_) => return false,
        };
        if !data.has_prepared() {
            return true;
        }
        if data.prepared_round >= msg.message.round {
            return false;
        }

        let mut signers: Vec<u64> = Vec::new();
        for witness in &data.justification {
            let m = &witness.message;
            if m.msg_type != MessageType::Prepare
                || m.round != data.prepared_round
                || m.value != data.prepared_value
                || m.sequence != self.state.sequence
                || m.identifier != self.state.identifier
                || !witness.verify(&self.share.committee)
            {
                return false;
            }
            for id in &witness.signer_ids {
                if !signers.contains(id) {
                    signers.push(*id);
                }
            }
        }
        signers.len() >= self.share.threshold_size()
    }

    // -----------------------------------------------------------------------
    // Round changes
    // -----------------------------------------------------------------------

    /// Advances to `new_round`: broadcasts our change-round message (with
    /// the local prepared certificate when we have one), purges the queue of
    /// the abandoned round's traffic, and resets the sub-stage to
    /// `PrePrepare` for the new round.
    async fn bump_round(&mut self, new_round: u64) -> Result<(), InstanceError> {
        self.state.stage = Stage::ChangeRound;
        self.state.round = new_round;
        self.round_started_at = Instant::now();

        let data = if self.state.prepared_round > 0 {
            let (_, witnesses) = self
                .prepare_messages
                .quorum_achieved(self.state.prepared_round, &self.state.prepared_value);
            ChangeRoundData {
                prepared_round: self.state.prepared_round,
                prepared_value: self.state.prepared_value.clone(),
                justification: witnesses,
            }
        } else {
            ChangeRoundData::default()
        };
        let value = data.encode()?;
        self.sign_and_broadcast(MessageType::ChangeRound, new_round, value)
            .await?;

        let identifier = self.state.identifier.clone();
        let sequence = self.state.sequence;
        let purged = self.queue.purge(|index| {
            index.identifier == identifier
                && index.sequence == sequence
                && index.round < new_round
                && index.msg_type != MessageType::ChangeRound
        });
        if purged > 0 {
            debug!(purged, new_round, "purged stale round traffic");
        }

        self.state.stage = Stage::PrePrepare;
        Ok(())
    }

    async fn sign_and_broadcast(
        &self,
        msg_type: MessageType,
        round: u64,
        value: Vec<u8>,
    ) -> Result<SignedMessage, InstanceError> {
        let message = Message {
            msg_type,
            round,
            sequence: self.state.sequence,
            identifier: self.state.identifier.clone(),
            value,
        };
        let own_key = self.own_share_key()?;
        let signature = self.signer.sign_consensus_message(&message, &own_key)?;
        let signed = SignedMessage {
            message,
            signature,
            signer_ids: vec![self.share.node_id],
        };
        self.network.broadcast(&signed).await?;
        Ok(signed)
    }
}

/// The certificate with the highest prepared round across a set of
/// change-round messages, if any was prepared.
fn highest_prepared_certificate(msgs: &[SignedMessage]) -> Option<ChangeRoundData> {
    msgs.iter()
        .filter_map(|m| ChangeRoundData::decode(&m.message.value).ok())
        .filter(ChangeRoundData::has_prepared)
        .max_by_key(|cert| cert.prepared_round)
}

/// Filters quorum witnesses down to a set with pairwise-disjoint signers so
/// their signatures aggregate cleanly. An already-aggregated witness can
/// overlap a single vote; the first seen wins.
fn distinct_signer_witnesses(witnesses: Vec<SignedMessage>) -> Vec<SignedMessage> {
    let mut seen: Vec<u64> = Vec::new();
    let mut out = Vec::new();
    for witness in witnesses {
        if witness.signer_ids.iter().any(|id| seen.contains(id)) {
            continue;
        }
        seen.extend(witness.signer_ids.iter().copied());
        out.push(witness);
    }
    out
}
