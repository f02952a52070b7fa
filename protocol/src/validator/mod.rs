//! # Duty Runtime
//!
//! The bridge between beacon duties and the consensus machinery. For each
//! assigned duty the runner: fetches the data to vote on, drives the
//! controller through one consensus sequence, signs the decided payload with
//! this operator's share, broadcasts that partial signature, collects a
//! quorum of partials from the committee, and reconstructs the validator's
//! full BLS signature by Lagrange interpolation before handing it to the
//! beacon client.
//!
//! The reconstructed signature is verified against the validator's master
//! public key before submission — interpolation over a bad partial yields
//! garbage, and garbage must never reach the beacon node.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::beacon::{
    AttestationData, BeaconClient, BeaconError, ConsensusData, Duty, Hash256,
};
use crate::config::{InstanceConfig, SIGNATURE_COLLECTION_TIMEOUT};
use crate::consensus::controller::{Controller, ControllerError, StartOptions};
use crate::consensus::message::{Message, MessageType, SignedMessage};
use crate::crypto::bls::{reconstruct_signature, BlsError, BlsSignature};
use crate::network::Network;
use crate::share::Share;
use crate::signer::{KeyManager, SignerError};

// ---------------------------------------------------------------------------
// Errors & Results
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DutyError {
    #[error("duty for slot {slot} expired at current slot {current}")]
    Expired { slot: u64, current: u64 },
    #[error("timed out collecting partial signatures")]
    PartialSignatureTimeout,
    #[error("reconstructed signature does not verify against the validator key")]
    ReconstructionMismatch,
    #[error("malformed share: own seat missing from committee")]
    MalformedShare,
    #[error(transparent)]
    Beacon(#[from] BeaconError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error(transparent)]
    Bls(#[from] BlsError),
    #[error(transparent)]
    Network(#[from] crate::network::NetworkError),
}

/// What a completed duty produced.
#[derive(Debug, Clone)]
pub struct DutyResult {
    pub sequence: u64,
    pub attestation: AttestationData,
    pub signature: BlsSignature,
}

pub struct DutyRunnerOptions {
    pub share: Share,
    pub controller: Arc<Controller>,
    pub network: Arc<dyn Network>,
    pub beacon: Arc<dyn BeaconClient>,
    pub signer: Arc<KeyManager>,
    pub config: InstanceConfig,
}

// ---------------------------------------------------------------------------
// DutyRunner
// ---------------------------------------------------------------------------

/// Executes beacon duties for one validator on one operator.
pub struct DutyRunner {
    share: Share,
    controller: Arc<Controller>,
    network: Arc<dyn Network>,
    beacon: Arc<dyn BeaconClient>,
    signer: Arc<KeyManager>,
    config: InstanceConfig,
    /// Registered once so no partial broadcast can slip past between decide
    /// and collect. Duties run one at a time per validator.
    signatures: Mutex<mpsc::Receiver<SignedMessage>>,
}

impl DutyRunner {
    pub fn new(opts: DutyRunnerOptions) -> Self {
        let signatures = Mutex::new(opts.network.received_signature_chan());
        Self {
            share: opts.share,
            controller: opts.controller,
            network: opts.network,
            beacon: opts.beacon,
            signer: opts.signer,
            config: opts.config,
            signatures,
        }
    }

    /// Runs one attester duty end to end. `current_slot` gates stale duties.
    pub async fn execute_duty(
        &self,
        duty: Duty,
        current_slot: u64,
    ) -> Result<DutyResult, DutyError> {
        if current_slot.saturating_sub(duty.slot) > self.config.duty_slot_limit {
            return Err(DutyError::Expired {
                slot: duty.slot,
                current: current_slot,
            });
        }

        let data = self
            .beacon
            .attestation_data(duty.slot, duty.committee_index)
            .await?;
        let value = ConsensusData::new(duty, &data).encode()?;

        let sequence = self.controller.next_sequence()?;
        info!(sequence, slot = data.slot, "starting consensus for duty");
        let decided = self
            .controller
            .start_instance(StartOptions { sequence, value })
            .await?;

        // Sign whatever was decided, not what we proposed — the committee
        // may have converged on another operator's data.
        let decided_data = ConsensusData::decode(&decided.message.value)?;
        let attestation = decided_data.attestation_data()?;
        let own_key = self
            .share
            .own_share_key()
            .cloned()
            .ok_or(DutyError::MalformedShare)?;
        let (root, partial) =
            self.signer
                .sign_attestation(&attestation, &decided_data.duty, &own_key)?;

        let partial_msg = SignedMessage {
            message: Message {
                msg_type: MessageType::Commit,
                round: decided.message.round,
                sequence,
                identifier: self.controller.identifier().to_vec(),
                value: Vec::new(),
            },
            signature: partial,
            signer_ids: vec![self.share.node_id],
        };
        self.network.broadcast_signature(&partial_msg).await?;

        let partials = self.collect_partials(sequence, root).await?;
        let full = reconstruct_signature(&partials)?;
        if !full.verify(&self.share.public_key, root.as_bytes()) {
            return Err(DutyError::ReconstructionMismatch);
        }

        self.beacon
            .submit_attestation(&attestation, &self.share.public_key, &full)
            .await?;
        info!(
            sequence,
            slot = attestation.slot,
            partials = partials.len(),
            "attestation submitted"
        );
        Ok(DutyResult {
            sequence,
            attestation,
            signature: full,
        })
    }

    /// Gathers partial signatures over `root` for `sequence` until the
    /// committee threshold is met. Invalid or stale partials are skipped,
    /// not fatal.
    async fn collect_partials(
        &self,
        sequence: u64,
        root: Hash256,
    ) -> Result<BTreeMap<u64, BlsSignature>, DutyError> {
        let threshold = self.share.threshold_size();
        let mut partials: BTreeMap<u64, BlsSignature> = BTreeMap::new();
        let mut rx = self.signatures.lock().await;
        let deadline = tokio::time::Instant::now() + SIGNATURE_COLLECTION_TIMEOUT;

        while partials.len() < threshold {
            let msg = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        have = partials.len(),
                        need = threshold,
                        "partial signature collection timed out"
                    );
                    return Err(DutyError::PartialSignatureTimeout);
                }
                received = rx.recv() => match received {
                    Some(msg) => msg,
                    None => return Err(DutyError::PartialSignatureTimeout),
                },
            };

            if msg.message.identifier != self.controller.identifier()
                || msg.message.sequence != sequence
            {
                continue;
            }
            let &[signer_id] = msg.signer_ids.as_slice() else {
                debug!("partial signature with unexpected signer list, skipping");
                continue;
            };
            let Some(share_pk) = self.share.committee.get(&signer_id) else {
                debug!(signer_id, "partial signature from outside the committee");
                continue;
            };
            if !msg.signature.verify(share_pk, root.as_bytes()) {
                debug!(signer_id, "partial signature failed verification, skipping");
                continue;
            }
            partials.insert(signer_id, msg.signature.clone());
            debug!(
                signer_id,
                have = partials.len(),
                need = threshold,
                "partial signature collected"
            );
        }
        Ok(partials)
    }
}
