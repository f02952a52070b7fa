//! # Slashing-Protected Signer
//!
//! The only component allowed to touch share secrets. It keeps an in-memory
//! wallet of BLS shares (persisted encrypted by the surrounding application)
//! and produces three kinds of signatures:
//!
//! - attestations — after consulting the slashing-protection store,
//! - block proposals — after the highest-proposed-slot check,
//! - consensus messages — internal votes, no slashing semantics.
//!
//! The ordering is deliberate: key lookup first (an unknown key must not
//! advance a watermark), slashing check-and-record second (durable before
//! any signature exists), signature last.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::beacon::{signing_root, AttestationData, BeaconBlockHeader, Domains, Duty, Hash256};
use crate::consensus::message::Message;
use crate::crypto::bls::{BlsPublicKey, BlsSecretKey, BlsSignature};
use crate::storage::slashing::{SlashingError, SlashingProtector};
use crate::storage::Store;

/// Errors the signer surfaces to callers.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    /// The request would be punishable on-chain. Never retried.
    #[error("failed to sign attestation: {0}")]
    Slashing(#[from] SlashingError),
    /// No share loaded for the requested key.
    #[error("unknown key: {0}")]
    UnknownKey(String),
    /// The cryptographic backend failed. Fatal to this operation only.
    #[error("cryptographic failure: {0}")]
    Cryptographic(String),
}

/// In-memory wallet of BLS shares plus the slashing gate in front of it.
pub struct KeyManager {
    wallet: RwLock<HashMap<Vec<u8>, BlsSecretKey>>,
    slashing: SlashingProtector,
    domains: Domains,
}

impl KeyManager {
    pub fn new(store: Arc<Store>, domains: Domains) -> Self {
        Self {
            wallet: RwLock::new(HashMap::new()),
            slashing: SlashingProtector::new(store),
            domains,
        }
    }

    /// Loads a share secret into the wallet, keyed by its own public key.
    /// Re-adding the same share is a no-op.
    pub fn add_share(&self, secret: BlsSecretKey) {
        let pk = secret.public_key();
        self.wallet
            .write()
            .insert(pk.as_bytes().to_vec(), secret);
        tracing::debug!(share_pk = %pk.to_hex(), "share loaded into wallet");
    }

    fn secret_for(&self, pk: &BlsPublicKey) -> Result<BlsSecretKey, SignerError> {
        self.wallet
            .read()
            .get(pk.as_bytes().as_slice())
            .cloned()
            .ok_or_else(|| SignerError::UnknownKey(pk.to_hex()))
    }

    /// Signs attestation data with the share behind `pk`, returning the
    /// signing root alongside the signature. Fails closed on anything the
    /// slashing store flags.
    pub fn sign_attestation(
        &self,
        data: &AttestationData,
        duty: &Duty,
        pk: &BlsPublicKey,
    ) -> Result<(Hash256, BlsSignature), SignerError> {
        let secret = self.secret_for(pk)?;

        if data.slot != duty.slot {
            return Err(SignerError::Cryptographic(format!(
                "attestation slot {} does not match duty slot {}",
                data.slot, duty.slot
            )));
        }

        self.slashing.check_and_record_attestation(pk, data)?;

        let root = signing_root(data, self.domains.attester);
        let signature = secret.sign(root.as_bytes());
        tracing::debug!(
            share_pk = %pk.to_hex(),
            slot = data.slot,
            target_epoch = data.target.epoch,
            "attestation signed"
        );
        Ok((root, signature))
    }

    /// Signs a block header with the share behind `pk`, gated by the
    /// highest-proposed-slot watermark.
    pub fn sign_block(
        &self,
        header: &BeaconBlockHeader,
        pk: &BlsPublicKey,
    ) -> Result<(Hash256, BlsSignature), SignerError> {
        let secret = self.secret_for(pk)?;
        self.slashing.check_and_record_block(pk, header.slot)?;

        let root = signing_root(header, self.domains.proposer);
        Ok((root, secret.sign(root.as_bytes())))
    }

    /// Signs a consensus message's root. No slashing check — this is an
    /// internal vote, not a beacon-chain object.
    pub fn sign_consensus_message(
        &self,
        msg: &Message,
        pk: &BlsPublicKey,
    ) -> Result<BlsSignature, SignerError> {
        let secret = self.secret_for(pk)?;
        Ok(secret.sign(msg.signing_root().as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::{Checkpoint, Role};
    use crate::consensus::message::{MessageType, SignedMessage};
    use std::collections::BTreeMap;

    fn key_manager() -> KeyManager {
        KeyManager::new(
            Arc::new(Store::open_temporary().unwrap()),
            Domains::default(),
        )
    }

    fn duty_for(pk: BlsPublicKey) -> Duty {
        Duty {
            role: Role::Attester,
            validator_pk: pk,
            slot: 30,
            validator_index: 1,
            committee_index: 2,
            committee_length: 128,
            committees_at_slot: 4,
            validator_committee_index: 3,
        }
    }

    fn attestation() -> AttestationData {
        AttestationData {
            slot: 30,
            index: 1,
            beacon_block_root: Hash256::repeat_byte(1),
            source: Checkpoint {
                epoch: 1,
                root: Hash256::zero(),
            },
            target: Checkpoint {
                epoch: 3,
                root: Hash256::zero(),
            },
        }
    }

    #[test]
    fn sign_once_succeeds() {
        let km = key_manager();
        let secret = BlsSecretKey::generate();
        let pk = secret.public_key();
        km.add_share(secret);

        let data = attestation();
        let (root, sig) = km
            .sign_attestation(&data, &duty_for(pk.clone()), &pk)
            .expect("first signature allowed");

        // The root is the domain-mixed signing root, and the signature
        // verifies against the share key over it.
        assert_eq!(root, signing_root(&data, Hash256::zero()));
        assert!(sig.verify(&pk, root.as_bytes()));
    }

    #[test]
    fn slashable_second_vote_fails_with_no_signature() {
        let km = key_manager();
        let secret = BlsSecretKey::generate();
        let pk = secret.public_key();
        km.add_share(secret);

        let data = attestation();
        km.sign_attestation(&data, &duty_for(pk.clone()), &pk)
            .unwrap();

        // Same target epoch, different block root: a double vote.
        let mut double = data;
        double.beacon_block_root = Hash256::repeat_byte(2);
        let err = km
            .sign_attestation(&double, &duty_for(pk.clone()), &pk)
            .expect_err("double vote must fail");

        assert_eq!(
            err.to_string(),
            "failed to sign attestation: slashable attestation (HighestAttestationVote), not signing"
        );
    }

    #[test]
    fn unknown_key_does_not_advance_watermark() {
        let km = key_manager();
        let stranger = BlsSecretKey::generate().public_key();

        let err = km
            .sign_attestation(&attestation(), &duty_for(stranger.clone()), &stranger)
            .expect_err("no share loaded");
        assert!(matches!(err, SignerError::UnknownKey(_)));

        // Loading the key afterwards must allow the same vote: the failed
        // attempt must not have recorded anything.
        let secret = BlsSecretKey::generate();
        let pk = secret.public_key();
        km.add_share(secret);
        km.sign_attestation(&attestation(), &duty_for(pk.clone()), &pk)
            .expect("fresh key signs");
    }

    #[test]
    fn slot_mismatch_rejected() {
        let km = key_manager();
        let secret = BlsSecretKey::generate();
        let pk = secret.public_key();
        km.add_share(secret);

        let mut duty = duty_for(pk.clone());
        duty.slot = 31;
        assert!(km.sign_attestation(&attestation(), &duty, &pk).is_err());
    }

    #[test]
    fn block_signing_respects_slot_watermark() {
        let km = key_manager();
        let secret = BlsSecretKey::generate();
        let pk = secret.public_key();
        km.add_share(secret);

        let header = BeaconBlockHeader {
            slot: 10,
            proposer_index: 1,
            parent_root: Hash256::zero(),
            state_root: Hash256::zero(),
            body_root: Hash256::zero(),
        };
        km.sign_block(&header, &pk).expect("first proposal");
        assert!(km.sign_block(&header, &pk).is_err());
    }

    #[test]
    fn consensus_message_signature_verifies_in_envelope() {
        let km = key_manager();
        let secret = BlsSecretKey::generate();
        let pk = secret.public_key();
        km.add_share(secret);

        let msg = Message {
            msg_type: MessageType::Commit,
            round: 2,
            sequence: 3,
            identifier: b"lambda1".to_vec(),
            value: b"value1".to_vec(),
        };
        let sig = km.sign_consensus_message(&msg, &pk).expect("signable");

        let committee: BTreeMap<u64, BlsPublicKey> = [(1u64, pk)].into_iter().collect();
        let signed = SignedMessage {
            message: msg,
            signature: sig,
            signer_ids: vec![1],
        };
        assert!(signed.verify(&committee));
    }
}
