//! # Slashing Protection
//!
//! The last line of defense between a buggy (or Byzantine) committee and a
//! slashed validator. For every key the signer serves, this store remembers
//! the highest attestation source/target epochs and the highest proposed
//! slot, and refuses anything that would regress them.
//!
//! The contract that keeps crashes safe: the watermark is durable on disk
//! *before* the caller gets a green light to sign. If the process dies
//! between durability and the signature leaving, recovery re-reads a
//! watermark that already forbids re-signing anything conflicting.
//!
//! Checks and updates are serialized per key; different keys proceed in
//! parallel.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::beacon::AttestationData;
use crate::crypto::bls::BlsPublicKey;
use crate::storage::{decode, encode, StorageError, StorageResult, Store};

/// What kind of double-signing a rejected request amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlashingKind {
    HighestAttestationVote,
    HighestProposal,
}

impl std::fmt::Display for SlashingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlashingKind::HighestAttestationVote => f.write_str("HighestAttestationVote"),
            SlashingKind::HighestProposal => f.write_str("HighestProposal"),
        }
    }
}

/// Errors from the protection check.
#[derive(Debug, thiserror::Error)]
pub enum SlashingError {
    /// The request conflicts with a recorded watermark. Never retried,
    /// never swallowed.
    #[error("slashable attestation ({0}), not signing")]
    Slashable(SlashingKind),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Persisted attestation watermark per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationMark {
    pub source_epoch: u64,
    pub target_epoch: u64,
}

/// The slashing-protection store. Wraps the shared [`Store`] with per-key
/// write serialization.
pub struct SlashingProtector {
    store: Arc<Store>,
    locks: DashMap<Vec<u8>, Arc<Mutex<()>>>,
}

impl SlashingProtector {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    fn key_lock(&self, pk: &BlsPublicKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(pk.as_bytes().to_vec())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Rejects the attestation if it regresses the recorded source/target
    /// watermark; otherwise records the new watermark durably and allows it.
    pub fn check_and_record_attestation(
        &self,
        pk: &BlsPublicKey,
        data: &AttestationData,
    ) -> Result<(), SlashingError> {
        let lock = self.key_lock(pk);
        let _guard = lock.lock();

        if let Some(mark) = self.get_highest_attestation(pk)? {
            if data.source.epoch < mark.source_epoch || data.target.epoch <= mark.target_epoch {
                return Err(SlashingError::Slashable(SlashingKind::HighestAttestationVote));
            }
        }

        self.store.slashing_att.insert(
            pk.as_bytes(),
            encode(&AttestationMark {
                source_epoch: data.source.epoch,
                target_epoch: data.target.epoch,
            })?,
        )
        .map_err(StorageError::from)?;
        // Durable before the signature is allowed out.
        self.store.flush()?;
        Ok(())
    }

    /// Rejects the proposal if its slot does not advance the recorded
    /// highest; otherwise records and allows.
    pub fn check_and_record_block(
        &self,
        pk: &BlsPublicKey,
        slot: u64,
    ) -> Result<(), SlashingError> {
        let lock = self.key_lock(pk);
        let _guard = lock.lock();

        if let Some(highest) = self.get_highest_block(pk)? {
            if slot <= highest {
                return Err(SlashingError::Slashable(SlashingKind::HighestProposal));
            }
        }

        self.store
            .slashing_blk
            .insert(pk.as_bytes(), &slot.to_be_bytes())
            .map_err(StorageError::from)?;
        self.store.flush()?;
        Ok(())
    }

    /// The recorded attestation watermark, if any.
    pub fn get_highest_attestation(
        &self,
        pk: &BlsPublicKey,
    ) -> StorageResult<Option<AttestationMark>> {
        match self.store.slashing_att.get(pk.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The recorded highest proposed slot, if any.
    pub fn get_highest_block(&self, pk: &BlsPublicKey) -> StorageResult<Option<u64>> {
        match self.store.slashing_blk.get(pk.as_bytes())? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_ref().try_into().map_err(|_| {
                    StorageError::Serialization("invalid slot bytes".to_string())
                })?;
                Ok(Some(u64::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::{Checkpoint, Hash256};
    use crate::crypto::bls::BlsSecretKey;

    fn protector() -> SlashingProtector {
        SlashingProtector::new(Arc::new(Store::open_temporary().unwrap()))
    }

    fn attestation(source: u64, target: u64) -> AttestationData {
        AttestationData {
            slot: target * 32,
            index: 0,
            beacon_block_root: Hash256::zero(),
            source: Checkpoint {
                epoch: source,
                root: Hash256::zero(),
            },
            target: Checkpoint {
                epoch: target,
                root: Hash256::zero(),
            },
        }
    }

    #[test]
    fn first_attestation_is_recorded() {
        let p = protector();
        let pk = BlsSecretKey::generate().public_key();

        p.check_and_record_attestation(&pk, &attestation(1, 3))
            .expect("first vote allowed");

        let mark = p.get_highest_attestation(&pk).unwrap().unwrap();
        assert_eq!(mark.source_epoch, 1);
        assert_eq!(mark.target_epoch, 3);
    }

    #[test]
    fn repeated_target_is_slashable_and_leaves_watermark_untouched() {
        let p = protector();
        let pk = BlsSecretKey::generate().public_key();

        p.check_and_record_attestation(&pk, &attestation(1, 3))
            .unwrap();

        // Same target epoch, different vote — a double vote.
        let mut double = attestation(1, 3);
        double.beacon_block_root = Hash256::repeat_byte(2);
        let err = p
            .check_and_record_attestation(&pk, &double)
            .expect_err("double vote must be rejected");
        assert!(matches!(
            err,
            SlashingError::Slashable(SlashingKind::HighestAttestationVote)
        ));

        let mark = p.get_highest_attestation(&pk).unwrap().unwrap();
        assert_eq!(mark.target_epoch, 3);
    }

    #[test]
    fn surround_vote_is_slashable() {
        let p = protector();
        let pk = BlsSecretKey::generate().public_key();

        p.check_and_record_attestation(&pk, &attestation(2, 4))
            .unwrap();

        // Lower source than the watermark: would surround.
        let err = p
            .check_and_record_attestation(&pk, &attestation(1, 5))
            .expect_err("surround vote must be rejected");
        assert!(matches!(err, SlashingError::Slashable(_)));
    }

    #[test]
    fn advancing_votes_are_allowed_and_monotone() {
        let p = protector();
        let pk = BlsSecretKey::generate().public_key();

        p.check_and_record_attestation(&pk, &attestation(1, 3))
            .unwrap();
        p.check_and_record_attestation(&pk, &attestation(3, 4))
            .unwrap();
        p.check_and_record_attestation(&pk, &attestation(4, 7))
            .unwrap();

        let mark = p.get_highest_attestation(&pk).unwrap().unwrap();
        assert_eq!(mark.source_epoch, 4);
        assert_eq!(mark.target_epoch, 7);
    }

    #[test]
    fn block_slots_must_strictly_advance() {
        let p = protector();
        let pk = BlsSecretKey::generate().public_key();

        p.check_and_record_block(&pk, 10).unwrap();
        assert!(p.check_and_record_block(&pk, 10).is_err());
        assert!(p.check_and_record_block(&pk, 9).is_err());
        p.check_and_record_block(&pk, 11).unwrap();

        assert_eq!(p.get_highest_block(&pk).unwrap(), Some(11));
    }

    #[test]
    fn keys_are_independent() {
        let p = protector();
        let pk_a = BlsSecretKey::generate().public_key();
        let pk_b = BlsSecretKey::generate().public_key();

        p.check_and_record_attestation(&pk_a, &attestation(1, 3))
            .unwrap();
        // A fresh key is unaffected by another key's watermark.
        p.check_and_record_attestation(&pk_b, &attestation(0, 1))
            .unwrap();
    }

    #[test]
    fn watermark_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let pk = BlsSecretKey::generate().public_key();

        {
            let store = Arc::new(Store::open(dir.path()).unwrap());
            let p = SlashingProtector::new(store);
            p.check_and_record_attestation(&pk, &attestation(1, 3))
                .unwrap();
        }

        let store = Arc::new(Store::open(dir.path()).unwrap());
        let p = SlashingProtector::new(store);
        assert!(p
            .check_and_record_attestation(&pk, &attestation(1, 3))
            .is_err());
    }
}
