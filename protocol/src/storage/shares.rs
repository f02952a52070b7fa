//! # Share Collection
//!
//! Persistence for validator shares — the committee metadata each operator
//! holds per validator. Keyed by the validator's public key.

use crate::crypto::bls::BlsPublicKey;
use crate::share::Share;
use crate::storage::{decode, encode, StorageResult, Store};

impl Store {
    /// Persists a validator share, replacing any previous version.
    pub fn save_validator_share(&self, share: &Share) -> StorageResult<()> {
        self.shares
            .insert(share.public_key.as_bytes(), encode(share)?)?;
        Ok(())
    }

    /// Reads the share for a validator. `Ok(None)` for unknown validators.
    pub fn get_validator_share(&self, pk: &BlsPublicKey) -> StorageResult<Option<Share>> {
        match self.shares.get(pk.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Enumerates every stored share. Used at startup to spin up one
    /// controller per validator.
    pub fn get_all_shares(&self) -> StorageResult<Vec<Share>> {
        let mut out = Vec::new();
        for item in self.shares.iter() {
            let (_, bytes) = item?;
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::bls::BlsSecretKey;
    use std::collections::BTreeMap;

    fn share_for(validator: &BlsSecretKey, node_id: u64) -> Share {
        let committee: BTreeMap<u64, BlsPublicKey> = (1..=4)
            .map(|id| (id, BlsSecretKey::generate().public_key()))
            .collect();
        Share {
            node_id,
            public_key: validator.public_key(),
            committee,
        }
    }

    #[test]
    fn save_and_get_share() {
        let store = Store::open_temporary().unwrap();
        let validator = BlsSecretKey::generate();
        let share = share_for(&validator, 2);

        store.save_validator_share(&share).unwrap();

        let read = store
            .get_validator_share(&validator.public_key())
            .unwrap()
            .expect("share exists");
        assert_eq!(read, share);

        let other = BlsSecretKey::generate().public_key();
        assert!(store.get_validator_share(&other).unwrap().is_none());
    }

    #[test]
    fn get_all_shares_enumerates() {
        let store = Store::open_temporary().unwrap();
        for _ in 0..3 {
            let validator = BlsSecretKey::generate();
            store
                .save_validator_share(&share_for(&validator, 1))
                .unwrap();
        }
        assert_eq!(store.get_all_shares().unwrap().len(), 3);
    }

    #[test]
    fn save_replaces_existing() {
        let store = Store::open_temporary().unwrap();
        let validator = BlsSecretKey::generate();

        store.save_validator_share(&share_for(&validator, 1)).unwrap();
        store.save_validator_share(&share_for(&validator, 3)).unwrap();

        let read = store
            .get_validator_share(&validator.public_key())
            .unwrap()
            .unwrap();
        assert_eq!(read.node_id, 3);
        assert_eq!(store.get_all_shares().unwrap().len(), 1);
    }
}
