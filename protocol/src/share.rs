//! # Validator Share
//!
//! One operator's view of a threshold-shared validator: which committee seat
//! it holds, the validator's public key, and the share public keys of every
//! committee member. The share carries no secret material — secrets live in
//! the signer's wallet, keyed by share public key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{partial_quorum_threshold, quorum_threshold};
use crate::crypto::bls::BlsPublicKey;

/// Committee metadata for one validator, as held by one operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    /// This operator's committee seat, `1..=N`.
    pub node_id: u64,
    /// The validator's (master) public key.
    pub public_key: BlsPublicKey,
    /// Share public keys by committee seat.
    pub committee: BTreeMap<u64, BlsPublicKey>,
}

impl Share {
    pub fn committee_size(&self) -> usize {
        self.committee.len()
    }

    /// Full quorum: `2N/3 + 1` distinct signers.
    pub fn threshold_size(&self) -> usize {
        quorum_threshold(self.committee.len())
    }

    /// Partial quorum: `N/3 + 1` distinct signers. Round-change only.
    pub fn partial_threshold_size(&self) -> usize {
        partial_quorum_threshold(self.committee.len())
    }

    /// This operator's own share public key.
    ///
    /// Returns `None` when the share is malformed (node id not in its own
    /// committee map), which storage-level validation should have caught.
    pub fn own_share_key(&self) -> Option<&BlsPublicKey> {
        self.committee.get(&self.node_id)
    }

    /// Looks up share public keys for a set of committee seats. Any unknown
    /// seat fails the whole lookup.
    pub fn keys_by_id(&self, ids: &[u64]) -> Option<Vec<&BlsPublicKey>> {
        ids.iter().map(|id| self.committee.get(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::bls::BlsSecretKey;

    fn share_of(n: u64) -> Share {
        let committee: BTreeMap<u64, BlsPublicKey> = (1..=n)
            .map(|id| (id, BlsSecretKey::generate().public_key()))
            .collect();
        Share {
            node_id: 1,
            public_key: BlsSecretKey::generate().public_key(),
            committee,
        }
    }

    #[test]
    fn thresholds_for_committee_of_four() {
        let share = share_of(4);
        assert_eq!(share.committee_size(), 4);
        assert_eq!(share.threshold_size(), 3);
        assert_eq!(share.partial_threshold_size(), 2);
    }

    #[test]
    fn key_lookup_by_seat() {
        let share = share_of(4);
        assert!(share.own_share_key().is_some());
        assert_eq!(share.keys_by_id(&[1, 2, 3]).unwrap().len(), 3);
        assert!(share.keys_by_id(&[1, 9]).is_none());
    }
}
