//! # Beacon-Chain Domain Types
//!
//! The slice of the Ethereum consensus data model that a share operator
//! actually touches: attestation data, the signing-root construction, and
//! the duty descriptor handed down by the beacon node. Everything else about
//! the beacon chain lives behind the [`BeaconClient`] trait — fetching duties
//! and submitting aggregates is the surrounding application's plumbing, not
//! ours.
//!
//! Roots are computed with the standard SSZ merkleization
//! (`hash_tree_root`), so a signature produced here is byte-identical to one
//! produced by any mainline consensus client given the same data and domain.

use ethereum_types::H256;
use ssz::{Decode, Encode};
use ssz_derive::{Decode as SszDecode, Encode as SszEncode};
use serde::{Deserialize, Serialize};
use tree_hash::TreeHash;
use tree_hash_derive::TreeHash as TreeHashDerive;

use crate::crypto::bls::{BlsPublicKey, BlsSignature};

/// 32-byte root / domain alias, matching consensus-spec naming.
pub type Hash256 = H256;

// ---------------------------------------------------------------------------
// Roles & Identifiers
// ---------------------------------------------------------------------------

/// The beacon duty a consensus stream serves. Each `(validator, role)` pair
/// gets its own identifier and therefore its own controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Attest to the head of the chain once per epoch.
    Attester,
    /// Propose a block when the validator is selected.
    Proposer,
}

impl Role {
    /// Stable lowercase name, used in identifiers and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Attester => "attester",
            Role::Proposer => "proposer",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the canonical identifier ("lambda") binding a consensus stream to a
/// validator and role. Every consensus message carries these bytes and is
/// routed by them.
pub fn identifier(validator_pk: &BlsPublicKey, role: Role) -> Vec<u8> {
    format!("{}_{}", validator_pk.to_hex(), role.as_str()).into_bytes()
}

// ---------------------------------------------------------------------------
// Attestation Data
// ---------------------------------------------------------------------------

/// A checkpoint: an epoch boundary the attestation votes for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SszEncode, SszDecode, TreeHashDerive,
)]
pub struct Checkpoint {
    pub epoch: u64,
    pub root: Hash256,
}

/// The content of an attestation vote, exactly as the consensus spec lays it
/// out. This is the value the committee runs consensus over (wrapped in
/// [`ConsensusData`]) and the object the slashing store watches.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SszEncode, SszDecode, TreeHashDerive,
)]
pub struct AttestationData {
    pub slot: u64,
    pub index: u64,
    pub beacon_block_root: Hash256,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

/// A beacon block header — the proposer-role analog of [`AttestationData`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SszEncode, SszDecode, TreeHashDerive,
)]
pub struct BeaconBlockHeader {
    pub slot: u64,
    pub proposer_index: u64,
    pub parent_root: Hash256,
    pub state_root: Hash256,
    pub body_root: Hash256,
}

/// The container whose hash-tree-root is what actually gets signed:
/// the object root mixed with the signature domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TreeHashDerive)]
pub struct SigningData {
    pub object_root: Hash256,
    pub domain: Hash256,
}

/// Computes the signing root of an object under a domain.
pub fn signing_root<T: TreeHash>(object: &T, domain: Hash256) -> Hash256 {
    SigningData {
        object_root: object.tree_hash_root(),
        domain,
    }
    .tree_hash_root()
}

// ---------------------------------------------------------------------------
// Domains
// ---------------------------------------------------------------------------

/// Signature domains per duty kind. Real networks derive these from the fork
/// version and genesis validators root; devnets and the test suites run with
/// the zeroed defaults, which the signer treats as perfectly valid domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Domains {
    pub attester: Hash256,
    pub proposer: Hash256,
}

// ---------------------------------------------------------------------------
// Duty
// ---------------------------------------------------------------------------

/// A beacon duty assigned to a validator at a slot, as delivered by the
/// beacon node's duties endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Duty {
    pub role: Role,
    pub validator_pk: BlsPublicKey,
    pub slot: u64,
    pub validator_index: u64,
    pub committee_index: u64,
    pub committee_length: u64,
    pub committees_at_slot: u64,
    pub validator_committee_index: u64,
}

// ---------------------------------------------------------------------------
// Consensus Payload
// ---------------------------------------------------------------------------

/// The value a committee decides on for an attester duty: the duty context
/// plus the SSZ-encoded attestation data.
///
/// The consensus machinery treats this as opaque bytes; only the validator
/// runtime and the signer look inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusData {
    pub duty: Duty,
    attestation_ssz: Vec<u8>,
}

impl ConsensusData {
    pub fn new(duty: Duty, attestation: &AttestationData) -> Self {
        Self {
            duty,
            attestation_ssz: attestation.as_ssz_bytes(),
        }
    }

    /// Decodes the attestation data out of the payload.
    pub fn attestation_data(&self) -> Result<AttestationData, BeaconError> {
        AttestationData::from_ssz_bytes(&self.attestation_ssz)
            .map_err(|e| BeaconError::Encoding(format!("{e:?}")))
    }

    /// Serializes the whole payload for use as a consensus input value.
    pub fn encode(&self) -> Result<Vec<u8>, BeaconError> {
        bincode::serialize(self).map_err(|e| BeaconError::Encoding(e.to_string()))
    }

    /// Parses a consensus value back into a payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, BeaconError> {
        bincode::deserialize(bytes).map_err(|e| BeaconError::Encoding(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Beacon Client Interface
// ---------------------------------------------------------------------------

/// Errors surfaced by beacon-node interaction or payload handling.
#[derive(Debug, thiserror::Error)]
pub enum BeaconError {
    #[error("beacon payload encoding failed: {0}")]
    Encoding(String),
    #[error("beacon node error: {0}")]
    Node(String),
}

/// The beacon-chain RPC surface the runtime needs. Implementations talk HTTP
/// to a real beacon node; tests plug in canned data.
#[async_trait::async_trait]
pub trait BeaconClient: Send + Sync {
    /// Fetches the attestation data the committee should vote on.
    async fn attestation_data(
        &self,
        slot: u64,
        committee_index: u64,
    ) -> Result<AttestationData, BeaconError>;

    /// Submits a fully reconstructed, validator-key attestation signature.
    async fn submit_attestation(
        &self,
        data: &AttestationData,
        validator_pk: &BlsPublicKey,
        signature: &BlsSignature,
    ) -> Result<(), BeaconError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::bls::BlsSecretKey;

    fn sample_attestation() -> AttestationData {
        AttestationData {
            slot: 30,
            index: 1,
            beacon_block_root: Hash256::repeat_byte(3),
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

    fn sample_duty(pk: BlsPublicKey) -> Duty {
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

    #[test]
    fn identifier_binds_key_and_role() {
        let pk = BlsSecretKey::generate().public_key();
        let att = identifier(&pk, Role::Attester);
        let prop = identifier(&pk, Role::Proposer);

        assert_ne!(att, prop);
        assert!(String::from_utf8(att).unwrap().ends_with("_attester"));
    }

    #[test]
    fn signing_root_mixes_domain() {
        let data = sample_attestation();
        let zero = signing_root(&data, Hash256::zero());
        let other = signing_root(&data, Hash256::repeat_byte(1));

        assert_ne!(zero, other);
        // The signing root is never the bare object root.
        assert_ne!(zero, data.tree_hash_root());
    }

    #[test]
    fn attestation_roots_are_field_sensitive() {
        let a = sample_attestation();
        let mut b = a;
        b.beacon_block_root = Hash256::repeat_byte(9);
        assert_ne!(a.tree_hash_root(), b.tree_hash_root());
    }

    #[test]
    fn consensus_data_roundtrip() {
        let pk = BlsSecretKey::generate().public_key();
        let data = sample_attestation();
        let payload = ConsensusData::new(sample_duty(pk), &data);

        let bytes = payload.encode().unwrap();
        let decoded = ConsensusData::decode(&bytes).unwrap();

        assert_eq!(decoded, payload);
        assert_eq!(decoded.attestation_data().unwrap(), data);
        assert_eq!(decoded.duty.committee_index, 2);
    }
}
