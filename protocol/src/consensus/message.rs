//! # Consensus Messages
//!
//! The wire-level data model of the IBFT protocol: the tagged message type,
//! the message body, and the signed envelope carrying an aggregate BLS
//! signature with the ids of the committee members behind it.
//!
//! Dispatch on message type is an exhaustive `match` everywhere — there is
//! no stringly-typed routing in this codebase. A new variant breaks the
//! build until every `process` function handles it, which is the point.

use sha2::{Digest, Sha256};

use serde::{Deserialize, Serialize};
use tree_hash::merkle_root;

use crate::beacon::Hash256;
use crate::crypto::bls::{aggregate_signatures, BlsPublicKey, BlsSignature};

// ---------------------------------------------------------------------------
// Message Type
// ---------------------------------------------------------------------------

/// The five message kinds of the protocol.
///
/// `Decided` never appears inside a consensus round — it is the wire
/// classification for broadcast decided aggregates, which carry `Commit`
/// semantics plus a quorum of signers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageType {
    PrePrepare,
    Prepare,
    Commit,
    ChangeRound,
    Decided,
}

impl MessageType {
    /// Stable numeric tag, used in the signing root so that a prepare can
    /// never be replayed as a commit.
    pub fn tag(&self) -> u64 {
        match self {
            MessageType::PrePrepare => 0,
            MessageType::Prepare => 1,
            MessageType::Commit => 2,
            MessageType::ChangeRound => 3,
            MessageType::Decided => 4,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::PrePrepare => "pre-prepare",
            MessageType::Prepare => "prepare",
            MessageType::Commit => "commit",
            MessageType::ChangeRound => "change-round",
            MessageType::Decided => "decided",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A consensus message body. `identifier` routes it to a controller,
/// `sequence` to an instance, `round` to a stage within the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    pub round: u64,
    pub sequence: u64,
    pub identifier: Vec<u8>,
    pub value: Vec<u8>,
}

impl Message {
    /// Merkleized signing root over the message content.
    ///
    /// Fixed fields pack into their own leaves; the variable-length
    /// identifier and value are pre-hashed so the container stays a flat
    /// five-leaf merkle tree.
    pub fn signing_root(&self) -> Hash256 {
        let mut leaves = Vec::with_capacity(5 * 32);
        for fixed in [self.msg_type.tag(), self.round, self.sequence] {
            let mut leaf = [0u8; 32];
            leaf[..8].copy_from_slice(&fixed.to_le_bytes());
            leaves.extend_from_slice(&leaf);
        }
        leaves.extend_from_slice(Sha256::digest(&self.identifier).as_slice());
        leaves.extend_from_slice(Sha256::digest(&self.value).as_slice());
        merkle_root(&leaves, 0)
    }

    /// Digest of the value alone — the container's dedup key.
    pub fn value_digest(&self) -> [u8; 32] {
        Sha256::digest(&self.value).into()
    }
}

// ---------------------------------------------------------------------------
// Signed Message
// ---------------------------------------------------------------------------

/// Errors from envelope-level operations.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("cannot aggregate messages with differing content")]
    MixedContent,
    #[error("nothing to aggregate")]
    Empty,
    #[error("duplicate signer id {0} across aggregated messages")]
    DuplicateSigner(u64),
    #[error(transparent)]
    Bls(#[from] crate::crypto::bls::BlsError),
    #[error("payload encoding failed: {0}")]
    Encoding(String),
}

/// A message plus the aggregate BLS signature of the committee members listed
/// in `signer_ids`. A fresh vote has one signer; a decided aggregate has a
/// quorum of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub message: Message,
    pub signature: BlsSignature,
    pub signer_ids: Vec<u64>,
}

impl SignedMessage {
    /// Verifies the aggregate signature against the share public keys of the
    /// listed signers. Unknown signer ids fail the check.
    pub fn verify(
        &self,
        committee: &std::collections::BTreeMap<u64, BlsPublicKey>,
    ) -> bool {
        if self.signer_ids.is_empty() {
            return false;
        }
        let mut pks = Vec::with_capacity(self.signer_ids.len());
        for id in &self.signer_ids {
            match committee.get(id) {
                Some(pk) => pks.push(pk),
                None => return false,
            }
        }
        self.signature
            .fast_aggregate_verify(&pks, self.message.signing_root().as_bytes())
    }
}

/// Folds commit witnesses with identical content into one decided envelope:
/// signer ids are unioned (sorted, duplicates rejected) and the signatures
/// aggregated on the curve.
pub fn aggregate_messages(msgs: &[SignedMessage]) -> Result<SignedMessage, MessageError> {
    let first = msgs.first().ok_or(MessageError::Empty)?;
    let mut signer_ids: Vec<u64> = Vec::new();
    let mut signatures: Vec<BlsSignature> = Vec::new();

    for msg in msgs {
        if msg.message != first.message {
            return Err(MessageError::MixedContent);
        }
        for id in &msg.signer_ids {
            if signer_ids.contains(id) {
                return Err(MessageError::DuplicateSigner(*id));
            }
            signer_ids.push(*id);
        }
        signatures.push(msg.signature.clone());
    }
    signer_ids.sort_unstable();

    Ok(SignedMessage {
        message: first.message.clone(),
        signature: aggregate_signatures(&signatures)?,
        signer_ids,
    })
}

// ---------------------------------------------------------------------------
// Change-Round Certificate
// ---------------------------------------------------------------------------

/// The payload of a change-round message: the sender's prepared certificate,
/// if it has one. `prepared_round == 0` means "nothing prepared" and the
/// remaining fields are empty.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeRoundData {
    pub prepared_round: u64,
    pub prepared_value: Vec<u8>,
    /// The prepare messages witnessing the certificate (a quorum of them).
    pub justification: Vec<SignedMessage>,
}

impl ChangeRoundData {
    pub fn has_prepared(&self) -> bool {
        self.prepared_round > 0
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        bincode::serialize(self).map_err(|e| MessageError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        bincode::deserialize(bytes).map_err(|e| MessageError::Encoding(e.to_string()))
    }
}
