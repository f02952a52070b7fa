//! # Message Container
//!
//! The per-instance buffer behind quorum detection. Each container holds one
//! message type (prepare, commit, ...) bucketed by round, deduplicated by
//! `(signer set, value digest)`. A message that adds no new evidence — same
//! signers, same value — is dropped on arrival, which is what makes duplicate
//! floods incapable of re-triggering stage transitions.
//!
//! Evidence strengthening: an incoming message whose signer set strictly
//! contains an existing entry's (same value) replaces it. This is how a
//! 4-signer decided aggregate supersedes a stored 3-signer one.
//!
//! Internally synchronized; the instance shares it freely with quorum
//! queries from other tasks.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::consensus::message::SignedMessage;

struct StoredMessage {
    digest: [u8; 32],
    /// Sorted, deduplicated signer ids.
    signers: Vec<u64>,
    msg: SignedMessage,
}

/// Per-round message store with quorum queries. One container per message
/// type per instance.
pub struct MessageContainer {
    quorum_threshold: usize,
    partial_threshold: usize,
    by_round: RwLock<BTreeMap<u64, Vec<StoredMessage>>>,
}

fn sorted_signers(msg: &SignedMessage) -> Vec<u64> {
    let mut ids = msg.signer_ids.clone();
    ids.sort_unstable();
    ids.dedup();
    ids
}

fn is_strict_subset(small: &[u64], big: &[u64]) -> bool {
    small.len() < big.len() && small.iter().all(|id| big.contains(id))
}

impl MessageContainer {
    pub fn new(quorum_threshold: usize, partial_threshold: usize) -> Self {
        Self {
            quorum_threshold,
            partial_threshold,
            by_round: RwLock::new(BTreeMap::new()),
        }
    }

    /// Records a message. Returns `false` when the message added no evidence
    /// (exact duplicate, or weaker than a stored superset).
    pub fn add(&self, msg: &SignedMessage) -> bool {
        let digest = msg.message.value_digest();
        let signers = sorted_signers(msg);
        let mut guard = self.by_round.write();
        let entries = guard.entry(msg.message.round).or_default();

        for existing in entries.iter() {
            if existing.digest != digest {
                continue;
            }
            if existing.signers == signers {
                return false;
            }
            // An already-stored superset makes this message redundant.
            if is_strict_subset(&signers, &existing.signers) {
                return false;
            }
        }

        // Strengthen in place when the new signer set strictly contains a
        // stored one for the same value.
        if let Some(pos) = entries
            .iter()
            .position(|e| e.digest == digest && is_strict_subset(&e.signers, &signers))
        {
            entries[pos] = StoredMessage {
                digest,
                signers,
                msg: msg.clone(),
            };
            return true;
        }

        entries.push(StoredMessage {
            digest,
            signers,
            msg: msg.clone(),
        });
        true
    }

    /// All distinct messages recorded for a round.
    pub fn messages_by_round(&self, round: u64) -> Vec<SignedMessage> {
        self.by_round
            .read()
            .get(&round)
            .map(|entries| entries.iter().map(|e| e.msg.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether the distinct signers behind `value` at `round` reach the full
    /// quorum. Returns the witnessing messages on success.
    pub fn quorum_achieved(&self, round: u64, value: &[u8]) -> (bool, Vec<SignedMessage>) {
        let digest: [u8; 32] = Sha256::digest(value).into();
        let guard = self.by_round.read();
        let Some(entries) = guard.get(&round) else {
            return (false, Vec::new());
        };

        let mut signers: Vec<u64> = Vec::new();
        let mut witnesses = Vec::new();
        for entry in entries.iter().filter(|e| e.digest == digest) {
            for id in &entry.signers {
                if !signers.contains(id) {
                    signers.push(*id);
                }
            }
            witnesses.push(entry.msg.clone());
        }

        if signers.len() >= self.quorum_threshold {
            (true, witnesses)
        } else {
            (false, Vec::new())
        }
    }

    /// Whether distinct signers at `round` — across all values — reach the
    /// full quorum. Change-round messages carry differing certificates, so
    /// their quorum is per-signer, not per-value.
    pub fn change_round_quorum(&self, round: u64) -> (bool, Vec<SignedMessage>) {
        let guard = self.by_round.read();
        let Some(entries) = guard.get(&round) else {
            return (false, Vec::new());
        };

        let mut signers: Vec<u64> = Vec::new();
        for entry in entries {
            for id in &entry.signers {
                if !signers.contains(id) {
                    signers.push(*id);
                }
            }
        }
        if signers.len() >= self.quorum_threshold {
            (true, entries.iter().map(|e| e.msg.clone()).collect())
        } else {
            (false, Vec::new())
        }
    }

    /// Scans change-round messages beyond `state_round`. Returns
    /// `(true, lowest_round)` when the distinct signers across those rounds
    /// reach the partial quorum — the f+1 guarantee that at least one honest
    /// node is already ahead of us.
    pub fn partial_change_round_quorum(&self, state_round: u64) -> (bool, u64) {
        let guard = self.by_round.read();
        let mut signers: Vec<u64> = Vec::new();
        let mut lowest = u64::MAX;

        for (&round, entries) in guard.range((state_round + 1)..) {
            for entry in entries {
                for id in &entry.signers {
                    if !signers.contains(id) {
                        signers.push(*id);
                    }
                }
            }
            if !entries.is_empty() {
                lowest = lowest.min(round);
            }
        }

        if signers.len() >= self.partial_threshold && lowest != u64::MAX {
            (true, lowest)
        } else {
            (false, 0)
        }
    }

    /// Drops everything stored for the message's round and installs the
    /// given message as the round's sole entry. Used when stronger-evidence
    /// decided messages supersede history.
    pub fn override_messages(&self, msg: &SignedMessage) {
        let mut guard = self.by_round.write();
        let entries = guard.entry(msg.message.round).or_default();
        entries.clear();
        entries.push(StoredMessage {
            digest: msg.message.value_digest(),
            signers: sorted_signers(msg),
            msg: msg.clone(),
        });
    }
}
