//! # Decided Log
//!
//! Persistence for the per-identifier decided history: one decided message
//! per sequence plus a pointer to the highest known. The controller and the
//! history sync are the only writers; both maintain the contiguous-prefix
//! invariant (a sequence is only persisted when everything below it already
//! is, or as part of an in-order sync batch).

use crate::consensus::message::SignedMessage;
use crate::storage::{decode, encode, StorageResult, Store};

fn decided_key(identifier: &[u8], sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(identifier.len() + 8);
    key.extend_from_slice(identifier);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

impl Store {
    /// Persists a decided message under its `(identifier, sequence)`.
    /// Overwrites an existing entry — the caller enforces the
    /// stronger-evidence override policy before calling.
    pub fn save_decided(&self, msg: &SignedMessage) -> StorageResult<()> {
        let key = decided_key(&msg.message.identifier, msg.message.sequence);
        self.decided.insert(key, encode(msg)?)?;
        Ok(())
    }

    /// Reads the decided message at a sequence. `Ok(None)` when the log has
    /// no entry there.
    pub fn get_decided(
        &self,
        identifier: &[u8],
        sequence: u64,
    ) -> StorageResult<Option<SignedMessage>> {
        match self.decided.get(decided_key(identifier, sequence))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Reads decided messages for sequences `from..=to`, ascending. Missing
    /// sequences simply don't appear; callers that need the prefix invariant
    /// check continuity themselves.
    pub fn get_decided_range(
        &self,
        identifier: &[u8],
        from: u64,
        to: u64,
    ) -> StorageResult<Vec<SignedMessage>> {
        let start = decided_key(identifier, from);
        let end = decided_key(identifier, to);
        let mut out = Vec::new();
        for item in self.decided.range(start..=end) {
            let (_, bytes) = item?;
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }

    /// Reads the highest-decided pointer for an identifier.
    pub fn get_highest_decided(
        &self,
        identifier: &[u8],
    ) -> StorageResult<Option<SignedMessage>> {
        match self.highest.get(identifier)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Moves the highest-decided pointer to the given message.
    pub fn save_highest_decided(&self, msg: &SignedMessage) -> StorageResult<()> {
        self.highest
            .insert(msg.message.identifier.clone(), encode(msg)?)?;
        Ok(())
    }

    /// The highest decided sequence, or 0 for an empty log.
    pub fn highest_decided_seq(&self, identifier: &[u8]) -> StorageResult<u64> {
        Ok(self
            .get_highest_decided(identifier)?
            .map(|msg| msg.message.sequence)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::message::{Message, MessageType};
    use crate::crypto::bls::BlsSecretKey;

    fn decided(identifier: &[u8], seq: u64, signers: &[u64]) -> SignedMessage {
        let message = Message {
            msg_type: MessageType::Commit,
            round: 1,
            sequence: seq,
            identifier: identifier.to_vec(),
            value: format!("value-{seq}").into_bytes(),
        };
        SignedMessage {
            signature: BlsSecretKey::generate().sign(b"x"),
            signer_ids: signers.to_vec(),
            message,
        }
    }

    #[test]
    fn save_and_get_decided() {
        let store = Store::open_temporary().unwrap();
        let msg = decided(b"id-a", 1, &[1, 2, 3]);

        store.save_decided(&msg).unwrap();
        let read = store.get_decided(b"id-a", 1).unwrap().expect("saved entry");
        assert_eq!(read, msg);

        assert!(store.get_decided(b"id-a", 2).unwrap().is_none());
        assert!(store.get_decided(b"id-b", 1).unwrap().is_none());
    }

    #[test]
    fn range_scan_in_order() {
        let store = Store::open_temporary().unwrap();
        for seq in 1..=5 {
            store.save_decided(&decided(b"id", seq, &[1, 2, 3])).unwrap();
        }

        let range = store.get_decided_range(b"id", 2, 4).unwrap();
        assert_eq!(range.len(), 3);
        let seqs: Vec<u64> = range.iter().map(|m| m.message.sequence).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[test]
    fn range_is_per_identifier() {
        let store = Store::open_temporary().unwrap();
        store.save_decided(&decided(b"id-a", 1, &[1, 2, 3])).unwrap();
        store.save_decided(&decided(b"id-b", 1, &[1, 2, 3])).unwrap();

        let range = store.get_decided_range(b"id-a", 1, 10).unwrap();
        assert_eq!(range.len(), 1);
        assert_eq!(range[0].message.identifier, b"id-a".to_vec());
    }

    #[test]
    fn highest_pointer_roundtrip() {
        let store = Store::open_temporary().unwrap();
        assert_eq!(store.highest_decided_seq(b"id").unwrap(), 0);
        assert!(store.get_highest_decided(b"id").unwrap().is_none());

        let msg = decided(b"id", 7, &[1, 2, 3]);
        store.save_highest_decided(&msg).unwrap();

        assert_eq!(store.highest_decided_seq(b"id").unwrap(), 7);
        assert_eq!(store.get_highest_decided(b"id").unwrap().unwrap(), msg);
    }

    #[test]
    fn overwrite_records_stronger_evidence() {
        let store = Store::open_temporary().unwrap();
        store.save_decided(&decided(b"id", 1, &[1, 2, 3])).unwrap();
        store
            .save_decided(&decided(b"id", 1, &[1, 2, 3, 4]))
            .unwrap();

        let read = store.get_decided(b"id", 1).unwrap().unwrap();
        assert_eq!(read.signer_ids, vec![1, 2, 3, 4]);
    }
}
