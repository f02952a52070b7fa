//! # Message Queue
//!
//! The buffer between the network readers and the consensus instances. Every
//! inbound envelope is indexed by `(identifier, type, sequence, round)` so a
//! controller can pop exactly the messages its current instance can act on
//! and leave the rest — a commit that arrives while the instance is still
//! collecting prepares waits here and is replayed when the stage is entered.
//!
//! FIFO within any matching subset. Bounded: when full, the oldest message
//! of the lowest-priority class makes room. Change-round chatter is the
//! first to go; decided aggregates are the last.

use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::consensus::message::MessageType;
use crate::network::{Envelope, EnvelopeKind};

/// Routing key derived from an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIndex {
    pub identifier: Vec<u8>,
    pub msg_type: MessageType,
    pub sequence: u64,
    pub round: u64,
}

impl MessageIndex {
    fn of(envelope: &Envelope) -> Self {
        Self {
            identifier: envelope.msg.message.identifier.clone(),
            msg_type: envelope.msg.message.msg_type,
            sequence: envelope.msg.message.sequence,
            round: envelope.msg.message.round,
        }
    }
}

/// Eviction priority class, lowest evicted first.
fn priority(envelope: &Envelope) -> u8 {
    if envelope.kind == EnvelopeKind::Decided {
        return 4;
    }
    match envelope.msg.message.msg_type {
        MessageType::ChangeRound => 0,
        MessageType::PrePrepare => 1,
        MessageType::Prepare => 2,
        MessageType::Commit => 3,
        MessageType::Decided => 4,
    }
}

/// Bounded multi-indexed FIFO buffer. Internally synchronized; shared
/// between the network reader tasks and the controller's scheduler, which
/// polls it non-blockingly.
pub struct MessageQueue {
    capacity: usize,
    inner: Mutex<VecDeque<(MessageIndex, Envelope)>>,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Buffers an envelope, evicting the oldest lowest-priority entry when
    /// full.
    pub fn add(&self, envelope: Envelope) {
        let index = MessageIndex::of(&envelope);
        let mut queue = self.inner.lock();

        if queue.len() >= self.capacity {
            if let Some(pos) = lowest_priority_position(&queue) {
                let (evicted_index, _) = queue.remove(pos).expect("position is in range");
                tracing::debug!(
                    msg_type = %evicted_index.msg_type,
                    sequence = evicted_index.sequence,
                    "message queue full, evicting"
                );
            }
        }
        queue.push_back((index, envelope));
    }

    /// Removes and returns the oldest envelope matching the predicate.
    pub fn pop_by(&self, pred: impl Fn(&MessageIndex) -> bool) -> Option<Envelope> {
        let mut queue = self.inner.lock();
        let pos = queue.iter().position(|(index, _)| pred(index))?;
        queue.remove(pos).map(|(_, envelope)| envelope)
    }

    /// Returns a copy of the oldest matching envelope without removing it.
    pub fn peek_by(&self, pred: impl Fn(&MessageIndex) -> bool) -> Option<Envelope> {
        let queue = self.inner.lock();
        queue
            .iter()
            .find(|(index, _)| pred(index))
            .map(|(_, envelope)| envelope.clone())
    }

    /// Drops every buffered envelope matching the predicate. Returns the
    /// number removed.
    pub fn purge(&self, pred: impl Fn(&MessageIndex) -> bool) -> usize {
        let mut queue = self.inner.lock();
        let before = queue.len();
        queue.retain(|(index, _)| !pred(index));
        before - queue.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

fn lowest_priority_position(queue: &VecDeque<(MessageIndex, Envelope)>) -> Option<usize> {
    let min = queue
        .iter()
        .map(|(_, envelope)| priority(envelope))
        .min()?;
    queue
        .iter()
        .position(|(_, envelope)| priority(envelope) == min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::message::{Message, SignedMessage};
    use crate::crypto::bls::BlsSecretKey;

    fn envelope(kind: EnvelopeKind, msg_type: MessageType, seq: u64, round: u64) -> Envelope {
        let message = Message {
            msg_type,
            round,
            sequence: seq,
            identifier: b"id".to_vec(),
            value: vec![seq as u8, round as u8],
        };
        Envelope {
            kind,
            msg: SignedMessage {
                signature: BlsSecretKey::generate().sign(b"x"),
                signer_ids: vec![1],
                message,
            },
        }
    }

    fn consensus(msg_type: MessageType, seq: u64, round: u64) -> Envelope {
        envelope(EnvelopeKind::Consensus, msg_type, seq, round)
    }

    #[test]
    fn fifo_within_matching_subset() {
        let queue = MessageQueue::new(16);
        queue.add(consensus(MessageType::Prepare, 1, 1));
        queue.add(consensus(MessageType::Prepare, 1, 2));
        queue.add(consensus(MessageType::Commit, 1, 1));

        let first = queue
            .pop_by(|i| i.msg_type == MessageType::Prepare)
            .unwrap();
        assert_eq!(first.msg.message.round, 1);

        let second = queue
            .pop_by(|i| i.msg_type == MessageType::Prepare)
            .unwrap();
        assert_eq!(second.msg.message.round, 2);

        assert!(queue.pop_by(|i| i.msg_type == MessageType::Prepare).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn peek_does_not_remove() {
        let queue = MessageQueue::new(16);
        queue.add(consensus(MessageType::Commit, 3, 1));

        assert!(queue.peek_by(|i| i.sequence == 3).is_some());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn purge_by_predicate() {
        let queue = MessageQueue::new(16);
        for seq in 1..=4 {
            queue.add(consensus(MessageType::Prepare, seq, 1));
        }

        let removed = queue.purge(|i| i.sequence <= 2);
        assert_eq!(removed, 2);
        assert_eq!(queue.len(), 2);
        assert!(queue.pop_by(|i| i.sequence == 1).is_none());
    }

    #[test]
    fn overflow_evicts_change_round_first() {
        let queue = MessageQueue::new(3);
        queue.add(consensus(MessageType::Commit, 1, 1));
        queue.add(consensus(MessageType::ChangeRound, 1, 2));
        queue.add(consensus(MessageType::Prepare, 1, 1));

        // Queue full; the change-round entry is the sacrifice.
        queue.add(consensus(MessageType::Commit, 2, 1));

        assert_eq!(queue.len(), 3);
        assert!(queue
            .pop_by(|i| i.msg_type == MessageType::ChangeRound)
            .is_none());
        assert!(queue.pop_by(|i| i.sequence == 2).is_some());
    }

    #[test]
    fn overflow_evicts_oldest_of_lowest_class() {
        let queue = MessageQueue::new(2);
        queue.add(consensus(MessageType::Prepare, 1, 1));
        queue.add(consensus(MessageType::Prepare, 2, 1));

        queue.add(consensus(MessageType::Prepare, 3, 1));

        // Sequence 1 was the oldest of the lowest (only) class.
        assert!(queue.pop_by(|i| i.sequence == 1).is_none());
        assert!(queue.pop_by(|i| i.sequence == 2).is_some());
        assert!(queue.pop_by(|i| i.sequence == 3).is_some());
    }

    #[test]
    fn decided_lane_outranks_commit() {
        let queue = MessageQueue::new(2);
        queue.add(envelope(EnvelopeKind::Decided, MessageType::Commit, 1, 1));
        queue.add(consensus(MessageType::Commit, 2, 1));

        queue.add(consensus(MessageType::Commit, 3, 1));

        // The plain commit goes before the decided aggregate.
        assert!(queue.pop_by(|i| i.sequence == 2).is_none());
        assert!(queue.pop_by(|i| i.sequence == 1).is_some());
    }
}
