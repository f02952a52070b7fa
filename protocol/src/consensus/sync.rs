//! # History Sync
//!
//! Catch-up for a controller that has been offline (or was just born): ask a
//! handful of peers for their highest decided sequence, pick the best
//! answer that proves itself (right type, authorized aggregate, quorum of
//! signers), then pull the missing range in bounded batches and persist it
//! in order. A peer with no history answers `EntryNotFound`, which is a
//! perfectly good answer — a gap or an invalid message mid-batch is not,
//! and aborts the sync for the caller to retry.
//!
//! The controller's weight-1 semaphore guarantees at most one sync per
//! identifier at a time; this type just does the fetching.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info};

use crate::config::InstanceConfig;
use crate::consensus::message::{MessageType, SignedMessage};
use crate::consensus::pipeline::{
    authorize_msg, basic_msg_validation, msg_type_check, validate_quorum, Pipeline,
};
use crate::network::{Network, NetworkError, SyncError, SyncKind, SyncMessage};
use crate::share::Share;
use crate::storage::{StorageError, Store};

/// Why a sync attempt failed. All variants are retryable by the caller.
#[derive(Debug, thiserror::Error)]
pub enum HistorySyncError {
    #[error("could not fetch highest decided from peers")]
    NoResults,
    #[error("history sync exceeded its deadline")]
    Timeout,
    #[error("decided history out of order: expected {expected}, got {got}")]
    Gap { expected: u64, got: u64 },
    #[error("peer sent an invalid batch: {0}")]
    InvalidBatch(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// One history-sync run for one identifier.
pub struct HistorySync {
    identifier: Vec<u8>,
    share: Share,
    network: Arc<dyn Network>,
    store: Arc<Store>,
    config: InstanceConfig,
}

impl HistorySync {
    pub fn new(
        identifier: Vec<u8>,
        share: Share,
        network: Arc<dyn Network>,
        store: Arc<Store>,
        config: InstanceConfig,
    ) -> Self {
        Self {
            identifier,
            share,
            network,
            store,
            config,
        }
    }

    /// The pipeline a decided message must pass before it is trusted:
    /// structurally sound, commit-typed, signed by committee members, and
    /// carrying a quorum of them.
    fn decided_pipeline(&self) -> Pipeline {
        Pipeline::combine([
            basic_msg_validation(),
            msg_type_check(MessageType::Commit),
            authorize_msg(self.share.clone()),
            validate_quorum(self.share.threshold_size()),
        ])
    }

    /// Runs the sync to completion: on success the local decided log is a
    /// contiguous prefix up to the network's best-known sequence and the
    /// highest pointer reflects it.
    pub async fn start(&self) -> Result<(), HistorySyncError> {
        let peers = self.network.all_peers(&self.share.public_key).await?;
        let sample: Vec<String> = peers
            .into_iter()
            .take(self.config.history_sync_peers)
            .collect();
        if sample.is_empty() {
            return Err(HistorySyncError::NoResults);
        }

        let Some((highest, from_peer)) = self.find_highest(&sample).await? else {
            debug!("no decided history anywhere on the topic, nothing to sync");
            return Ok(());
        };

        let local = self.store.highest_decided_seq(&self.identifier)?;
        let target = highest.message.sequence;
        if target <= local {
            debug!(local, target, "local history already caught up");
            return Ok(());
        }

        info!(local, target, peer = %from_peer, "syncing decided history");
        self.fetch_range(&from_peer, local + 1, target).await?;
        self.store.save_highest_decided(&highest)?;
        Ok(())
    }

    /// Queries the sampled peers in parallel and returns the valid response
    /// with the highest sequence, plus the peer that served it. `Ok(None)`
    /// when every peer answered `EntryNotFound`.
    async fn find_highest(
        &self,
        peers: &[String],
    ) -> Result<Option<(SignedMessage, String)>, HistorySyncError> {
        let requests = peers.iter().map(|peer| {
            let req = SyncMessage::request(
                SyncKind::GetHighestDecided,
                self.identifier.clone(),
                vec![],
            );
            async move { (peer.clone(), self.network.get_highest_decided(peer, req).await) }
        });
        let responses = join_all(requests).await;

        let pipeline = self.decided_pipeline();
        let mut answered = 0usize;
        let mut best: Option<(SignedMessage, String)> = None;

        for (peer, result) in responses {
            let response = match result {
                Ok(r) => r,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "highest-decided request failed");
                    continue;
                }
            };
            match response.error {
                Some(SyncError::EntryNotFound) => {
                    // A new validator's peers legitimately have no history.
                    answered += 1;
                    continue;
                }
                Some(err) => {
                    debug!(peer = %peer, error = %err, "peer answered with error");
                    continue;
                }
                None => {}
            }
            if response.messages.len() != 1 {
                debug!(peer = %peer, count = response.messages.len(), "malformed highest-decided response");
                continue;
            }
            let msg = response.messages.into_iter().next().expect("length checked");
            if let Err(e) = pipeline.run(&msg) {
                debug!(peer = %peer, error = %e, "received invalid highest decided");
                continue;
            }
            answered += 1;
            let better = best
                .as_ref()
                .map(|(current, _)| current.message.sequence < msg.message.sequence)
                .unwrap_or(true);
            if better {
                best = Some((msg, peer));
            }
        }

        if answered == 0 {
            return Err(HistorySyncError::NoResults);
        }
        Ok(best)
    }

    /// Pulls `from..=to` from one peer in batches, validating and persisting
    /// strictly in order.
    async fn fetch_range(
        &self,
        peer: &str,
        from: u64,
        to: u64,
    ) -> Result<(), HistorySyncError> {
        let pipeline = self.decided_pipeline();
        let mut expected = from;

        while expected <= to {
            let batch_end = (expected + self.config.sync_batch_max - 1).min(to);
            let req = SyncMessage::request(
                SyncKind::GetDecidedRange,
                self.identifier.clone(),
                vec![expected, batch_end],
            );
            let response = self.network.get_decided_by_range(peer, req).await?;

            if let Some(err) = response.error {
                return Err(HistorySyncError::InvalidBatch(err.to_string()));
            }
            if response.messages.is_empty() {
                return Err(HistorySyncError::Gap {
                    expected,
                    got: 0,
                });
            }

            for msg in response.messages {
                pipeline
                    .run(&msg)
                    .map_err(|e| HistorySyncError::InvalidBatch(e.to_string()))?;
                if msg.message.sequence != expected {
                    return Err(HistorySyncError::Gap {
                        expected,
                        got: msg.message.sequence,
                    });
                }
                self.store.save_decided(&msg)?;
                expected += 1;
            }
            debug!(up_to = expected - 1, "sync batch persisted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::{identifier, Role};
    use crate::consensus::message::{aggregate_messages, Message};
    use crate::crypto::bls::BlsSecretKey;
    use crate::network::local::LocalNetwork;
    use crate::network::SyncRequestEnvelope;
    use std::collections::BTreeMap;

    struct TestNet {
        keys: Vec<BlsSecretKey>,
        share: Share,
        identifier: Vec<u8>,
        hub: LocalNetwork,
    }

    fn test_net() -> TestNet {
        let keys: Vec<BlsSecretKey> = (0..4).map(|_| BlsSecretKey::generate()).collect();
        let committee: BTreeMap<u64, _> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| (i as u64 + 1, k.public_key()))
            .collect();
        let validator = BlsSecretKey::generate().public_key();
        let share = Share {
            node_id: 1,
            public_key: validator.clone(),
            committee,
        };
        let id = identifier(&validator, Role::Attester);
        TestNet {
            keys,
            share,
            identifier: id,
            hub: LocalNetwork::new(),
        }
    }

    fn decided_at(net: &TestNet, seq: u64) -> SignedMessage {
        let message = Message {
            msg_type: MessageType::Commit,
            round: 1,
            sequence: seq,
            identifier: net.identifier.clone(),
            value: format!("value-{seq}").into_bytes(),
        };
        let witnesses: Vec<SignedMessage> = (0..3)
            .map(|i| SignedMessage {
                message: message.clone(),
                signature: net.keys[i].sign(message.signing_root().as_bytes()),
                signer_ids: vec![i as u64 + 1],
            })
            .collect();
        aggregate_messages(&witnesses).unwrap()
    }

    /// Serves a peer's decided log out of a plain vector.
    fn spawn_peer(net: &TestNet, peer_id: &str, history: Vec<SignedMessage>) {
        let handle = net.hub.for_peer(peer_id);
        let mut requests = handle.received_sync_chan();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            while let Some(SyncRequestEnvelope { msg, responder }) = requests.recv().await {
                let mut response = SyncMessage {
                    from_peer: peer_id.clone(),
                    ..msg.clone()
                };
                match msg.kind {
                    SyncKind::GetHighestDecided => match history.last() {
                        Some(highest) => response.messages = vec![highest.clone()],
                        None => response.error = Some(SyncError::EntryNotFound),
                    },
                    SyncKind::GetDecidedRange => {
                        let (from, to) = (msg.params[0], msg.params[1]);
                        response.messages = history
                            .iter()
                            .filter(|m| {
                                m.message.sequence >= from && m.message.sequence <= to
                            })
                            .take(25)
                            .cloned()
                            .collect();
                    }
                    SyncKind::GetLastChangeRound => {
                        response.error = Some(SyncError::EntryNotFound);
                    }
                }
                let _ = responder.send(response);
            }
        });
    }

    fn sync_for(net: &TestNet, store: Arc<Store>) -> HistorySync {
        HistorySync::new(
            net.identifier.clone(),
            net.share.clone(),
            Arc::new(net.hub.for_peer("local")),
            store,
            InstanceConfig::default(),
        )
    }

    #[tokio::test]
    async fn fresh_node_catches_up_to_peer() {
        let net = test_net();
        let history: Vec<SignedMessage> = (1..=12).map(|s| decided_at(&net, s)).collect();
        spawn_peer(&net, "peer-1", history);

        let store = Arc::new(Store::open_temporary().unwrap());
        sync_for(&net, Arc::clone(&store)).start().await.unwrap();

        assert_eq!(store.highest_decided_seq(&net.identifier).unwrap(), 12);
        for seq in 1..=12 {
            assert!(store.get_decided(&net.identifier, seq).unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn partially_synced_node_fetches_only_the_tail() {
        let net = test_net();
        let history: Vec<SignedMessage> = (1..=12).map(|s| decided_at(&net, s)).collect();
        spawn_peer(&net, "peer-1", history.clone());

        let store = Arc::new(Store::open_temporary().unwrap());
        for msg in history.iter().take(5) {
            store.save_decided(msg).unwrap();
        }
        store.save_highest_decided(&history[4]).unwrap();

        sync_for(&net, Arc::clone(&store)).start().await.unwrap();
        assert_eq!(store.highest_decided_seq(&net.identifier).unwrap(), 12);
    }

    #[tokio::test]
    async fn picks_the_highest_among_peers() {
        let net = test_net();
        let short: Vec<SignedMessage> = (1..=3).map(|s| decided_at(&net, s)).collect();
        let long: Vec<SignedMessage> = (1..=8).map(|s| decided_at(&net, s)).collect();
        spawn_peer(&net, "peer-short", short);
        spawn_peer(&net, "peer-long", long);

        let store = Arc::new(Store::open_temporary().unwrap());
        sync_for(&net, Arc::clone(&store)).start().await.unwrap();
        assert_eq!(store.highest_decided_seq(&net.identifier).unwrap(), 8);
    }

    #[tokio::test]
    async fn entry_not_found_everywhere_is_success() {
        let net = test_net();
        spawn_peer(&net, "peer-1", vec![]);
        spawn_peer(&net, "peer-2", vec![]);

        let store = Arc::new(Store::open_temporary().unwrap());
        sync_for(&net, Arc::clone(&store)).start().await.unwrap();
        assert_eq!(store.highest_decided_seq(&net.identifier).unwrap(), 0);
    }

    #[tokio::test]
    async fn no_peers_is_an_error() {
        let net = test_net();
        let store = Arc::new(Store::open_temporary().unwrap());
        let err = sync_for(&net, store).start().await.unwrap_err();
        assert!(matches!(err, HistorySyncError::NoResults));
    }

    #[tokio::test]
    async fn gap_in_history_aborts() {
        let net = test_net();
        // Peer is missing sequence 3: 1, 2, 4, 5.
        let history: Vec<SignedMessage> = [1u64, 2, 4, 5]
            .iter()
            .map(|s| decided_at(&net, *s))
            .collect();
        spawn_peer(&net, "peer-1", history);

        let store = Arc::new(Store::open_temporary().unwrap());
        let err = sync_for(&net, Arc::clone(&store))
            .start()
            .await
            .unwrap_err();
        assert!(matches!(err, HistorySyncError::Gap { expected: 3, got: 4 }));

        // The highest pointer must not have moved past the persisted prefix.
        assert_eq!(store.highest_decided_seq(&net.identifier).unwrap(), 0);
    }

    #[tokio::test]
    async fn under_quorum_highest_is_ignored() {
        let net = test_net();
        // A "highest" with only 2 signers cannot prove itself.
        let message = Message {
            msg_type: MessageType::Commit,
            round: 1,
            sequence: 9,
            identifier: net.identifier.clone(),
            value: b"weak".to_vec(),
        };
        let witnesses: Vec<SignedMessage> = (0..2)
            .map(|i| SignedMessage {
                message: message.clone(),
                signature: net.keys[i].sign(message.signing_root().as_bytes()),
                signer_ids: vec![i as u64 + 1],
            })
            .collect();
        let weak = aggregate_messages(&witnesses).unwrap();
        spawn_peer(&net, "peer-1", vec![weak]);

        let store = Arc::new(Store::open_temporary().unwrap());
        let err = sync_for(&net, store).start().await.unwrap_err();
        // The only answer was invalid, so the sync saw no results at all.
        assert!(matches!(err, HistorySyncError::NoResults));
    }
}
