//! # In-Process Network
//!
//! A [`Network`] implementation where "the wire" is a set of tokio channels
//! inside one process. Every broadcast fans out to every registered
//! consumer, including the sender's own — exactly like a pubsub topic a node
//! is subscribed to. Sync requests are routed point-to-point through a
//! per-peer request lane with a one-shot response channel standing in for
//! the stream.
//!
//! This is the backing network for the test suites and the single-process
//! devnet. It makes no attempt at being a real transport: no backpressure
//! fairness, no peer scoring, no partitions (unless a test builds one by
//! simply not registering a peer).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::consensus::message::SignedMessage;
use crate::crypto::bls::BlsPublicKey;
use crate::network::{
    Network, NetworkError, SyncMessage, SyncRequestEnvelope, CHANNEL_CAPACITY,
};

#[derive(Default)]
struct Shared {
    msg_subs: Vec<mpsc::Sender<SignedMessage>>,
    decided_subs: Vec<mpsc::Sender<SignedMessage>>,
    signature_subs: Vec<mpsc::Sender<SignedMessage>>,
    sync_peers: HashMap<String, mpsc::Sender<SyncRequestEnvelope>>,
}

/// An in-memory network hub. Clone it with [`for_peer`](Self::for_peer) to
/// give each node a peer identity; all clones share the same wire.
#[derive(Clone)]
pub struct LocalNetwork {
    shared: Arc<Mutex<Shared>>,
    local_peer: String,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            local_peer: String::new(),
        }
    }

    /// A handle onto the same network with a distinct peer identity, used to
    /// key this node's sync-request lane and stamp outgoing requests.
    pub fn for_peer(&self, peer_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            local_peer: peer_id.into(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.local_peer
    }

    async fn fan_out(
        &self,
        pick: impl Fn(&Shared) -> Vec<mpsc::Sender<SignedMessage>>,
        msg: &SignedMessage,
    ) -> Result<(), NetworkError> {
        // Snapshot the subscriber list before awaiting; holding the lock
        // across a send would deadlock a subscriber that is also a sender.
        let subs = pick(&self.shared.lock());
        for sub in subs {
            // A dropped consumer is not an error for the rest of the topic.
            let _ = sub.send(msg.clone()).await;
        }
        Ok(())
    }

    async fn request(
        &self,
        peer: &str,
        mut req: SyncMessage,
    ) -> Result<SyncMessage, NetworkError> {
        req.from_peer = self.local_peer.clone();
        let lane = self
            .shared
            .lock()
            .sync_peers
            .get(peer)
            .cloned()
            .ok_or_else(|| NetworkError::PeerNotFound(peer.to_string()))?;

        let (responder, response) = oneshot::channel();
        lane.send(SyncRequestEnvelope { msg: req, responder })
            .await
            .map_err(|_| NetworkError::StreamClosed)?;
        response.await.map_err(|_| NetworkError::StreamClosed)
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Network for LocalNetwork {
    async fn subscribe(&self, _validator_pk: &BlsPublicKey) -> Result<(), NetworkError> {
        // Everyone is on every topic in-process.
        Ok(())
    }

    async fn broadcast(&self, msg: &SignedMessage) -> Result<(), NetworkError> {
        self.fan_out(|s| s.msg_subs.clone(), msg).await
    }

    async fn broadcast_decided(&self, msg: &SignedMessage) -> Result<(), NetworkError> {
        self.fan_out(|s| s.decided_subs.clone(), msg).await
    }

    async fn broadcast_signature(&self, msg: &SignedMessage) -> Result<(), NetworkError> {
        self.fan_out(|s| s.signature_subs.clone(), msg).await
    }

    fn received_msg_chan(&self) -> mpsc::Receiver<SignedMessage> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.shared.lock().msg_subs.push(tx);
        rx
    }

    fn received_decided_chan(&self) -> mpsc::Receiver<SignedMessage> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.shared.lock().decided_subs.push(tx);
        rx
    }

    fn received_signature_chan(&self) -> mpsc::Receiver<SignedMessage> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.shared.lock().signature_subs.push(tx);
        rx
    }

    fn received_sync_chan(&self) -> mpsc::Receiver<SyncRequestEnvelope> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.shared
            .lock()
            .sync_peers
            .insert(self.local_peer.clone(), tx);
        rx
    }

    async fn get_highest_decided(
        &self,
        peer: &str,
        req: SyncMessage,
    ) -> Result<SyncMessage, NetworkError> {
        self.request(peer, req).await
    }

    async fn get_decided_by_range(
        &self,
        peer: &str,
        req: SyncMessage,
    ) -> Result<SyncMessage, NetworkError> {
        self.request(peer, req).await
    }

    async fn get_last_change_round(
        &self,
        peer: &str,
        req: SyncMessage,
    ) -> Result<SyncMessage, NetworkError> {
        self.request(peer, req).await
    }

    async fn all_peers(&self, _validator_pk: &BlsPublicKey) -> Result<Vec<String>, NetworkError> {
        let shared = self.shared.lock();
        Ok(shared
            .sync_peers
            .keys()
            .filter(|id| **id != self.local_peer)
            .cloned()
            .collect())
    }
}
