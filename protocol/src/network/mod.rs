//! # Network Interface
//!
//! The transport contract between the consensus core and whatever carries
//! bytes between operators. Peer discovery, gossip topology and pubsub
//! plumbing are explicitly someone else's problem — the core sees exactly
//! this trait: topic subscription, three broadcast channels (consensus,
//! decided, post-consensus signatures), and a request/response surface for
//! history sync.
//!
//! [`local::LocalNetwork`] implements the trait in-memory for tests and
//! single-process devnets.

pub mod local;
pub mod queue;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::consensus::message::SignedMessage;
use crate::crypto::bls::BlsPublicKey;

/// Buffer size for the subscription channels a network implementation hands
/// out. Large enough to absorb gossip bursts without dropping votes.
pub const CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Transport-level failures.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("not enough peers: have {have}, need {need}")]
    NotEnoughPeers { have: usize, need: usize },
    #[error("peer not found: {0}")]
    PeerNotFound(String),
    #[error("peer closed the stream")]
    StreamClosed,
    #[error("network failure: {0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Sync Wire Protocol
// ---------------------------------------------------------------------------

/// Request/response kinds of the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncKind {
    /// "What is the highest decided sequence you hold for this identifier?"
    GetHighestDecided,
    /// "Send decided messages for sequences [from, to]." Bounded by
    /// [`Network::max_batch`].
    GetDecidedRange,
    /// "What was your last change-round message for the running instance?"
    GetLastChangeRound,
}

/// In-band errors a peer can answer with. `EntryNotFound` is an expected
/// answer from a peer with no history, not a fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncError {
    EntryNotFound,
    Internal(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::EntryNotFound => f.write_str("entry not found"),
            SyncError::Internal(s) => write!(f, "internal: {s}"),
        }
    }
}

/// A sync request or response. The same shape travels both directions, which
/// keeps the protocol self-describing: responses echo the kind and
/// identifier of the request they answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub kind: SyncKind,
    pub identifier: Vec<u8>,
    /// `[from, to]` for range requests, empty otherwise.
    pub params: Vec<u64>,
    pub messages: Vec<SignedMessage>,
    pub error: Option<SyncError>,
    pub from_peer: String,
}

impl SyncMessage {
    pub fn request(kind: SyncKind, identifier: Vec<u8>, params: Vec<u64>) -> Self {
        Self {
            kind,
            identifier,
            params,
            messages: Vec::new(),
            error: None,
            from_peer: String::new(),
        }
    }
}

/// An inbound sync request paired with its one-shot response lane.
pub struct SyncRequestEnvelope {
    pub msg: SyncMessage,
    pub responder: oneshot::Sender<SyncMessage>,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Which topic a signed message arrived on. Decided aggregates and
/// post-consensus partial signatures travel on their own lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    Consensus,
    Decided,
    Signature,
}

/// A signed message plus its lane, as buffered by the message queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub msg: SignedMessage,
}

// ---------------------------------------------------------------------------
// Network Trait
// ---------------------------------------------------------------------------

/// The transport surface provided to controllers and sync.
#[async_trait::async_trait]
pub trait Network: Send + Sync {
    /// Joins the validator's topic. Idempotent.
    async fn subscribe(&self, validator_pk: &BlsPublicKey) -> Result<(), NetworkError>;

    /// Broadcasts a consensus message on the validator topic.
    async fn broadcast(&self, msg: &SignedMessage) -> Result<(), NetworkError>;

    /// Broadcasts a decided aggregate on the decided topic.
    async fn broadcast_decided(&self, msg: &SignedMessage) -> Result<(), NetworkError>;

    /// Broadcasts a post-consensus partial signature.
    async fn broadcast_signature(&self, msg: &SignedMessage) -> Result<(), NetworkError>;

    /// Registers a consumer for consensus messages.
    fn received_msg_chan(&self) -> mpsc::Receiver<SignedMessage>;

    /// Registers a consumer for decided messages.
    fn received_decided_chan(&self) -> mpsc::Receiver<SignedMessage>;

    /// Registers a consumer for partial-signature messages.
    fn received_signature_chan(&self) -> mpsc::Receiver<SignedMessage>;

    /// Registers this node as a sync responder and returns its request lane.
    fn received_sync_chan(&self) -> mpsc::Receiver<SyncRequestEnvelope>;

    /// Asks one peer for its highest decided message.
    async fn get_highest_decided(
        &self,
        peer: &str,
        req: SyncMessage,
    ) -> Result<SyncMessage, NetworkError>;

    /// Asks one peer for a decided range. Responses are capped at
    /// [`max_batch`](Network::max_batch) messages.
    async fn get_decided_by_range(
        &self,
        peer: &str,
        req: SyncMessage,
    ) -> Result<SyncMessage, NetworkError>;

    /// Asks one peer for its last change-round message.
    async fn get_last_change_round(
        &self,
        peer: &str,
        req: SyncMessage,
    ) -> Result<SyncMessage, NetworkError>;

    /// Peers currently on the validator's topic.
    async fn all_peers(&self, validator_pk: &BlsPublicKey) -> Result<Vec<String>, NetworkError>;

    /// Largest decided batch a range response may carry.
    fn max_batch(&self) -> u64 {
        crate::config::SYNC_BATCH_MAX
    }
}

/// Polls the peer count until `min` peers join the topic or `timeout`
/// elapses.
pub async fn wait_for_min_peers(
    network: &dyn Network,
    validator_pk: &BlsPublicKey,
    min: usize,
    poll_interval: std::time::Duration,
    timeout: std::time::Duration,
) -> Result<(), NetworkError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let peers = network.all_peers(validator_pk).await?;
        if peers.len() >= min {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(NetworkError::NotEnoughPeers {
                have: peers.len(),
                need: min,
            });
        }
        tracing::debug!(
            have = peers.len(),
            need = min,
            "waiting for peers on validator topic"
        );
        tokio::time::sleep(poll_interval).await;
    }
}
