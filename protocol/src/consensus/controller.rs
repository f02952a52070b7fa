//! # Consensus Controller
//!
//! The long-lived coordinator for one `(validator, role)` stream. It owns
//! the lifecycle: consume network traffic into the queue, serve sync
//! requests from peers, catch up on history before anything else, then run
//! instances strictly in sequence order — a new instance starts only at
//! `highest_decided + 1`, with the syncing semaphore held so catch-up and
//! consensus never interleave.
//!
//! Decided messages from the network are applied under the evidence rule: a
//! stored decided at the same sequence is replaced only by one with strictly
//! more signers, and a decided that would leave a gap triggers a background
//! sync instead of being applied.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::beacon::Role;
use crate::config::{
    InstanceConfig, HISTORY_SYNC_TIMEOUT, PEER_POLL_INTERVAL, PEER_WAIT_TIMEOUT, SYNC_RETRIES,
};
use crate::consensus::instance::{Instance, InstanceError, InstanceOptions};
use crate::consensus::message::{MessageType, SignedMessage};
use crate::consensus::pipeline::{
    authorize_msg, basic_msg_validation, msg_type_check, validate_lambdas, validate_quorum,
    Pipeline,
};
use crate::consensus::sync::{HistorySync, HistorySyncError};
use crate::monitoring::{report_consensus_status, report_decided};
use crate::network::queue::MessageQueue;
use crate::network::{
    wait_for_min_peers, Envelope, EnvelopeKind, Network, NetworkError, SyncError, SyncKind,
    SyncMessage, SyncRequestEnvelope,
};
use crate::share::Share;
use crate::signer::KeyManager;
use crate::storage::{StorageError, Store};
use crate::tasks::{exec_with_timeout, retry, stop_pair, StopHandle, Stopper};

// ---------------------------------------------------------------------------
// Errors & Options
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("controller init has not finished")]
    NotReady,
    #[error("an instance is already running")]
    InstanceAlreadyRunning,
    #[error("a history sync is in progress")]
    SyncInProgress,
    #[error("can't start instance at sequence {requested}, expected {expected}")]
    OutOfSequence { requested: u64, expected: u64 },
    #[error("history sync failed: {0}")]
    SyncFailed(#[from] HistorySyncError),
    #[error("instance stopped before deciding")]
    Stopped,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Instance(#[from] InstanceError),
}

/// Parameters for one instance start.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub sequence: u64,
    pub value: Vec<u8>,
}

/// Everything a controller is built from.
pub struct ControllerOptions {
    pub role: Role,
    pub identifier: Vec<u8>,
    pub share: Share,
    pub config: InstanceConfig,
    pub store: Arc<Store>,
    pub network: Arc<dyn Network>,
    pub queue: Arc<MessageQueue>,
    pub signer: Arc<KeyManager>,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct Controller {
    role: Role,
    identifier: Vec<u8>,
    share: Share,
    config: InstanceConfig,
    store: Arc<Store>,
    network: Arc<dyn Network>,
    queue: Arc<MessageQueue>,
    signer: Arc<KeyManager>,
    init_finished: AtomicBool,
    /// Holds the running instance's sequence. One instance at a time.
    instance_slot: Mutex<Option<u64>>,
    /// Weight-1: history sync and instance runs are mutually exclusive.
    syncing: Arc<Semaphore>,
    stop_handle: StopHandle,
    stopper: Stopper,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(opts: ControllerOptions) -> Arc<Self> {
        let (stop_handle, stopper) = stop_pair();
        Arc::new(Self {
            role: opts.role,
            identifier: opts.identifier,
            share: opts.share,
            config: opts.config,
            store: opts.store,
            network: opts.network,
            queue: opts.queue,
            signer: opts.signer,
            init_finished: AtomicBool::new(false),
            instance_slot: Mutex::new(None),
            syncing: Arc::new(Semaphore::new(1)),
            stop_handle,
            stopper,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn identifier(&self) -> &[u8] {
        &self.identifier
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn share(&self) -> &Share {
        &self.share
    }

    fn pubkey_hex(&self) -> String {
        self.share.public_key.to_hex()
    }

    /// The next sequence an instance may start at.
    pub fn next_sequence(&self) -> Result<u64, ControllerError> {
        Ok(self.store.highest_decided_seq(&self.identifier)? + 1)
    }

    // -----------------------------------------------------------------------
    // Init
    // -----------------------------------------------------------------------

    /// Brings the controller up, blocking until it is caught up with the
    /// network: starts the consumer loops, waits for peers on the topic,
    /// and runs history sync with retries. Only after this returns may
    /// instances start.
    pub async fn init(self: &Arc<Self>) -> Result<(), ControllerError> {
        info!(role = %self.role, "consensus controller init started");
        report_consensus_status(&self.pubkey_hex(), false, false);

        self.network.subscribe(&self.share.public_key).await?;
        self.listen_to_network_messages();
        self.listen_to_decided_messages();
        self.listen_to_sync_requests();

        wait_for_min_peers(
            self.network.as_ref(),
            &self.share.public_key,
            self.config.min_peers_for_start,
            PEER_POLL_INTERVAL,
            PEER_WAIT_TIMEOUT,
        )
        .await?;

        if let Err(e) = retry(
            || self.sync_once(),
            SYNC_RETRIES,
            std::time::Duration::from_millis(500),
        )
        .await
        {
            report_consensus_status(&self.pubkey_hex(), false, true);
            return Err(ControllerError::SyncFailed(e));
        }

        self.init_finished.store(true, Ordering::SeqCst);
        report_consensus_status(&self.pubkey_hex(), true, false);
        info!(role = %self.role, "consensus controller init finished");
        Ok(())
    }

    /// Stops the consumer loops and any running instance.
    pub fn stop(&self) {
        self.stop_handle.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Instance lifecycle
    // -----------------------------------------------------------------------

    /// Runs one consensus instance to a decided value, persists and
    /// broadcasts it. Gated on: init finished, no concurrent sync, no
    /// concurrent instance, and the sequence being exactly the next one.
    pub async fn start_instance(
        &self,
        opts: StartOptions,
    ) -> Result<SignedMessage, ControllerError> {
        if !self.init_finished.load(Ordering::SeqCst) {
            return Err(ControllerError::NotReady);
        }
        let expected = self.next_sequence()?;
        if opts.sequence != expected {
            return Err(ControllerError::OutOfSequence {
                requested: opts.sequence,
                expected,
            });
        }
        let _sync_guard = self
            .syncing
            .try_acquire()
            .map_err(|_| ControllerError::SyncInProgress)?;

        {
            let mut slot = self.instance_slot.lock().await;
            if slot.is_some() {
                return Err(ControllerError::InstanceAlreadyRunning);
            }
            *slot = Some(opts.sequence);
        }

        let result = self.run_instance(&opts).await;

        *self.instance_slot.lock().await = None;
        if result.is_err() {
            report_consensus_status(&self.pubkey_hex(), true, true);
        }
        result
    }

    async fn run_instance(&self, opts: &StartOptions) -> Result<SignedMessage, ControllerError> {
        let mut instance = Instance::new(InstanceOptions {
            share: self.share.clone(),
            identifier: self.identifier.clone(),
            sequence: opts.sequence,
            input_value: opts.value.clone(),
            config: self.config.clone(),
            network: Arc::clone(&self.network),
            signer: Arc::clone(&self.signer),
            queue: Arc::clone(&self.queue),
        });

        let decided = instance
            .run_until_decided(&self.stopper)
            .await?
            .ok_or(ControllerError::Stopped)?;

        // A peer's broadcast may already have stored a stronger aggregate
        // for this sequence; the evidence rule applies to our own result
        // too.
        let sequence = decided.message.sequence;
        let stronger_stored = self
            .store
            .get_decided(&self.identifier, sequence)?
            .map(|existing| existing.signer_ids.len() >= decided.signer_ids.len())
            .unwrap_or(false);
        if !stronger_stored {
            self.store.save_decided(&decided)?;
        }
        if sequence > self.store.highest_decided_seq(&self.identifier)? {
            self.store.save_highest_decided(&decided)?;
        }
        self.network.broadcast_decided(&decided).await?;
        report_decided(&self.pubkey_hex());
        info!(
            sequence = decided.message.sequence,
            signers = decided.signer_ids.len(),
            "decided message persisted and broadcast"
        );
        Ok(decided)
    }

    // -----------------------------------------------------------------------
    // Consumer loops
    // -----------------------------------------------------------------------

    fn listen_to_network_messages(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        let mut rx = self.network.received_msg_chan();
        let task = tokio::spawn(async move {
            let stopper = controller.stopper.clone();
            loop {
                tokio::select! {
                    _ = stopper.stopped() => break,
                    received = rx.recv() => {
                        let Some(msg) = received else { break };
                        if msg.message.identifier != controller.identifier {
                            continue;
                        }
                        controller.queue.add(Envelope {
                            kind: EnvelopeKind::Consensus,
                            msg,
                        });
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    fn listen_to_decided_messages(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        let mut rx = self.network.received_decided_chan();
        let task = tokio::spawn(async move {
            let stopper = controller.stopper.clone();
            loop {
                tokio::select! {
                    _ = stopper.stopped() => break,
                    received = rx.recv() => {
                        let Some(msg) = received else { break };
                        if let Err(e) = controller.process_decided(msg).await {
                            warn!(error = %e, "could not handle decided message");
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    fn listen_to_sync_requests(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        let mut rx = self.network.received_sync_chan();
        let task = tokio::spawn(async move {
            let stopper = controller.stopper.clone();
            loop {
                tokio::select! {
                    _ = stopper.stopped() => break,
                    received = rx.recv() => {
                        let Some(envelope) = received else { break };
                        controller.respond_to_sync_request(envelope);
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    // -----------------------------------------------------------------------
    // Decided handling
    // -----------------------------------------------------------------------

    fn decided_pipeline(&self) -> Pipeline {
        Pipeline::combine([
            basic_msg_validation(),
            validate_lambdas(self.identifier.clone()),
            msg_type_check(MessageType::Commit),
            authorize_msg(self.share.clone()),
            validate_quorum(self.share.threshold_size()),
        ])
    }

    /// Applies an inbound decided message: save it unless a stronger or
    /// equal one is already stored, advance the highest pointer only without
    /// creating gaps, and kick a background sync when the network is ahead
    /// of us.
    pub(crate) async fn process_decided(
        &self,
        msg: SignedMessage,
    ) -> Result<bool, ControllerError> {
        if let Err(e) = self.decided_pipeline().run(&msg) {
            debug!(error = %e, "received invalid decided message");
            return Ok(false);
        }
        let sequence = msg.message.sequence;

        // Evidence rule: only strictly more signers replace a stored entry.
        if let Some(existing) = self.store.get_decided(&self.identifier, sequence)? {
            if msg.signer_ids.len() <= existing.signer_ids.len() {
                debug!(sequence, "received known decided sequence");
                return Ok(false);
            }
        }
        self.store.save_decided(&msg)?;
        debug!(sequence, signers = msg.signer_ids.len(), "decided saved");

        let highest = self.store.highest_decided_seq(&self.identifier)?;
        if sequence < highest {
            // Override applied above; the pointer does not move backwards.
            return Ok(true);
        }
        if sequence > highest + 1 {
            debug!(
                sequence,
                highest, "decided beyond our prefix, triggering background sync"
            );
            self.trigger_background_sync();
            return Ok(true);
        }
        self.store.save_highest_decided(&msg)?;
        report_decided(&self.pubkey_hex());
        info!(sequence, "highest decided saved");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    async fn sync_once(&self) -> Result<(), HistorySyncError> {
        let _permit = self
            .syncing
            .acquire()
            .await
            .expect("syncing semaphore is never closed");
        let sync = HistorySync::new(
            self.identifier.clone(),
            self.share.clone(),
            Arc::clone(&self.network),
            Arc::clone(&self.store),
            self.config.clone(),
        );
        let (completed, result) = exec_with_timeout(
            &self.stopper,
            |_stopper| async move { sync.start().await },
            HISTORY_SYNC_TIMEOUT,
        )
        .await;
        match (completed, result) {
            (true, Some(outcome)) => outcome,
            _ => Err(HistorySyncError::Timeout),
        }
    }

    /// Spawns a sync unless one is already holding the permit. Failures are
    /// non-fatal here — the next out-of-prefix decided will try again.
    fn trigger_background_sync(&self) {
        let Ok(permit) = Arc::clone(&self.syncing).try_acquire_owned() else {
            debug!("sync already in progress, skipping");
            return;
        };
        let sync = HistorySync::new(
            self.identifier.clone(),
            self.share.clone(),
            Arc::clone(&self.network),
            Arc::clone(&self.store),
            self.config.clone(),
        );
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = sync.start().await {
                warn!(error = %e, "background history sync failed");
            }
        });
    }

    fn respond_to_sync_request(&self, envelope: SyncRequestEnvelope) {
        let SyncRequestEnvelope { msg, responder } = envelope;
        let mut response = SyncMessage {
            messages: Vec::new(),
            error: None,
            ..msg.clone()
        };

        match self.build_sync_response(&msg) {
            Ok(messages) if messages.is_empty() => {
                response.error = Some(SyncError::EntryNotFound);
            }
            Ok(messages) => response.messages = messages,
            Err(e) => {
                warn!(error = %e, "failed to serve sync request");
                response.error = Some(SyncError::Internal(e.to_string()));
            }
        }
        let _ = responder.send(response);
    }

    fn build_sync_response(
        &self,
        msg: &SyncMessage,
    ) -> Result<Vec<SignedMessage>, StorageError> {
        match msg.kind {
            SyncKind::GetHighestDecided => Ok(self
                .store
                .get_highest_decided(&msg.identifier)?
                .into_iter()
                .collect()),
            SyncKind::GetDecidedRange => {
                let (from, to) = match msg.params.as_slice() {
                    [from, to, ..] => (*from, *to),
                    _ => return Ok(Vec::new()),
                };
                // Never serve more than a batch, whatever was asked.
                let capped_to = to.min(from.saturating_add(self.network.max_batch() - 1));
                self.store.get_decided_range(&msg.identifier, from, capped_to)
            }
            // The controller does not track per-instance change-round state.
            SyncKind::GetLastChangeRound => Ok(Vec::new()),
        }
    }
}
