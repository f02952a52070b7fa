//! # Protocol Configuration & Constants
//!
//! Every magic number in Tessera lives here. If you're hardcoding a constant
//! somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! The values split into two groups: process-wide constants (quorum
//! arithmetic, batch caps) and the per-instance tunables collected in
//! [`InstanceConfig`]. The tunables ship with defaults that match the
//! production network; tests override them freely.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Committee Arithmetic
// ---------------------------------------------------------------------------

/// Computes the full quorum threshold for a committee of `n` operators:
/// `2n/3 + 1` distinct signers.
///
/// With the canonical committee size `3f + 1` this is exactly `2f + 1` — the
/// classical BFT bound. Fewer signers and two conflicting decisions can both
/// gather a quorum under `f` Byzantine members.
pub fn quorum_threshold(n: usize) -> usize {
    (2 * n / 3) + 1
}

/// Computes the partial quorum for a committee of `n` operators:
/// `n/3 + 1` distinct signers, i.e. `f + 1`.
///
/// A partial quorum guarantees at least one honest member is in the set. It
/// is used only to accelerate round changes — never to decide values.
pub fn partial_quorum_threshold(n: usize) -> usize {
    (n / 3) + 1
}

// ---------------------------------------------------------------------------
// Timing Constants
// ---------------------------------------------------------------------------

/// Base timeout for the first consensus round. Each subsequent round doubles
/// it (see [`InstanceConfig::round_timeout`]), so a stalled instance backs
/// off instead of hammering the network with change-round storms.
pub const ROUND_CHANGE_BASE_TIMEOUT: Duration = Duration::from_secs(2);

/// Multiplier applied to the round timeout per elapsed round.
pub const ROUND_CHANGE_FACTOR: u32 = 2;

/// How long `wait_for_min_peers` sleeps between peer-count polls.
pub const PEER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on waiting for peers before init gives up.
pub const PEER_WAIT_TIMEOUT: Duration = Duration::from_secs(64);

// ---------------------------------------------------------------------------
// Sync Parameters
// ---------------------------------------------------------------------------

/// Number of peers sampled when searching for the highest decided sequence.
pub const HISTORY_SYNC_PEERS: usize = 4;

/// Maximum number of decided messages in a single range-sync batch. Peers
/// are free to return fewer; returning more is a protocol violation.
pub const SYNC_BATCH_MAX: u64 = 25;

/// Minimum peers on a validator's topic before its controller starts.
pub const MIN_PEERS_FOR_START: usize = 1;

/// How many times a failed history sync is retried before init gives up.
pub const SYNC_RETRIES: usize = 3;

/// Deadline for one whole history-sync run. A peer that trickles batches
/// slower than this is abandoned and the sync retried elsewhere.
pub const HISTORY_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// How long the duty runner waits for a partial-signature quorum after a
/// value is decided before giving the duty up.
pub const SIGNATURE_COLLECTION_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Queue Parameters
// ---------------------------------------------------------------------------

/// Maximum number of buffered network envelopes per message queue. On
/// overflow the oldest message of the lowest-priority class is dropped.
pub const MSG_QUEUE_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// InstanceConfig
// ---------------------------------------------------------------------------

/// Tunable parameters shared by every consensus instance a controller spawns.
///
/// Defaults mirror the constants above. Changing `round_change_base_timeout`
/// across the committee asymmetrically will make the slow nodes perpetual
/// round-change laggards, so deployments should keep these uniform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Timeout for round 1. Doubles per round.
    pub round_change_base_timeout: Duration,
    /// Per-round timeout multiplier.
    pub round_change_factor: u32,
    /// Peers sampled during history sync.
    pub history_sync_peers: usize,
    /// Range-sync batch cap.
    pub sync_batch_max: u64,
    /// Minimum topic peers before a controller finishes init.
    pub min_peers_for_start: usize,
    /// First epoch of the chain this node serves.
    pub genesis_epoch: u64,
    /// How many slots late a duty may still be executed. Duties older than
    /// this are dropped rather than signed into irrelevance.
    pub duty_slot_limit: u64,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            round_change_base_timeout: ROUND_CHANGE_BASE_TIMEOUT,
            round_change_factor: ROUND_CHANGE_FACTOR,
            history_sync_peers: HISTORY_SYNC_PEERS,
            sync_batch_max: SYNC_BATCH_MAX,
            min_peers_for_start: MIN_PEERS_FOR_START,
            genesis_epoch: 0,
            duty_slot_limit: 32,
        }
    }
}

impl InstanceConfig {
    /// Returns the timeout for the given round (1-based):
    /// `base * factor^(round-1)`.
    ///
    /// Saturates instead of overflowing — a round number large enough to
    /// overflow a `Duration` means the instance is dead anyway.
    pub fn round_timeout(&self, round: u64) -> Duration {
        let exp = round.saturating_sub(1).min(u32::MAX as u64) as u32;
        let factor = self.round_change_factor.saturating_pow(exp);
        self.round_change_base_timeout
            .saturating_mul(factor.max(1))
    }
}
