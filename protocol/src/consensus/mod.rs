//! # IBFT Consensus
//!
//! Leader-based Byzantine fault tolerant consensus, one instance per
//! `(identifier, sequence)`:
//!
//! - **message** — the wire model: typed messages and signed envelopes.
//! - **container** — per-round buffers with quorum queries.
//! - **pipeline** — validation as data.
//! - **instance** — the four-stage state machine with change-rounds.
//! - **controller** — per-validator lifecycle, decided log, sync gating.
//! - **sync** — history catch-up from peers.

pub mod container;
pub mod controller;
pub mod instance;
pub mod message;
pub mod pipeline;
pub mod sync;
