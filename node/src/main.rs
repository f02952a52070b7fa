// Copyright (c) 2026 Tessera Labs. MIT License.
// See LICENSE for details.

//! # Tessera Operator Node
//!
//! Entry point for the `tessera-node` binary. Parses CLI arguments,
//! initializes logging, and runs a single-process operator committee: every
//! committee seat gets its own store, signer, controller, and duty runner,
//! all wired through the in-process network. This is the devnet shape —
//! a production deployment runs one seat per machine behind a real
//! transport, but the consensus core is exactly the same code.
//!
//! Subcommands:
//!
//! - `run`     — start the committee and execute duties per slot
//! - `init`    — create a data directory with a freshly split validator key
//! - `version` — print build version information

mod cli;
mod logging;
mod metrics;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::signal;

use tessera_protocol::beacon::{
    identifier, AttestationData, BeaconClient, BeaconError, Checkpoint, Domains, Duty, Hash256,
    Role,
};
use tessera_protocol::config::{quorum_threshold, InstanceConfig, MSG_QUEUE_CAPACITY};
use tessera_protocol::consensus::controller::{Controller, ControllerOptions};
use tessera_protocol::crypto::bls::{split_secret, BlsPublicKey, BlsSecretKey, BlsSignature};
use tessera_protocol::network::local::LocalNetwork;
use tessera_protocol::network::queue::MessageQueue;
use tessera_protocol::network::Network;
use tessera_protocol::share::Share;
use tessera_protocol::signer::KeyManager;
use tessera_protocol::storage::Store;
use tessera_protocol::validator::{DutyRunner, DutyRunnerOptions};

use cli::{Commands, TesseraNodeCli};
use logging::LogFormat;

/// First devnet slot. Slot 0 would make the source epoch arithmetic
/// degenerate, so the committee starts attesting at 1.
const FIRST_SLOT: u64 = 1;

/// Committee manifest written by `init` and read by `run`.
#[derive(Debug, Serialize, Deserialize)]
struct CommitteeManifest {
    validator_pubkey: String,
    operators: Vec<ManifestOperator>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestOperator {
    node_id: u64,
    share_pubkey: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TesseraNodeCli::parse();
    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// run — committee startup and duty loop
// ---------------------------------------------------------------------------

struct OperatorSeat {
    node_id: u64,
    controller: Arc<Controller>,
    runner: DutyRunner,
}

async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(&args.log_level, LogFormat::from_str_lossy(&args.log_format));

    if args.operators < 4 {
        bail!("a committee needs at least 4 operators to tolerate one fault");
    }

    let (validator_pk, share_keys) = load_or_generate_committee(&args.data_dir, args.operators)?;
    let committee: BTreeMap<u64, BlsPublicKey> = share_keys
        .iter()
        .map(|(id, sk)| (*id, sk.public_key()))
        .collect();
    let stream_id = identifier(&validator_pk, Role::Attester);

    tracing::info!(
        validator = %validator_pk.to_hex(),
        operators = args.operators,
        quorum = quorum_threshold(args.operators as usize),
        data_dir = %args.data_dir.display(),
        "starting tessera committee"
    );

    let hub = LocalNetwork::new();
    let beacon: Arc<dyn BeaconClient> = Arc::new(DevnetBeacon);
    let mut seats = Vec::new();

    for (&node_id, secret) in &share_keys {
        let share = Share {
            node_id,
            public_key: validator_pk.clone(),
            committee: committee.clone(),
        };
        let store = Arc::new(
            Store::open(args.data_dir.join(format!("operator-{node_id}")))
                .with_context(|| format!("opening store for operator {node_id}"))?,
        );
        store
            .save_validator_share(&share)
            .context("persisting validator share")?;
        let signer = Arc::new(KeyManager::new(Arc::clone(&store), Domains::default()));
        signer.add_share(secret.clone());

        let network: Arc<dyn Network> = Arc::new(hub.for_peer(format!("operator-{node_id}")));
        let controller = Controller::new(ControllerOptions {
            role: Role::Attester,
            identifier: stream_id.clone(),
            share: share.clone(),
            config: InstanceConfig::default(),
            store,
            network: Arc::clone(&network),
            queue: Arc::new(MessageQueue::new(MSG_QUEUE_CAPACITY)),
            signer: Arc::clone(&signer),
        });
        let runner = DutyRunner::new(DutyRunnerOptions {
            share,
            controller: Arc::clone(&controller),
            network,
            beacon: Arc::clone(&beacon),
            signer,
            config: InstanceConfig::default(),
        });
        seats.push(OperatorSeat {
            node_id,
            controller,
            runner,
        });
    }

    let init_results =
        futures::future::join_all(seats.iter().map(|seat| seat.controller.init())).await;
    for (seat, result) in seats.iter().zip(init_results) {
        result.with_context(|| format!("initializing controller for operator {}", seat.node_id))?;
    }
    tracing::info!("all controllers initialized, entering duty loop");

    let mut slot = FIRST_SLOT
        + seats[0]
            .controller
            .next_sequence()
            .context("reading decided history")?
        - 1;
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(args.slot_ms));
    let mut completed_rounds = 0u64;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
                break;
            }
            _ = interval.tick() => {
                let duty = Duty {
                    role: Role::Attester,
                    validator_pk: validator_pk.clone(),
                    slot,
                    validator_index: 0,
                    committee_index: 0,
                    committee_length: args.operators,
                    committees_at_slot: 1,
                    validator_committee_index: 0,
                };
                let results = futures::future::join_all(
                    seats.iter().map(|seat| seat.runner.execute_duty(duty.clone(), slot)),
                )
                .await;

                let mut succeeded = 0usize;
                for (seat, result) in seats.iter().zip(results) {
                    match result {
                        Ok(outcome) => {
                            succeeded += 1;
                            tracing::debug!(
                                operator = seat.node_id,
                                sequence = outcome.sequence,
                                slot = outcome.attestation.slot,
                                "duty completed"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(operator = seat.node_id, error = %e, "duty failed");
                        }
                    }
                }
                tracing::info!(slot, succeeded, of = seats.len(), "duty round finished");
                tracing::trace!(metrics = %metrics::render(), "metrics snapshot");

                slot += 1;
                completed_rounds += 1;
                if args.rounds > 0 && completed_rounds >= args.rounds {
                    tracing::info!(rounds = completed_rounds, "configured rounds done, exiting");
                    break;
                }
            }
        }
    }

    for seat in &seats {
        seat.controller.stop();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// init — data directory scaffolding
// ---------------------------------------------------------------------------

fn init_node(args: cli::InitArgs) -> Result<()> {
    if args.operators < 4 {
        bail!("a committee needs at least 4 operators to tolerate one fault");
    }
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating {}", args.data_dir.display()))?;

    let master = BlsSecretKey::generate();
    let validator_pk = master.public_key();
    let shares = split_secret(&master, args.operators, quorum_threshold(args.operators as usize))
        .context("splitting validator key")?;

    let mut manifest = CommitteeManifest {
        validator_pubkey: validator_pk.to_hex(),
        operators: Vec::new(),
    };
    for (node_id, secret) in &shares {
        let key_path = args.data_dir.join(format!("operator-{node_id}.key"));
        std::fs::write(&key_path, hex::encode(secret.to_bytes()))
            .with_context(|| format!("writing {}", key_path.display()))?;
        manifest.operators.push(ManifestOperator {
            node_id: *node_id,
            share_pubkey: secret.public_key().to_hex(),
        });
    }
    let manifest_path = args.data_dir.join("committee.json");
    std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    println!("initialized committee in {}", args.data_dir.display());
    println!("validator public key: {}", manifest.validator_pubkey);
    println!("operators: {}", manifest.operators.len());
    Ok(())
}

/// Loads the committee written by `init`, or generates an ephemeral one
/// when the data directory has no manifest.
fn load_or_generate_committee(
    data_dir: &Path,
    operators: u64,
) -> Result<(BlsPublicKey, BTreeMap<u64, BlsSecretKey>)> {
    let manifest_path = data_dir.join("committee.json");
    if manifest_path.exists() {
        let manifest: CommitteeManifest =
            serde_json::from_str(&std::fs::read_to_string(&manifest_path)?)
                .context("parsing committee.json")?;
        if manifest.operators.len() as u64 != operators {
            bail!(
                "committee.json holds {} operators, --operators says {}",
                manifest.operators.len(),
                operators
            );
        }
        let validator_pk = BlsPublicKey::from_bytes(
            &hex::decode(&manifest.validator_pubkey).context("decoding validator pubkey")?,
        )
        .context("parsing validator pubkey")?;

        let mut share_keys = BTreeMap::new();
        for op in &manifest.operators {
            let key_path = data_dir.join(format!("operator-{}.key", op.node_id));
            let raw = std::fs::read_to_string(&key_path)
                .with_context(|| format!("reading {}", key_path.display()))?;
            let secret = BlsSecretKey::from_bytes(&hex::decode(raw.trim())?)
                .context("parsing operator share key")?;
            share_keys.insert(op.node_id, secret);
        }
        tracing::info!(path = %manifest_path.display(), "loaded committee from data dir");
        return Ok((validator_pk, share_keys));
    }

    tracing::info!("no committee manifest found, generating an ephemeral one");
    std::fs::create_dir_all(data_dir)?;
    let master = BlsSecretKey::generate();
    let shares = split_secret(&master, operators, quorum_threshold(operators as usize))
        .context("splitting validator key")?;
    Ok((master.public_key(), shares))
}

// ---------------------------------------------------------------------------
// Devnet beacon
// ---------------------------------------------------------------------------

/// A deterministic stand-in for a beacon node: every operator derives the
/// same attestation data from the slot number, and submissions are logged
/// instead of sent. Epoch arithmetic is compressed (one slot per epoch) so
/// the slashing watermarks advance every duty.
struct DevnetBeacon;

#[async_trait::async_trait]
impl BeaconClient for DevnetBeacon {
    async fn attestation_data(
        &self,
        slot: u64,
        committee_index: u64,
    ) -> Result<AttestationData, BeaconError> {
        let root: [u8; 32] = Sha256::digest(slot.to_be_bytes()).into();
        Ok(AttestationData {
            slot,
            index: committee_index,
            beacon_block_root: Hash256::from(root),
            source: Checkpoint {
                epoch: slot.saturating_sub(1),
                root: Hash256::zero(),
            },
            target: Checkpoint {
                epoch: slot,
                root: Hash256::zero(),
            },
        })
    }

    async fn submit_attestation(
        &self,
        data: &AttestationData,
        validator_pk: &BlsPublicKey,
        _signature: &BlsSignature,
    ) -> Result<(), BeaconError> {
        tracing::info!(
            slot = data.slot,
            validator = %validator_pk.to_hex(),
            "attestation accepted by devnet beacon"
        );
        Ok(())
    }
}

fn print_version() {
    println!("tessera-node {}", env!("CARGO_PKG_VERSION"));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_protocol::crypto::bls::reconstruct_signature;

    fn init_into_tempdir(operators: u64) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        init_node(cli::InitArgs {
            data_dir: dir.path().to_path_buf(),
            operators,
        })
        .expect("init succeeds");
        dir
    }

    // -- init ---------------------------------------------------------------

    #[test]
    fn init_writes_manifest_and_key_files() {
        let dir = init_into_tempdir(4);

        let manifest: CommitteeManifest = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("committee.json")).unwrap(),
        )
        .expect("manifest parses");
        assert_eq!(manifest.operators.len(), 4);

        // The validator pubkey is a real compressed BLS key.
        let pk_bytes = hex::decode(&manifest.validator_pubkey).unwrap();
        BlsPublicKey::from_bytes(&pk_bytes).expect("valid validator pubkey");

        // Every key file holds the secret whose pubkey the manifest lists.
        for op in &manifest.operators {
            let raw = std::fs::read_to_string(
                dir.path().join(format!("operator-{}.key", op.node_id)),
            )
            .expect("key file exists");
            let secret = BlsSecretKey::from_bytes(&hex::decode(raw.trim()).unwrap())
                .expect("valid share key");
            assert_eq!(secret.public_key().to_hex(), op.share_pubkey);
        }
    }

    #[test]
    fn init_creates_missing_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("deeper").join("devnet");
        init_node(cli::InitArgs {
            data_dir: nested.clone(),
            operators: 4,
        })
        .expect("init creates the directory chain");
        assert!(nested.join("committee.json").exists());
    }

    #[test]
    fn init_rejects_undersized_committee() {
        let dir = tempfile::tempdir().unwrap();
        let err = init_node(cli::InitArgs {
            data_dir: dir.path().to_path_buf(),
            operators: 3,
        })
        .expect_err("3 operators cannot tolerate a fault");
        assert!(err.to_string().contains("at least 4"));
    }

    // -- load_or_generate_committee -----------------------------------------

    #[test]
    fn load_returns_the_initialized_committee() {
        let dir = init_into_tempdir(4);
        let manifest: CommitteeManifest = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("committee.json")).unwrap(),
        )
        .unwrap();

        let (validator_pk, share_keys) =
            load_or_generate_committee(dir.path(), 4).expect("load succeeds");

        assert_eq!(validator_pk.to_hex(), manifest.validator_pubkey);
        assert_eq!(share_keys.len(), 4);
        for op in &manifest.operators {
            assert_eq!(
                share_keys[&op.node_id].public_key().to_hex(),
                op.share_pubkey
            );
        }
    }

    #[test]
    fn load_rejects_operator_count_mismatch() {
        let dir = init_into_tempdir(4);
        let err = load_or_generate_committee(dir.path(), 5)
            .expect_err("manifest size must match --operators");
        assert!(err.to_string().contains("committee.json holds 4"));
    }

    #[test]
    fn generate_branch_produces_a_working_committee() {
        let dir = tempfile::tempdir().unwrap();
        let (validator_pk, share_keys) =
            load_or_generate_committee(dir.path(), 4).expect("ephemeral committee");

        assert_eq!(share_keys.len(), 4);
        assert_eq!(
            share_keys.keys().copied().collect::<Vec<u64>>(),
            vec![1, 2, 3, 4]
        );

        // A quorum of the generated shares reconstructs a signature of the
        // returned validator key.
        let msg = b"devnet root";
        let partials: BTreeMap<u64, _> = share_keys
            .iter()
            .take(3)
            .map(|(id, sk)| (*id, sk.sign(msg)))
            .collect();
        let full = reconstruct_signature(&partials).expect("reconstruction succeeds");
        assert!(full.verify(&validator_pk, msg));

        // No manifest was written: the committee is ephemeral.
        assert!(!dir.path().join("committee.json").exists());
    }

    // -- devnet beacon ------------------------------------------------------

    #[tokio::test]
    async fn devnet_beacon_compresses_epochs() {
        let beacon = DevnetBeacon;
        let data = beacon.attestation_data(5, 2).await.unwrap();

        assert_eq!(data.slot, 5);
        assert_eq!(data.index, 2);
        assert_eq!(data.source.epoch, 4);
        assert_eq!(data.target.epoch, 5);

        // The first slot's source saturates at zero instead of wrapping.
        let first = beacon.attestation_data(FIRST_SLOT, 0).await.unwrap();
        assert_eq!(first.source.epoch, 0);
        assert_eq!(first.target.epoch, 1);
    }

    #[tokio::test]
    async fn devnet_beacon_is_deterministic_per_slot() {
        let beacon = DevnetBeacon;
        let a = beacon.attestation_data(7, 0).await.unwrap();
        let b = beacon.attestation_data(7, 0).await.unwrap();
        let other = beacon.attestation_data(8, 0).await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a.beacon_block_root, other.beacon_block_root);
    }
}
