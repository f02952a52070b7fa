//! Cryptographic primitives: threshold BLS signatures and key handling.

pub mod bls;

pub use bls::{
    aggregate_public_keys, aggregate_signatures, reconstruct_signature, split_secret, BlsError,
    BlsPublicKey, BlsSecretKey, BlsSignature,
};
