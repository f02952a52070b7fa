//! # Threshold BLS over BLS12-381
//!
//! Every signature in Tessera — consensus votes, attestations, block
//! proposals — is a BLS signature in the `min_pk` scheme (48-byte public
//! keys on G1, 96-byte signatures on G2), with the standard eth2 domain
//! separation tag. The `blst` backend does the curve arithmetic; this module
//! wraps it in types that serialize, compare, and hash like ordinary values.
//!
//! ## Threshold machinery
//!
//! A validator's secret key never exists on any single operator. It is
//! Shamir-split: a random polynomial `f` of degree `t-1` with `f(0)` equal to
//! the validator key, and operator `i` holding `f(i)`. Because BLS signing is
//! linear in the secret key, partial signatures under the shares combine by
//! Lagrange interpolation at zero into exactly the signature the full key
//! would have produced. [`split_secret`] produces the shares,
//! [`reconstruct_signature`] performs the interpolation.
//!
//! The interpolation walks into `blst`'s low-level `fr`/`p2` primitives —
//! the safe `min_pk` API has no scalar-multiply-a-signature operation. The
//! unsafe blocks are confined to this module.

use std::collections::BTreeMap;
use std::fmt;

use blst::min_pk as bls_core;
use blst::{
    blst_bendian_from_scalar, blst_fr, blst_fr_add, blst_fr_eucl_inverse, blst_fr_from_scalar,
    blst_fr_from_uint64, blst_fr_mul, blst_fr_sub, blst_p2, blst_p2_add_or_double,
    blst_p2_compress, blst_p2_from_affine, blst_p2_mult, blst_p2_uncompress, blst_scalar,
    blst_scalar_from_bendian, blst_scalar_from_fr, BLST_ERROR,
};
use rand::RngCore;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Domain separation tag for eth2 BLS signatures (proof-of-possession scheme).
pub const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Compressed public key length on G1.
pub const PUBLIC_KEY_LENGTH: usize = 48;

/// Compressed signature length on G2.
pub const SIGNATURE_LENGTH: usize = 96;

/// Secret key (scalar) length.
pub const SECRET_KEY_LENGTH: usize = 32;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors from BLS operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BlsError {
    /// Byte string did not decode to a valid curve point or scalar.
    #[error("invalid BLS encoding: {0}")]
    InvalidBytes(String),
    /// The backend rejected an operation (group check, aggregation, ...).
    #[error("bls backend error: {0:?}")]
    Backend(BLST_ERROR),
    /// Threshold math was asked to do something impossible.
    #[error("threshold error: {0}")]
    Threshold(String),
}

// ---------------------------------------------------------------------------
// Public Key
// ---------------------------------------------------------------------------

/// A compressed BLS public key (48 bytes, G1).
///
/// Stored in compressed form so the type is `Eq + Hash + Ord` and serializes
/// without ceremony; decompression happens at verification time.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlsPublicKey([u8; PUBLIC_KEY_LENGTH]);

impl BlsPublicKey {
    /// Parses and group-checks a compressed public key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        let pk = bls_core::PublicKey::from_bytes(bytes)
            .map_err(|e| BlsError::InvalidBytes(format!("public key: {e:?}")))?;
        Ok(Self(pk.to_bytes()))
    }

    /// Returns the compressed form.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    /// Hex rendering, used for identifiers and log fields.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn decompress(&self) -> Result<bls_core::PublicKey, BlsError> {
        bls_core::PublicKey::from_bytes(&self.0)
            .map_err(|e| BlsError::InvalidBytes(format!("public key: {e:?}")))
    }
}

impl fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsPublicKey({}..)", hex::encode(&self.0[..6]))
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// A compressed BLS signature (96 bytes, G2). May be a single partial
/// signature or an aggregate — the bytes don't know the difference.
#[derive(Clone, PartialEq, Eq)]
pub struct BlsSignature([u8; SIGNATURE_LENGTH]);

impl BlsSignature {
    /// Parses and group-checks a compressed signature.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        let sig = bls_core::Signature::from_bytes(bytes)
            .map_err(|e| BlsError::InvalidBytes(format!("signature: {e:?}")))?;
        Ok(Self(sig.to_bytes()))
    }

    /// Returns the compressed form.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    /// Verifies this signature over `msg` against a single public key.
    pub fn verify(&self, pk: &BlsPublicKey, msg: &[u8]) -> bool {
        let sig = match bls_core::Signature::from_bytes(&self.0) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let pk = match pk.decompress() {
            Ok(p) => p,
            Err(_) => return false,
        };
        sig.verify(true, msg, DST, &[], &pk, true) == BLST_ERROR::BLST_SUCCESS
    }

    /// Verifies this (aggregate) signature over one message against the
    /// aggregate of the given public keys.
    ///
    /// This is the committee check: a decided message with signer ids
    /// `{1,2,3}` verifies against the aggregate of those operators' share
    /// public keys.
    pub fn fast_aggregate_verify(&self, pks: &[&BlsPublicKey], msg: &[u8]) -> bool {
        if pks.is_empty() {
            return false;
        }
        let sig = match bls_core::Signature::from_bytes(&self.0) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let decompressed: Result<Vec<_>, _> = pks.iter().map(|pk| pk.decompress()).collect();
        let decompressed = match decompressed {
            Ok(v) => v,
            Err(_) => return false,
        };
        let refs: Vec<&bls_core::PublicKey> = decompressed.iter().collect();
        sig.fast_aggregate_verify(true, msg, DST, &refs) == BLST_ERROR::BLST_SUCCESS
    }
}

impl fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsSignature({}..)", hex::encode(&self.0[..6]))
    }
}

// ---------------------------------------------------------------------------
// Secret Key
// ---------------------------------------------------------------------------

/// A BLS secret key. `Debug` never prints key material.
#[derive(Clone)]
pub struct BlsSecretKey(bls_core::SecretKey);

impl BlsSecretKey {
    /// Generates a fresh random secret key from OS entropy.
    pub fn generate() -> Self {
        let mut ikm = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut ikm);
        // key_gen only fails on short IKM; 32 bytes always succeeds.
        let sk = bls_core::SecretKey::key_gen(&ikm, &[]).expect("32-byte IKM is sufficient");
        Self(sk)
    }

    /// Parses a 32-byte big-endian scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        let sk = bls_core::SecretKey::from_bytes(bytes)
            .map_err(|e| BlsError::InvalidBytes(format!("secret key: {e:?}")))?;
        Ok(Self(sk))
    }

    /// Serializes to the 32-byte big-endian scalar form.
    pub fn to_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.0.to_bytes()
    }

    /// Derives the matching public key.
    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey(self.0.sk_to_pk().to_bytes())
    }

    /// Signs a message under the eth2 DST.
    pub fn sign(&self, msg: &[u8]) -> BlsSignature {
        BlsSignature(self.0.sign(msg, DST, &[]).to_bytes())
    }
}

impl fmt::Debug for BlsSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsSecretKey(***)")
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Aggregates signatures into one by point addition on G2.
pub fn aggregate_signatures(sigs: &[BlsSignature]) -> Result<BlsSignature, BlsError> {
    if sigs.is_empty() {
        return Err(BlsError::Threshold("nothing to aggregate".into()));
    }
    let parsed: Result<Vec<_>, _> = sigs
        .iter()
        .map(|s| {
            bls_core::Signature::from_bytes(&s.0)
                .map_err(|e| BlsError::InvalidBytes(format!("signature: {e:?}")))
        })
        .collect();
    let parsed = parsed?;
    let refs: Vec<&bls_core::Signature> = parsed.iter().collect();
    let agg = bls_core::AggregateSignature::aggregate(&refs, true).map_err(BlsError::Backend)?;
    Ok(BlsSignature(agg.to_signature().to_bytes()))
}

/// Aggregates public keys into one by point addition on G1.
pub fn aggregate_public_keys(pks: &[&BlsPublicKey]) -> Result<BlsPublicKey, BlsError> {
    if pks.is_empty() {
        return Err(BlsError::Threshold("nothing to aggregate".into()));
    }
    let parsed: Result<Vec<_>, _> = pks.iter().map(|pk| pk.decompress()).collect();
    let parsed = parsed?;
    let refs: Vec<&bls_core::PublicKey> = parsed.iter().collect();
    let agg = bls_core::AggregatePublicKey::aggregate(&refs, true).map_err(BlsError::Backend)?;
    Ok(BlsPublicKey(agg.to_public_key().to_bytes()))
}

// ---------------------------------------------------------------------------
// Shamir Split & Lagrange Reconstruction
// ---------------------------------------------------------------------------

fn fr_from_u64(x: u64) -> blst_fr {
    let input = [x, 0, 0, 0];
    let mut ret = blst_fr::default();
    unsafe { blst_fr_from_uint64(&mut ret, input.as_ptr()) };
    ret
}

fn fr_from_secret(sk: &BlsSecretKey) -> blst_fr {
    let be = sk.to_bytes();
    let mut scalar = blst_scalar::default();
    let mut ret = blst_fr::default();
    unsafe {
        blst_scalar_from_bendian(&mut scalar, be.as_ptr());
        blst_fr_from_scalar(&mut ret, &scalar);
    }
    ret
}

fn secret_from_fr(fr: &blst_fr) -> Result<BlsSecretKey, BlsError> {
    let mut scalar = blst_scalar::default();
    let mut be = [0u8; SECRET_KEY_LENGTH];
    unsafe {
        blst_scalar_from_fr(&mut scalar, fr);
        blst_bendian_from_scalar(be.as_mut_ptr(), &scalar);
    }
    BlsSecretKey::from_bytes(&be)
}

/// Splits `master` into `committee_size` shares with the given reconstruction
/// `threshold`, returning shares keyed by operator id `1..=committee_size`.
///
/// Any `threshold` of the shares reconstruct signatures of the master key;
/// fewer reveal nothing.
pub fn split_secret(
    master: &BlsSecretKey,
    committee_size: u64,
    threshold: usize,
) -> Result<BTreeMap<u64, BlsSecretKey>, BlsError> {
    if threshold == 0 || (threshold as u64) > committee_size {
        return Err(BlsError::Threshold(format!(
            "threshold {threshold} incompatible with committee of {committee_size}"
        )));
    }

    // f(x) = master + a_1 x + ... + a_{t-1} x^{t-1}, coefficients random.
    let mut coefficients = vec![fr_from_secret(master)];
    for _ in 1..threshold {
        coefficients.push(fr_from_secret(&BlsSecretKey::generate()));
    }

    let mut shares = BTreeMap::new();
    for id in 1..=committee_size {
        let x = fr_from_u64(id);
        // Horner evaluation, highest coefficient first.
        let mut acc = *coefficients.last().expect("threshold >= 1");
        for coeff in coefficients.iter().rev().skip(1) {
            unsafe {
                let tmp = acc;
                blst_fr_mul(&mut acc, &tmp, &x);
                let tmp = acc;
                blst_fr_add(&mut acc, &tmp, coeff);
            }
        }
        shares.insert(id, secret_from_fr(&acc)?);
    }
    Ok(shares)
}

/// Reconstructs the master-key signature from partial signatures produced by
/// distinct shares, by Lagrange interpolation at zero over the operator ids.
///
/// `partials` maps operator id -> partial signature over the same message.
/// Passing signatures over different messages yields garbage that fails
/// verification, not an error.
pub fn reconstruct_signature(
    partials: &BTreeMap<u64, BlsSignature>,
) -> Result<BlsSignature, BlsError> {
    if partials.is_empty() {
        return Err(BlsError::Threshold("no partial signatures".into()));
    }
    if partials.contains_key(&0) {
        return Err(BlsError::Threshold("operator id 0 is reserved".into()));
    }

    let ids: Vec<u64> = partials.keys().copied().collect();
    let mut acc = blst_p2::default();
    let mut acc_initialized = false;

    for (&id, sig) in partials {
        // lambda_id = prod_{m != id} x_m / (x_m - x_id), all in fr.
        let x_i = fr_from_u64(id);
        let mut num = fr_from_u64(1);
        let mut den = fr_from_u64(1);
        for &other in &ids {
            if other == id {
                continue;
            }
            let x_m = fr_from_u64(other);
            unsafe {
                let tmp = num;
                blst_fr_mul(&mut num, &tmp, &x_m);
                let mut diff = blst_fr::default();
                blst_fr_sub(&mut diff, &x_m, &x_i);
                let tmp = den;
                blst_fr_mul(&mut den, &tmp, &diff);
            }
        }
        let mut lambda = blst_fr::default();
        unsafe {
            let mut den_inv = blst_fr::default();
            blst_fr_eucl_inverse(&mut den_inv, &den);
            blst_fr_mul(&mut lambda, &num, &den_inv);
        }

        // term = lambda * sig, as a G2 point.
        let mut affine = blst::blst_p2_affine::default();
        let rc = unsafe { blst_p2_uncompress(&mut affine, sig.0.as_ptr()) };
        if rc != BLST_ERROR::BLST_SUCCESS {
            return Err(BlsError::InvalidBytes(format!("partial signature: {rc:?}")));
        }
        let mut point = blst_p2::default();
        let mut term = blst_p2::default();
        let mut scalar = blst_scalar::default();
        unsafe {
            blst_p2_from_affine(&mut point, &affine);
            blst_scalar_from_fr(&mut scalar, &lambda);
            blst_p2_mult(&mut term, &point, scalar.b.as_ptr(), 255);
        }

        if acc_initialized {
            unsafe {
                let tmp = acc;
                blst_p2_add_or_double(&mut acc, &tmp, &term);
            }
        } else {
            acc = term;
            acc_initialized = true;
        }
    }

    let mut compressed = [0u8; SIGNATURE_LENGTH];
    unsafe { blst_p2_compress(compressed.as_mut_ptr(), &acc) };
    BlsSignature::from_bytes(&compressed)
}

// ---------------------------------------------------------------------------
// Serde — fixed-size byte arrays need manual impls
// ---------------------------------------------------------------------------

macro_rules! impl_byte_serde {
    ($type:ident, $len:expr, $expecting:expr) => {
        impl Serialize for $type {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_bytes(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $type {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                struct BytesVisitor;
                impl<'de> Visitor<'de> for BytesVisitor {
                    type Value = $type;

                    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                        formatter.write_str($expecting)
                    }

                    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
                    where
                        E: de::Error,
                    {
                        $type::from_bytes(v).map_err(|e| E::custom(e.to_string()))
                    }

                    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                    where
                        A: de::SeqAccess<'de>,
                    {
                        let mut buf = [0u8; $len];
                        for (i, slot) in buf.iter_mut().enumerate() {
                            *slot = seq
                                .next_element()?
                                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                        }
                        $type::from_bytes(&buf).map_err(|e| de::Error::custom(e.to_string()))
                    }
                }
                deserializer.deserialize_bytes(BytesVisitor)
            }
        }
    };
}

impl_byte_serde!(BlsPublicKey, PUBLIC_KEY_LENGTH, "a 48-byte public key");
impl_byte_serde!(BlsSignature, SIGNATURE_LENGTH, "a 96-byte signature");

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let sk = BlsSecretKey::generate();
        let pk = sk.public_key();
        let sig = sk.sign(b"attestation root");

        assert!(sig.verify(&pk, b"attestation root"));
        assert!(!sig.verify(&pk, b"different root"));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let sk = BlsSecretKey::generate();
        let other = BlsSecretKey::generate();
        let sig = sk.sign(b"msg");

        assert!(!sig.verify(&other.public_key(), b"msg"));
    }

    #[test]
    fn aggregate_verifies_against_aggregate_key() {
        let keys: Vec<BlsSecretKey> = (0..4).map(|_| BlsSecretKey::generate()).collect();
        let msg = b"decided value";

        let sigs: Vec<BlsSignature> = keys.iter().map(|k| k.sign(msg)).collect();
        let agg = aggregate_signatures(&sigs).expect("aggregation succeeds");

        let pks: Vec<BlsPublicKey> = keys.iter().map(|k| k.public_key()).collect();
        let pk_refs: Vec<&BlsPublicKey> = pks.iter().collect();
        assert!(agg.fast_aggregate_verify(&pk_refs, msg));

        // A subset of the keys must not verify the full aggregate.
        let subset: Vec<&BlsPublicKey> = pks.iter().take(3).collect();
        assert!(!agg.fast_aggregate_verify(&subset, msg));
    }

    #[test]
    fn split_then_reconstruct_matches_master() {
        let master = BlsSecretKey::generate();
        let shares = split_secret(&master, 4, 3).expect("split succeeds");
        assert_eq!(shares.len(), 4);

        let msg = b"signing root";
        let expected = master.sign(msg);

        // Any 3 of 4 shares reconstruct the master signature.
        let partials: BTreeMap<u64, BlsSignature> = shares
            .iter()
            .filter(|(id, _)| **id != 2)
            .map(|(id, sk)| (*id, sk.sign(msg)))
            .collect();
        let reconstructed = reconstruct_signature(&partials).expect("reconstruction succeeds");

        assert_eq!(reconstructed, expected);
        assert!(reconstructed.verify(&master.public_key(), msg));
    }

    #[test]
    fn reconstruct_from_different_subset_is_identical() {
        let master = BlsSecretKey::generate();
        let shares = split_secret(&master, 4, 3).expect("split succeeds");
        let msg = b"same message";

        let subset_a: BTreeMap<u64, BlsSignature> = [1u64, 2, 3]
            .iter()
            .map(|id| (*id, shares[id].sign(msg)))
            .collect();
        let subset_b: BTreeMap<u64, BlsSignature> = [2u64, 3, 4]
            .iter()
            .map(|id| (*id, shares[id].sign(msg)))
            .collect();

        let sig_a = reconstruct_signature(&subset_a).unwrap();
        let sig_b = reconstruct_signature(&subset_b).unwrap();
        assert_eq!(sig_a, sig_b);
    }

    #[test]
    fn too_few_shares_reconstruct_garbage() {
        let master = BlsSecretKey::generate();
        let shares = split_secret(&master, 4, 3).expect("split succeeds");
        let msg = b"msg";

        let partials: BTreeMap<u64, BlsSignature> = shares
            .iter()
            .take(2)
            .map(|(id, sk)| (*id, sk.sign(msg)))
            .collect();
        let bad = reconstruct_signature(&partials).expect("point math still works");
        assert!(!bad.verify(&master.public_key(), msg));
    }

    #[test]
    fn split_rejects_bad_threshold() {
        let master = BlsSecretKey::generate();
        assert!(split_secret(&master, 4, 0).is_err());
        assert!(split_secret(&master, 4, 5).is_err());
    }

    #[test]
    fn serde_roundtrip_via_bincode() {
        let sk = BlsSecretKey::generate();
        let pk = sk.public_key();
        let sig = sk.sign(b"roundtrip");

        let pk_bytes = bincode::serialize(&pk).unwrap();
        let sig_bytes = bincode::serialize(&sig).unwrap();

        let pk2: BlsPublicKey = bincode::deserialize(&pk_bytes).unwrap();
        let sig2: BlsSignature = bincode::deserialize(&sig_bytes).unwrap();

        assert_eq!(pk, pk2);
        assert_eq!(sig, sig2);
    }

    #[test]
    fn secret_key_roundtrip() {
        let sk = BlsSecretKey::generate();
        let restored = BlsSecretKey::from_bytes(&sk.to_bytes()).unwrap();
        assert_eq!(sk.public_key(), restored.public_key());
    }
}
