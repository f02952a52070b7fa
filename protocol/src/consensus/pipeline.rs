//! # Validation Pipelines
//!
//! Message validation is data, not inheritance: a pipeline is an ordered
//! list of named predicates over a [`SignedMessage`], and `run` applies them
//! in order, stopping at the first failure. Each consensus stage assembles
//! its own pipeline from the standard validators below, so the rules a
//! message must pass are visible in one expression at the call site.
//!
//! Apart from the BLS verification inside [`authorize_msg`], validators are
//! pure.

use std::sync::Arc;

use crate::consensus::message::{MessageType, SignedMessage};
use crate::share::Share;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Why a message was rejected. Both variants end in a silent drop; they
/// differ only in log level (invalid → debug, unauthorized → info).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

type Check = Arc<dyn Fn(&SignedMessage) -> Result<(), PipelineError> + Send + Sync>;

/// A named validation step.
#[derive(Clone)]
pub struct Validator {
    name: &'static str,
    check: Check,
}

impl Validator {
    pub fn new(
        name: &'static str,
        check: impl Fn(&SignedMessage) -> Result<(), PipelineError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            check: Arc::new(check),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// An ordered composition of validators.
#[derive(Clone, Default)]
pub struct Pipeline {
    validators: Vec<Validator>,
}

impl Pipeline {
    /// Builds a pipeline from validators, run in the given order.
    pub fn combine(validators: impl IntoIterator<Item = Validator>) -> Self {
        Self {
            validators: validators.into_iter().collect(),
        }
    }

    /// Runs every validator in order; the first failure wins.
    pub fn run(&self, msg: &SignedMessage) -> Result<(), PipelineError> {
        for validator in &self.validators {
            (validator.check)(msg).map_err(|e| {
                tracing::trace!(validator = validator.name, error = %e, "pipeline check failed");
                e
            })?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Standard Validators
// ---------------------------------------------------------------------------

/// Structural sanity: at least one unique signer, round and sequence are
/// 1-based, the identifier is present.
pub fn basic_msg_validation() -> Validator {
    Validator::new("basic_msg_validation", |msg| {
        if msg.signer_ids.is_empty() {
            return Err(PipelineError::InvalidMessage("no signer ids".into()));
        }
        let mut seen = msg.signer_ids.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != msg.signer_ids.len() {
            return Err(PipelineError::InvalidMessage(
                "duplicate signer ids".into(),
            ));
        }
        if msg.message.round == 0 {
            return Err(PipelineError::InvalidMessage("round must be >= 1".into()));
        }
        if msg.message.sequence == 0 {
            return Err(PipelineError::InvalidMessage(
                "sequence must be >= 1".into(),
            ));
        }
        if msg.message.identifier.is_empty() {
            return Err(PipelineError::InvalidMessage("empty identifier".into()));
        }
        Ok(())
    })
}

/// Message type must match the stage's expectation.
pub fn msg_type_check(expected: MessageType) -> Validator {
    Validator::new("msg_type_check", move |msg| {
        if msg.message.msg_type != expected {
            return Err(PipelineError::InvalidMessage(format!(
                "message type {} where {} was expected",
                msg.message.msg_type, expected
            )));
        }
        Ok(())
    })
}

/// Identifier must equal the instance's lambda.
pub fn validate_lambdas(expected: Vec<u8>) -> Validator {
    Validator::new("validate_lambdas", move |msg| {
        if msg.message.identifier != expected {
            return Err(PipelineError::InvalidMessage(
                "message lambda does not equal state lambda".into(),
            ));
        }
        Ok(())
    })
}

/// Round must equal the instance's current round.
pub fn validate_round(expected: u64) -> Validator {
    Validator::new("validate_round", move |msg| {
        if msg.message.round != expected {
            return Err(PipelineError::InvalidMessage(format!(
                "message round ({}) does not equal state round ({})",
                msg.message.round, expected
            )));
        }
        Ok(())
    })
}

/// Sequence must equal the instance's sequence.
pub fn validate_sequence(expected: u64) -> Validator {
    Validator::new("validate_sequence", move |msg| {
        if msg.message.sequence != expected {
            return Err(PipelineError::InvalidMessage(format!(
                "message sequence ({}) does not equal state sequence ({})",
                msg.message.sequence, expected
            )));
        }
        Ok(())
    })
}

/// Signers must hold committee seats and their aggregate signature must
/// verify over the message signing root.
pub fn authorize_msg(share: Share) -> Validator {
    Validator::new("authorize_msg", move |msg| {
        if share.keys_by_id(&msg.signer_ids).is_none() {
            return Err(PipelineError::Unauthorized(
                "signer id outside the committee".into(),
            ));
        }
        if !msg.verify(&share.committee) {
            return Err(PipelineError::Unauthorized(
                "could not verify message signature".into(),
            ));
        }
        Ok(())
    })
}

/// The envelope must carry at least `threshold` signers. Used on decided
/// messages, where the aggregate itself is the quorum proof.
pub fn validate_quorum(threshold: usize) -> Validator {
    Validator::new("validate_quorum", move |msg| {
        if msg.signer_ids.len() < threshold {
            return Err(PipelineError::InvalidMessage(format!(
                "message has {} signers, quorum is {}",
                msg.signer_ids.len(),
                threshold
            )));
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::message::Message;
    use crate::crypto::bls::BlsSecretKey;
    use std::collections::BTreeMap;

    fn test_share(keys: &[BlsSecretKey]) -> Share {
        Share {
            node_id: 1,
            public_key: BlsSecretKey::generate().public_key(),
            committee: keys
                .iter()
                .enumerate()
                .map(|(i, k)| (i as u64 + 1, k.public_key()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn signed(msg_type: MessageType, round: u64, seq: u64, key: &BlsSecretKey, id: u64) -> SignedMessage {
        let message = Message {
            msg_type,
            round,
            sequence: seq,
            identifier: b"lambda".to_vec(),
            value: b"value".to_vec(),
        };
        let signature = key.sign(message.signing_root().as_bytes());
        SignedMessage {
            message,
            signature,
            signer_ids: vec![id],
        }
    }

    #[test]
    fn combine_short_circuits_in_order() {
        let keys: Vec<BlsSecretKey> = (0..4).map(|_| BlsSecretKey::generate()).collect();
        let msg = signed(MessageType::Prepare, 1, 1, &keys[0], 1);

        let pipeline = Pipeline::combine([
            basic_msg_validation(),
            msg_type_check(MessageType::Commit),
            // Would also fail, but the type check fires first.
            validate_round(9),
        ]);

        let err = pipeline.run(&msg).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidMessage(ref s) if s.contains("type")));
    }

    #[test]
    fn full_pipeline_accepts_valid_message() {
        let keys: Vec<BlsSecretKey> = (0..4).map(|_| BlsSecretKey::generate()).collect();
        let share = test_share(&keys);
        let msg = signed(MessageType::Prepare, 1, 1, &keys[0], 1);

        let pipeline = Pipeline::combine([
            basic_msg_validation(),
            msg_type_check(MessageType::Prepare),
            validate_lambdas(b"lambda".to_vec()),
            validate_round(1),
            validate_sequence(1),
            authorize_msg(share),
        ]);

        assert!(pipeline.run(&msg).is_ok());
    }

    #[test]
    fn basic_validation_rejects_malformed() {
        let key = BlsSecretKey::generate();
        let pipeline = Pipeline::combine([basic_msg_validation()]);

        let mut msg = signed(MessageType::Prepare, 1, 1, &key, 1);
        msg.signer_ids = vec![];
        assert!(pipeline.run(&msg).is_err());

        let mut msg = signed(MessageType::Prepare, 1, 1, &key, 1);
        msg.signer_ids = vec![2, 2];
        assert!(pipeline.run(&msg).is_err());

        let msg = signed(MessageType::Prepare, 0, 1, &key, 1);
        assert!(pipeline.run(&msg).is_err());

        let msg = signed(MessageType::Prepare, 1, 0, &key, 1);
        assert!(pipeline.run(&msg).is_err());
    }

    #[test]
    fn authorize_rejects_foreign_signer() {
        let keys: Vec<BlsSecretKey> = (0..4).map(|_| BlsSecretKey::generate()).collect();
        let share = test_share(&keys);
        let outsider = BlsSecretKey::generate();

        let pipeline = Pipeline::combine([authorize_msg(share)]);

        // Valid seat, wrong key behind it.
        let msg = signed(MessageType::Prepare, 1, 1, &outsider, 1);
        assert!(matches!(
            pipeline.run(&msg),
            Err(PipelineError::Unauthorized(_))
        ));

        // Seat outside the committee entirely.
        let msg = signed(MessageType::Prepare, 1, 1, &keys[0], 7);
        assert!(matches!(
            pipeline.run(&msg),
            Err(PipelineError::Unauthorized(_))
        ));
    }

    #[test]
    fn quorum_validator_counts_signers() {
        let keys: Vec<BlsSecretKey> = (0..4).map(|_| BlsSecretKey::generate()).collect();
        let mut msg = signed(MessageType::Commit, 1, 1, &keys[0], 1);
        let pipeline = Pipeline::combine([validate_quorum(3)]);

        assert!(pipeline.run(&msg).is_err());

        msg.signer_ids = vec![1, 2, 3];
        assert!(pipeline.run(&msg).is_ok());
    }
}
