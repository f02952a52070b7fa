//! # Consensus Status Reporting
//!
//! Prometheus gauges tracking per-validator consensus health: whether a
//! controller is ready, whether it last reported an error, and how many
//! sequences it has decided. Registration is a process-wide one-shot; the
//! node binary exposes the default registry.

use std::sync::OnceLock;

use prometheus::{IntCounterVec, IntGaugeVec};

struct Metrics {
    status: IntGaugeVec,
    errors: IntGaugeVec,
    decided: IntCounterVec,
}

fn metrics() -> Option<&'static Metrics> {
    static METRICS: OnceLock<Option<Metrics>> = OnceLock::new();
    METRICS
        .get_or_init(|| {
            let status = prometheus::register_int_gauge_vec!(
                "tessera_consensus_ready",
                "whether the validator's consensus controller is ready",
                &["pubkey"]
            )
            .ok()?;
            let errors = prometheus::register_int_gauge_vec!(
                "tessera_consensus_error",
                "whether the validator's consensus controller last reported an error",
                &["pubkey"]
            )
            .ok()?;
            let decided = prometheus::register_int_counter_vec!(
                "tessera_decided_total",
                "decided sequences per validator",
                &["pubkey"]
            )
            .ok()?;
            Some(Metrics {
                status,
                errors,
                decided,
            })
        })
        .as_ref()
}

/// Records a controller's readiness and error state for one validator.
pub fn report_consensus_status(pubkey: &str, ready: bool, error: bool) {
    if let Some(m) = metrics() {
        m.status.with_label_values(&[pubkey]).set(ready as i64);
        m.errors.with_label_values(&[pubkey]).set(error as i64);
    }
    tracing::debug!(pubkey, ready, error, "consensus status reported");
}

/// Counts one decided sequence for a validator.
pub fn report_decided(pubkey: &str) {
    if let Some(m) = metrics() {
        m.decided.with_label_values(&[pubkey]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporting_is_idempotent_and_panic_free() {
        report_consensus_status("pk-1", false, false);
        report_consensus_status("pk-1", true, false);
        report_consensus_status("pk-1", true, true);
        report_decided("pk-1");
        report_decided("pk-2");
    }
}
