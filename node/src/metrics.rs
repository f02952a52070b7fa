//! # Metrics Export
//!
//! The protocol library registers its gauges against the prometheus default
//! registry; this module renders that registry to the text exposition
//! format. The node logs a snapshot per duty round — wiring a scrape
//! endpoint in front of [`render`] is deployment plumbing, not core.

use prometheus::{Encoder, TextEncoder};

/// Renders the default registry in the Prometheus text format.
pub fn render() -> String {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
