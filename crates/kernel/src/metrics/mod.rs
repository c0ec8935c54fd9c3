//! Prometheus metrics collection.
//!
//! Provides application metrics in Prometheus format.

use prometheus_client::encoding::{EncodeLabelSet, text::encode};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use crate::media::ReconcileOutcome;

/// HTTP request labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    pub method: String,
    pub path: String,
    pub status: u16,
}

/// Application metrics.
pub struct Metrics {
    registry: Registry,

    /// HTTP request counter by method/path/status.
    pub http_requests: Family<HttpLabels, Counter>,

    /// HTTP request duration histogram.
    pub http_duration_seconds: Family<HttpLabels, Histogram>,

    /// Media uploads persisted through reconciliation or direct upload.
    pub media_uploads: Counter,

    /// Completed reconciliation passes.
    pub reconcile_passes: Counter,

    /// Image references resolved across all passes.
    pub reconcile_references: Counter,

    /// Reference tokens skipped (unmatched or unresolvable).
    pub reconcile_skipped: Counter,
}

impl Metrics {
    /// Create a new metrics registry.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let http_requests = Family::<HttpLabels, Counter>::default();
        registry.register(
            "http_requests_total",
            "Total HTTP requests",
            http_requests.clone(),
        );

        let http_duration_seconds = Family::<HttpLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 12))
        });
        registry.register(
            "http_request_duration_seconds",
            "HTTP request duration in seconds",
            http_duration_seconds.clone(),
        );

        let media_uploads = Counter::default();
        registry.register(
            "media_uploads",
            "Media files persisted",
            media_uploads.clone(),
        );

        let reconcile_passes = Counter::default();
        registry.register(
            "reconcile_passes",
            "Completed media reconciliation passes",
            reconcile_passes.clone(),
        );

        let reconcile_references = Counter::default();
        registry.register(
            "reconcile_references",
            "Image references resolved during reconciliation",
            reconcile_references.clone(),
        );

        let reconcile_skipped = Counter::default();
        registry.register(
            "reconcile_skipped",
            "Reference tokens skipped during reconciliation",
            reconcile_skipped.clone(),
        );

        Self {
            registry,
            http_requests,
            http_duration_seconds,
            media_uploads,
            reconcile_passes,
            reconcile_references,
            reconcile_skipped,
        }
    }

    /// Record an HTTP request.
    pub fn record_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let labels = HttpLabels {
            method: method.to_string(),
            path: normalize_path(path),
            status,
        };

        self.http_requests.get_or_create(&labels).inc();
        self.http_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record the counters of one reconciliation pass.
    pub fn record_reconcile(&self, outcome: &ReconcileOutcome) {
        self.reconcile_passes.inc();
        self.reconcile_references
            .inc_by(outcome.resolved.len() as u64);
        self.reconcile_skipped.inc_by(outcome.skipped as u64);
        self.media_uploads.inc_by(outcome.persisted as u64);
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Panics
    ///
    /// Panics if Prometheus metric encoding to a `String` buffer fails.
    /// The `fmt::Write` impl for `String` is infallible, and all metric
    /// labels use derived `Display`/`EncodeLabelSet` impls that do not
    /// produce `fmt::Error`.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        // Prometheus encoding to String buffer is infallible
        #[allow(clippy::expect_used)]
        encode(&mut buffer, &self.registry).expect("encoding metrics");
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish()
    }
}

/// Normalize a path for metrics labels.
///
/// Replaces dynamic segments (UUIDs, IDs) with placeholders to limit cardinality.
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    let normalized: Vec<String> = segments
        .into_iter()
        .map(|s| {
            if uuid::Uuid::parse_str(s).is_ok()
                || (!s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
            {
                "{id}".to_string()
            } else {
                s.to_string()
            }
        })
        .collect();
    normalized.join("/")
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/api/document/123"), "/api/document/{id}");
        assert_eq!(
            normalize_path("/api/document/550e8400-e29b-41d4-a716-446655440000"),
            "/api/document/{id}"
        );
        assert_eq!(normalize_path("/api/collections"), "/api/collections");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        let output = metrics.encode();
        assert!(output.contains("http_requests_total"));
        assert!(output.contains("reconcile_passes_total"));
    }

    #[test]
    fn test_record_reconcile() {
        let metrics = Metrics::new();
        let outcome = ReconcileOutcome {
            resolved: vec![uuid::Uuid::now_v7(), uuid::Uuid::now_v7()],
            persisted: 1,
            usages_recorded: 2,
            skipped: 1,
            removal_candidates: vec![],
        };
        metrics.record_reconcile(&outcome);

        let output = metrics.encode();
        assert!(output.contains("reconcile_references_total 2"));
        assert!(output.contains("media_uploads_total 1"));
    }
}
