//! `MetricsRegistry`: the Prometheus registry backing this instance's own
//! `/metrics` endpoint, and `collect()`: the distributed scrape that fans a
//! single external request out to every instance's local registry and
//! aggregates the results.

use crate::control_plane::CONTROL_PLANE_PORT;
use crate::discovery;
use fabric_kernel::Frame;
use fabric_runtime::{Publisher, RequestOptions};
use prometheus::{Encoder, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// This instance's local metric set: request counts and latencies, labeled
/// by host/method/status the way the ingress pipeline observes them.
pub struct MetricsRegistry {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new().expect("static metric descriptors are always valid")
    }
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("fabric_gateway_requests_total", "Total requests handled by this instance"),
            &["host", "method", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "fabric_gateway_request_duration_seconds",
                "Request handling latency in seconds",
            ),
            &["host", "method"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        Ok(Self { registry, requests_total, request_duration_seconds })
    }

    pub fn record_request(&self, host: &str, method: &str, status: u16, duration: Duration) {
        self.requests_total.with_label_values(&[host, method, &status.to_string()]).inc();
        self.request_duration_seconds
            .with_label_values(&[host, method])
            .observe(duration.as_secs_f64());
    }

    /// Render this instance's own metrics as Prometheus exposition text.
    pub fn render(&self) -> String {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if let Err(err) = TextEncoder::new().encode(&families, &mut buf) {
            warn!(%err, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

/// Inputs to a distributed `Collect()` call, read off the incoming HTTP
/// request by the server before delegating here.
pub struct CollectRequest<'a> {
    pub secret_key_param: Option<&'a str>,
    pub accept_encoding: Option<&'a str>,
    pub scrape_timeout_seconds: Option<f64>,
    pub is_local: bool,
}

/// The error a rejected or failed `Collect()` call reports.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CollectError {
    #[error("secretKey query parameter missing or incorrect")]
    Unauthorized,
}

/// The rendered, possibly gzip-compressed aggregate payload.
pub struct CollectOutcome {
    pub body: Vec<u8>,
    pub content_type: &'static str,
    pub content_encoding: Option<&'static str>,
}

const DEFAULT_SCRAPE_DEADLINE: Duration = Duration::from_secs(10);
const STAGGER: Duration = Duration::from_millis(1);

/// Enumerate every live instance via ping discovery, scrape each instance's
/// `/metrics` over the bus, and concatenate the payloads into one response.
/// Per-target failures are logged and skipped; they never fail the call.
pub async fn collect(
    publisher: &Publisher,
    bus: &Arc<dyn fabric_kernel::bus::Bus>,
    caller: &Frame,
    local_registry: &MetricsRegistry,
    secret_key: &str,
    request: CollectRequest<'_>,
) -> Result<CollectOutcome, CollectError> {
    if !secret_key.is_empty() && !request.is_local && request.secret_key_param != Some(secret_key) {
        return Err(CollectError::Unauthorized);
    }

    let deadline = request
        .scrape_timeout_seconds
        .map(Duration::from_secs_f64)
        .unwrap_or(DEFAULT_SCRAPE_DEADLINE);

    let replies = discovery::ping_all(bus, deadline).await;
    let hosts = discovery::distinct_hosts(&replies);

    let mut body = local_registry.render();
    for (idx, host) in hosts.iter().enumerate() {
        if idx > 0 {
            tokio::time::sleep(STAGGER).await;
        }
        let opts = RequestOptions::new(host, CONTROL_PLANE_PORT, "GET", "/metrics");
        match publisher.request(caller, opts).await {
            Ok(response) => {
                if let Ok(text) = String::from_utf8(response.body) {
                    body.push('\n');
                    body.push_str(&text);
                }
            }
            Err(err) => warn!(host, %err, "metrics scrape of peer instance failed"),
        }
    }

    let wants_gzip = request.accept_encoding.is_some_and(|ae| ae.contains("gzip"));
    if wants_gzip && !request.is_local {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        if encoder.write_all(body.as_bytes()).is_ok() {
            if let Ok(compressed) = encoder.finish() {
                return Ok(CollectOutcome {
                    body: compressed,
                    content_type: "text/plain; version=0.0.4",
                    content_encoding: Some("gzip"),
                });
            }
        }
    }

    Ok(CollectOutcome { body: body.into_bytes(), content_type: "text/plain; version=0.0.4", content_encoding: None })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_metric_families() {
        let registry = MetricsRegistry::new().unwrap();
        registry.record_request("svc.example", "GET", 200, Duration::from_millis(5));
        let text = registry.render();
        assert!(text.contains("fabric_gateway_requests_total"));
        assert!(text.contains("fabric_gateway_request_duration_seconds"));
    }

    #[tokio::test]
    async fn collect_rejects_without_matching_secret_key() {
        use fabric_runtime::InProcessBus;

        let bus: Arc<dyn fabric_kernel::bus::Bus> = Arc::new(InProcessBus::new());
        let publisher = Publisher::new(bus.clone());
        let caller = Frame::root("test-msg", 5_000);
        let local = MetricsRegistry::new().unwrap();

        let request = CollectRequest {
            secret_key_param: Some("wrong"),
            accept_encoding: None,
            scrape_timeout_seconds: None,
            is_local: false,
        };

        let err = collect(&publisher, &bus, &caller, &local, "correct-secret", request)
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::Unauthorized));
    }

    #[tokio::test]
    async fn collect_allows_local_deployments_without_a_secret_key() {
        use fabric_runtime::InProcessBus;

        let bus: Arc<dyn fabric_kernel::bus::Bus> = Arc::new(InProcessBus::new());
        let publisher = Publisher::new(bus.clone());
        let caller = Frame::root("test-msg", 5_000);
        let local = MetricsRegistry::new().unwrap();
        local.record_request("svc.example", "GET", 200, Duration::from_millis(1));

        let request = CollectRequest {
            secret_key_param: None,
            accept_encoding: None,
            scrape_timeout_seconds: Some(1.0),
            is_local: true,
        };

        let outcome = collect(&publisher, &bus, &caller, &local, "correct-secret", request)
            .await
            .unwrap();
        assert!(outcome.content_encoding.is_none());
        assert!(String::from_utf8(outcome.body).unwrap().contains("fabric_gateway_requests_total"));
    }
}
