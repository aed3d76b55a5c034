//! # Metrics
//!
//! A single prometheus registry owned by the API layer. Requests are counted per matched route
//! and outcome; latency is a histogram per route. Label values come from the route template,
//! never from the raw path, so conversation tokens do not explode cardinality.

use std::fmt;
use std::time::Duration;

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

pub const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub method: String,
    pub route: String,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
    pub route: String,
}

type LatencyFamily = Family<RouteLabels, Histogram, fn() -> Histogram>;

fn latency_histogram() -> Histogram {
    // 1ms .. ~8s
    Histogram::new(exponential_buckets(0.001, 2.0, 14))
}

#[derive(Debug)]
pub struct ApiMetrics {
    registry: Registry,
    requests: Family<RequestLabels, Counter>,
    latency: LatencyFamily,
}

impl Default for ApiMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("agora");
        let requests = Family::<RequestLabels, Counter>::default();
        let latency = LatencyFamily::new_with_constructor(latency_histogram);
        registry.register(
            "http_requests",
            "HTTP requests by route and outcome",
            requests.clone(),
        );
        registry.register(
            "http_request_duration_seconds",
            "HTTP request latency by route",
            latency.clone(),
        );
        Self {
            registry,
            requests,
            latency,
        }
    }

    pub fn observe(&self, method: &str, route: &str, status: u16, elapsed: Duration) {
        self.requests
            .get_or_create(&RequestLabels {
                method: method.to_string(),
                route: route.to_string(),
                outcome: outcome(status).to_string(),
            })
            .inc();
        self.latency
            .get_or_create(&RouteLabels {
                route: route.to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }

    /// Requests counted so far for one label set.
    pub fn requests(&self, method: &str, route: &str, outcome: &str) -> u64 {
        self.requests
            .get_or_create(&RequestLabels {
                method: method.to_string(),
                route: route.to_string(),
                outcome: outcome.to_string(),
            })
            .get()
    }

    /// OpenMetrics text exposition of the whole registry.
    pub fn encode(&self) -> Result<String, fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

pub fn outcome(status: u16) -> &'static str {
    match status {
        100..=399 => "success",
        400..=499 => "client_error",
        _ => "server_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_route_and_outcome() {
        let metrics = ApiMetrics::new();
        let route = "/api/v3/conversations/{token}/votes";
        metrics.observe("POST", route, 200, Duration::from_millis(3));
        metrics.observe("POST", route, 409, Duration::from_millis(2));
        metrics.observe("POST", route, 200, Duration::from_millis(4));

        assert_eq!(metrics.requests("POST", route, "success"), 2);
        assert_eq!(metrics.requests("POST", route, "client_error"), 1);
        assert_eq!(metrics.requests("POST", route, "server_error"), 0);
    }

    #[test]
    fn exposition_names_the_families() {
        let metrics = ApiMetrics::new();
        metrics.observe("GET", "/healthz", 200, Duration::from_millis(1));
        let text = metrics.encode().unwrap();
        assert!(text.contains("agora_http_requests_total"));
        assert!(text.contains("agora_http_request_duration_seconds"));
        assert!(text.ends_with("# EOF\n"));
    }
}
