use async_trait::async_trait;
use dashmap::DashMap;
use http::header::HeaderName;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::{
        Duration,
        Instant,
    },
};

use crate::{
    config::{RouteConfig, UpstreamConfig},
    error::{GatewayError, GatewayResult},
    exchange::{Exchange, ExchangeResponse},
    filter::Dispatcher,
};

pub struct UpstreamDispatcher {
    client: reqwest::Client,
    services: HashMap<String, UpstreamConfig>,
    routes: Vec<RouteConfig>,
    stats: DashMap<String, Arc<UpstreamStats>>,
}

#[derive(Default)]
struct UpstreamStats {
    in_flight: AtomicU64,
    consecutive_failures: AtomicU64,
    success_total: AtomicU64,
    failure_total: AtomicU64,
    avg_latency_micros: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct UpstreamSnapshot {
    pub name: String,
    pub in_flight: u64,
    pub consecutive_failures: u64,
    pub success_total: u64,
    pub failure_total: u64,
    pub avg_latency_ms: u64,
}

// Released on drop, so a cancelled forward gives its slot back.
struct InFlight(Arc<UpstreamStats>);

impl InFlight {
    fn enter(stats: Arc<UpstreamStats>) -> Self {
        stats.in_flight.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl UpstreamDispatcher {
    pub fn new(upstreams: Vec<UpstreamConfig>, routes: Vec<RouteConfig>) -> GatewayResult<Self> {
        let mut services = HashMap::new();
        let stats = DashMap::new();

        for upstream in upstreams {
            stats.insert(upstream.name.clone(), Arc::new(UpstreamStats::default()));
            services.insert(upstream.name.clone(), upstream);
        }

        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        Ok(Self {
            client,
            services,
            routes,
            stats,
        })
    }

    pub fn resolve_route(&self, path: &str) -> Option<&RouteConfig> {
        self.routes
            .iter()
            .filter(|route| path.starts_with(route.path_prefix.as_str()))
            .max_by_key(|route| route.path_prefix.len())
    }

    pub fn snapshot(&self, name: &str) -> UpstreamSnapshot {
        self.stats
            .get(name)
            .map(|stats| UpstreamSnapshot {
                name: name.to_string(),
                in_flight: stats.in_flight.load(Ordering::Relaxed),
                consecutive_failures: stats.consecutive_failures.load(Ordering::Relaxed),
                success_total: stats.success_total.load(Ordering::Relaxed),
                failure_total: stats.failure_total.load(Ordering::Relaxed),
                avg_latency_ms: stats.avg_latency_micros.load(Ordering::Relaxed) / 1_000,
            })
            .unwrap_or_else(|| UpstreamSnapshot {
                name: name.to_string(),
                ..UpstreamSnapshot::default()
            })
    }

    pub fn snapshots(&self) -> Vec<UpstreamSnapshot> {
        let mut names = self.services.keys().collect::<Vec<_>>();
        names.sort();
        names.into_iter().map(|name| self.snapshot(name)).collect()
    }

    async fn forward(
        &self,
        exchange: &Exchange,
        upstream: &UpstreamConfig,
    ) -> GatewayResult<ExchangeResponse> {
        let stats = self
            .stats
            .get(&upstream.name)
            .map(|s| s.clone())
            .ok_or_else(|| GatewayError::Internal("upstream stats unavailable".to_string()))?;

        let _slot = InFlight::enter(stats.clone());

        let request = exchange.request();
        let path_and_query = request
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or(request.uri.path());
        let target_url = format!("{}{}", upstream.base_url.trim_end_matches('/'), path_and_query);

        let mut outbound = self
            .client
            .request(request.method.clone(), &target_url)
            .body(request.body.clone());

        for (name, value) in &request.headers {
            if should_forward_header(name) && name != "x-request-id" {
                outbound = outbound.header(name, value);
            }
        }

        outbound = outbound.header("x-request-id", exchange.request_id());
        if let Some(client_ip) = exchange.client_ip() {
            outbound = outbound.header("x-forwarded-for", client_ip.to_string());
        }

        let started = Instant::now();
        let sent = outbound
            .timeout(Duration::from_millis(upstream.timeout_ms))
            .send()
            .await;

        let upstream_response = match sent {
            Ok(response) => response,
            Err(err) => {
                stats.record_failure();
                return Err(err.into());
            }
        };

        let status = upstream_response.status();
        let mut headers = http::HeaderMap::new();
        for (name, value) in upstream_response.headers() {
            if should_forward_header(name) {
                headers.append(name.clone(), value.clone());
            }
        }

        let body = match upstream_response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                stats.record_failure();
                return Err(err.into());
            }
        };

        if status.is_server_error() {
            stats.record_failure();
        } else {
            stats.record_success(started.elapsed());
        }

        Ok(ExchangeResponse {
            status,
            headers,
            body,
            served_by: Some(upstream.name.clone()),
        })
    }
}

#[async_trait]
impl Dispatcher for UpstreamDispatcher {
    async fn dispatch(&self, exchange: &Exchange) -> GatewayResult<ExchangeResponse> {
        if let Some(err) = &exchange.request().body_error {
            return Err(err.clone());
        }

        let route = self
            .resolve_route(exchange.request().uri.path())
            .ok_or(GatewayError::RouteNotFound)?;

        let candidates = route
            .upstreams
            .iter()
            .filter_map(|name| self.services.get(name))
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            return Err(GatewayError::UpstreamUnavailable);
        }

        let mut last_error: Option<GatewayError> = None;
        for upstream in candidates {
            match self.forward(exchange, upstream).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    tracing::warn!(
                        request_id = %exchange.request_id(),
                        upstream = %upstream.name,
                        error = %err,
                        "upstream call failed; trying next candidate"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or(GatewayError::UpstreamUnavailable))
    }
}

impl UpstreamStats {
    fn record_success(&self, latency: Duration) {
        self.success_total.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);

        let latency_micros = latency.as_micros() as u64;
        let current = self.avg_latency_micros.load(Ordering::Relaxed);
        let updated = if current == 0 {
            latency_micros
        } else {
            (current * 7 + latency_micros) / 8
        };
        self.avg_latency_micros.store(updated, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failure_total.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }
}

fn should_forward_header(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}
