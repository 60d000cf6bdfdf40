use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, Uri};

use crate::{
    config::{HeaderPolicy, TimestampConfig},
    error::{GatewayError, GatewayResult},
    exchange::Exchange,
    filter::{Filter, Next},
};

#[derive(Debug)]
pub enum RequestEvent<'a> {
    Received {
        request_id: &'a str,
        method: &'a Method,
        uri: &'a Uri,
    },
    Completed {
        request_id: &'a str,
        method: &'a Method,
        uri: &'a Uri,
        status: Option<StatusCode>,
        upstream: Option<&'a str>,
        latency_ms: u128,
    },
}

/// Destination for request observability events.
pub trait ObservabilitySink: Send + Sync {
    fn record(&self, event: &RequestEvent<'_>) -> anyhow::Result<()>;
}

pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn record(&self, event: &RequestEvent<'_>) -> anyhow::Result<()> {
        match event {
            RequestEvent::Received {
                request_id,
                method,
                uri,
            } => tracing::info!(
                request_id = %request_id,
                method = %method,
                uri = %uri,
                "incoming request"
            ),
            RequestEvent::Completed {
                request_id,
                method,
                uri,
                status,
                upstream,
                latency_ms,
            } => tracing::info!(
                request_id = %request_id,
                method = %method,
                path = %uri.path(),
                status = ?status.map(|s| s.as_u16()),
                upstream = ?upstream,
                latency_ms = *latency_ms,
                "request completed"
            ),
        }
        Ok(())
    }
}

// Sink failures are swallowed; they never fail the request.
pub struct RequestLoggingFilter {
    header: HeaderName,
    policy: HeaderPolicy,
    sink: Arc<dyn ObservabilitySink>,
}

impl RequestLoggingFilter {
    pub fn new(cfg: &TimestampConfig) -> GatewayResult<Self> {
        let header = HeaderName::from_bytes(cfg.header_name.as_bytes())
            .map_err(|e| GatewayError::Internal(format!("invalid timestamp header: {e}")))?;

        Ok(Self {
            header,
            policy: cfg.policy,
            sink: Arc::new(TracingSink),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = sink;
        self
    }

    fn observe(&self, request_id: &str, event: &RequestEvent<'_>) {
        let reason = match panic::catch_unwind(AssertUnwindSafe(|| self.sink.record(event))) {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err.to_string(),
            Err(_) => "sink panicked".to_string(),
        };

        let fault = GatewayError::FilterObservability {
            filter: self.name().to_string(),
            reason,
        };
        tracing::debug!(request_id = %request_id, error = %fault, "dropping observability event");
    }

    fn stamp(&self, exchange: &mut Exchange) {
        let millis = chrono::Utc::now().timestamp_millis().max(0);
        let value = HeaderValue::from(millis);

        let applied = exchange.request_mut().map(|request| match self.policy {
            HeaderPolicy::Append => {
                request.headers.append(self.header.clone(), value);
            }
            HeaderPolicy::Replace => {
                request.headers.insert(self.header.clone(), value);
            }
        });

        if let Err(err) = applied {
            tracing::debug!(
                request_id = %exchange.request_id(),
                error = %err,
                "timestamp header not applied"
            );
        }
    }
}

#[async_trait]
impl Filter for RequestLoggingFilter {
    fn name(&self) -> &'static str {
        "request-logging"
    }

    fn order(&self) -> i32 {
        -1
    }

    async fn apply(&self, exchange: &mut Exchange, next: &mut Next<'_>) -> GatewayResult<()> {
        {
            let request = exchange.request();
            self.observe(exchange.request_id(), &RequestEvent::Received {
                request_id: exchange.request_id(),
                method: &request.method,
                uri: &request.uri,
            });
        }

        self.stamp(exchange);

        let outcome = next.run(exchange).await;

        let response = exchange.response();
        let status = match &outcome {
            Err(err) => Some(err.status()),
            Ok(()) => response.map(|r| r.status),
        };
        let request = exchange.request();
        self.observe(exchange.request_id(), &RequestEvent::Completed {
            request_id: exchange.request_id(),
            method: &request.method,
            uri: &request.uri,
            status,
            upstream: response.and_then(|r| r.served_by.as_deref()),
            latency_ms: exchange.started_at().elapsed().as_millis(),
        });

        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::anyhow;
    use axum::http::header;
    use bytes::Bytes;
    use http::HeaderMap;

    use super::*;
    use crate::{
        config::DEFAULT_TIMESTAMP_HEADER,
        exchange::ExchangeResponse,
        filter::{Dispatcher, FilterChain, FilterRegistry},
    };

    #[derive(Default)]
    struct CapturingDispatcher {
        seen: Mutex<Option<HeaderMap>>,
    }

    #[async_trait]
    impl Dispatcher for CapturingDispatcher {
        async fn dispatch(&self, exchange: &Exchange) -> GatewayResult<ExchangeResponse> {
            *self.seen.lock().unwrap() = Some(exchange.request().headers.clone());
            Ok(ExchangeResponse::new(StatusCode::IM_A_TEAPOT))
        }
    }

    impl CapturingDispatcher {
        fn headers(&self) -> HeaderMap {
            self.seen.lock().unwrap().clone().unwrap()
        }
    }

    #[derive(Default)]
    struct MemorySink {
        events: Mutex<Vec<String>>,
    }

    impl ObservabilitySink for MemorySink {
        fn record(&self, event: &RequestEvent<'_>) -> anyhow::Result<()> {
            let line = match event {
                RequestEvent::Received { method, uri, .. } => format!("received {method} {uri}"),
                RequestEvent::Completed { status, .. } => {
                    format!("completed {}", status.map(|s| s.as_u16()).unwrap_or(0))
                }
            };
            self.events.lock().unwrap().push(line);
            Ok(())
        }
    }

    struct UnavailableSink;

    impl ObservabilitySink for UnavailableSink {
        fn record(&self, _event: &RequestEvent<'_>) -> anyhow::Result<()> {
            Err(anyhow!("log sink unavailable"))
        }
    }

    struct PanickingSink;

    impl ObservabilitySink for PanickingSink {
        fn record(&self, _event: &RequestEvent<'_>) -> anyhow::Result<()> {
            panic!("sink exploded")
        }
    }

    fn exchange_with(headers: HeaderMap) -> Exchange {
        Exchange::new(
            "req-42".to_string(),
            Method::GET,
            Uri::from_static("/accounts/42"),
            headers,
            Bytes::new(),
            None,
        )
    }

    async fn run(
        filter: RequestLoggingFilter,
        headers: HeaderMap,
    ) -> (StatusCode, HeaderMap) {
        let mut registry = FilterRegistry::new();
        registry.register(Arc::new(filter)).unwrap();
        let dispatcher = CapturingDispatcher::default();

        let mut ex = exchange_with(headers);
        let response = FilterChain::new(&registry, &dispatcher).execute(&mut ex).await;
        (response.status(), dispatcher.headers())
    }

    #[tokio::test]
    async fn stamps_exactly_one_timestamp_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.append("x-trace", HeaderValue::from_static("one"));
        headers.append("x-trace", HeaderValue::from_static("two"));

        let filter = RequestLoggingFilter::new(&TimestampConfig::default()).unwrap();
        let (status, seen) = run(filter, headers).await;

        assert_eq!(status, StatusCode::IM_A_TEAPOT);
        let stamps = seen.get_all(DEFAULT_TIMESTAMP_HEADER).iter().collect::<Vec<_>>();
        assert_eq!(stamps.len(), 1);
        let millis = stamps[0].to_str().unwrap().parse::<u64>().unwrap();
        assert!(millis > 0);

        assert_eq!(seen[header::ACCEPT], "application/json");
        assert_eq!(
            seen.get_all("x-trace").iter().collect::<Vec<_>>(),
            vec!["one", "two"]
        );
        assert_eq!(seen.len(), 4);
    }

    #[tokio::test]
    async fn appends_to_caller_supplied_timestamp_by_default() {
        let mut headers = HeaderMap::new();
        headers.insert(DEFAULT_TIMESTAMP_HEADER, HeaderValue::from_static("1"));

        let filter = RequestLoggingFilter::new(&TimestampConfig::default()).unwrap();
        let (_, seen) = run(filter, headers).await;

        let stamps = seen.get_all(DEFAULT_TIMESTAMP_HEADER).iter().collect::<Vec<_>>();
        assert_eq!(stamps.len(), 2);
        assert_eq!(stamps[0], "1");
    }

    #[tokio::test]
    async fn replace_policy_keeps_a_single_value() {
        let mut headers = HeaderMap::new();
        headers.insert(DEFAULT_TIMESTAMP_HEADER, HeaderValue::from_static("1"));

        let cfg = TimestampConfig {
            policy: HeaderPolicy::Replace,
            ..TimestampConfig::default()
        };
        let filter = RequestLoggingFilter::new(&cfg).unwrap();
        let (_, seen) = run(filter, headers).await;

        let stamps = seen.get_all(DEFAULT_TIMESTAMP_HEADER).iter().collect::<Vec<_>>();
        assert_eq!(stamps.len(), 1);
        assert_ne!(stamps[0], "1");
    }

    #[tokio::test]
    async fn records_request_and_response_status() {
        let sink = Arc::new(MemorySink::default());
        let filter = RequestLoggingFilter::new(&TimestampConfig::default())
            .unwrap()
            .with_sink(sink.clone());
        run(filter, HeaderMap::new()).await;

        assert_eq!(
            *sink.events.lock().unwrap(),
            vec!["received GET /accounts/42", "completed 418"]
        );
    }

    struct CallsNextTwice;

    #[async_trait]
    impl Filter for CallsNextTwice {
        fn name(&self) -> &'static str {
            "calls-next-twice"
        }

        async fn apply(&self, exchange: &mut Exchange, next: &mut Next<'_>) -> GatewayResult<()> {
            next.run(exchange).await?;
            let _ = next.run(exchange).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn logged_status_matches_a_faulted_response() {
        let sink = Arc::new(MemorySink::default());
        let mut registry = FilterRegistry::new();
        registry
            .register(Arc::new(
                RequestLoggingFilter::new(&TimestampConfig::default())
                    .unwrap()
                    .with_sink(sink.clone()),
            ))
            .unwrap();
        registry.register(Arc::new(CallsNextTwice)).unwrap();
        let dispatcher = CapturingDispatcher::default();

        let mut ex = exchange_with(HeaderMap::new());
        let response = FilterChain::new(&registry, &dispatcher).execute(&mut ex).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            *sink.events.lock().unwrap(),
            vec!["received GET /accounts/42", "completed 500"]
        );
    }

    #[tokio::test]
    async fn sink_failure_does_not_affect_the_response() {
        let filter = RequestLoggingFilter::new(&TimestampConfig::default())
            .unwrap()
            .with_sink(Arc::new(UnavailableSink));
        let (status, seen) = run(filter, HeaderMap::new()).await;

        assert_eq!(status, StatusCode::IM_A_TEAPOT);
        assert!(seen.contains_key(DEFAULT_TIMESTAMP_HEADER));
    }

    #[tokio::test]
    async fn sink_panic_does_not_affect_the_response() {
        let filter = RequestLoggingFilter::new(&TimestampConfig::default())
            .unwrap()
            .with_sink(Arc::new(PanickingSink));
        let (status, _) = run(filter, HeaderMap::new()).await;

        assert_eq!(status, StatusCode::IM_A_TEAPOT);
    }
}
