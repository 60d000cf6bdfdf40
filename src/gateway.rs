use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use axum::{
    Json,
    Router,
    body::{
        Body,
        to_bytes,
    },
    extract::{
        ConnectInfo,
        State,
    },
    http::Request,
    response::Response,
    routing::{any, get},
};
use bytes::Bytes;
use http_body_util::LengthLimitError;
use uuid::Uuid;

use crate::{
    config::GatewayConfig,
    error::{GatewayError, GatewayResult},
    exchange::Exchange,
    filter::{
        FilterChain,
        FilterRegistry,
        headers::ResponseHeadersFilter,
        logging::RequestLoggingFilter,
        validation::RequestValidationFilter,
    },
    metadata::ServiceMetadata,
    upstream::{UpstreamDispatcher, UpstreamSnapshot},
};

pub struct Gateway {
    registry: Arc<FilterRegistry>,
    dispatcher: Arc<UpstreamDispatcher>,
    route_timeout: Option<Duration>,
    max_body_bytes: usize,
    metadata: ServiceMetadata,
}

impl Gateway {
    pub fn from_config(config: GatewayConfig) -> GatewayResult<Self> {
        let registry = FilterRegistry::new()
            .with(ResponseHeadersFilter)?
            .with(RequestLoggingFilter::new(&config.timestamp)?)?
            .with(RequestValidationFilter::new(config.validation.clone()))?;

        let dispatcher = UpstreamDispatcher::new(config.upstreams, config.routes)?;

        Ok(Self {
            registry: Arc::new(registry),
            dispatcher: Arc::new(dispatcher),
            route_timeout: config.route_timeout,
            max_body_bytes: config.validation.max_body_bytes,
            metadata: config.metadata,
        })
    }

    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    pub fn upstream_snapshots(&self) -> Vec<UpstreamSnapshot> {
        self.dispatcher.snapshots()
    }

    pub async fn handle_http(
        &self,
        request: Request<Body>,
        client_ip: Option<IpAddr>,
    ) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let (body, body_error) = match to_bytes(body, self.max_body_bytes).await {
            Ok(body) => (body, None),
            Err(err) => (Bytes::new(), Some(body_read_error(err))),
        };

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut exchange = Exchange::new(
            request_id,
            parts.method,
            parts.uri,
            parts.headers,
            body,
            client_ip,
        );
        if let Some(err) = body_error {
            exchange = exchange.with_body_error(err);
        }

        FilterChain::new(&self.registry, self.dispatcher.as_ref())
            .with_timeout(self.route_timeout)
            .execute(&mut exchange)
            .await
    }
}

fn body_read_error(err: axum::Error) -> GatewayError {
    let err = err.into_inner();
    if err.downcast_ref::<LengthLimitError>().is_some() {
        GatewayError::PayloadTooLarge
    } else {
        tracing::debug!(error = %err, "request body read failed");
        GatewayError::Validation("request body could not be read".to_string())
    }
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/_gateway/openapi.json", get(openapi))
        .route("/_gateway/upstreams", get(upstreams))
        .fallback(any(proxy_handler))
        .with_state(gateway)
}

async fn openapi(State(gateway): State<Arc<Gateway>>) -> Json<ServiceMetadata> {
    Json(gateway.metadata.clone())
}

async fn upstreams(State(gateway): State<Arc<Gateway>>) -> Json<Vec<UpstreamSnapshot>> {
    Json(gateway.upstream_snapshots())
}

async fn proxy_handler(
    State(gateway): State<Arc<Gateway>>,
    request: Request<Body>,
) -> Response<Body> {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    gateway.handle_http(request, client_ip).await
}

#[cfg(test)]
mod tests {
    use axum::{
        http::{HeaderMap, StatusCode},
        routing::get,
    };
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    use super::*;
    use crate::config::{
        LogFormat,
        RouteConfig,
        TimestampConfig,
        UpstreamConfig,
        ValidationConfig,
    };

    async fn spawn_upstream() -> SocketAddr {
        let app = Router::new()
            .route(
                "/accounts/{id}",
                get(|headers: HeaderMap| async move {
                    let stamps = headers.get_all("x-gateway-timestamp").iter().count();
                    (StatusCode::OK, format!("stamps={stamps}"))
                }),
            )
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    StatusCode::OK
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn config(upstream: SocketAddr) -> GatewayConfig {
        GatewayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            log_format: LogFormat::Compact,
            validation: ValidationConfig::default(),
            timestamp: TimestampConfig::default(),
            route_timeout: Some(Duration::from_secs(5)),
            upstreams: vec![UpstreamConfig {
                name: "accounts".to_string(),
                base_url: format!("http://{upstream}"),
                timeout_ms: 2_000,
            }],
            routes: vec![
                RouteConfig {
                    path_prefix: "/accounts".to_string(),
                    upstreams: vec!["accounts".to_string()],
                },
                RouteConfig {
                    path_prefix: "/slow".to_string(),
                    upstreams: vec!["accounts".to_string()],
                },
            ],
            metadata: ServiceMetadata::default(),
        }
    }

    async fn app() -> Router {
        let addr = spawn_upstream().await;
        router(Arc::new(Gateway::from_config(config(addr)).unwrap()))
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn registers_filters_in_onion_order() {
        let gateway = Gateway::from_config(config("127.0.0.1:9".parse().unwrap())).unwrap();
        assert_eq!(
            gateway.registry().names(),
            vec!["response-headers", "request-logging", "request-validation"]
        );
    }

    #[tokio::test]
    async fn proxies_through_the_chain() {
        let response = app()
            .await
            .oneshot(
                Request::get("/accounts/42")
                    .header("host", "gateway.local")
                    .header("x-request-id", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-request-id"], "abc-123");
        assert_eq!(response.headers()["x-frame-options"], "DENY");
        assert_eq!(body_string(response).await, "stamps=1");
    }

    #[tokio::test]
    async fn rejected_requests_still_get_hardening_headers() {
        let response = app()
            .await
            .oneshot(Request::get("/accounts/42").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().contains_key("x-request-id"));
        assert!(body_string(response).await.contains("host header is required"));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_inside_the_chain() {
        let addr = spawn_upstream().await;
        let mut cfg = config(addr);
        cfg.validation.max_body_bytes = 4;
        let app = router(Arc::new(Gateway::from_config(cfg).unwrap()));

        let response = app
            .oneshot(
                Request::post("/accounts/42")
                    .header("host", "gateway.local")
                    .header("x-request-id", "rid-2")
                    .body(Body::from("0123456789"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(response.headers()["x-request-id"], "rid-2");
        assert_eq!(response.headers()["x-frame-options"], "DENY");
        assert!(body_string(response).await.contains("payload_too_large"));
    }

    #[tokio::test]
    async fn route_timeout_is_decorated_by_outer_filters() {
        let addr = spawn_upstream().await;
        let mut cfg = config(addr);
        cfg.route_timeout = Some(Duration::from_millis(100));
        let gateway = Arc::new(Gateway::from_config(cfg).unwrap());

        let response = router(gateway.clone())
            .oneshot(
                Request::get("/slow")
                    .header("host", "gateway.local")
                    .header("x-request-id", "rid-3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.headers()["x-request-id"], "rid-3");
        assert_eq!(response.headers()["x-frame-options"], "DENY");
        assert_eq!(gateway.upstream_snapshots()[0].in_flight, 0);
    }

    #[tokio::test]
    async fn unknown_route_maps_to_not_found() {
        let response = app()
            .await
            .oneshot(
                Request::get("/ledger")
                    .header("host", "gateway.local")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_string(response).await.contains("route_not_found"));
    }

    #[tokio::test]
    async fn serves_static_metadata() {
        let response = app()
            .await
            .oneshot(
                Request::get("/_gateway/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let doc: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(doc["info"]["title"], "Personal Finance API Gateway");
        assert_eq!(doc["info"]["version"], "v1");
    }

    #[tokio::test]
    async fn reports_upstream_counters() {
        let app = app().await;
        app.clone()
            .oneshot(
                Request::get("/accounts/1")
                    .header("host", "gateway.local")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(Request::get("/_gateway/upstreams").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let doc: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(doc[0]["name"], "accounts");
        assert_eq!(doc[0]["success_total"], 1);
        assert_eq!(doc[0]["in_flight"], 0);
    }
}
