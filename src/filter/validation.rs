use async_trait::async_trait;
use axum::http::header;

use crate::{
    config::ValidationConfig,
    error::{GatewayError, GatewayResult},
    exchange::{Exchange, ExchangeRequest, ExchangeResponse},
    filter::{Filter, Next},
};

type Rule = fn(&ValidationConfig, &ExchangeRequest) -> GatewayResult<()>;

// Evaluated in order; the first failing rule decides the response.
const RULES: &[(&str, Rule)] = &[
    ("body-captured", body_captured),
    ("host", host_present),
    ("header-count", header_count),
    ("method", method_allowed),
    ("content-length", content_length_matches),
    ("body-size", body_within_limit),
];

pub struct RequestValidationFilter {
    cfg: ValidationConfig,
}

impl RequestValidationFilter {
    pub fn new(cfg: ValidationConfig) -> Self {
        Self { cfg }
    }

    fn check(&self, request: &ExchangeRequest) -> Result<(), (&'static str, GatewayError)> {
        RULES
            .iter()
            .try_for_each(|(rule, check)| check(&self.cfg, request).map_err(|err| (*rule, err)))
    }
}

fn body_captured(_cfg: &ValidationConfig, request: &ExchangeRequest) -> GatewayResult<()> {
    request.body_error.clone().map_or(Ok(()), Err)
}

fn host_present(cfg: &ValidationConfig, request: &ExchangeRequest) -> GatewayResult<()> {
    if cfg.require_host_header && !request.headers.contains_key(header::HOST) {
        return Err(GatewayError::Validation("host header is required".to_string()));
    }
    Ok(())
}

fn header_count(cfg: &ValidationConfig, request: &ExchangeRequest) -> GatewayResult<()> {
    let count = request.headers.len();
    if count > cfg.max_headers {
        return Err(GatewayError::Validation(format!(
            "{count} headers exceed the limit of {}",
            cfg.max_headers
        )));
    }
    Ok(())
}

fn method_allowed(cfg: &ValidationConfig, request: &ExchangeRequest) -> GatewayResult<()> {
    let method = request.method.as_str();
    if cfg.allowed_methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
        return Ok(());
    }
    Err(GatewayError::Validation(format!("method {method} is not accepted")))
}

fn content_length_matches(_cfg: &ValidationConfig, request: &ExchangeRequest) -> GatewayResult<()> {
    let declared = request
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    match declared {
        Some(len) if len != request.body.len() => Err(GatewayError::Validation(format!(
            "declared content-length {len} but received {} bytes",
            request.body.len()
        ))),
        _ => Ok(()),
    }
}

fn body_within_limit(cfg: &ValidationConfig, request: &ExchangeRequest) -> GatewayResult<()> {
    if request.body.len() > cfg.max_body_bytes {
        return Err(GatewayError::PayloadTooLarge);
    }
    Ok(())
}

#[async_trait]
impl Filter for RequestValidationFilter {
    fn name(&self) -> &'static str {
        "request-validation"
    }

    async fn apply(&self, exchange: &mut Exchange, next: &mut Next<'_>) -> GatewayResult<()> {
        match self.check(exchange.request()) {
            Ok(()) => next.run(exchange).await,
            Err((rule, err)) => {
                tracing::warn!(
                    request_id = %exchange.request_id(),
                    rule,
                    error = %err,
                    "rejecting request"
                );
                exchange.respond(ExchangeResponse::from_error(&err))
            }
        }
    }
}
