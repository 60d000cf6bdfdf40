use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::{
    error::GatewayResult,
    exchange::{Exchange, ExchangeResponse},
    filter::{Filter, Next},
};

pub struct ResponseHeadersFilter;

#[async_trait]
impl Filter for ResponseHeadersFilter {
    fn name(&self) -> &'static str {
        "response-headers"
    }

    fn order(&self) -> i32 {
        i32::MIN
    }

    async fn apply(&self, exchange: &mut Exchange, next: &mut Next<'_>) -> GatewayResult<()> {
        if let Err(err) = next.run(exchange).await {
            exchange.respond(ExchangeResponse::from_error(&err))?;
        }

        let request_id = HeaderValue::from_str(exchange.request_id()).ok();
        attach_hardening_headers(&mut exchange.response_mut()?.headers, request_id);
        Ok(())
    }
}

fn attach_hardening_headers(headers: &mut HeaderMap, request_id: Option<HeaderValue>) {
    if let Some(value) = request_id {
        headers.insert(HeaderName::from_static("x-request-id"), value);
    }

    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
}
