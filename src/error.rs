use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

const INTERNAL_MESSAGE: &str = "internal gateway error";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("filter `{name}` is already registered")]
    DuplicateFilter { name: String },
    #[error("filter `{filter}` invoked next more than once")]
    ChainReentry { filter: String },
    #[error("exchange is already completed")]
    ExchangeClosed,
    #[error("request was already handed to dispatch")]
    RequestCommitted,
    #[error("observability fault in filter `{filter}`: {reason}")]
    FilterObservability { filter: String, reason: String },
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("request body exceeds configured limit")]
    PayloadTooLarge,
    #[error("no route matched the request")]
    RouteNotFound,
    #[error("no healthy upstream available")]
    UpstreamUnavailable,
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("route timed out")]
    Timeout,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub error: &'a str,
    pub message: String,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateFilter { .. } => "duplicate_filter",
            Self::ChainReentry { .. } => "chain_reentry",
            Self::ExchangeClosed => "exchange_closed",
            Self::RequestCommitted => "request_committed",
            Self::FilterObservability { .. } => "filter_observability",
            Self::Validation(_) => "validation_error",
            Self::PayloadTooLarge => "payload_too_large",
            Self::RouteNotFound => "route_not_found",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::Upstream(_) => "upstream_error",
            Self::Timeout => "gateway_timeout",
            Self::Internal(_) => "internal_error",
        }
    }

    // Internal faults never leak detail to the caller.
    pub fn message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::PayloadTooLarge
            | Self::RouteNotFound
            | Self::UpstreamUnavailable
            | Self::Timeout => self.to_string(),
            Self::Upstream(_) => "upstream request failed".to_string(),
            Self::DuplicateFilter { .. }
            | Self::ChainReentry { .. }
            | Self::ExchangeClosed
            | Self::RequestCommitted
            | Self::FilterObservability { .. }
            | Self::Internal(_) => INTERNAL_MESSAGE.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::DuplicateFilter { .. }
            | Self::ChainReentry { .. }
            | Self::ExchangeClosed
            | Self::RequestCommitted
            | Self::FilterObservability { .. }
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> Vec<u8> {
        serde_json::to_vec(&ErrorBody {
            error: self.code(),
            message: self.message(),
        })
        .unwrap_or_default()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, Json(ErrorBody {
            error: self.code(),
            message: self.message(),
        }))
            .into_response();

        if !response.headers().contains_key(header::CONTENT_TYPE) {
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }

        response
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Upstream(err.to_string())
        }
    }
}
