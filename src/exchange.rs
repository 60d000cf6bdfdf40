use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use std::{
    collections::HashMap,
    net::IpAddr,
    time::Instant,
};

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    Created,
    Request { filter: &'static str },
    Dispatching,
    Response { filter: &'static str },
    Completed,
}

#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub body_error: Option<GatewayError>,
}

#[derive(Debug, Clone)]
pub struct ExchangeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub served_by: Option<String>,
}

impl ExchangeResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            served_by: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn from_error(err: &GatewayError) -> Self {
        let mut response = Self::new(err.status()).with_body(err.body());
        response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }

    pub fn into_http(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[derive(Debug)]
pub struct Exchange {
    request_id: String,
    client_ip: Option<IpAddr>,
    started_at: Instant,
    request: ExchangeRequest,
    response: Option<ExchangeResponse>,
    attributes: HashMap<String, String>,
    phase: ExchangePhase,
    fault: Option<GatewayError>,
}

impl Exchange {
    pub fn new(
        request_id: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        client_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            request_id,
            client_ip,
            started_at: Instant::now(),
            request: ExchangeRequest {
                method,
                uri,
                headers,
                body,
                body_error: None,
            },
            response: None,
            attributes: HashMap::new(),
            phase: ExchangePhase::Created,
            fault: None,
        }
    }

    /// Marks a body that could not be captured in full; `body` is then empty.
    pub fn with_body_error(mut self, err: GatewayError) -> Self {
        self.request.body_error = Some(err);
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn phase(&self) -> ExchangePhase {
        self.phase
    }

    pub fn is_completed(&self) -> bool {
        self.phase == ExchangePhase::Completed
    }

    pub fn request(&self) -> &ExchangeRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> GatewayResult<&mut ExchangeRequest> {
        match self.phase {
            ExchangePhase::Created | ExchangePhase::Request { .. } => Ok(&mut self.request),
            ExchangePhase::Dispatching | ExchangePhase::Response { .. } => {
                Err(GatewayError::RequestCommitted)
            }
            ExchangePhase::Completed => Err(GatewayError::ExchangeClosed),
        }
    }

    pub fn response(&self) -> Option<&ExchangeResponse> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> GatewayResult<&mut ExchangeResponse> {
        self.ensure_open()?;
        self.response
            .as_mut()
            .ok_or_else(|| GatewayError::Internal("response is not available yet".to_string()))
    }

    pub fn respond(&mut self, response: ExchangeResponse) -> GatewayResult<()> {
        self.ensure_open()?;
        self.response = Some(response);
        Ok(())
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn set_attribute(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> GatewayResult<Option<String>> {
        self.ensure_open()?;
        Ok(self.attributes.insert(key.into(), value.into()))
    }

    pub fn remove_attribute(&mut self, key: &str) -> GatewayResult<Option<String>> {
        self.ensure_open()?;
        Ok(self.attributes.remove(key))
    }

    pub fn fault(&self) -> Option<&GatewayError> {
        self.fault.as_ref()
    }

    fn ensure_open(&self) -> GatewayResult<()> {
        if self.is_completed() {
            Err(GatewayError::ExchangeClosed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn enter_request(&mut self, filter: &'static str) {
        self.phase = ExchangePhase::Request { filter };
    }

    pub(crate) fn begin_dispatch(&mut self) {
        self.phase = ExchangePhase::Dispatching;
    }

    pub(crate) fn enter_response(&mut self, filter: &'static str) {
        if !self.is_completed() {
            self.phase = ExchangePhase::Response { filter };
        }
    }

    // First fault wins.
    pub(crate) fn record_fault(&mut self, err: GatewayError) {
        if self.fault.is_none() {
            self.fault = Some(err);
        }
    }

    pub(crate) fn finish(&mut self, outcome: GatewayResult<()>) -> Option<Response<Body>> {
        if self.is_completed() {
            return None;
        }

        let response = if let Some(fault) = &self.fault {
            tracing::error!(
                request_id = %self.request_id,
                error = %fault,
                "filter fault; failing request"
            );
            let mut response = ExchangeResponse::from_error(fault);
            if let Some(existing) = &self.response {
                for (name, value) in &existing.headers {
                    if name != header::CONTENT_TYPE && name != header::CONTENT_LENGTH {
                        response.headers.insert(name.clone(), value.clone());
                    }
                }
            }
            response
        } else {
            match outcome {
                Ok(()) => match &self.response {
                    Some(response) => response.clone(),
                    None => {
                        let err = GatewayError::Internal(
                            "chain completed without a response".to_string(),
                        );
                        tracing::error!(request_id = %self.request_id, error = %err, "empty chain outcome");
                        ExchangeResponse::from_error(&err)
                    }
                },
                Err(err) => {
                    tracing::warn!(
                        request_id = %self.request_id,
                        error = %err,
                        "unhandled chain error; applying default mapping"
                    );
                    ExchangeResponse::from_error(&err)
                }
            }
        };

        self.response = Some(response.clone());
        self.phase = ExchangePhase::Completed;
        Some(response.into_http())
    }
}
