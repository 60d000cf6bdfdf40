use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    response::{IntoResponse, Response},
};

use crate::{
    error::{GatewayError, GatewayResult},
    exchange::{Exchange, ExchangeResponse},
    filter::{Filter, FilterRegistry},
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Terminal step of the chain: hands the request to a backend and returns
/// what it answered.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, exchange: &Exchange) -> GatewayResult<ExchangeResponse>;
}

/// Continuation handed to a filter: the remaining filters, then dispatch.
/// `run` may be called at most once.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Filter>],
    dispatcher: &'a dyn Dispatcher,
    deadline: Option<Duration>,
    caller: Option<&'static str>,
    consumed: bool,
}

impl<'a> Next<'a> {
    fn root(
        filters: &'a [Arc<dyn Filter>],
        dispatcher: &'a dyn Dispatcher,
        deadline: Option<Duration>,
    ) -> Self {
        Self {
            remaining: filters,
            dispatcher,
            deadline,
            caller: None,
            consumed: false,
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    pub fn run<'b>(&'b mut self, exchange: &'b mut Exchange) -> BoxFuture<'b, GatewayResult<()>> {
        Box::pin(async move {
            if self.consumed {
                let err = GatewayError::ChainReentry {
                    filter: self.caller.unwrap_or("chain").to_string(),
                };
                tracing::error!(
                    request_id = %exchange.request_id(),
                    filter = self.caller.unwrap_or("chain"),
                    "next invoked more than once"
                );
                exchange.record_fault(err.clone());
                return Err(err);
            }
            self.consumed = true;

            let mut outcome = match self.remaining.split_first() {
                Some((filter, rest)) => {
                    let mut next = Next {
                        remaining: rest,
                        dispatcher: self.dispatcher,
                        deadline: self.deadline,
                        caller: Some(filter.name()),
                        consumed: false,
                    };
                    exchange.enter_request(filter.name());
                    filter.apply(exchange, &mut next).await
                }
                None => {
                    exchange.begin_dispatch();
                    match self.dispatch(exchange).await {
                        Ok(response) => exchange.respond(response),
                        Err(err) => Err(err),
                    }
                }
            };

            // A fault recorded downstream reaches the caller even if the
            // faulting filter swallowed it.
            if outcome.is_ok()
                && let Some(fault) = exchange.fault()
            {
                outcome = Err(fault.clone());
            }

            if let Some(caller) = self.caller {
                exchange.enter_response(caller);
            }
            outcome
        })
    }

    async fn dispatch(&self, exchange: &Exchange) -> GatewayResult<ExchangeResponse> {
        let Some(limit) = self.deadline else {
            return self.dispatcher.dispatch(exchange).await;
        };

        match tokio::time::timeout(limit, self.dispatcher.dispatch(exchange)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    request_id = %exchange.request_id(),
                    timeout_ms = limit.as_millis() as u64,
                    "route timed out; cancelling dispatch"
                );
                Err(GatewayError::Timeout)
            }
        }
    }
}

pub struct FilterChain<'a> {
    filters: &'a [Arc<dyn Filter>],
    dispatcher: &'a dyn Dispatcher,
    timeout: Option<Duration>,
}

impl<'a> FilterChain<'a> {
    pub fn new(registry: &'a FilterRegistry, dispatcher: &'a dyn Dispatcher) -> Self {
        Self {
            filters: registry.as_slice(),
            dispatcher,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn execute(self, exchange: &mut Exchange) -> Response<Body> {
        if exchange.is_completed() {
            return GatewayError::ExchangeClosed.into_response();
        }

        let mut root = Next::root(self.filters, self.dispatcher, self.timeout);
        // The route deadline applies to dispatch, so filters still see the
        // timeout as a failed `next`. This guard only catches filters that
        // stall on their own.
        let outcome = match self.timeout.map(|limit| limit.saturating_mul(BACKSTOP_FACTOR)) {
            Some(backstop) => match tokio::time::timeout(backstop, root.run(exchange)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!(
                        request_id = %exchange.request_id(),
                        backstop_ms = backstop.as_millis() as u64,
                        "filter chain stalled past route deadline; aborting"
                    );
                    Err(GatewayError::Timeout)
                }
            },
            None => root.run(exchange).await,
        };

        exchange
            .finish(outcome)
            .unwrap_or_else(|| GatewayError::ExchangeClosed.into_response())
    }
}

const BACKSTOP_FACTOR: u32 = 2;
