//! Request/response filter chain for an HTTP API gateway.
//!
//! Every inbound request becomes an [`exchange::Exchange`] and passes through
//! the filters held by a [`filter::FilterRegistry`] in onion order before the
//! [`upstream::UpstreamDispatcher`] forwards it to a backend.

pub mod config;
pub mod error;
pub mod exchange;
pub mod filter;
pub mod gateway;
pub mod metadata;
pub mod upstream;

pub use error::{GatewayError, GatewayResult};
pub use exchange::{Exchange, ExchangePhase, ExchangeRequest, ExchangeResponse};
pub use filter::{Dispatcher, Filter, FilterChain, FilterRegistry, Next};
