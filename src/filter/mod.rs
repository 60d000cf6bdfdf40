pub mod chain;
pub mod headers;
pub mod logging;
pub mod registry;
pub mod validation;

use async_trait::async_trait;

use crate::{
    error::GatewayResult,
    exchange::Exchange,
};

pub use chain::{Dispatcher, FilterChain, Next};
pub use registry::FilterRegistry;

/// Shared by every in-flight request; per-request state lives in the
/// [`Exchange`]. Code after [`Next::run`] is the filter's response phase, and
/// not calling it short-circuits the chain.
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower values run earlier on the way in and later on the way out.
    fn order(&self) -> i32 {
        0
    }

    async fn apply(&self, exchange: &mut Exchange, next: &mut Next<'_>) -> GatewayResult<()>;
}
