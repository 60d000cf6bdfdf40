use std::{slice, sync::Arc};

use crate::{
    error::{GatewayError, GatewayResult},
    filter::Filter,
};

#[derive(Default)]
pub struct FilterRegistry {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, filter: Arc<dyn Filter>) -> GatewayResult<()> {
        let name = filter.name();
        if self.filters.iter().any(|f| f.name() == name) {
            return Err(GatewayError::DuplicateFilter {
                name: name.to_string(),
            });
        }

        tracing::debug!(filter = name, order = filter.order(), "registering filter");
        self.filters.push(filter);
        // Stable sort keeps registration sequence for equal orders.
        self.filters.sort_by_key(|f| f.order());
        Ok(())
    }

    pub fn with(mut self, filter: impl Filter + 'static) -> GatewayResult<Self> {
        self.register(Arc::new(filter))?;
        Ok(self)
    }

    pub fn ordered_filters(&self) -> slice::Iter<'_, Arc<dyn Filter>> {
        self.filters.iter()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub(crate) fn as_slice(&self) -> &[Arc<dyn Filter>] {
        &self.filters
    }
}
