use std::sync::Arc;

use crate::services::aggregator::Aggregator;

/// Shared state passed to the progress route handlers.
#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
}

impl AppState {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        Self { aggregator }
    }
}
