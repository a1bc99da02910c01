use std::sync::Arc;

use crate::services::registry::BatchRegistry;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub batches: Arc<BatchRegistry>,
}

impl AppState {
    pub fn new(batches: BatchRegistry) -> Self {
        Self {
            batches: Arc::new(batches),
        }
    }
}
