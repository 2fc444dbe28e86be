use std::{fmt, sync::Arc};

use shutterflow_core::catalog::Catalog;
use shutterflow_core::pipeline::PipelineRunner;

/// Shared handles every request can reach. Cloning is cheap; the catalog
/// wraps a pool and the runner shares its state through `Arc`s.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Catalog,
    pub pipeline: PipelineRunner,
    /// `None` disables authentication entirely.
    pub api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(catalog: Catalog, pipeline: PipelineRunner, api_key: Option<String>) -> Self {
        Self {
            catalog,
            pipeline,
            api_key: api_key.map(Arc::from),
        }
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
