//! The published model.

use super::Model;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Holds the current model.
///
/// Readers clone the `Arc` and keep using their copy for the rest of the
/// request. A new model is compiled elsewhere and installed as a whole.
#[derive(Debug, Default)]
pub struct ModelCache {
    current: RwLock<Arc<Model>>,
}

impl ModelCache {
    /// Creates a cache holding `model`.
    #[must_use]
    pub fn new(model: Model) -> Self {
        Self {
            current: RwLock::new(Arc::new(model)),
        }
    }

    /// Returns the current model.
    #[must_use]
    pub fn get(&self) -> Arc<Model> {
        Arc::clone(&self.current.read())
    }

    /// Replaces the current model.
    pub fn install(&self, model: Model) {
        debug!(types = model.objects.len(), "installing model");
        *self.current.write() = Arc::new(model);
    }
}
