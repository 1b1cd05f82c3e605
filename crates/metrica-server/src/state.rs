//! Shared application state for the HTTP handlers and the gRPC service.

use std::sync::Arc;

use metrica_core::repository::Repository;

use crate::saver::Saver;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) repo: Arc<dyn Repository>,
    /// Present only for the in-memory backend with a snapshot file.
    pub(crate) saver: Option<Arc<Saver>>,
}

impl AppState {
    pub(crate) fn new(repo: Arc<dyn Repository>, saver: Option<Arc<Saver>>) -> Self {
        Self { repo, saver }
    }

    /// Hook run after every successful write.
    pub(crate) async fn written(&self) {
        if let Some(saver) = &self.saver {
            saver.on_write().await;
        }
    }
}
