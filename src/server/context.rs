//! Server context.
//!
//! One `ServerContext` is constructed at startup and passed explicitly to
//! everything that needs it; tests build independent contexts per case.
//! There are no process-wide singletons.

use super::registry::Registry;
use crate::config::Options;
use crate::crypto::{Identity, TrustStore};
use crate::metrics::Metrics;
use std::sync::Arc;
use tokio::sync::watch;

pub struct ServerContext {
    pub options: Options,
    pub registry: Registry,
    pub identity: Identity,
    pub trust: TrustStore,
    pub password: Option<String>,
    pub metrics: Metrics,
    shutdown_tx: watch::Sender<bool>,
}

impl ServerContext {
    pub fn new(
        options: Options,
        identity: Identity,
        trust: TrustStore,
        password: Option<String>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(ServerContext {
            options,
            registry: Registry::new(),
            identity,
            trust,
            password,
            metrics: Metrics::new(),
            shutdown_tx,
        })
    }

    /// Context with generated identity and ephemeral trust, for tests.
    pub fn for_tests(options: Options) -> Arc<Self> {
        Self::new(options, Identity::generate(), TrustStore::ephemeral(), None)
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Begin shutdown: every session task watches this signal.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
