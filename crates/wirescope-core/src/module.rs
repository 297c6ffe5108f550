//! Module lifecycle trait
//!
//! Taps, input streams, stream handlers and policies are all modules: a
//! uniquely named object with a configuration and a start/stop lifecycle.
//! Modules live inside a [`ModuleStore`](crate::store::ModuleStore) which
//! owns them; everyone else works through locked handles.

use crate::configurable::ModuleConfig;
use crate::error::CoreResult;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

/// Base module trait - everything placed in a module store implements this
#[async_trait]
pub trait Module: Send + Sync {
    /// Globally unique module name
    fn name(&self) -> &str;

    /// Module type, e.g. `mock`, `net`, `dns`, `tap`, `policy`
    fn schema_key(&self) -> &str;

    /// Whether the module is currently running
    fn running(&self) -> bool;

    /// Effective configuration
    fn config(&self) -> &ModuleConfig;

    /// Start the module. May spawn background work that runs until `stop()`.
    async fn start(&mut self) -> CoreResult<()>;

    /// Stop the module, waiting until its background work has ceased.
    /// Stopping a stopped module is a no-op.
    async fn stop(&mut self) -> CoreResult<()>;

    /// Describe the module for the control API
    fn info_json(&self) -> Value {
        serde_json::json!({
            "name": self.name(),
            "type": self.schema_key(),
            "running": self.running(),
            "config": self.config().to_json(),
        })
    }
}

/// A spawned background task with a shutdown signal.
///
/// Input streams and handlers keep one of these while running; `shutdown`
/// signals the task and waits for it to exit.
pub struct BackgroundTask {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `f` on the tokio runtime, handing it the shutdown receiver
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(f(shutdown_rx));
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Signal shutdown and wait for the task to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
