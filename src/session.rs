//! Wiring for a live detector: control client plus worker thread.

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::client::ControlClient;
use crate::config::MerlinConfig;
use crate::error::{AppResult, MerlinError};
use crate::messages::job_channel;
use crate::stats::StatsSnapshot;
use crate::storage::StorageBackend;
use crate::worker::{spawn_worker_thread, WorkerHandle};

/// A connected detector session.
///
/// Dropping the session closes the job channel, which ends the worker loop;
/// [`MerlinSession::shutdown`] additionally waits for the worker thread.
pub struct MerlinSession {
    client: ControlClient<TcpStream>,
    worker: WorkerHandle,
}

impl MerlinSession {
    /// Spawn the worker (which connects the data channel) and connect the
    /// control channel.
    pub async fn connect(config: &MerlinConfig, backend: Arc<dyn StorageBackend>) -> AppResult<Self> {
        config.validate()?;
        let (control, worker_end) = job_channel(config.acquisition.job_channel_capacity);

        let mut worker = spawn_worker_thread(config, worker_end, backend)?;
        if let Err(startup) = worker.wait_ready().await {
            let joined = tokio::task::spawn_blocking(move || worker.join())
                .await
                .map_err(|e| MerlinError::Worker(format!("joining worker thread: {}", e)))?;
            return Err(joined.err().unwrap_or(startup));
        }

        // The worker exits on its own once `control` is dropped.
        let client = ControlClient::connect(config, control).await?;
        info!(detector = %config.detector.host, "Merlin session ready");
        Ok(Self { client, worker })
    }

    /// The control client; cheap to borrow for every request.
    pub fn client(&self) -> &ControlClient<TcpStream> {
        &self.client
    }

    /// Worker counters at this instant.
    pub fn stats(&self) -> StatsSnapshot {
        self.worker.stats().snapshot()
    }

    /// Close the job channel and wait for the worker thread to exit.
    pub async fn shutdown(self) -> AppResult<()> {
        let Self { client, worker } = self;
        drop(client);
        let result = tokio::task::spawn_blocking(move || worker.join())
            .await
            .map_err(|e| MerlinError::Worker(format!("joining worker thread: {}", e)))?;
        match &result {
            Ok(()) => info!("Merlin session shut down"),
            Err(error) => warn!(%error, "Worker exited with an error"),
        }
        result
    }
}
