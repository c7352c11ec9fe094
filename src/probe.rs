//! Probe coordination
//!
//! Polls the backend for remote process status until every host reports
//! completion or the attempt bound is reached. Every snapshot is handed to the
//! caller as it arrives; only the last one decides the stage outcome.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::TestBackend;
use crate::config::ProbeConfig;
use crate::error::{BackendError, BackendResult};
use crate::models::ProbeSnapshot;

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    /// Latest snapshot received
    pub snapshot: ProbeSnapshot,
    /// True when the backend reported `all_completed`
    pub completed: bool,
    /// Probe requests issued
    pub attempts: u32,
}

#[derive(Clone)]
pub struct ProbeCoordinator {
    backend: Arc<dyn TestBackend>,
    interval: Duration,
    max_attempts: u32,
}

impl ProbeCoordinator {
    /// `max_attempts` of 0 is raised to 1: a probe stage always asks at least once.
    pub fn new(backend: Arc<dyn TestBackend>, interval: Duration, max_attempts: u32) -> Self {
        Self {
            backend,
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(backend: Arc<dyn TestBackend>, config: &ProbeConfig) -> Self {
        Self::new(backend, config.interval(), config.max_attempts)
    }

    /// Poll until completion, the attempt bound, or cancellation.
    ///
    /// At most `max_attempts` probe requests are made. The wait between two
    /// requests ends early when `cancel` fires.
    pub async fn poll<F>(
        &self,
        config: &str,
        cancel: &CancellationToken,
        mut on_snapshot: F,
    ) -> BackendResult<ProbeOutcome>
    where
        F: FnMut(&ProbeSnapshot),
    {
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }

            let snapshot = self.backend.probe(config, cancel).await?;
            attempts += 1;
            debug!("Probe {}/{}: {}", attempts, self.max_attempts, snapshot.progress_line());
            on_snapshot(&snapshot);

            if snapshot.all_completed {
                info!("All hosts completed after {} probe(s)", attempts);
                return Ok(ProbeOutcome { snapshot, completed: true, attempts });
            }

            if attempts >= self.max_attempts {
                info!("Probe bound reached after {} attempt(s)", attempts);
                return Ok(ProbeOutcome { snapshot, completed: false, attempts });
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Run `poll` on its own task, streaming snapshots through `tx`.
    ///
    /// The channel closes when the task ends; await the handle for the outcome.
    pub fn spawn(
        &self,
        config: String,
        cancel: CancellationToken,
        tx: mpsc::UnboundedSender<ProbeSnapshot>,
    ) -> JoinHandle<BackendResult<ProbeOutcome>> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator
                .poll(&config, &cancel, |snapshot| {
                    // Receiver gone means nobody watches progress; keep polling anyway
                    let _ = tx.send(snapshot.clone());
                })
                .await
        })
    }
}
