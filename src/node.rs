use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::scheduler::{CleanupTask, JobStore, Runner};
use crate::worker::{BackendRegistry, PollAdapter};

/// Process-level owner of the runner and its background loops.
pub struct Node {
    pub config: NodeConfig,
    pub runner: Runner,
    poll_adapters: Vec<PollAdapter>,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn JobStore>,
        backends: BackendRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        let runner = Runner::with_shutdown(store, backends, config.runner.clone(), shutdown.clone());
        Self {
            config,
            runner,
            poll_adapters: Vec::new(),
            shutdown,
        }
    }

    /// Add a poll-mode worker that runs alongside the runner.
    pub fn with_poll_adapter(mut self, adapter: PollAdapter) -> Self {
        self.poll_adapters.push(adapter);
        self
    }

    /// Run the node until the shutdown token is cancelled.
    ///
    /// 1. Resumes jobs left queued or processing in the store
    /// 2. Spawns the periodic cleanup loop
    /// 3. Spawns one loop per poll adapter
    /// 4. Optionally spawns the dashboard server
    /// 5. Waits for every loop to stop
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read during recovery.
    /// Background loops log their own errors and keep running.
    pub async fn run(self) -> Result<()> {
        let resumed = self.runner.resume_pending().await?;
        tracing::info!(resumed, "Job runner started");

        let mut tasks = JoinSet::new();

        let cleanup = CleanupTask::new(self.runner.clone(), self.config.cleanup.clone());
        tasks.spawn(cleanup.run(self.shutdown.clone()));

        for adapter in self.poll_adapters {
            tasks.spawn(adapter.run(self.shutdown.clone()));
        }

        if let Some(addr) = self.config.dashboard_addr {
            let state = DashboardState {
                runner: self.runner.clone(),
            };
            tasks.spawn(run_dashboard(addr, state, self.shutdown.clone()));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Node task failed");
            }
        }

        tracing::info!("Node stopped");
        Ok(())
    }
}
