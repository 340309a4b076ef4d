use anyhow::{Context, Result};
use bh_core::config::HostConfig;
use bh_core::lockfile::LockGuard;
use bh_supervisor::Supervisor;
use tracing::{info, warn};

use crate::shutdown::ShutdownSignal;

/// A booted supervisor that owns the data directory until it shuts down.
///
/// Boot takes the lockfile, opens the stores and prunes stale logs. `run`
/// auto-starts workers and then waits for the shutdown signal.
pub struct Daemon {
    supervisor: Supervisor,
    shutdown: ShutdownSignal,
    lock: LockGuard,
}

impl Daemon {
    pub fn boot(config: HostConfig) -> Result<Self> {
        let lock_path = config.paths.lock_file();
        let lock = LockGuard::acquire(&lock_path, &config.paths.state_file())
            .with_context(|| format!("failed to lock {}", lock_path.display()))?;

        let supervisor = Supervisor::open(config);
        match supervisor.prune_logs() {
            Ok(0) => {}
            Ok(removed) => info!(removed, "pruned expired bot logs"),
            Err(e) => warn!(error = %e, "log pruning failed"),
        }

        let statuses = supervisor.all_statuses();
        info!(
            bots = statuses.len(),
            candidates = supervisor.list_auto_start_candidates().len(),
            lock = %lock.path().display(),
            "bothost booted"
        );

        Ok(Self {
            supervisor,
            shutdown: ShutdownSignal::new(),
            lock,
        })
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Auto-start (when enabled) and block until shutdown is triggered.
    ///
    /// On shutdown every still-registered bot is recorded as stopped by the
    /// server, both documents are flushed and the lockfile is released.
    pub async fn run(self) -> Result<()> {
        let auto_start = if self.supervisor.settings().auto_start() {
            let sup = self.supervisor.clone();
            Some(tokio::spawn(async move { sup.auto_start_all().await }))
        } else {
            info!("auto-start disabled by settings");
            None
        };

        self.shutdown.wait().await;
        info!("shutdown signal received, recording bot states");

        if let Some(task) = auto_start {
            task.abort();
        }
        self.finish()
    }

    fn finish(self) -> Result<()> {
        let recorded = self.supervisor.shutdown_all();
        self.supervisor
            .flush()
            .context("failed to flush supervisor state on shutdown")?;
        info!(recorded, lock = %self.lock.path().display(), "bothost stopped");
        Ok(())
    }
}
