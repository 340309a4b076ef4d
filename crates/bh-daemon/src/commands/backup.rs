use anyhow::{Context, Result};
use bh_core::config::HostConfig;
use bh_supervisor::Supervisor;

/// Write a backup of both documents and render its path.
///
/// Runs its own supervisor instance, so `running_bots` in the backup is
/// empty; statuses come from the state document.
pub fn run(config: HostConfig) -> Result<String> {
    let supervisor = Supervisor::open(config);
    let path = supervisor
        .create_backup()
        .context("failed to write backup")?;
    Ok(format!("backup written to {}\n", path.display()))
}
