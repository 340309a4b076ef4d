use anyhow::{Context, Result};
use bh_core::config::HostConfig;
use bh_core::lockfile::SupervisorLock;
use bh_core::types::{StateDocument, WorkerRecord};
use chrono::Local;

/// Read the state document without creating it.
fn read_state(config: &HostConfig) -> Result<Option<StateDocument>> {
    let path = config.paths.state_file();
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let doc = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(doc))
}

/// Render the `status` subcommand: one bot in detail, or a table of all.
pub fn render(config: &HostConfig, id: Option<&str>, json: bool) -> Result<String> {
    let doc = read_state(config)?;
    let bots = doc.as_ref().map(|d| &d.bots);

    if let Some(id) = id {
        let record = bots
            .and_then(|b| b.get(id))
            .with_context(|| format!("bot not found: {id}"))?;
        return if json {
            Ok(serde_json::to_string_pretty(record)?)
        } else {
            Ok(detail(record))
        };
    }

    if json {
        return match &doc {
            Some(doc) => Ok(serde_json::to_string_pretty(doc)?),
            None => Ok("{}".to_string()),
        };
    }

    let mut out = String::new();
    match SupervisorLock::read_live(&config.paths.lock_file()) {
        Some(lock) => out.push_str(&format!(
            "bothost supervisor: running (pid {}, since {})\n",
            lock.pid, lock.started_at
        )),
        None => out.push_str("bothost supervisor: not running\n"),
    }
    out.push_str(&"-".repeat(60));
    out.push('\n');

    match bots {
        Some(bots) if !bots.is_empty() => {
            out.push_str(&format!(
                "{:<20} {:<9} {:>8} {:>6}  {}\n",
                "BOT", "STATUS", "PID", "EXIT", "UPDATED"
            ));
            for record in bots.values() {
                out.push_str(&format!(
                    "{:<20} {:<9} {:>8} {:>6}  {}\n",
                    record.id,
                    record.status.as_str(),
                    opt(record.pid),
                    opt(record.exit_code),
                    local(record.last_updated),
                ));
            }
        }
        _ => out.push_str("no bots recorded\n"),
    }
    Ok(out)
}

fn detail(record: &WorkerRecord) -> String {
    let mut out = format!("{}\n", record.id);
    out.push_str(&format!("  status:        {}\n", record.status));
    out.push_str(&format!("  auto_restart:  {}\n", record.auto_restart));
    out.push_str(&format!("  pid:           {}\n", opt(record.pid)));
    out.push_str(&format!("  exit_code:     {}\n", opt(record.exit_code)));
    if let Some(by) = record.stopped_by {
        out.push_str(&format!("  stopped_by:    {by:?}\n"));
    }
    if let Some(error) = &record.error {
        out.push_str(&format!("  error:         {error}\n"));
    }
    if let Some(command) = &record.command {
        out.push_str(&format!("  command:       {command}\n"));
    }
    out.push_str(&format!("  created:       {}\n", local(record.created_at)));
    out.push_str(&format!("  updated:       {}\n", local(record.last_updated)));
    out.push_str("  history:\n");
    for entry in record.status_history.iter().rev().take(10) {
        out.push_str(&format!("    {}  {}\n", local(entry.timestamp), entry.status));
    }
    out
}

fn opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
}

fn local(at: chrono::DateTime<chrono::Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}
