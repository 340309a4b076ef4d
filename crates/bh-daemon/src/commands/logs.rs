use anyhow::{Context, Result};
use bh_core::config::HostConfig;
use bh_core::log_sink::LogSink;

/// Render the last `lines` lines of a bot's log.
pub fn render(config: &HostConfig, id: &str, lines: Option<usize>) -> Result<String> {
    let sink = LogSink::new(config.paths.logs_dir());
    let max = lines.unwrap_or(config.supervisor.log_tail_default);
    let tail = sink
        .tail(id, max)
        .with_context(|| format!("failed to read log for {id}"))?;
    if tail.is_empty() {
        return Ok(format!("no log output for {id}\n"));
    }
    let mut out = tail.join("\n");
    out.push('\n');
    Ok(out)
}
