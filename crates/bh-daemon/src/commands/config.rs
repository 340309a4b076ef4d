use anyhow::{bail, Result};
use bh_core::config::HostConfig;
use bh_core::lockfile::SupervisorLock;
use bh_core::settings::SettingsStore;
use serde_json::Value;

/// Render the value at a dotted settings path. Never creates the settings
/// document.
pub fn get(config: &HostConfig, path: &str) -> Result<String> {
    let settings = SettingsStore::read(config.paths.config_file());
    match settings.get(path) {
        Some(value) => Ok(format!("{}\n", serde_json::to_string_pretty(&value)?)),
        None => Ok(format!("{path} is not set\n")),
    }
}

/// Set a dotted settings path. `raw` is parsed as JSON, falling back to a
/// plain string.
///
/// Refused while a supervisor is running: it holds the document in memory
/// and would overwrite the change on its next write.
pub fn set(config: &HostConfig, path: &str, raw: &str) -> Result<String> {
    if let Some(lock) = SupervisorLock::read_live(&config.paths.lock_file()) {
        bail!(
            "a supervisor is running (pid {}); stop it before editing settings",
            lock.pid
        );
    }
    let value = parse_value(raw);
    let settings = SettingsStore::load(config.paths.config_file());
    settings.set(path, value.clone())?;
    settings.flush()?;
    Ok(format!("{path} = {value}\n"))
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn values_parse_as_json_first() {
        assert_eq!(parse_value("14"), json!(14));
        assert_eq!(parse_value("true"), json!(true));
        assert_eq!(parse_value("{\"a\": 1}"), json!({"a": 1}));
        assert_eq!(parse_value("plain words"), json!("plain words"));
    }
}
