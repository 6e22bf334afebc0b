use std::{
  fs,
  net::TcpListener,
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{CyberdriverError, Result};

const CONFIG_DIR: &str = ".cyberdriver";
const CONFIG_FILE: &str = "config.json";
const PID_FILE: &str = "cyberdriver.pid.json";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Per-install identity. The fingerprint is generated once and survives
/// version upgrades; the file is rewritten whenever `version` changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
  pub version: String,
  pub fingerprint: String,
}

#[derive(Clone, Debug, Default)]
pub struct ConnectionInfo {
  pub host: Option<String>,
  pub port: Option<u16>,
  pub connected: bool,
  pub last_error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimePidInfo {
  pub pid: u32,
  pub command: String,
  pub local_port: Option<u16>,
  pub cloud_host: String,
  pub cloud_port: u16,
  pub version: Option<String>,
  pub started_at: Option<String>,
  pub frozen: Option<bool>,
  pub argv: Option<Vec<String>>,
}

// LOCALAPPDATA on Windows, XDG_CONFIG_HOME (or ~/.config) elsewhere; the
// home directory is the last resort on stripped-down accounts.
pub fn get_config_dir() -> PathBuf {
  dirs::config_local_dir()
    .or_else(dirs::home_dir)
    .unwrap_or_else(|| PathBuf::from("."))
    .join(CONFIG_DIR)
}

pub fn get_config() -> Result<Config> {
  load_or_create_config(&get_config_dir())
}

fn load_or_create_config(config_dir: &Path) -> Result<Config> {
  let config_path = config_dir.join(CONFIG_FILE);
  let on_disk = read_config_file(&config_path);

  // A current version means the file is good as-is. Anything else (older
  // version, unreadable file, first run) gets rewritten, carrying the
  // fingerprint forward so the cloud keeps recognizing this install.
  if let Some(config) = &on_disk {
    if config.version == VERSION {
      return Ok(config.clone());
    }
  }

  let config = Config {
    version: VERSION.to_string(),
    fingerprint: on_disk
      .map(|old| old.fingerprint)
      .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
  };
  fs::create_dir_all(config_dir)?;
  fs::write(&config_path, serde_json::to_vec_pretty(&config)?)?;
  Ok(config)
}

fn read_config_file(path: &Path) -> Option<Config> {
  let content = fs::read_to_string(path).ok()?;
  serde_json::from_str(&content).ok()
}

pub fn get_pid_file_path() -> PathBuf {
  get_config_dir().join(PID_FILE)
}

pub fn write_pid_info(info: RuntimePidInfo) -> Result<()> {
  fs::create_dir_all(get_config_dir())?;
  let mut payload = info;
  if payload.pid == 0 {
    payload.pid = std::process::id();
  }
  if payload.version.is_none() {
    payload.version = Some(VERSION.to_string());
  }
  if payload.started_at.is_none() {
    payload.started_at = Some(chrono::Local::now().to_rfc3339());
  }
  if payload.frozen.is_none() {
    payload.frozen = Some(cfg!(not(debug_assertions)));
  }
  if payload.argv.is_none() {
    payload.argv = Some(std::env::args().collect());
  }
  write_pid_record(&get_pid_file_path(), &payload)
}

// Write-temp-then-rename so a crash mid-write never leaves a torn record.
fn write_pid_record(path: &Path, payload: &RuntimePidInfo) -> Result<()> {
  let tmp = path.with_extension("json.tmp");
  fs::write(&tmp, serde_json::to_vec_pretty(payload)?)?;
  fs::rename(&tmp, path)?;
  Ok(())
}

pub fn read_pid_info() -> Option<RuntimePidInfo> {
  read_pid_record(&get_pid_file_path())
}

fn read_pid_record(path: &Path) -> Option<RuntimePidInfo> {
  let content = fs::read_to_string(path).ok()?;
  serde_json::from_str(&content).ok()
}

pub fn remove_pid_file() -> Result<()> {
  let path = get_pid_file_path();
  if path.exists() {
    fs::remove_file(path).map_err(|err| CyberdriverError::RuntimeError(err.to_string()))?;
  }
  Ok(())
}

// Probe a window of ports above the requested one and take the first that
// binds; another local instance may already hold the default.
const PORT_PROBE_WINDOW: u16 = 100;

pub fn find_available_port(host: &str, start_port: u16) -> Option<u16> {
  let last = start_port.saturating_add(PORT_PROBE_WINDOW - 1);
  (start_port..=last).find(|&port| TcpListener::bind((host, port)).is_ok())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn config_fingerprint_survives_version_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    let first = load_or_create_config(dir.path()).unwrap();
    assert_eq!(first.version, VERSION);

    // Simulate an older install: same fingerprint, stale version.
    let stale = serde_json::json!({ "version": "0.0.1", "fingerprint": first.fingerprint });
    fs::write(dir.path().join(CONFIG_FILE), serde_json::to_vec_pretty(&stale).unwrap()).unwrap();

    let second = load_or_create_config(dir.path()).unwrap();
    assert_eq!(second.version, VERSION);
    assert_eq!(second.fingerprint, first.fingerprint);
  }

  #[test]
  fn config_is_stable_across_loads() {
    let dir = tempfile::tempdir().unwrap();
    let first = load_or_create_config(dir.path()).unwrap();
    let second = load_or_create_config(dir.path()).unwrap();
    assert_eq!(first.fingerprint, second.fingerprint);
  }

  #[test]
  fn pid_record_round_trips_and_leaves_no_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(PID_FILE);
    let info = RuntimePidInfo {
      pid: 4321,
      command: "join".to_string(),
      local_port: Some(3000),
      cloud_host: "api.cyberdesk.io".to_string(),
      cloud_port: 443,
      version: Some(VERSION.to_string()),
      started_at: None,
      frozen: Some(false),
      argv: Some(vec!["cyberdriver".into(), "join".into()]),
    };
    write_pid_record(&path, &info).unwrap();
    let read = read_pid_record(&path).unwrap();
    assert_eq!(read.pid, 4321);
    assert_eq!(read.command, "join");
    assert_eq!(read.cloud_port, 443);
    assert!(!path.with_extension("json.tmp").exists());
  }

  #[test]
  fn find_available_port_skips_bound_port() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = listener.local_addr().unwrap().port();
    let found = find_available_port("127.0.0.1", taken).unwrap();
    assert!(found > taken);
  }
}
