use std::{
  fs,
  io::Write,
  path::{Path, PathBuf},
  process::{Command, Stdio},
  time::Duration,
};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader, SeekFrom};

use crate::error::{CyberdriverError, Result};

use super::config::{self, RuntimePidInfo};

/// Internal marker: set on the relaunched child so it runs the tunnel in the
/// foreground instead of detaching again. Never part of the public CLI.
pub const DETACH_MARKER_ENV: &str = "CYBERDRIVER_DAEMON_CHILD";

const STDIO_LOG_FILE: &str = "cyberdriver-stdio.log";
const STDIO_LOG_CAP: u64 = 10 * 1024 * 1024;
const TAIL_HISTORY_BYTES: u64 = 16 * 1024;
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub fn is_daemon_child() -> bool {
  std::env::var_os(DETACH_MARKER_ENV).is_some()
}

pub fn stdio_log_path() -> PathBuf {
  config::get_config_dir().join("logs").join(STDIO_LOG_FILE)
}

/// Relaunch self with the same argv, detached from the current terminal,
/// stdio redirected to the capped log file. Returns the child pid.
pub fn spawn_detached() -> Result<u32> {
  let exe = std::env::current_exe()?;
  let args: Vec<String> = std::env::args().skip(1).collect();
  let log_path = stdio_log_path();
  let stdout_log = prepare_stdio_log(&log_path, STDIO_LOG_CAP)?;
  let stderr_log = stdout_log.try_clone()?;

  let mut cmd = Command::new(exe);
  cmd
    .args(args)
    .env(DETACH_MARKER_ENV, "1")
    .stdin(Stdio::null())
    .stdout(stdout_log)
    .stderr(stderr_log);

  #[cfg(windows)]
  {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
  }
  #[cfg(unix)]
  {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
  }

  let child = cmd.spawn()?;
  Ok(child.id())
}

// Opens the stdio log for appending; above the cap the file is truncated and
// restarted with a header line so the tail command keeps working.
fn prepare_stdio_log(path: &Path, cap: u64) -> Result<fs::File> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent)?;
  }
  let over_cap = fs::metadata(path).map(|meta| meta.len() > cap).unwrap_or(false);
  if over_cap {
    let mut file = fs::File::create(path)?;
    writeln!(
      file,
      "[log truncated at {} after exceeding {} bytes]",
      chrono::Local::now().to_rfc3339(),
      cap
    )?;
    return Ok(file);
  }
  Ok(fs::OpenOptions::new().create(true).append(true).open(path)?)
}

/// Single-instance guard: a PID record pointing at a live cyberdriver
/// process means another instance owns this machine.
pub fn find_running_instance() -> Option<RuntimePidInfo> {
  let info = config::read_pid_info()?;
  if info.pid == std::process::id() {
    return None;
  }
  if process_is_cyberdriver(info.pid) {
    Some(info)
  } else {
    None
  }
}

// Image-name check plus argv heuristic, so a recycled pid belonging to an
// unrelated process is never killed.
fn process_is_cyberdriver(pid: u32) -> bool {
  let pid = Pid::from_u32(pid);
  let mut system = System::new();
  let targets = [pid];
  system.refresh_processes(ProcessesToUpdate::Some(&targets), false);
  let Some(process) = system.process(pid) else {
    return false;
  };
  let name = process.name().to_string_lossy().to_lowercase();
  if name.contains("cyberdriver") {
    return true;
  }
  process
    .cmd()
    .iter()
    .any(|arg| arg.to_string_lossy().to_lowercase().contains("cyberdriver"))
}

#[derive(Debug)]
pub enum StopOutcome {
  Stopped(u32),
  NotRunning,
  Refused(String),
}

/// Stop the recorded instance. `force` skips the image check; on POSIX the
/// process gets SIGTERM and up to `timeout_secs` before SIGKILL.
pub fn stop_running_instance(force: bool, timeout_secs: u64) -> Result<StopOutcome> {
  let Some(info) = config::read_pid_info() else {
    return Ok(StopOutcome::NotRunning);
  };
  let pid = Pid::from_u32(info.pid);
  let mut system = System::new();
  let targets = [pid];
  system.refresh_processes(ProcessesToUpdate::Some(&targets), false);
  if system.process(pid).is_none() {
    // Stale record from a crashed instance.
    config::remove_pid_file()?;
    return Ok(StopOutcome::NotRunning);
  }
  if !force && !process_is_cyberdriver(info.pid) {
    return Ok(StopOutcome::Refused(format!(
      "pid {} does not look like a cyberdriver process (use --force to override)",
      info.pid
    )));
  }

  let process = system
    .process(pid)
    .ok_or_else(|| CyberdriverError::RuntimeError("process vanished during stop".into()))?;
  if cfg!(windows) {
    process.kill();
  } else {
    if process.kill_with(sysinfo::Signal::Term).is_none() {
      process.kill();
    }
    let deadline = std::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
      std::thread::sleep(STOP_POLL_INTERVAL);
      system.refresh_processes(ProcessesToUpdate::Some(&targets), false);
      let Some(process) = system.process(pid) else {
        break;
      };
      if std::time::Instant::now() >= deadline {
        process.kill();
        break;
      }
    }
  }

  // Give a force-killed process a moment to disappear before cleanup.
  for _ in 0..10 {
    system.refresh_processes(ProcessesToUpdate::Some(&targets), false);
    if system.process(pid).is_none() {
      break;
    }
    std::thread::sleep(STOP_POLL_INTERVAL);
  }
  config::remove_pid_file()?;
  Ok(StopOutcome::Stopped(info.pid))
}

/// Print the last ~16 KiB of the log, then follow appends until Ctrl+C or
/// Enter. A shrinking file means it was truncated; reseek to the start.
pub async fn tail_log(path: &Path) -> Result<()> {
  let mut file = tokio::fs::File::open(path)
    .await
    .map_err(|err| CyberdriverError::RuntimeError(format!("cannot open {}: {err}", path.display())))?;
  let len = file.metadata().await?.len();
  let mut pos = len.saturating_sub(TAIL_HISTORY_BYTES);
  file.seek(SeekFrom::Start(pos)).await?;

  let mut history = String::new();
  file.read_to_string(&mut history).await?;
  print!("{history}");
  let _ = std::io::stdout().flush();
  pos = len;

  let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      line = stdin_lines.next_line() => {
        if matches!(line, Ok(Some(_)) | Ok(None)) {
          break;
        }
      }
      _ = tokio::time::sleep(TAIL_POLL_INTERVAL) => {
        let len = match tokio::fs::metadata(path).await {
          Ok(meta) => meta.len(),
          Err(_) => continue,
        };
        if len < pos {
          pos = 0;
        }
        if len > pos {
          let mut file = tokio::fs::File::open(path).await?;
          file.seek(SeekFrom::Start(pos)).await?;
          let mut appended = String::new();
          file.read_to_string(&mut appended).await?;
          print!("{appended}");
          let _ = std::io::stdout().flush();
          pos = len;
        }
      }
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stdio_log_is_truncated_above_the_cap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(STDIO_LOG_FILE);
    fs::write(&path, vec![b'x'; 4096]).unwrap();

    // Under the cap: appended, not truncated.
    let mut file = prepare_stdio_log(&path, 8192).unwrap();
    writeln!(file, "more").unwrap();
    drop(file);
    assert!(fs::metadata(&path).unwrap().len() > 4096);

    // Over the cap: truncated with a header.
    let file = prepare_stdio_log(&path, 1024).unwrap();
    drop(file);
    let content = fs::read_to_string(&path).unwrap();
    assert!(content.starts_with("[log truncated at "));
    assert!(content.len() < 4096);
  }

  #[test]
  fn stdio_log_creates_missing_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join(STDIO_LOG_FILE);
    let file = prepare_stdio_log(&path, STDIO_LOG_CAP).unwrap();
    drop(file);
    assert!(path.exists());
  }

  #[test]
  fn dead_pid_is_not_a_running_instance() {
    // Pid::MAX-ish values are never live.
    assert!(!process_is_cyberdriver(u32::MAX - 1));
  }
}
