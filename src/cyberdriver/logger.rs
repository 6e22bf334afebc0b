use std::{
  fs::{self, OpenOptions},
  io::Write,
  path::PathBuf,
  sync::atomic::{AtomicBool, Ordering},
  sync::{Arc, Mutex},
};

use chrono::Local;

use crate::error::Result;

#[derive(Clone)]
pub struct DebugLogger {
  enabled: Arc<AtomicBool>,
  log_dir: PathBuf,
}

impl DebugLogger {
  pub fn new(enabled: bool) -> Result<Self> {
    let log_dir = super::config::get_config_dir().join("logs");
    fs::create_dir_all(&log_dir)?;
    Ok(Self {
      enabled: Arc::new(AtomicBool::new(enabled)),
      log_dir,
    })
  }

  fn log_file_path(&self) -> PathBuf {
    let date = Local::now().format("%Y-%m-%d").to_string();
    self.log_dir.join(format!("cyberdriver-{date}.log"))
  }

  fn write_line(&self, line: &str) {
    if !self.enabled.load(Ordering::Relaxed) {
      return;
    }
    let path = self.log_file_path();
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
      let _ = writeln!(file, "{line}");
    }
  }

  pub fn log(&self, category: &str, message: &str, fields: &[(&str, String)]) {
    if !self.enabled.load(Ordering::Relaxed) {
      return;
    }
    let timestamp = Local::now().to_rfc3339();
    let mut line = format!("[{timestamp}] [{category}] {message}");
    for (key, value) in fields {
      line.push_str(&format!(" {key}={value}"));
    }
    self.write_line(&line);
  }

  pub fn info(&self, category: &str, message: &str) {
    self.log(category, message, &[]);
  }

  pub fn connection_attempt(&self, uri: &str, attempt: usize) {
    self.log(
      "CONNECTION",
      "Attempt",
      &[("uri", uri.to_string()), ("attempt", attempt.to_string())],
    );
  }

  pub fn connection_established(&self, uri: &str) {
    self.log("CONNECTION", "Established", &[("uri", uri.to_string())]);
  }

  pub fn connection_closed(&self, reason: &str, duration: f64, close_code: Option<u16>) {
    self.log(
      "CONNECTION",
      "Closed",
      &[
        ("reason", reason.to_string()),
        ("duration_s", format!("{duration:.2}")),
        ("close_code", close_code.map(|c| c.to_string()).unwrap_or_else(|| "None".into())),
      ],
    );
  }

  pub fn request_forwarded(&self, method: &str, path: &str, status: u16, duration_ms: f64) {
    self.log(
      "REQUEST",
      "Forwarded",
      &[
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
        ("duration_ms", format!("{duration_ms:.1}")),
      ],
    );
  }
}

/// Console printer that keeps one transient status line (the keepalive
/// countdown) at the bottom of the terminal. Any regular line erases the
/// status line first, prints, then redraws it.
#[derive(Clone)]
pub struct ConsoleStatus {
  line: Arc<Mutex<Option<String>>>,
}

impl ConsoleStatus {
  pub fn new() -> Self {
    Self {
      line: Arc::new(Mutex::new(None)),
    }
  }

  pub fn set_line(&self, text: String) {
    let mut guard = match self.line.lock() {
      Ok(guard) => guard,
      Err(_) => return,
    };
    let mut out = std::io::stdout();
    let _ = write!(out, "\r\x1b[2K{text}");
    let _ = out.flush();
    *guard = Some(text);
  }

  pub fn clear_line(&self) {
    let mut guard = match self.line.lock() {
      Ok(guard) => guard,
      Err(_) => return,
    };
    if guard.take().is_some() {
      let mut out = std::io::stdout();
      let _ = write!(out, "\r\x1b[2K");
      let _ = out.flush();
    }
  }

  pub fn println(&self, text: &str) {
    let guard = match self.line.lock() {
      Ok(guard) => guard,
      Err(_) => return,
    };
    let mut out = std::io::stdout();
    if guard.is_some() {
      let _ = write!(out, "\r\x1b[2K");
    }
    let _ = writeln!(out, "{text}");
    if let Some(status) = guard.as_ref() {
      let _ = write!(out, "{status}");
    }
    let _ = out.flush();
  }
}

impl Default for ConsoleStatus {
  fn default() -> Self {
    Self::new()
  }
}
