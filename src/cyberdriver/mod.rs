pub mod api;
mod black_screen;
pub mod config;
pub mod daemon;
mod diagnostics;
mod forward;
mod frame;
mod idempotency;
mod input;
mod keepalive;
mod logger;
mod tunnel;
mod windows;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CyberdriverError, Result};

pub use tunnel::TunnelExit;

use self::{
  api::ApiState,
  config::{Config, ConnectionInfo, RuntimePidInfo},
  keepalive::KeepAliveManager,
  logger::{ConsoleStatus, DebugLogger},
  tunnel::TunnelClient,
};

pub const DEFAULT_HOST: &str = "api.cyberdesk.io";
pub const DEFAULT_PORT: u16 = 443;
pub const DEFAULT_TARGET_PORT: u16 = 3000;
pub const DEFAULT_KEEPALIVE_THRESHOLD_MINUTES: f64 = 3.0;
pub const DEFAULT_BLACK_SCREEN_INTERVAL_SECONDS: f64 = 30.0;

/// Everything the `join` command needs, resolved from the CLI. Immutable for
/// the life of the process.
#[derive(Clone, Debug)]
pub struct JoinSettings {
  pub host: String,
  pub port: u16,
  pub secret: String,
  pub target_port: u16,
  pub keepalive_enabled: bool,
  pub keepalive_threshold_minutes: f64,
  pub keepalive_click_x: Option<i32>,
  pub keepalive_click_y: Option<i32>,
  pub black_screen_recovery: bool,
  pub black_screen_check_interval: f64,
  pub register_as_keepalive_for: Option<String>,
  pub debug: bool,
}

impl Default for JoinSettings {
  fn default() -> Self {
    Self {
      host: DEFAULT_HOST.to_string(),
      port: DEFAULT_PORT,
      secret: String::new(),
      target_port: DEFAULT_TARGET_PORT,
      keepalive_enabled: false,
      keepalive_threshold_minutes: DEFAULT_KEEPALIVE_THRESHOLD_MINUTES,
      keepalive_click_x: None,
      keepalive_click_y: None,
      black_screen_recovery: false,
      black_screen_check_interval: DEFAULT_BLACK_SCREEN_INTERVAL_SECONDS,
      register_as_keepalive_for: None,
      debug: true,
    }
  }
}

struct ServerHandle {
  port: u16,
  stop: CancellationToken,
  task: JoinHandle<()>,
}

struct TunnelHandle {
  stop: CancellationToken,
  task: Option<JoinHandle<TunnelExit>>,
}

struct BlackScreenHandle {
  stop: CancellationToken,
  task: JoinHandle<()>,
}

/// Owns the process-lifetime pieces: local API server, keepalive
/// coordinator, black-screen watchdog, and the tunnel supervisor. The
/// coordinator and connection info are shared handles that survive tunnel
/// reconnects.
pub struct AgentRuntime {
  config: Config,
  settings: JoinSettings,
  keepalive: Arc<KeepAliveManager>,
  server: Option<ServerHandle>,
  tunnel: Option<TunnelHandle>,
  black_screen: Option<BlackScreenHandle>,
  debug_logger: DebugLogger,
  console: ConsoleStatus,
  connection_info: Arc<Mutex<ConnectionInfo>>,
}

impl AgentRuntime {
  pub fn new(settings: JoinSettings) -> Result<Self> {
    let config = config::get_config()?;
    let debug_logger = DebugLogger::new(settings.debug)?;
    let console = ConsoleStatus::new();
    let keepalive = KeepAliveManager::new(
      settings.keepalive_enabled,
      settings.keepalive_threshold_minutes,
      settings.keepalive_click_x,
      settings.keepalive_click_y,
      debug_logger.clone(),
      console.clone(),
    );
    Ok(Self {
      config,
      settings,
      keepalive,
      server: None,
      tunnel: None,
      black_screen: None,
      debug_logger,
      console,
      connection_info: Arc::new(Mutex::new(ConnectionInfo::default())),
    })
  }

  pub fn console(&self) -> ConsoleStatus {
    self.console.clone()
  }

  pub fn fingerprint(&self) -> &str {
    &self.config.fingerprint
  }

  pub async fn start_local_server(&mut self, command: &str) -> Result<u16> {
    if let Some(server) = &self.server {
      return Ok(server.port);
    }
    let port = config::find_available_port("127.0.0.1", self.settings.target_port)
      .ok_or_else(|| CyberdriverError::RuntimeError("No available port found".into()))?;

    let state = ApiState::new(
      self.config.clone(),
      self.keepalive.clone(),
      self.debug_logger.clone(),
      self.connection_info.clone(),
    )?;
    let router = api::router(state);
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port)))
      .await
      .map_err(|err| CyberdriverError::RuntimeError(format!("Failed to bind server: {err}")))?;

    let stop = CancellationToken::new();
    let stop_signal = stop.clone();
    let task = tokio::spawn(async move {
      let _ = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
          stop_signal.cancelled().await;
        })
        .await;
    });

    self.server = Some(ServerHandle { port, stop, task });
    self
      .debug_logger
      .log("RUNTIME", "Local API started", &[("port", port.to_string())]);
    config::write_pid_info(RuntimePidInfo {
      pid: std::process::id(),
      command: command.to_string(),
      local_port: Some(port),
      cloud_host: self.settings.host.clone(),
      cloud_port: self.settings.port,
      version: None,
      started_at: None,
      frozen: None,
      argv: None,
    })?;

    Ok(port)
  }

  pub async fn stop_local_server(&mut self) -> Result<()> {
    if let Some(server) = self.server.take() {
      server.stop.cancel();
      let _ = tokio::time::timeout(Duration::from_secs(2), server.task).await;
      self.debug_logger.info("RUNTIME", "Local API stopped");
    }
    Ok(())
  }

  pub async fn connect_tunnel(&mut self) -> Result<u16> {
    if self.settings.secret.trim().is_empty() {
      return Err(CyberdriverError::RuntimeError("Missing API key".into()));
    }
    let local_port = self.start_local_server("join").await?;
    if self.tunnel.is_some() {
      return Ok(local_port);
    }

    let stop = CancellationToken::new();
    let stop_signal = stop.clone();
    let client = TunnelClient::new(
      self.settings.host.clone(),
      self.settings.port,
      self.settings.secret.clone(),
      local_port,
      self.config.clone(),
      self.keepalive.clone(),
      self.settings.register_as_keepalive_for.clone(),
      self.debug_logger.clone(),
      self.console.clone(),
      self.connection_info.clone(),
    );

    self
      .debug_logger
      .log("RUNTIME", "Tunnel connect requested", &[("host", self.settings.host.clone())]);
    let task = tokio::spawn(async move { client.run(stop_signal).await });
    self.tunnel = Some(TunnelHandle { stop, task: Some(task) });

    self.start_keepalive_if_enabled().await;
    self.start_black_screen_if_enabled().await;
    Ok(local_port)
  }

  /// Hand the tunnel supervisor's join handle to the caller; `shutdown`
  /// still cancels the supervisor through its token.
  pub fn take_tunnel_task(&mut self) -> Option<JoinHandle<TunnelExit>> {
    self.tunnel.as_mut().and_then(|handle| handle.task.take())
  }

  pub async fn start_keepalive_if_enabled(&mut self) {
    if self.settings.keepalive_enabled {
      self.keepalive.ensure_started().await;
    }
  }

  pub async fn start_black_screen_if_enabled(&mut self) {
    if !self.settings.black_screen_recovery {
      return;
    }
    if self.black_screen.is_some() {
      return;
    }
    let stop = CancellationToken::new();
    let stop_signal = stop.clone();
    let interval = self.settings.black_screen_check_interval;
    let logger = self.debug_logger.clone();
    let task = tokio::spawn(async move {
      black_screen::run_black_screen_recovery(stop_signal, interval, logger).await;
    });
    self.black_screen = Some(BlackScreenHandle { stop, task });
    self.debug_logger.info("RUNTIME", "Black screen recovery enabled");
  }

  pub async fn shutdown(&mut self) -> Result<()> {
    if let Some(tunnel) = self.tunnel.take() {
      tunnel.stop.cancel();
      if let Some(task) = tunnel.task {
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
      }
      self.debug_logger.info("RUNTIME", "Tunnel disconnected");
    }
    self.keepalive.stop().await;
    if let Some(handle) = self.black_screen.take() {
      handle.stop.cancel();
      let _ = tokio::time::timeout(Duration::from_secs(2), handle.task).await;
    }
    self.stop_local_server().await?;
    config::remove_pid_file()?;
    Ok(())
  }
}
