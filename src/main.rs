mod cyberdriver;
mod error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use cyberdriver::{
  daemon, AgentRuntime, JoinSettings, TunnelExit, DEFAULT_BLACK_SCREEN_INTERVAL_SECONDS,
  DEFAULT_HOST, DEFAULT_KEEPALIVE_THRESHOLD_MINUTES, DEFAULT_PORT, DEFAULT_TARGET_PORT,
};

#[derive(Parser)]
#[command(name = "cyberdriver", about = "Cyberdriver: remote computer control agent", version)]
struct Args {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Run the local computer-control API server only.
  Start {
    /// Port for the local API server (first free port at or above this).
    #[arg(long, default_value_t = DEFAULT_TARGET_PORT)]
    port: u16,
    /// Write debug logs under the config directory.
    #[arg(long)]
    debug: bool,
  },
  /// Connect to the control plane and serve remote requests.
  Join {
    /// API key for authentication.
    #[arg(long)]
    secret: String,
    /// Control server host.
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,
    /// Control server port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Local API port (first free port at or above this).
    #[arg(long, default_value_t = DEFAULT_TARGET_PORT)]
    target_port: u16,
    /// Periodically simulate user activity while idle.
    #[arg(long)]
    keepalive: bool,
    /// Idle minutes before a simulated-activity action.
    #[arg(long, default_value_t = DEFAULT_KEEPALIVE_THRESHOLD_MINUTES)]
    keepalive_threshold_minutes: f64,
    /// Fixed x coordinate for the keepalive focus click.
    #[arg(long)]
    keepalive_click_x: Option<i32>,
    /// Fixed y coordinate for the keepalive focus click.
    #[arg(long)]
    keepalive_click_y: Option<i32>,
    /// Recover the console session when the screen goes black (Windows).
    #[arg(long)]
    black_screen_recovery: bool,
    /// Seconds between black-screen checks.
    #[arg(long, default_value_t = DEFAULT_BLACK_SCREEN_INTERVAL_SECONDS)]
    black_screen_check_interval: f64,
    /// Act as a keepalive proxy for another machine id.
    #[arg(long)]
    register_as_keepalive_for: Option<String>,
    /// Stay attached to this terminal instead of detaching (Windows).
    #[arg(long)]
    foreground: bool,
    /// Write debug logs under the config directory.
    #[arg(long)]
    debug: bool,
  },
  /// Stop a running instance via its PID file.
  Stop {
    /// Skip the safety check that the PID belongs to a cyberdriver.
    #[arg(long)]
    force: bool,
    /// Seconds to wait for graceful shutdown before killing (POSIX).
    #[arg(long, default_value_t = 10)]
    timeout: u64,
  },
  /// Tail the detached-mode log file.
  Logs {
    /// Log file to tail; defaults to the detached stdio log.
    #[arg(long)]
    path: Option<PathBuf>,
  },
}

#[tokio::main]
async fn main() {
  // With more than one rustls crypto backend in the dependency graph, the
  // TLS config builder needs a process-wide default pinned up front.
  let _ = rustls::crypto::ring::default_provider().install_default();
  let args = Args::parse();
  let code = match args.command {
    Command::Start { port, debug } => run_start(port, debug).await,
    Command::Join {
      secret,
      host,
      port,
      target_port,
      keepalive,
      keepalive_threshold_minutes,
      keepalive_click_x,
      keepalive_click_y,
      black_screen_recovery,
      black_screen_check_interval,
      register_as_keepalive_for,
      foreground,
      debug,
    } => {
      let settings = JoinSettings {
        host,
        port,
        secret,
        target_port,
        keepalive_enabled: keepalive,
        keepalive_threshold_minutes,
        keepalive_click_x,
        keepalive_click_y,
        black_screen_recovery,
        black_screen_check_interval,
        register_as_keepalive_for,
        debug,
      };
      run_join(settings, foreground).await
    }
    Command::Stop { force, timeout } => run_stop(force, timeout),
    Command::Logs { path } => run_logs(path).await,
  };
  std::process::exit(code);
}

async fn run_start(port: u16, debug: bool) -> i32 {
  let settings = JoinSettings {
    target_port: port,
    debug,
    ..JoinSettings::default()
  };
  let mut runtime = match AgentRuntime::new(settings) {
    Ok(runtime) => runtime,
    Err(err) => {
      eprintln!("Failed to initialize: {err}");
      return 1;
    }
  };
  let bound = match runtime.start_local_server("start").await {
    Ok(port) => port,
    Err(err) => {
      eprintln!("Failed to start local server: {err}");
      return 1;
    }
  };
  println!("Local server running at http://127.0.0.1:{bound}");
  let _ = tokio::signal::ctrl_c().await;
  let _ = runtime.shutdown().await;
  0
}

async fn run_join(settings: JoinSettings, foreground: bool) -> i32 {
  if let Some(existing) = daemon::find_running_instance() {
    println!(
      "Cyberdriver is already running (pid {}, started {}).",
      existing.pid,
      existing.started_at.as_deref().unwrap_or("unknown")
    );
    println!("Use `cyberdriver stop` to stop it first.");
    return 0;
  }

  // Windows `join` detaches by default so the agent survives the terminal.
  if cfg!(windows) && !foreground && !daemon::is_daemon_child() {
    match daemon::spawn_detached() {
      Ok(pid) => {
        println!("Cyberdriver running in background (pid {pid}).");
        println!("Logs: {}", daemon::stdio_log_path().display());
        return 0;
      }
      Err(err) => {
        eprintln!("Could not detach ({err}); continuing in the foreground.");
      }
    }
  }

  let mut runtime = match AgentRuntime::new(settings) {
    Ok(runtime) => runtime,
    Err(err) => {
      eprintln!("Failed to initialize: {err}");
      return 1;
    }
  };
  let console = runtime.console();
  match runtime.connect_tunnel().await {
    Ok(port) => {
      console.println(&format!("Local server running at http://127.0.0.1:{port}"));
      console.println(&format!("Machine fingerprint: {}", runtime.fingerprint()));
    }
    Err(err) => {
      eprintln!("Failed to start: {err}");
      return 1;
    }
  }

  let mut tunnel_task = runtime.take_tunnel_task();
  let exit = tokio::select! {
    _ = tokio::signal::ctrl_c() => None,
    exit = async {
      match tunnel_task.as_mut() {
        Some(task) => task.await.unwrap_or(TunnelExit::Cancelled),
        None => std::future::pending().await,
      }
    } => Some(exit),
  };
  let _ = runtime.shutdown().await;
  match exit {
    Some(TunnelExit::AuthFailed) => 1,
    _ => 0,
  }
}

fn run_stop(force: bool, timeout: u64) -> i32 {
  match daemon::stop_running_instance(force, timeout) {
    Ok(daemon::StopOutcome::Stopped(pid)) => {
      println!("Stopped cyberdriver (pid {pid}).");
      0
    }
    Ok(daemon::StopOutcome::NotRunning) => {
      println!("No running cyberdriver instance found.");
      0
    }
    Ok(daemon::StopOutcome::Refused(reason)) => {
      eprintln!("Refusing to stop: {reason}");
      2
    }
    Err(err) => {
      eprintln!("Stop failed: {err}");
      1
    }
  }
}

async fn run_logs(path: Option<PathBuf>) -> i32 {
  let path = path.unwrap_or_else(daemon::stdio_log_path);
  if !path.exists() {
    eprintln!("No log file at {}", path.display());
    eprintln!("Detached logs appear after `cyberdriver join` runs in the background.");
    return 1;
  }
  match daemon::tail_log(&path).await {
    Ok(()) => 0,
    Err(err) => {
      eprintln!("Log tail failed: {err}");
      1
    }
  }
}
