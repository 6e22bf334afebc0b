use serde_json::json;
use sysinfo::ProcessesToUpdate;

use super::config::{Config, ConnectionInfo};

/// Snapshot served by `GET /internal/diagnostics`: agent identity, tunnel
/// state, and process resource usage.
pub fn collect(config: &Config, connection: &ConnectionInfo) -> serde_json::Value {
  let pid = sysinfo::Pid::from(std::process::id() as usize);
  let mut system = sysinfo::System::new();
  let processes = [pid];
  system.refresh_processes(ProcessesToUpdate::Some(&processes), false);

  let mut diagnostics = json!({
    "pid": std::process::id(),
    "version": config.version,
    "fingerprint": config.fingerprint,
    "tunnel": {
      "connected": connection.connected,
      "host": connection.host,
      "port": connection.port,
      "last_error": connection.last_error,
    },
  });
  if let Some(proc) = system.process(pid) {
    diagnostics["memory_bytes"] = json!(proc.memory());
    diagnostics["virtual_memory_bytes"] = json!(proc.virtual_memory());
    diagnostics["cpu_usage"] = json!(proc.cpu_usage());
    diagnostics["start_time"] = json!(proc.start_time());
    diagnostics["memory_mb"] = json!(proc.memory() as f64 / (1024.0 * 1024.0));
  }

  #[cfg(windows)]
  {
    use windows::Win32::System::ProcessStatus::{GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS};
    use windows::Win32::System::Threading::GetCurrentProcess;
    use windows::Win32::UI::WindowsAndMessaging::GetGuiResources;
    use windows::Win32::UI::WindowsAndMessaging::{GR_GDIOBJECTS, GR_USEROBJECTS};
    unsafe {
      let handle = GetCurrentProcess();
      diagnostics["gdi_objects"] = json!(GetGuiResources(handle, GR_GDIOBJECTS));
      diagnostics["user_objects"] = json!(GetGuiResources(handle, GR_USEROBJECTS));
      let mut mem = PROCESS_MEMORY_COUNTERS::default();
      if GetProcessMemoryInfo(handle, &mut mem, std::mem::size_of::<PROCESS_MEMORY_COUNTERS>() as u32).as_bool() {
        diagnostics["working_set_bytes"] = json!(mem.WorkingSetSize);
      }
    }
  }

  diagnostics
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn snapshot_reports_identity_and_tunnel_state() {
    let config = Config {
      version: "1.2.3".to_string(),
      fingerprint: "fp-1".to_string(),
    };
    let connection = ConnectionInfo {
      host: Some("api.cyberdesk.io".to_string()),
      port: Some(443),
      connected: true,
      last_error: None,
    };
    let snapshot = collect(&config, &connection);
    assert_eq!(snapshot["version"], "1.2.3");
    assert_eq!(snapshot["fingerprint"], "fp-1");
    assert_eq!(snapshot["tunnel"]["connected"], true);
    assert_eq!(snapshot["pid"], std::process::id());
  }
}
