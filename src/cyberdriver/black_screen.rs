use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::logger::DebugLogger;

const FIRST_CHECK_DELAY: Duration = Duration::from_secs(5);
const RECHECK_DELAY: Duration = Duration::from_secs(5);
const MIN_INTERVAL_SECONDS: f64 = 5.0;

// A frozen RDP console renders as a near-uniform black frame; both bounds
// must hold before recovery fires.
const BLACK_VARIANCE_CEILING: f64 = 1.0;
const BLACK_MEAN_CEILING: f64 = 10.0;

/// Periodic screen-variance probe. Windows-only; on other platforms the task
/// exits immediately. A positive detection is re-checked once before the
/// recovery action runs, and capture failures are logged and swallowed.
pub async fn run_black_screen_recovery(
  stop: CancellationToken,
  check_interval_seconds: f64,
  logger: DebugLogger,
) {
  if !cfg!(windows) {
    return;
  }
  let interval = check_interval_seconds.max(MIN_INTERVAL_SECONDS);
  tokio::select! {
    _ = stop.cancelled() => return,
    _ = tokio::time::sleep(FIRST_CHECK_DELAY) => {}
  }
  if stop.is_cancelled() {
    return;
  }
  check_and_recover(&stop, &logger).await;

  loop {
    tokio::select! {
      _ = stop.cancelled() => return,
      _ = tokio::time::sleep(Duration::from_secs_f64(interval)) => {}
    }
    if stop.is_cancelled() {
      return;
    }
    check_and_recover(&stop, &logger).await;
  }
}

async fn check_and_recover(stop: &CancellationToken, logger: &DebugLogger) {
  if stop.is_cancelled() {
    return;
  }
  if !probe_screen(logger).await {
    return;
  }
  logger.info("BLACK_SCREEN", "Black screen suspected; re-checking");
  tokio::select! {
    _ = stop.cancelled() => return,
    _ = tokio::time::sleep(RECHECK_DELAY) => {}
  }
  if probe_screen(logger).await {
    logger.info("BLACK_SCREEN", "Black screen confirmed; running recovery");
    let _ = tokio::task::spawn_blocking(execute_console_switch).await;
  }
}

async fn probe_screen(logger: &DebugLogger) -> bool {
  match tokio::task::spawn_blocking(check_if_screen_black).await {
    Ok(Ok(is_black)) => is_black,
    Ok(Err(err)) => {
      logger.log("BLACK_SCREEN", "Capture failed", &[("error", err)]);
      false
    }
    Err(err) => {
      logger.log("BLACK_SCREEN", "Capture task failed", &[("error", err.to_string())]);
      false
    }
  }
}

fn check_if_screen_black() -> Result<bool, String> {
  let monitor = xcap::Monitor::all()
    .map_err(|err| err.to_string())?
    .pop()
    .ok_or_else(|| "no monitor available".to_string())?;
  let image = monitor.capture_image().map_err(|err| err.to_string())?;
  let bytes = image.as_raw();
  if bytes.is_empty() {
    return Err("empty capture buffer".to_string());
  }
  let (mean, variance) = rgb_stats(bytes);
  Ok(variance < BLACK_VARIANCE_CEILING && mean < BLACK_MEAN_CEILING)
}

// Single pass over the RGBA buffer, skipping the constant alpha channel.
fn rgb_stats(rgba: &[u8]) -> (f64, f64) {
  let mut sum = 0f64;
  let mut sum_sq = 0f64;
  let mut count = 0f64;
  for pixel in rgba.chunks_exact(4) {
    for &channel in &pixel[..3] {
      let v = channel as f64;
      sum += v;
      sum_sq += v * v;
      count += 1.0;
    }
  }
  if count == 0.0 {
    return (0.0, 0.0);
  }
  let mean = sum / count;
  let variance = (sum_sq / count) - (mean * mean);
  (mean, variance)
}

fn execute_console_switch() {
  if !cfg!(windows) {
    return;
  }
  let ps_script = r#"
$sessionId = (Get-Process -Id $PID).SessionId
function Invoke-Tscon {
    param($Id)
    & tscon $Id /dest:console
    $rc = $LASTEXITCODE
    if ($rc -ne 0) { throw "tscon exited with code $rc" }
}
$isAdmin = ([Security.Principal.WindowsPrincipal] [Security.Principal.WindowsIdentity]::GetCurrent()).IsInRole([Security.Principal.WindowsBuiltInRole]::Administrator)
if (-not $isAdmin) {
    Start-Process powershell -Verb RunAs -ArgumentList "-NoProfile -WindowStyle Hidden -Command `"& { tscon $sessionId /dest:console }`""
    return
}
Invoke-Tscon -Id $sessionId
"#;
  let _ = std::process::Command::new("powershell")
    .args(["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-Command"])
    .arg(ps_script)
    .output();
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn black_frame_is_below_both_ceilings() {
    let frame = vec![0u8, 0, 0, 255].repeat(64);
    let (mean, variance) = rgb_stats(&frame);
    assert!(mean < BLACK_MEAN_CEILING);
    assert!(variance < BLACK_VARIANCE_CEILING);
  }

  #[test]
  fn live_frame_exceeds_the_mean_ceiling() {
    let frame = vec![120u8, 80, 40, 255].repeat(64);
    let (mean, _) = rgb_stats(&frame);
    assert!(mean > BLACK_MEAN_CEILING);
  }

  #[test]
  fn noisy_dark_frame_exceeds_the_variance_ceiling() {
    let mut frame = Vec::new();
    for i in 0..64u8 {
      frame.extend_from_slice(&[i % 8, 0, 0, 255]);
    }
    let (mean, variance) = rgb_stats(&frame);
    assert!(mean < BLACK_MEAN_CEILING);
    assert!(variance > BLACK_VARIANCE_CEILING);
  }

  #[test]
  fn alpha_channel_is_ignored() {
    // Opaque alpha would push the mean to 63.75 if it were counted.
    let frame = vec![0u8, 0, 0, 255].repeat(256);
    let (mean, _) = rgb_stats(&frame);
    assert_eq!(mean, 0.0);
  }
}
