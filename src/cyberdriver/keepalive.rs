use std::{
  sync::Arc,
  time::{Duration, Instant},
};

use rand::seq::SliceRandom;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use enigo::{Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};

use crate::error::Result;

use super::logger::{ConsoleStatus, DebugLogger};

// Remote activity marks and post-action cooldowns are jittered so several
// instances behind the same VDI broker never act in lockstep.
const ACTIVITY_JITTER_SECS: f64 = 7.0;

/// Injects simulated user activity on idle machines so RDP/Citrix sessions
/// are not reaped, while guaranteeing no overlap with real inbound traffic:
/// dispatches wait on `wait_until_idle`, the scheduler re-checks eligibility
/// at its deadline before touching the input devices.
#[derive(Clone)]
pub struct KeepAliveManager {
  state: Arc<Mutex<KeepAliveState>>,
  schedule_notify: Arc<Notify>,
  idle_notify: Arc<Notify>,
  task: Arc<Mutex<Option<JoinHandle<()>>>>,
  logger: DebugLogger,
  console: ConsoleStatus,
}

struct KeepAliveState {
  enabled: bool,
  threshold_seconds: f64,
  last_activity: Instant,
  next_allowed: Instant,
  busy: bool,
  click_x: Option<i32>,
  click_y: Option<i32>,
  stop: bool,
}

impl KeepAliveManager {
  pub fn new(
    enabled: bool,
    threshold_minutes: f64,
    click_x: Option<i32>,
    click_y: Option<i32>,
    logger: DebugLogger,
    console: ConsoleStatus,
  ) -> Arc<Self> {
    let threshold_seconds = (threshold_minutes.max(0.1)) * 60.0;
    let now = Instant::now();
    Arc::new(Self {
      state: Arc::new(Mutex::new(KeepAliveState {
        enabled,
        threshold_seconds,
        last_activity: now,
        next_allowed: now + Duration::from_secs_f64(threshold_seconds),
        busy: false,
        click_x,
        click_y,
        stop: false,
      })),
      schedule_notify: Arc::new(Notify::new()),
      idle_notify: Arc::new(Notify::new()),
      task: Arc::new(Mutex::new(None)),
      logger,
      console,
    })
  }

  pub async fn set_enabled(self: &Arc<Self>, enabled: bool) {
    {
      let mut state = self.state.lock().await;
      state.enabled = enabled;
      state.next_allowed = Instant::now() + Duration::from_secs_f64(state.threshold_seconds);
    }
    if enabled {
      self.ensure_started().await;
    } else {
      self.console.clear_line();
    }
    self.schedule_notify.notify_waiters();
    self.logger.log(
      "KEEPALIVE",
      if enabled { "Enabled" } else { "Disabled" },
      &[],
    );
  }

  pub async fn is_enabled(&self) -> bool {
    self.state.lock().await.enabled
  }

  /// Real traffic passed through the tunnel; push the idle deadline out.
  pub async fn record_activity(&self) {
    let mut state = self.state.lock().await;
    state.last_activity = Instant::now();
    state.next_allowed = state.last_activity + Duration::from_secs_f64(state.threshold_seconds);
    drop(state);
    self.schedule_notify.notify_waiters();
  }

  /// Activity reported by the remote-control endpoint. The small backwards
  /// jitter keeps co-located instances from synchronizing their schedules.
  pub async fn record_remote_activity(&self) {
    let jitter = rand::random::<f64>() * (2.0 * ACTIVITY_JITTER_SECS) - ACTIVITY_JITTER_SECS;
    let mut state = self.state.lock().await;
    state.last_activity = Instant::now();
    let cooldown = (state.threshold_seconds + jitter).max(0.0);
    state.next_allowed = state.last_activity + Duration::from_secs_f64(cooldown);
    drop(state);
    self.schedule_notify.notify_waiters();
  }

  /// Blocks while a simulated-activity action is running. Dispatches call
  /// this before touching the local origin.
  pub async fn wait_until_idle(&self) {
    loop {
      {
        let state = self.state.lock().await;
        if !state.busy {
          return;
        }
      }
      self.idle_notify.notified().await;
    }
  }

  pub async fn ensure_started(self: &Arc<Self>) {
    let mut guard = self.task.lock().await;
    if guard.is_some() {
      return;
    }
    let manager = Arc::clone(self);
    let task = tokio::spawn(async move {
      manager.run_loop().await;
    });
    *guard = Some(task);
  }

  pub async fn stop(&self) {
    {
      let mut state = self.state.lock().await;
      state.stop = true;
      state.enabled = false;
    }
    self.console.clear_line();
    self.schedule_notify.notify_waiters();
    let mut guard = self.task.lock().await;
    if let Some(task) = guard.take() {
      let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }
  }

  async fn run_loop(self: Arc<Self>) {
    'outer: loop {
      let (enabled, deadline, stop) = {
        let state = self.state.lock().await;
        (state.enabled, state.next_allowed, state.stop)
      };
      if stop {
        break;
      }
      if !enabled {
        self.schedule_notify.notified().await;
        continue;
      }

      // Count down to the deadline, redrawing the status line once a
      // second. Any schedule event restarts the loop with a fresh deadline.
      loop {
        let now = Instant::now();
        if now >= deadline {
          break;
        }
        let remaining = deadline - now;
        self
          .console
          .set_line(format!("keepalive action in {}s", remaining.as_secs().max(1)));
        let tick = remaining.min(Duration::from_secs(1));
        tokio::select! {
          _ = tokio::time::sleep(tick) => {}
          _ = self.schedule_notify.notified() => continue 'outer,
        }
      }

      // Deadline reached; re-check eligibility before acting.
      let (click_x, click_y) = {
        let mut state = self.state.lock().await;
        if !state.enabled || state.stop || Instant::now() < state.next_allowed {
          continue;
        }
        state.busy = true;
        (state.click_x, state.click_y)
      };
      self.console.clear_line();
      let result =
        tokio::task::spawn_blocking(move || Self::perform_keepalive_action(click_x, click_y)).await;
      match result {
        Ok(Ok(())) => self.logger.info("KEEPALIVE", "Simulated activity performed"),
        Ok(Err(err)) => self.logger.log(
          "KEEPALIVE",
          "Simulated activity failed",
          &[("error", err.to_string())],
        ),
        Err(err) => self.logger.log(
          "KEEPALIVE",
          "Simulated activity panicked",
          &[("error", err.to_string())],
        ),
      }
      {
        let mut state = self.state.lock().await;
        state.busy = false;
        let jitter = rand::random::<f64>() * (2.0 * ACTIVITY_JITTER_SECS) - ACTIVITY_JITTER_SECS;
        let cooldown = (state.threshold_seconds + jitter).max(0.0);
        state.next_allowed = Instant::now() + Duration::from_secs_f64(cooldown);
      }
      self.idle_notify.notify_waiters();
    }
  }

  // Focus-click in a screen corner, type a few human-looking tokens, then
  // Escape so no window is left with stray text. Must not touch the
  // clipboard.
  fn perform_keepalive_action(click_x: Option<i32>, click_y: Option<i32>) -> Result<()> {
    let mut enigo = Enigo::new(&Settings::default())?;
    let mut phrases = vec![
      "cookies", "checking notes", "be right back", "just a sec", "one moment", "thinking",
      "hmm", "on it", "almost there", "nearly done", "okay", "ok", "sure", "yep", "cool",
      "thanks", "working", "system settings", "logs", "utilities", "reports", "status",
      "calendar", "updates", "notepad", "calculator", "network",
    ];
    let mut rng = rand::rng();
    phrases.shuffle(&mut rng);
    let count = (rand::random::<u8>() % 4) + 2;
    let chosen = phrases.into_iter().take(count as usize).collect::<Vec<_>>();

    let screen = xcap::Monitor::all()
      .ok()
      .and_then(|mut monitors| monitors.pop())
      .and_then(|m| match (m.width(), m.height()) {
        (Ok(w), Ok(h)) => Some((w as i32, h as i32)),
        _ => None,
      });
    let (_width, height) = screen.unwrap_or((1920, 1080));

    let (click_x, click_y) = match (click_x, click_y) {
      (Some(x), Some(y)) => (x, y),
      _ => (
        rand::random::<i32>().abs() % 3 + 1,
        height - (rand::random::<i32>().abs() % 3 + 1),
      ),
    };
    enigo.move_mouse(click_x, click_y, Coordinate::Abs)?;
    enigo.button(enigo::Button::Left, Direction::Click)?;

    for phrase in chosen {
      enigo.text(phrase)?;
      std::thread::sleep(Duration::from_millis(80));
    }
    enigo.key(Key::Escape, Direction::Click)?;
    Ok(())
  }

  #[cfg(test)]
  pub(crate) async fn force_busy(&self, busy: bool) {
    {
      let mut state = self.state.lock().await;
      state.busy = busy;
    }
    if !busy {
      self.idle_notify.notify_waiters();
    }
  }

  #[cfg(test)]
  async fn next_allowed_in(&self) -> Duration {
    let state = self.state.lock().await;
    state.next_allowed.saturating_duration_since(Instant::now())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn manager(threshold_minutes: f64) -> Arc<KeepAliveManager> {
    let logger = DebugLogger::new(false).unwrap();
    KeepAliveManager::new(false, threshold_minutes, None, None, logger, ConsoleStatus::new())
  }

  #[tokio::test]
  async fn wait_until_idle_returns_immediately_when_not_busy() {
    let manager = manager(3.0);
    tokio::time::timeout(Duration::from_millis(100), manager.wait_until_idle())
      .await
      .expect("must not block while idle");
  }

  #[tokio::test]
  async fn wait_until_idle_blocks_while_busy() {
    let manager = manager(3.0);
    manager.force_busy(true).await;
    let blocked =
      tokio::time::timeout(Duration::from_millis(50), manager.wait_until_idle()).await;
    assert!(blocked.is_err());

    let waiter = {
      let manager = Arc::clone(&manager);
      tokio::spawn(async move { manager.wait_until_idle().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.force_busy(false).await;
    tokio::time::timeout(Duration::from_secs(1), waiter)
      .await
      .expect("released waiter")
      .unwrap();
  }

  #[tokio::test]
  async fn activity_pushes_the_deadline_out() {
    let manager = manager(3.0);
    let before = manager.next_allowed_in().await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    manager.record_activity().await;
    let after = manager.next_allowed_in().await;
    assert!(after >= before - Duration::from_millis(20));
  }

  #[tokio::test]
  async fn remote_activity_jitter_stays_within_seven_seconds() {
    let manager = manager(3.0);
    for _ in 0..32 {
      manager.record_remote_activity().await;
      let remaining = manager.next_allowed_in().await.as_secs_f64();
      assert!(remaining >= 180.0 - ACTIVITY_JITTER_SECS - 1.0);
      assert!(remaining <= 180.0 + ACTIVITY_JITTER_SECS + 1.0);
    }
  }

  #[tokio::test]
  async fn set_enabled_flips_the_flag() {
    let manager = manager(3.0);
    assert!(!manager.is_enabled().await);
    manager.set_enabled(true).await;
    assert!(manager.is_enabled().await);
    manager.stop().await;
    assert!(!manager.is_enabled().await);
  }
}
