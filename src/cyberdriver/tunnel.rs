use std::{
  sync::Arc,
  time::{Duration, Instant},
};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, HeaderValue};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tungstenite::{
  client::IntoClientRequest,
  protocol::{frame::CloseFrame, WebSocketConfig},
  Error as WsError, Message,
};

use crate::error::{CyberdriverError, Result};

use super::{
  config::{Config, ConnectionInfo},
  forward::Forwarder,
  frame::{response_frames, RequestAssembler, RequestMeta, ResponseMeta},
  idempotency::{idempotency_key, IdempotencyCache},
  keepalive::KeepAliveManager,
  logger::{ConsoleStatus, DebugLogger},
};

const PING_INTERVAL: Duration = Duration::from_secs(20);
const PING_TIMEOUT: Duration = Duration::from_secs(20);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);
const CLEANUP_BUDGET: Duration = Duration::from_millis(250);
const DISPATCH_QUEUE_LIMIT: usize = 32;

// Connections that die faster than this count as consecutive failures;
// anything longer resets the backoff to its minimum.
const STABLE_CONNECTION: Duration = Duration::from_secs(10);
const MAX_BACKOFF_SECS: u64 = 16;
const MAX_JITTER_RATIO: f64 = 0.3;
const DEFAULT_RATE_LIMIT_WAIT_SECS: u64 = 60;

const AUTH_CLOSE_CODE: u16 = 4001;
const RATE_LIMIT_CLOSE_CODE: u16 = 4008;

/// Why one WebSocket session ended. The supervisor's retry policy is a pure
/// function of this value plus the session's lifetime.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionTermination {
  AuthFailed,
  RateLimited(u64),
  ProtocolError(String),
  TransportError(String),
  Closed(String),
}

impl std::fmt::Display for SessionTermination {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::AuthFailed => write!(f, "authentication failed"),
      Self::RateLimited(secs) => write!(f, "rate limited for {secs}s"),
      Self::ProtocolError(detail) => write!(f, "protocol error: {detail}"),
      Self::TransportError(detail) => write!(f, "transport error: {detail}"),
      Self::Closed(detail) => write!(f, "closed: {detail}"),
    }
  }
}

/// How the supervisor itself ended; anything recoverable never surfaces here.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TunnelExit {
  AuthFailed,
  Cancelled,
}

/// Owns the reconnect loop and at most one live tunnel session at a time.
/// The keepalive coordinator, idempotency cache, and forwarder are shared
/// across sessions; each retry gets a fresh socket and TLS configuration.
pub struct TunnelClient {
  host: String,
  port: u16,
  secret: String,
  config: Config,
  keepalive: Arc<KeepAliveManager>,
  remote_keepalive_for: Option<String>,
  debug_logger: DebugLogger,
  console: ConsoleStatus,
  connection_info: Arc<Mutex<ConnectionInfo>>,
  idempotency: Arc<IdempotencyCache>,
  forwarder: Arc<Forwarder>,
}

impl TunnelClient {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    host: String,
    port: u16,
    secret: String,
    target_port: u16,
    config: Config,
    keepalive: Arc<KeepAliveManager>,
    remote_keepalive_for: Option<String>,
    debug_logger: DebugLogger,
    console: ConsoleStatus,
    connection_info: Arc<Mutex<ConnectionInfo>>,
  ) -> Self {
    Self {
      host,
      port,
      secret,
      config,
      keepalive,
      remote_keepalive_for,
      debug_logger,
      console,
      connection_info,
      idempotency: Arc::new(IdempotencyCache::new()),
      forwarder: Arc::new(Forwarder::new(target_port)),
    }
  }

  pub async fn run(self, stop: CancellationToken) -> TunnelExit {
    let mut consecutive_failures: u32 = 0;
    let mut attempt: usize = 0;
    loop {
      if stop.is_cancelled() {
        self.mark_disconnected(None).await;
        return TunnelExit::Cancelled;
      }
      attempt += 1;
      self.pre_retry_cleanup().await;

      let connection_start = Instant::now();
      let termination = self.connect_and_run(attempt, stop.clone()).await;
      let duration = connection_start.elapsed();
      self.mark_disconnected(Some(termination.to_string())).await;
      self
        .debug_logger
        .connection_closed(&termination.to_string(), duration.as_secs_f64(), None);
      if stop.is_cancelled() {
        return TunnelExit::Cancelled;
      }

      match termination {
        SessionTermination::AuthFailed => {
          self.console.println("Authentication Failed: the control plane rejected this machine.");
          self
            .console
            .println("Check that the secret passed to `cyberdriver join --secret` is still valid.");
          return TunnelExit::AuthFailed;
        }
        SessionTermination::RateLimited(secs) => {
          // Server-directed wait; the backoff counter is untouched.
          self
            .console
            .println(&format!("Rate limited by the control plane; reconnecting in {secs}s"));
          tokio::select! {
            _ = stop.cancelled() => return TunnelExit::Cancelled,
            _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
          }
        }
        _ => {
          if duration < STABLE_CONNECTION {
            consecutive_failures += 1;
          } else {
            consecutive_failures = 0;
          }
          let delay = backoff_delay(consecutive_failures, rand::random::<f64>());
          self.console.println(&format!(
            "Tunnel disconnected ({termination}); retrying in {:.1}s",
            delay.as_secs_f64()
          ));
          tokio::select! {
            _ = stop.cancelled() => return TunnelExit::Cancelled,
            _ = tokio::time::sleep(delay) => {}
          }
        }
      }
    }
  }

  // The same housekeeping a Ctrl+C + restart would do, on every attempt:
  // drop memoized responses and the forwarder's pooled connections.
  async fn pre_retry_cleanup(&self) {
    let start = Instant::now();
    self.idempotency.clear().await;
    self.forwarder.recycle().await;
    let elapsed = start.elapsed();
    if elapsed > CLEANUP_BUDGET {
      self.debug_logger.log(
        "CONNECTION",
        "Pre-retry cleanup exceeded budget",
        &[("elapsed_ms", format!("{:.1}", elapsed.as_secs_f64() * 1000.0))],
      );
    }
  }

  async fn mark_disconnected(&self, last_error: Option<String>) {
    let mut info = self.connection_info.lock().await;
    info.connected = false;
    if last_error.is_some() {
      info.last_error = last_error;
    }
  }

  async fn connect_and_run(&self, attempt: usize, stop: CancellationToken) -> SessionTermination {
    let host = self
      .host
      .trim_start_matches("https://")
      .trim_start_matches("http://")
      .trim_end_matches('/');
    let uri = format!("wss://{host}:{}/tunnel/ws", self.port);
    self.debug_logger.connection_attempt(&uri, attempt);

    {
      let mut info = self.connection_info.lock().await;
      info.host = Some(host.to_string());
      info.port = Some(self.port);
    }

    let request = match self.handshake_request(&uri) {
      Ok(request) => request,
      Err(err) => return SessionTermination::TransportError(err.to_string()),
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = None;
    ws_config.max_frame_size = None;
    ws_config.accept_unmasked_frames = false;

    // Fresh TLS state per attempt. Cached sessions have been observed to
    // poison reconnects behind some proxies.
    let connector = build_tls_connector();
    let connect = tokio_tungstenite::connect_async_tls_with_config(
      request,
      Some(ws_config),
      false,
      Some(connector),
    );
    let connect_result = tokio::select! {
      _ = stop.cancelled() => return SessionTermination::Closed("cancelled".into()),
      result = connect => result,
    };
    let (ws_stream, _) = match connect_result {
      Ok(value) => value,
      Err(WsError::Http(response)) if response.status() == http::StatusCode::FORBIDDEN => {
        return SessionTermination::AuthFailed;
      }
      Err(err) => return SessionTermination::TransportError(format!("Connection failed: {err}")),
    };

    self.debug_logger.connection_established(&uri);
    self.console.println("Connected to control server");
    {
      let mut info = self.connection_info.lock().await;
      info.connected = true;
      info.last_error = None;
    }

    let (write, read) = ws_stream.split();
    // All outbound frames pass through one writer task, so a response's
    // meta/chunks/end sequence is never interleaved with another's.
    let (frame_tx, frame_rx) = mpsc::channel::<Vec<Message>>(DISPATCH_QUEUE_LIMIT);
    let mut writer = tokio::spawn(write_frames(write, frame_rx));

    let mut dispatches = JoinSet::new();
    let termination = self
      .receive_loop(read, &frame_tx, &mut dispatches, stop)
      .await;

    // Client-side close handshake: give in-flight dispatches the close
    // budget to flush, then send the close frame and let the writer drain.
    let drain = async {
      while dispatches.join_next().await.is_some() {}
    };
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, drain).await;
    dispatches.abort_all();
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, frame_tx.send(vec![Message::Close(None)])).await;
    drop(frame_tx);
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await;
    writer.abort();

    termination
  }

  fn handshake_request(&self, uri: &str) -> Result<tungstenite::handshake::client::Request> {
    let mut request = uri
      .into_client_request()
      .map_err(|err| CyberdriverError::RuntimeError(err.to_string()))?;
    let headers = request.headers_mut();
    set_header(headers, "Authorization", format!("Bearer {}", self.secret))?;
    set_header(headers, "X-PIGLET-FINGERPRINT", self.config.fingerprint.clone())?;
    set_header(headers, "X-PIGLET-VERSION", self.config.version.clone())?;
    if let Some(main_id) = &self.remote_keepalive_for {
      set_header(headers, "X-Remote-Keepalive-For", main_id.clone())?;
    }
    Ok(request)
  }

  async fn receive_loop<R>(
    &self,
    mut read: R,
    frame_tx: &mpsc::Sender<Vec<Message>>,
    dispatches: &mut JoinSet<()>,
    stop: CancellationToken,
  ) -> SessionTermination
  where
    R: futures_util::Stream<Item = std::result::Result<Message, WsError>> + Unpin,
  {
    let mut assembler = RequestAssembler::default();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.reset();
    let mut last_inbound = Instant::now();

    loop {
      tokio::select! {
        _ = stop.cancelled() => {
          return SessionTermination::Closed("cancelled".into());
        }
        _ = ping.tick() => {
          if last_inbound.elapsed() > PING_INTERVAL + PING_TIMEOUT {
            return SessionTermination::TransportError("ping timeout".into());
          }
          if frame_tx.send(vec![Message::Ping(Bytes::new())]).await.is_err() {
            return SessionTermination::TransportError("writer closed".into());
          }
        }
        msg = read.next() => {
          let msg = match msg {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => return SessionTermination::TransportError(err.to_string()),
            None => return SessionTermination::Closed("connection closed".into()),
          };
          last_inbound = Instant::now();
          match msg {
            Message::Text(text) => {
              match assembler.push_text(&text) {
                Err(violation) => return SessionTermination::ProtocolError(violation.to_string()),
                Ok(Some((meta, body))) => {
                  self.keepalive.record_activity().await;
                  self.spawn_dispatch(dispatches, frame_tx.clone(), meta, body);
                }
                Ok(None) => {
                  self.keepalive.record_activity().await;
                }
              }
            }
            Message::Binary(bytes) => {
              if let Err(violation) = assembler.push_binary(bytes) {
                return SessionTermination::ProtocolError(violation.to_string());
              }
            }
            Message::Close(frame) => {
              return classify_close_frame(frame);
            }
            _ => {}
          }
        }
      }
    }
  }

  fn spawn_dispatch(
    &self,
    dispatches: &mut JoinSet<()>,
    frame_tx: mpsc::Sender<Vec<Message>>,
    meta: RequestMeta,
    body: Vec<u8>,
  ) {
    let forwarder = Arc::clone(&self.forwarder);
    let idempotency = Arc::clone(&self.idempotency);
    let keepalive = Arc::clone(&self.keepalive);
    let logger = self.debug_logger.clone();
    dispatches.spawn(async move {
      dispatch_request(forwarder, idempotency, keepalive, logger, frame_tx, meta, body).await;
    });
  }
}

/// One remote request, end to end: wait out any keepalive action, consult the
/// idempotency cache, forward, and push the complete response frame sequence
/// to the serializing writer.
async fn dispatch_request(
  forwarder: Arc<Forwarder>,
  idempotency: Arc<IdempotencyCache>,
  keepalive: Arc<KeepAliveManager>,
  logger: DebugLogger,
  frame_tx: mpsc::Sender<Vec<Message>>,
  meta: RequestMeta,
  body: Vec<u8>,
) {
  let start = Instant::now();
  keepalive.wait_until_idle().await;
  keepalive.record_activity().await;

  let key = idempotency_key(meta.headers.as_ref());
  let mut replayed = false;
  let response = match &key {
    Some(key) => match idempotency.lookup(key).await {
      Some(cached) => {
        replayed = true;
        cached
      }
      None => {
        let response = forwarder.forward(&meta, &body).await;
        idempotency.store(key.clone(), response.clone()).await;
        response
      }
    },
    None => forwarder.forward(&meta, &body).await,
  };

  if replayed {
    logger.log(
      "REQUEST",
      "Replayed from idempotency cache",
      &[("path", meta.path.clone()), ("status", response.status.to_string())],
    );
  } else {
    logger.request_forwarded(
      &meta.method,
      &meta.path,
      response.status,
      start.elapsed().as_secs_f64() * 1000.0,
    );
  }

  let resp_meta = ResponseMeta {
    request_id: &meta.request_id,
    status: response.status,
    headers: response.headers.clone(),
  };
  match response_frames(&resp_meta, &response.body) {
    Ok(frames) => {
      let _ = frame_tx.send(frames).await;
    }
    Err(err) => {
      logger.log(
        "REQUEST",
        "Failed to encode response",
        &[("error", err.to_string())],
      );
    }
  }
}

async fn write_frames<S>(
  mut write: S,
  mut frame_rx: mpsc::Receiver<Vec<Message>>,
) -> std::result::Result<(), WsError>
where
  S: futures_util::Sink<Message, Error = WsError> + Unpin,
{
  while let Some(frames) = frame_rx.recv().await {
    let closing = frames.iter().any(|frame| matches!(frame, Message::Close(_)));
    for frame in frames {
      write.send(frame).await?;
    }
    if closing {
      break;
    }
  }
  write.close().await
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: String) -> Result<()> {
  let header =
    HeaderValue::from_str(&value).map_err(|err| CyberdriverError::RuntimeError(err.to_string()))?;
  headers.insert(name, header);
  Ok(())
}

fn build_tls_connector() -> tokio_tungstenite::Connector {
  let mut roots = rustls::RootCertStore::empty();
  for cert in rustls_native_certs::load_native_certs().certs {
    let _ = roots.add(cert);
  }
  let tls = rustls::ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  tokio_tungstenite::Connector::Rustls(Arc::new(tls))
}

fn classify_close_frame(frame: Option<CloseFrame>) -> SessionTermination {
  let frame = match frame {
    Some(frame) => frame,
    None => return SessionTermination::Closed("closed without close frame".into()),
  };
  let code = u16::from(frame.code);
  match code {
    AUTH_CLOSE_CODE => SessionTermination::AuthFailed,
    RATE_LIMIT_CLOSE_CODE => SessionTermination::RateLimited(
      parse_wait_seconds(&frame.reason).unwrap_or(DEFAULT_RATE_LIMIT_WAIT_SECS),
    ),
    _ => SessionTermination::Closed(format!("close code {code}: {}", frame.reason)),
  }
}

// Reason strings look like "Wait 12 seconds"; take the first integer.
fn parse_wait_seconds(reason: &str) -> Option<u64> {
  reason
    .split(|c: char| !c.is_ascii_digit())
    .find(|part| !part.is_empty())
    .and_then(|part| part.parse().ok())
}

/// Backoff for the i-th consecutive failure: 1 s doubling up to 16 s, plus
/// 0-30 % jitter. `jitter` is a uniform sample from [0, 1).
fn backoff_delay(consecutive_failures: u32, jitter: f64) -> Duration {
  let exponent = consecutive_failures.saturating_sub(1).min(4);
  let base = (1u64 << exponent).min(MAX_BACKOFF_SECS);
  Duration::from_secs_f64(base as f64 * (1.0 + jitter.clamp(0.0, 1.0) * MAX_JITTER_RATIO))
}

#[cfg(test)]
mod tests {
  use super::*;

  use tungstenite::protocol::frame::coding::CloseCode;

  fn close(code: u16, reason: &str) -> Option<CloseFrame> {
    Some(CloseFrame {
      code: CloseCode::from(code),
      reason: reason.to_string().into(),
    })
  }

  #[test]
  fn close_4001_is_auth_failure() {
    assert_eq!(
      classify_close_frame(close(4001, "invalid secret")),
      SessionTermination::AuthFailed
    );
  }

  #[test]
  fn close_4008_parses_the_wait_duration() {
    assert_eq!(
      classify_close_frame(close(4008, "Wait 12 seconds")),
      SessionTermination::RateLimited(12)
    );
  }

  #[test]
  fn close_4008_without_duration_defaults_to_sixty() {
    assert_eq!(
      classify_close_frame(close(4008, "slow down")),
      SessionTermination::RateLimited(60)
    );
  }

  #[test]
  fn other_close_codes_are_ordinary_closes() {
    assert!(matches!(
      classify_close_frame(close(1000, "bye")),
      SessionTermination::Closed(_)
    ));
    assert!(matches!(
      classify_close_frame(None),
      SessionTermination::Closed(_)
    ));
  }

  #[test]
  fn wait_seconds_takes_the_first_integer() {
    assert_eq!(parse_wait_seconds("Wait 12 seconds"), Some(12));
    assert_eq!(parse_wait_seconds("Wait 0 seconds"), Some(0));
    assert_eq!(parse_wait_seconds("retry in 45s (burst 3)"), Some(45));
    assert_eq!(parse_wait_seconds("no digits here"), None);
  }

  #[test]
  fn backoff_doubles_and_caps_at_sixteen_seconds() {
    for (failures, base) in [(1u32, 1u64), (2, 2), (3, 4), (4, 8), (5, 16), (9, 16)] {
      let min = backoff_delay(failures, 0.0);
      assert_eq!(min, Duration::from_secs(base));
      let max = backoff_delay(failures, 0.999_999);
      assert!(max >= min);
      assert!(max.as_secs_f64() <= base as f64 * 1.3 + 1e-6);
    }
  }

  #[test]
  fn backoff_jitter_stays_in_band() {
    for failures in 1u32..=6 {
      for _ in 0..64 {
        let delay = backoff_delay(failures, rand::random::<f64>()).as_secs_f64();
        let base = (1u64 << failures.saturating_sub(1).min(4)).min(16) as f64;
        assert!(delay >= base);
        assert!(delay <= base * 1.3);
      }
    }
  }

  use std::collections::HashMap;
  use std::sync::atomic::{AtomicUsize, Ordering};

  use axum::{routing::get, Router};

  struct DispatchHarness {
    forwarder: Arc<Forwarder>,
    idempotency: Arc<IdempotencyCache>,
    keepalive: Arc<KeepAliveManager>,
    logger: DebugLogger,
    hits: Arc<AtomicUsize>,
  }

  async fn dispatch_harness() -> DispatchHarness {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let router = Router::new()
      .route(
        "/ping",
        get(move || {
          let counter = Arc::clone(&counter);
          async move {
            counter.fetch_add(1, Ordering::SeqCst);
            "pong"
          }
        }),
      )
      .route("/blob", get(|| async { vec![9u8; 40_000] }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
      let _ = axum::serve(listener, router).await;
    });
    let logger = DebugLogger::new(false).unwrap();
    DispatchHarness {
      forwarder: Arc::new(Forwarder::new(port)),
      idempotency: Arc::new(IdempotencyCache::new()),
      keepalive: KeepAliveManager::new(false, 3.0, None, None, logger.clone(), ConsoleStatus::new()),
      logger,
      hits,
    }
  }

  fn request(path: &str, headers: Option<HashMap<String, String>>) -> RequestMeta {
    RequestMeta {
      request_id: "r1".to_string(),
      method: "GET".to_string(),
      path: path.to_string(),
      query: None,
      headers,
    }
  }

  async fn run_dispatch(
    harness: &DispatchHarness,
    meta: RequestMeta,
  ) -> Vec<Message> {
    let (tx, mut rx) = mpsc::channel(DISPATCH_QUEUE_LIMIT);
    dispatch_request(
      Arc::clone(&harness.forwarder),
      Arc::clone(&harness.idempotency),
      Arc::clone(&harness.keepalive),
      harness.logger.clone(),
      tx,
      meta,
      Vec::new(),
    )
    .await;
    rx.recv().await.expect("one frame batch per dispatch")
  }

  #[tokio::test]
  async fn dispatch_emits_meta_chunks_end_in_order() {
    let harness = dispatch_harness().await;
    let frames = run_dispatch(&harness, request("/blob", None)).await;

    let Message::Text(meta) = &frames[0] else {
      panic!("first frame must be the response meta");
    };
    let parsed: serde_json::Value = serde_json::from_str(meta.as_str()).unwrap();
    assert_eq!(parsed["requestId"], "r1");
    assert_eq!(parsed["status"], 200);

    let chunk_sizes: Vec<usize> = frames[1..frames.len() - 1]
      .iter()
      .map(|frame| match frame {
        Message::Binary(bytes) => bytes.len(),
        other => panic!("expected binary chunk, got {other:?}"),
      })
      .collect();
    assert_eq!(chunk_sizes, vec![16384, 16384, 7232]);

    assert!(matches!(
      frames.last(),
      Some(Message::Text(text)) if text.as_str() == "end"
    ));
  }

  #[tokio::test]
  async fn dispatch_replays_idempotent_requests_without_second_forward() {
    let harness = dispatch_harness().await;
    let headers = HashMap::from([("X-Idempotency-Key".to_string(), "abc".to_string())]);

    let first = run_dispatch(&harness, request("/ping", Some(headers.clone()))).await;
    let second = run_dispatch(&harness, request("/ping", Some(headers))).await;

    assert_eq!(harness.hits.load(Ordering::SeqCst), 1);
    let body = |frames: &[Message]| -> Vec<u8> {
      frames
        .iter()
        .filter_map(|frame| match frame {
          Message::Binary(bytes) => Some(bytes.to_vec()),
          _ => None,
        })
        .flatten()
        .collect()
    };
    assert_eq!(body(&first), body(&second));
    assert_eq!(body(&first), b"pong");
  }

  #[tokio::test]
  async fn dispatch_without_key_always_forwards() {
    let harness = dispatch_harness().await;
    run_dispatch(&harness, request("/ping", None)).await;
    run_dispatch(&harness, request("/ping", None)).await;
    assert_eq!(harness.hits.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn dispatch_blocks_while_keepalive_action_runs() {
    let harness = dispatch_harness().await;
    harness.keepalive.force_busy(true).await;

    let (tx, mut rx) = mpsc::channel(DISPATCH_QUEUE_LIMIT);
    let pending = tokio::spawn({
      let forwarder = Arc::clone(&harness.forwarder);
      let idempotency = Arc::clone(&harness.idempotency);
      let keepalive = Arc::clone(&harness.keepalive);
      let logger = harness.logger.clone();
      async move {
        dispatch_request(forwarder, idempotency, keepalive, logger, tx, request("/ping", None), Vec::new())
          .await;
      }
    });

    // No forward while the simulated action is in progress.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(harness.hits.load(Ordering::SeqCst), 0);
    assert!(rx.try_recv().is_err());

    harness.keepalive.force_busy(false).await;
    tokio::time::timeout(Duration::from_secs(2), pending)
      .await
      .expect("dispatch completes once idle")
      .unwrap();
    assert_eq!(harness.hits.load(Ordering::SeqCst), 1);
    assert!(rx.recv().await.is_some());
  }
}
