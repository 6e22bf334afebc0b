use std::{
  path::PathBuf,
  sync::Arc,
  time::{Duration, Instant},
};

use axum::{
  extract::{Query, Request, State},
  http::{header::HeaderValue, StatusCode},
  middleware::{self, Next},
  response::{IntoResponse, Response},
  routing::{get, post},
  Json, Router,
};
use base64::Engine;
use enigo::{Button, Enigo, Settings};
use image::GenericImageView;
use serde::Deserialize;
use tokio::sync::{Mutex, Semaphore};

use crate::error::CyberdriverError;

use super::{
  config::{Config, ConnectionInfo},
  diagnostics, input,
  keepalive::KeepAliveManager,
  logger::DebugLogger,
};

// Worker budget for blocking calls (screen grabs, shell waits) so a burst of
// slow requests cannot exhaust the blocking thread pool.
const BLOCKING_PERMITS: usize = 5;

#[derive(Clone)]
pub struct ApiState {
  pub config: Config,
  pub keepalive: Arc<KeepAliveManager>,
  pub debug_logger: DebugLogger,
  pub connection_info: Arc<Mutex<ConnectionInfo>>,
  pub enigo: Arc<Mutex<Enigo>>,
  pub blocking: Arc<Semaphore>,
}

impl ApiState {
  pub fn new(
    config: Config,
    keepalive: Arc<KeepAliveManager>,
    debug_logger: DebugLogger,
    connection_info: Arc<Mutex<ConnectionInfo>>,
  ) -> crate::error::Result<Self> {
    Ok(Self {
      config,
      keepalive,
      debug_logger,
      connection_info,
      enigo: Arc::new(Mutex::new(Enigo::new(&Settings::default())?)),
      blocking: Arc::new(Semaphore::new(BLOCKING_PERMITS)),
    })
  }
}

#[derive(Debug)]
struct ApiError {
  status: StatusCode,
  message: String,
}

impl ApiError {
  fn bad_request(message: &str) -> Self {
    Self {
      status: StatusCode::BAD_REQUEST,
      message: message.to_string(),
    }
  }

  fn internal(message: &str) -> Self {
    Self {
      status: StatusCode::INTERNAL_SERVER_ERROR,
      message: message.to_string(),
    }
  }

  fn status(status: StatusCode, message: &str) -> Self {
    Self {
      status,
      message: message.to_string(),
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
  }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: ApiState) -> Router {
  Router::new()
    .route("/computer/display/screenshot", get(get_screenshot))
    .route("/computer/display/dimensions", get(get_dimensions))
    .route("/computer/input/keyboard/type", post(post_keyboard_type))
    .route("/computer/input/keyboard/key", post(post_keyboard_key))
    .route("/computer/input/mouse/position", get(get_mouse_position))
    .route("/computer/input/mouse/move", post(post_mouse_move))
    .route("/computer/input/mouse/click", post(post_mouse_click))
    .route("/computer/input/mouse/drag", post(post_mouse_drag))
    .route("/computer/input/mouse/scroll", post(post_mouse_scroll))
    .route("/computer/copy_to_clipboard", post(post_copy_to_clipboard))
    .route("/computer/fs/list", get(get_fs_list))
    .route("/computer/fs/read", get(get_fs_read))
    .route("/computer/fs/write", post(post_fs_write))
    .route("/computer/shell/powershell/simple", post(post_powershell_simple))
    .route("/computer/shell/powershell/test", post(post_powershell_test))
    .route("/computer/shell/powershell/exec", post(post_powershell_exec))
    .route("/computer/shell/powershell/session", post(post_powershell_session))
    .route("/internal/diagnostics", get(get_diagnostics))
    .route("/internal/keepalive/remote/activity", post(post_keepalive_activity))
    .route("/internal/keepalive/remote/enable", post(post_keepalive_enable))
    .route("/internal/keepalive/remote/disable", post(post_keepalive_disable))
    .layer(middleware::from_fn(disable_buffering))
    .with_state(state)
}

// Responses stream back through the tunnel; any intermediate buffering turns
// screenshots into multi-second stalls.
async fn disable_buffering(request: Request, next: Next) -> Response {
  let mut response = next.run(request).await;
  let headers = response.headers_mut();
  headers.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
  headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
  response
}

#[derive(Deserialize)]
struct ScreenshotQuery {
  width: Option<u32>,
  height: Option<u32>,
  mode: Option<String>,
}

#[derive(Clone, Copy)]
enum ScaleMode {
  Exact,
  AspectFit,
  AspectFill,
}

impl ScaleMode {
  fn from_str(mode: &str) -> Self {
    match mode.to_lowercase().as_str() {
      "aspect_fit" => Self::AspectFit,
      "aspect_fill" => Self::AspectFill,
      _ => Self::Exact,
    }
  }

  fn as_str(&self) -> &'static str {
    match self {
      Self::Exact => "exact",
      Self::AspectFit => "aspect_fit",
      Self::AspectFill => "aspect_fill",
    }
  }
}

const SCREENSHOT_CONTENT_TYPE: &str = "image/png";
const SCREENSHOT_ATTEMPTS: usize = 3;

async fn get_screenshot(
  State(state): State<ApiState>,
  Query(query): Query<ScreenshotQuery>,
) -> ApiResult<Response> {
  let width = query.width;
  let height = query.height;
  let mode = ScaleMode::from_str(query.mode.as_deref().unwrap_or("exact"));
  let debug_logger = state.debug_logger.clone();
  let _permit = state
    .blocking
    .acquire()
    .await
    .map_err(|_| ApiError::internal("Blocking pool unavailable"))?;

  let mut last_error: Option<String> = None;
  for attempt in 0..SCREENSHOT_ATTEMPTS {
    match tokio::task::spawn_blocking(move || capture_screen(width, height, mode)).await {
      Ok(Ok(result)) => {
        debug_logger.log(
          "SCREENSHOT",
          "Captured",
          &[
            ("requested_w", width.map(|v| v.to_string()).unwrap_or_else(|| "auto".into())),
            ("requested_h", height.map(|v| v.to_string()).unwrap_or_else(|| "auto".into())),
            ("mode", mode.as_str().to_string()),
            ("orig", format!("{}x{}", result.orig_w, result.orig_h)),
            ("out", format!("{}x{}", result.out_w, result.out_h)),
            ("bytes", result.bytes.len().to_string()),
            ("capture_ms", format!("{:.1}", result.capture_ms)),
            ("encode_ms", format!("{:.1}", result.encode_ms)),
          ],
        );
        return Response::builder()
          .header("Content-Type", SCREENSHOT_CONTENT_TYPE)
          .body(axum::body::Body::from(result.bytes))
          .map_err(|err| ApiError::internal(&err.to_string()));
      }
      Ok(Err(err)) => {
        debug_logger.log(
          "SCREENSHOT",
          "Failed",
          &[("attempt", (attempt + 1).to_string()), ("error", err.clone())],
        );
        last_error = Some(err);
      }
      Err(err) => {
        let error = format!("Join error: {err}");
        debug_logger.log(
          "SCREENSHOT",
          "Failed",
          &[("attempt", (attempt + 1).to_string()), ("error", error.clone())],
        );
        last_error = Some(error);
      }
    }
    if attempt + 1 < SCREENSHOT_ATTEMPTS {
      tokio::time::sleep(Duration::from_millis(50)).await;
    }
  }
  Err(ApiError::internal(
    last_error.unwrap_or_else(|| "Screen capture failed".into()).as_str(),
  ))
}

async fn get_dimensions(State(_state): State<ApiState>) -> ApiResult<Json<serde_json::Value>> {
  let monitor = xcap::Monitor::all()
    .ok()
    .and_then(|mut list| list.pop())
    .ok_or_else(|| ApiError::internal("No monitor available"))?;
  let width = monitor
    .width()
    .map_err(|err| ApiError::internal(&err.to_string()))?;
  let height = monitor
    .height()
    .map_err(|err| ApiError::internal(&err.to_string()))?;
  Ok(Json(serde_json::json!({ "width": width, "height": height })))
}

#[derive(Deserialize)]
struct TextPayload {
  text: String,
}

async fn post_keyboard_type(
  State(state): State<ApiState>,
  Json(payload): Json<TextPayload>,
) -> ApiResult<Json<serde_json::Value>> {
  if payload.text.is_empty() {
    return Err(ApiError::bad_request("Missing 'text' field"));
  }
  input::type_text(&state.enigo, &payload.text)
    .await
    .map_err(|err| ApiError::internal(&err.to_string()))?;
  Ok(Json(serde_json::json!({})))
}

async fn post_keyboard_key(
  State(state): State<ApiState>,
  Json(payload): Json<TextPayload>,
) -> ApiResult<Json<serde_json::Value>> {
  if payload.text.is_empty() {
    return Err(ApiError::bad_request("Missing 'text' field"));
  }
  state.debug_logger.log(
    "INPUT",
    "Keyboard sequence",
    &[("sequence", payload.text.clone())],
  );
  input::execute_xdo_sequence(&state.enigo, &payload.text)
    .await
    .map_err(|err| ApiError::internal(&err.to_string()))?;
  Ok(Json(serde_json::json!({})))
}

async fn post_copy_to_clipboard(
  State(state): State<ApiState>,
  Json(payload): Json<TextPayload>,
) -> ApiResult<Json<serde_json::Value>> {
  if payload.text.is_empty() {
    return Err(ApiError::bad_request("Missing 'text' field (key name)"));
  }
  let key_name = payload.text.clone();
  let _ = tokio::task::spawn_blocking(|| {
    let mut clipboard = arboard::Clipboard::new().ok();
    if let Some(cb) = clipboard.as_mut() {
      let _ = cb.set_text(String::new());
    }
  })
  .await;

  input::execute_xdo_sequence(&state.enigo, "ctrl+c")
    .await
    .map_err(|err| ApiError::internal(&err.to_string()))?;

  let mut clipboard_content = String::new();
  for attempt in 0..8 {
    tokio::time::sleep(Duration::from_millis(200 + attempt * 100)).await;
    let read = tokio::task::spawn_blocking(|| {
      let clipboard = arboard::Clipboard::new().ok();
      clipboard.and_then(|mut cb| cb.get_text().ok()).unwrap_or_default()
    })
    .await
    .unwrap_or_default();
    if !read.is_empty() {
      clipboard_content = read;
      break;
    }
  }

  let mut response = serde_json::Map::new();
  response.insert(key_name, serde_json::Value::String(clipboard_content));
  Ok(Json(serde_json::Value::Object(response)))
}

async fn get_mouse_position(
  State(_state): State<ApiState>,
) -> ApiResult<Json<serde_json::Value>> {
  let pos = input::mouse_position()
    .await
    .map_err(|err| ApiError::internal(&err.to_string()))?;
  Ok(Json(serde_json::json!({ "x": pos.x, "y": pos.y })))
}

#[derive(Deserialize)]
struct MouseMovePayload {
  x: i32,
  y: i32,
}

async fn post_mouse_move(
  State(state): State<ApiState>,
  Json(payload): Json<MouseMovePayload>,
) -> ApiResult<Json<serde_json::Value>> {
  input::move_mouse(&state.enigo, payload.x, payload.y)
    .await
    .map_err(|err| ApiError::internal(&err.to_string()))?;
  Ok(Json(serde_json::json!({})))
}

#[derive(Deserialize)]
struct MouseClickPayload {
  x: Option<i32>,
  y: Option<i32>,
  button: Option<String>,
  down: Option<bool>,
  clicks: Option<u8>,
}

async fn post_mouse_click(
  State(state): State<ApiState>,
  Json(payload): Json<MouseClickPayload>,
) -> ApiResult<Json<serde_json::Value>> {
  let button = parse_button(payload.button.as_deref())?;
  state.debug_logger.log(
    "INPUT",
    "Mouse click",
    &[
      ("x", payload.x.map(|v| v.to_string()).unwrap_or_else(|| "none".into())),
      ("y", payload.y.map(|v| v.to_string()).unwrap_or_else(|| "none".into())),
      ("button", payload.button.clone().unwrap_or_else(|| "left".into())),
    ],
  );
  if let Some(down) = payload.down {
    input::mouse_click(&state.enigo, payload.x, payload.y, button, down, !down, 0)
      .await
      .map_err(|err| ApiError::internal(&err.to_string()))?;
  } else {
    let clicks = payload.clicks.unwrap_or(1);
    if !(1..=3).contains(&clicks) {
      return Err(ApiError::bad_request("clicks must be 1, 2, or 3"));
    }
    input::mouse_click(&state.enigo, payload.x, payload.y, button, false, false, clicks)
      .await
      .map_err(|err| ApiError::internal(&err.to_string()))?;
  }
  Ok(Json(serde_json::json!({})))
}

#[derive(Deserialize)]
struct MouseDragPayload {
  start_x: Option<i32>,
  start_y: Option<i32>,
  from_x: Option<i32>,
  from_y: Option<i32>,
  to_x: Option<i32>,
  to_y: Option<i32>,
  x: Option<i32>,
  y: Option<i32>,
  button: Option<String>,
  duration: Option<f64>,
}

async fn post_mouse_drag(
  State(state): State<ApiState>,
  Json(payload): Json<MouseDragPayload>,
) -> ApiResult<Json<serde_json::Value>> {
  let button = parse_button(payload.button.as_deref())?;
  let end_x = payload
    .to_x
    .or(payload.x)
    .ok_or_else(|| ApiError::bad_request("Missing or invalid destination coordinates"))?;
  let end_y = payload
    .to_y
    .or(payload.y)
    .ok_or_else(|| ApiError::bad_request("Missing or invalid destination coordinates"))?;
  let start_x = payload
    .start_x
    .or(payload.from_x)
    .ok_or_else(|| ApiError::bad_request("Missing or invalid start coordinates"))?;
  let start_y = payload
    .start_y
    .or(payload.from_y)
    .ok_or_else(|| ApiError::bad_request("Missing or invalid start coordinates"))?;
  input::mouse_drag(
    &state.enigo,
    start_x,
    start_y,
    end_x,
    end_y,
    button,
    payload.duration,
  )
  .await
  .map_err(|err| ApiError::internal(&err.to_string()))?;
  Ok(Json(serde_json::json!({})))
}

#[derive(Deserialize)]
struct MouseScrollPayload {
  direction: String,
  amount: i32,
  x: Option<i32>,
  y: Option<i32>,
}

async fn post_mouse_scroll(
  State(state): State<ApiState>,
  Json(payload): Json<MouseScrollPayload>,
) -> ApiResult<Json<serde_json::Value>> {
  if payload.amount < 0 {
    return Err(ApiError::bad_request("'amount' must be non-negative"));
  }
  input::mouse_scroll(
    &state.enigo,
    payload.direction.to_lowercase().as_str(),
    payload.amount,
    payload.x,
    payload.y,
  )
  .await
  .map_err(|err| ApiError::internal(&err.to_string()))?;
  Ok(Json(serde_json::json!({})))
}

fn parse_button(button: Option<&str>) -> ApiResult<Button> {
  match button.unwrap_or("left") {
    "left" => Ok(Button::Left),
    "right" => Ok(Button::Right),
    "middle" => Ok(Button::Middle),
    _ => Err(ApiError::bad_request("Invalid button")),
  }
}

#[derive(Deserialize)]
struct FsListQuery {
  path: Option<String>,
}

async fn get_fs_list(Query(query): Query<FsListQuery>) -> ApiResult<Json<serde_json::Value>> {
  let path = query.path.unwrap_or_else(|| ".".to_string());
  let safe_path = PathBuf::from(path).expand_dir();
  if !safe_path.exists() {
    return Err(ApiError::status(StatusCode::NOT_FOUND, "Directory not found"));
  }
  if !safe_path.is_dir() {
    return Err(ApiError::bad_request("Path is not a directory"));
  }
  let mut entries = Vec::new();
  let listing = std::fs::read_dir(&safe_path)
    .map_err(|_| ApiError::status(StatusCode::FORBIDDEN, "Permission denied to list directory"))?;
  for item in listing.flatten() {
    let path = item.path();
    let name = item.file_name().to_string_lossy().to_string();
    let meta = item.metadata();
    let is_dir = meta.as_ref().map(|m| m.is_dir()).unwrap_or(false);
    let size = meta.as_ref().ok().and_then(|m| if m.is_file() { Some(m.len()) } else { None });
    let modified = meta
      .ok()
      .and_then(|m| m.modified().ok())
      .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
      .map(|d| d.as_secs_f64());
    entries.push(serde_json::json!({
      "name": name,
      "path": path.to_string_lossy(),
      "is_dir": is_dir,
      "size": size,
      "modified": modified,
    }));
  }
  entries.sort_by(|a, b| {
    let a_dir = a.get("is_dir").and_then(|v| v.as_bool()).unwrap_or(false);
    let b_dir = b.get("is_dir").and_then(|v| v.as_bool()).unwrap_or(false);
    a_dir
      .cmp(&b_dir)
      .reverse()
      .then_with(|| {
        let a_name = a.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let b_name = b.get("name").and_then(|v| v.as_str()).unwrap_or("");
        a_name.cmp(b_name)
      })
  });
  Ok(Json(serde_json::json!({ "path": safe_path.to_string_lossy(), "entries": entries })))
}

#[derive(Deserialize)]
struct FsReadQuery {
  path: String,
}

const FS_READ_MAX_BYTES: u64 = 100 * 1024 * 1024;

async fn get_fs_read(Query(query): Query<FsReadQuery>) -> ApiResult<Json<serde_json::Value>> {
  let safe_path = PathBuf::from(query.path).expand_dir();
  if !safe_path.exists() {
    return Err(ApiError::status(StatusCode::NOT_FOUND, "File not found"));
  }
  if !safe_path.is_file() {
    return Err(ApiError::bad_request("Path is not a file"));
  }
  let meta = safe_path
    .metadata()
    .map_err(|_| ApiError::status(StatusCode::FORBIDDEN, "Permission denied to read file"))?;
  if meta.len() > FS_READ_MAX_BYTES {
    return Err(ApiError::status(StatusCode::PAYLOAD_TOO_LARGE, "File too large (>100MB)"));
  }
  let content = tokio::fs::read(&safe_path)
    .await
    .map_err(|_| ApiError::status(StatusCode::FORBIDDEN, "Permission denied to read file"))?;
  Ok(Json(serde_json::json!({
    "path": safe_path.to_string_lossy(),
    "content": base64::engine::general_purpose::STANDARD.encode(content),
    "size": meta.len(),
  })))
}

#[derive(Deserialize)]
struct FsWritePayload {
  path: String,
  content: String,
  mode: Option<String>,
}

async fn post_fs_write(Json(payload): Json<FsWritePayload>) -> ApiResult<Json<serde_json::Value>> {
  if payload.path.is_empty() {
    return Err(ApiError::bad_request("Missing 'path' field"));
  }
  if payload.content.is_empty() {
    return Err(ApiError::bad_request("Missing 'content' field"));
  }
  let file_data = base64::engine::general_purpose::STANDARD
    .decode(payload.content)
    .map_err(|_| ApiError::bad_request("Invalid base64 content"))?;
  let mut safe_path = PathBuf::from(payload.path).expand_dir();
  // Bare filenames land in a dedicated transfer directory, not the cwd.
  if safe_path.parent().map(|p| p == std::path::Path::new("")).unwrap_or(true) {
    if let Some(file_name) = safe_path.file_name() {
      safe_path = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("CyberdeskTransfers")
        .join(file_name);
    }
  }
  if let Some(parent) = safe_path.parent() {
    let _ = tokio::fs::create_dir_all(parent).await;
  }
  let write_mode = payload.mode.unwrap_or_else(|| "write".to_string());
  if write_mode == "append" {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(&safe_path)
      .await
      .map_err(|_| ApiError::status(StatusCode::FORBIDDEN, "Permission denied to write file"))?;
    file
      .write_all(&file_data)
      .await
      .map_err(|_| ApiError::status(StatusCode::FORBIDDEN, "Permission denied to write file"))?;
  } else {
    tokio::fs::write(&safe_path, file_data)
      .await
      .map_err(|_| ApiError::status(StatusCode::FORBIDDEN, "Permission denied to write file"))?;
  }
  Ok(Json(serde_json::json!({})))
}

async fn post_powershell_simple() -> ApiResult<Json<serde_json::Value>> {
  let output = if cfg!(windows) {
    std::process::Command::new("powershell")
      .args(["-NoProfile", "-Command", "Write-Output 'Hello World'"])
      .output()
  } else {
    std::process::Command::new("/bin/sh")
      .args(["-c", "printf 'Hello World'"])
      .output()
  }
  .map_err(|err| ApiError::internal(&err.to_string()))?;
  Ok(Json(serde_json::json!({
    "returncode": output.status.code().unwrap_or(0),
    "stdout": truncate_output(String::from_utf8_lossy(&output.stdout).to_string()),
    "stderr": truncate_output(String::from_utf8_lossy(&output.stderr).to_string()),
  })))
}

async fn post_powershell_test() -> ApiResult<Json<serde_json::Value>> {
  let output = if cfg!(windows) {
    std::process::Command::new("powershell")
      .args(["-NoLogo", "-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-Command"])
      .arg("Write-Output \"Hello from PowerShell\"")
      .output()
  } else {
    std::process::Command::new("/bin/sh")
      .args(["-c", "printf 'Hello from shell'"])
      .output()
  }
  .map_err(|err| ApiError::internal(&err.to_string()))?;
  Ok(Json(serde_json::json!({
    "returncode": output.status.code().unwrap_or(0),
    "stdout": truncate_output(String::from_utf8_lossy(&output.stdout).to_string()),
    "stderr": truncate_output(String::from_utf8_lossy(&output.stderr).to_string()),
  })))
}

#[derive(Deserialize)]
struct PowerShellExecPayload {
  command: String,
  working_directory: Option<String>,
  session_id: Option<String>,
  timeout: Option<f64>,
}

async fn post_powershell_exec(
  State(state): State<ApiState>,
  Json(payload): Json<PowerShellExecPayload>,
) -> ApiResult<Json<serde_json::Value>> {
  if payload.command.is_empty() {
    return Err(ApiError::bad_request("Missing 'command' field"));
  }
  let timeout = payload.timeout.unwrap_or(30.0);
  let working_directory = payload.working_directory.clone();
  let command = payload.command.clone();
  let session_id = payload.session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
  let _permit = state
    .blocking
    .acquire()
    .await
    .map_err(|_| ApiError::internal("Blocking pool unavailable"))?;
  let result: std::result::Result<CommandResult, CyberdriverError> =
    tokio::task::spawn_blocking(move || {
      execute_shell_command(&command, working_directory.as_deref(), timeout)
    })
    .await
    .unwrap_or_else(|err| Err(CyberdriverError::RuntimeError(err.to_string())));

  match result {
    Ok(result) => Ok(Json(serde_json::json!({
      "stdout": truncate_output(result.stdout),
      "stderr": truncate_output(result.stderr),
      "exit_code": result.exit_code,
      "session_id": session_id,
      "timeout_reached": result.timeout_reached,
    }))),
    Err(err) => Err(ApiError::internal(&err.to_string())),
  }
}

#[derive(Deserialize)]
struct PowerShellSessionPayload {
  action: String,
  #[allow(dead_code)]
  session_id: Option<String>,
}

async fn post_powershell_session(
  Json(payload): Json<PowerShellSessionPayload>,
) -> ApiResult<Json<serde_json::Value>> {
  if payload.action != "create" && payload.action != "destroy" {
    return Err(ApiError::bad_request("Invalid action. Must be 'create' or 'destroy'"));
  }
  if payload.action == "create" {
    Ok(Json(serde_json::json!({
      "session_id": uuid::Uuid::new_v4().to_string(),
      "message": "Session ID generated (sessions are stateless)"
    })))
  } else {
    Ok(Json(serde_json::json!({ "message": "Session destroyed (no-op in stateless mode)" })))
  }
}

async fn get_diagnostics(State(state): State<ApiState>) -> ApiResult<Json<serde_json::Value>> {
  let connection = state.connection_info.lock().await.clone();
  Ok(Json(diagnostics::collect(&state.config, &connection)))
}

async fn post_keepalive_activity(State(state): State<ApiState>) -> StatusCode {
  state.keepalive.record_remote_activity().await;
  StatusCode::NO_CONTENT
}

async fn post_keepalive_enable(State(state): State<ApiState>) -> StatusCode {
  state.keepalive.set_enabled(true).await;
  StatusCode::NO_CONTENT
}

async fn post_keepalive_disable(State(state): State<ApiState>) -> StatusCode {
  state.keepalive.set_enabled(false).await;
  StatusCode::NO_CONTENT
}

#[derive(Debug)]
struct CommandResult {
  stdout: String,
  stderr: String,
  exit_code: i32,
  timeout_reached: bool,
}

fn execute_shell_command(
  command: &str,
  working_dir: Option<&str>,
  timeout: f64,
) -> std::result::Result<CommandResult, CyberdriverError> {
  let mut cmd = if cfg!(windows) {
    let mut cmd = std::process::Command::new("powershell");
    cmd.args(["-NoLogo", "-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass"])
      .arg("-Command")
      .arg(command);
    cmd
  } else {
    let mut cmd = std::process::Command::new("/bin/sh");
    cmd.args(["-c", command]);
    cmd
  };
  if let Some(dir) = working_dir {
    cmd.current_dir(dir);
  }
  let child = cmd
    .stdout(std::process::Stdio::piped())
    .stderr(std::process::Stdio::piped())
    .spawn()
    .map_err(|err| CyberdriverError::RuntimeError(err.to_string()))?;

  let (tx, rx) = std::sync::mpsc::channel();
  std::thread::spawn(move || {
    let output = child.wait_with_output();
    let _ = tx.send(output);
  });
  match rx.recv_timeout(Duration::from_secs_f64(timeout.max(1.0))) {
    Ok(Ok(output)) => Ok(CommandResult {
      stdout: String::from_utf8_lossy(&output.stdout).to_string(),
      stderr: String::from_utf8_lossy(&output.stderr).to_string(),
      exit_code: output.status.code().unwrap_or(-1),
      timeout_reached: false,
    }),
    _ => Ok(CommandResult {
      stdout: String::new(),
      stderr: format!(
        "Command timeout reached after {timeout} seconds. Process continues in background."
      ),
      exit_code: 0,
      timeout_reached: true,
    }),
  }
}

struct ScreenshotResult {
  bytes: Vec<u8>,
  orig_w: u32,
  orig_h: u32,
  out_w: u32,
  out_h: u32,
  capture_ms: f64,
  encode_ms: f64,
}

fn capture_screen(
  width: Option<u32>,
  height: Option<u32>,
  mode: ScaleMode,
) -> std::result::Result<ScreenshotResult, String> {
  let capture_start = Instant::now();
  let monitor = xcap::Monitor::all()
    .ok()
    .and_then(|mut list| list.pop())
    .ok_or_else(|| "No monitor available".to_string())?;
  let image = monitor.capture_image().map_err(|err| err.to_string())?;
  let mut dyn_image = image::DynamicImage::ImageRgba8(image);
  let capture_ms = capture_start.elapsed().as_secs_f64() * 1000.0;
  let (orig_w, orig_h) = dyn_image.dimensions();

  if width.is_some() || height.is_some() {
    let target_w = width.unwrap_or(orig_w);
    let target_h = height.unwrap_or(orig_h);
    dyn_image = scale_image(dyn_image, target_w, target_h, mode);
  }
  let (out_w, out_h) = dyn_image.dimensions();

  let encode_start = Instant::now();
  let mut buf = Vec::new();
  dyn_image
    .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
    .map_err(|err| err.to_string())?;
  let encode_ms = encode_start.elapsed().as_secs_f64() * 1000.0;

  Ok(ScreenshotResult {
    bytes: buf,
    orig_w,
    orig_h,
    out_w,
    out_h,
    capture_ms,
    encode_ms,
  })
}

fn scale_image(
  image: image::DynamicImage,
  target_width: u32,
  target_height: u32,
  mode: ScaleMode,
) -> image::DynamicImage {
  let (orig_width, orig_height) = image.dimensions();
  if target_width == orig_width && target_height == orig_height {
    return image;
  }
  let (new_w, new_h) = scaled_dimensions(orig_width, orig_height, target_width, target_height, mode);
  let filter = choose_resize_filter(orig_width, orig_height, new_w, new_h);
  image.resize_exact(new_w.max(1), new_h.max(1), filter)
}

fn scaled_dimensions(
  orig_width: u32,
  orig_height: u32,
  target_width: u32,
  target_height: u32,
  mode: ScaleMode,
) -> (u32, u32) {
  let orig_aspect = orig_width as f32 / orig_height as f32;
  let target_aspect = target_width as f32 / target_height as f32;
  match mode {
    ScaleMode::Exact => (target_width, target_height),
    ScaleMode::AspectFit => {
      if orig_aspect > target_aspect {
        (target_width, (target_width as f32 / orig_aspect) as u32)
      } else {
        ((target_height as f32 * orig_aspect) as u32, target_height)
      }
    }
    ScaleMode::AspectFill => {
      if orig_aspect > target_aspect {
        ((target_height as f32 * orig_aspect) as u32, target_height)
      } else {
        (target_width, (target_width as f32 / orig_aspect) as u32)
      }
    }
  }
}

fn choose_resize_filter(
  orig_width: u32,
  orig_height: u32,
  target_width: u32,
  target_height: u32,
) -> image::imageops::FilterType {
  let scale_x = target_width as f64 / orig_width as f64;
  let scale_y = target_height as f64 / orig_height as f64;
  // Heavy downscales read better with Triangle; everything else CatmullRom.
  if scale_x.min(scale_y) < 0.5 {
    image::imageops::FilterType::Triangle
  } else {
    image::imageops::FilterType::CatmullRom
  }
}

trait ExpandPath {
  fn expand_dir(self) -> PathBuf;
}

impl ExpandPath for PathBuf {
  fn expand_dir(self) -> PathBuf {
    if let Some(str_path) = self.to_str() {
      if str_path.starts_with("~") {
        if let Some(home) = dirs::home_dir() {
          return PathBuf::from(str_path.replacen("~", home.to_string_lossy().as_ref(), 1));
        }
      }
    }
    self
  }
}

fn truncate_output(output: String) -> String {
  let max = 15_000;
  if output.len() <= max {
    return output;
  }
  let head = &output[..max / 2];
  let tail = &output[output.len() - max / 2..];
  format!("{head}\n... (truncated) ...\n{tail}")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scale_mode_parses_loosely() {
    assert!(matches!(ScaleMode::from_str("ASPECT_FIT"), ScaleMode::AspectFit));
    assert!(matches!(ScaleMode::from_str("aspect_fill"), ScaleMode::AspectFill));
    assert!(matches!(ScaleMode::from_str("anything else"), ScaleMode::Exact));
  }

  #[test]
  fn aspect_fit_preserves_aspect_within_bounds() {
    // 1920x1080 into a 960x960 box: width-bound, 960x540.
    assert_eq!(
      scaled_dimensions(1920, 1080, 960, 960, ScaleMode::AspectFit),
      (960, 540)
    );
    // 1080x1920 into a 960x960 box: height-bound, 540x960.
    assert_eq!(
      scaled_dimensions(1080, 1920, 960, 960, ScaleMode::AspectFit),
      (540, 960)
    );
  }

  #[test]
  fn aspect_fill_covers_the_target_box() {
    assert_eq!(
      scaled_dimensions(1920, 1080, 960, 960, ScaleMode::AspectFill),
      (1706, 960)
    );
    assert_eq!(
      scaled_dimensions(1920, 1080, 960, 540, ScaleMode::Exact),
      (960, 540)
    );
  }

  #[test]
  fn downscale_filter_switches_below_half() {
    assert!(matches!(
      choose_resize_filter(1920, 1080, 800, 450),
      image::imageops::FilterType::Triangle
    ));
    assert!(matches!(
      choose_resize_filter(1920, 1080, 1280, 720),
      image::imageops::FilterType::CatmullRom
    ));
  }

  #[test]
  fn truncate_output_keeps_head_and_tail() {
    let long = "a".repeat(20_000);
    let truncated = truncate_output(long);
    assert!(truncated.len() < 20_000);
    assert!(truncated.contains("... (truncated) ..."));
    assert_eq!(truncate_output("short".to_string()), "short");
  }

  #[test]
  fn tilde_paths_expand_to_home() {
    if let Some(home) = dirs::home_dir() {
      let expanded = PathBuf::from("~/transfers/file.txt").expand_dir();
      assert!(expanded.starts_with(home));
    }
    let untouched = PathBuf::from("/tmp/file.txt").expand_dir();
    assert_eq!(untouched, PathBuf::from("/tmp/file.txt"));
  }
}
