use std::{collections::HashMap, time::Duration};

use futures_util::StreamExt;
use http::{HeaderMap, HeaderValue};
use tokio::sync::Mutex;

use crate::error::Result;

use super::frame::RequestMeta;

pub const SHELL_EXEC_PATH: &str = "/computer/shell/powershell/exec";

const DEFAULT_READ_TIMEOUT_SECS: f64 = 30.0;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
// Lets the origin return its own timeout response before the forwarder aborts.
const SHELL_TIMEOUT_MARGIN_SECS: f64 = 3.0;

#[derive(Clone, Debug, PartialEq)]
pub struct ForwardedResponse {
  pub status: u16,
  pub headers: HashMap<String, String>,
  pub body: Vec<u8>,
}

/// Proxies one decoded tunnel request to the loopback HTTP origin.
pub struct Forwarder {
  target_port: u16,
  client: Mutex<reqwest::Client>,
}

impl Forwarder {
  pub fn new(target_port: u16) -> Self {
    Self {
      target_port,
      client: Mutex::new(build_client()),
    }
  }

  /// Drops the pooled loopback connections; part of the supervisor's
  /// pre-retry cleanup.
  pub async fn recycle(&self) {
    let mut client = self.client.lock().await;
    *client = build_client();
  }

  pub async fn forward(&self, meta: &RequestMeta, body: &[u8]) -> ForwardedResponse {
    match self.try_forward(meta, body).await {
      Ok(response) => response,
      Err(err) => ForwardedResponse {
        status: 500,
        headers: [("content-type".to_string(), "text/plain".to_string())]
          .into_iter()
          .collect(),
        body: err.to_string().into_bytes(),
      },
    }
  }

  async fn try_forward(&self, meta: &RequestMeta, body: &[u8]) -> Result<ForwardedResponse> {
    let mut url = format!("http://127.0.0.1:{}{}", self.target_port, meta.path);
    if let Some(query) = &meta.query {
      if !query.is_empty() {
        url.push('?');
        url.push_str(query);
      }
    }

    let mut headers = HeaderMap::new();
    if let Some(raw) = &meta.headers {
      for (key, value) in raw {
        if let (Ok(name), Ok(val)) = (
          http::header::HeaderName::from_bytes(key.as_bytes()),
          HeaderValue::from_str(value),
        ) {
          headers.insert(name, val);
        }
      }
    }

    let method = meta
      .method
      .to_uppercase()
      .parse()
      .unwrap_or(reqwest::Method::GET);
    let client = self.client.lock().await.clone();
    let response = client
      .request(method, url)
      .headers(headers)
      .timeout(read_timeout_for(&meta.path, body))
      .body(body.to_vec())
      .send()
      .await?;

    let status = response.status().as_u16();
    let mut resp_headers = HashMap::new();
    for (key, value) in response.headers().iter() {
      if let Ok(val) = value.to_str() {
        resp_headers.insert(key.to_string(), val.to_string());
      }
    }

    // Stream the origin body rather than buffering it inside reqwest.
    let mut stream = response.bytes_stream();
    let mut resp_body = Vec::new();
    while let Some(chunk) = stream.next().await {
      resp_body.extend_from_slice(&chunk?);
    }

    let mut forwarded = ForwardedResponse {
      status,
      headers: resp_headers,
      body: resp_body,
    };
    if forwarded.status >= 400 && forwarded.body.is_empty() {
      forwarded
        .headers
        .insert("content-type".to_string(), "application/json".to_string());
      forwarded.body = serde_json::json!({
        "detail": "Cyberdriver local API returned an error with an empty body",
        "status": forwarded.status,
        "method": meta.method,
        "path": meta.path,
      })
      .to_string()
      .into_bytes();
    }
    Ok(forwarded)
  }
}

fn build_client() -> reqwest::Client {
  reqwest::Client::builder()
    .connect_timeout(CONNECT_TIMEOUT)
    .build()
    .unwrap_or_else(|_| reqwest::Client::new())
}

/// Shell executions carry their own timeout in the JSON body; honor it with a
/// margin so the origin's timeout response wins over the forwarder's.
pub fn read_timeout_for(path: &str, body: &[u8]) -> Duration {
  let secs = if path == SHELL_EXEC_PATH {
    extract_timeout(body)
      .map(|t| t + SHELL_TIMEOUT_MARGIN_SECS)
      .unwrap_or(DEFAULT_READ_TIMEOUT_SECS)
  } else {
    DEFAULT_READ_TIMEOUT_SECS
  };
  Duration::from_secs_f64(secs.max(1.0))
}

fn extract_timeout(body: &[u8]) -> Option<f64> {
  serde_json::from_slice::<serde_json::Value>(body)
    .ok()
    .and_then(|value| value.get("timeout").and_then(|v| v.as_f64()))
}

#[cfg(test)]
mod tests {
  use super::*;

  use axum::{http::StatusCode, routing::get, Router};

  fn meta(method: &str, path: &str) -> RequestMeta {
    RequestMeta {
      request_id: "r1".to_string(),
      method: method.to_string(),
      path: path.to_string(),
      query: None,
      headers: None,
    }
  }

  async fn spawn_origin(router: Router) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
      let _ = axum::serve(listener, router).await;
    });
    port
  }

  #[tokio::test]
  async fn forwards_and_collects_body() {
    let port = spawn_origin(Router::new().route("/ping", get(|| async { "pong" }))).await;
    let forwarder = Forwarder::new(port);
    let response = forwarder.forward(&meta("GET", "/ping"), &[]).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"pong");
  }

  #[tokio::test]
  async fn enriches_empty_error_bodies() {
    let port =
      spawn_origin(Router::new().route("/missing", get(|| async { StatusCode::NOT_FOUND }))).await;
    let forwarder = Forwarder::new(port);
    let response = forwarder.forward(&meta("GET", "/missing"), &[]).await;
    assert_eq!(response.status, 404);
    let detail: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(detail["status"], 404);
    assert_eq!(detail["method"], "GET");
    assert_eq!(detail["path"], "/missing");
    assert_eq!(
      response.headers.get("content-type").map(String::as_str),
      Some("application/json")
    );
  }

  #[tokio::test]
  async fn transport_errors_become_synthetic_500() {
    // Bind then drop to get a port nothing is listening on.
    let port = {
      let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
      listener.local_addr().unwrap().port()
    };
    let forwarder = Forwarder::new(port);
    let response = forwarder.forward(&meta("GET", "/ping"), &[]).await;
    assert_eq!(response.status, 500);
    assert_eq!(
      response.headers.get("content-type").map(String::as_str),
      Some("text/plain")
    );
    assert!(!response.body.is_empty());
  }

  #[test]
  fn shell_exec_timeout_gets_margin() {
    let body = br#"{"command":"sleep 60","timeout":12}"#;
    assert_eq!(
      read_timeout_for(SHELL_EXEC_PATH, body),
      Duration::from_secs_f64(15.0)
    );
  }

  #[test]
  fn non_shell_paths_use_default_timeout() {
    let body = br#"{"timeout":12}"#;
    assert_eq!(
      read_timeout_for("/computer/display/screenshot", body),
      Duration::from_secs_f64(30.0)
    );
    assert_eq!(
      read_timeout_for(SHELL_EXEC_PATH, b"not json"),
      Duration::from_secs_f64(30.0)
    );
  }
}
