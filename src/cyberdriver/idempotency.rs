use std::{
  collections::HashMap,
  time::{Duration, Instant},
};

use tokio::sync::Mutex;

use super::forward::ForwardedResponse;

pub const CACHE_TTL: Duration = Duration::from_secs(60);
pub const CACHE_MAX_ENTRIES: usize = 1000;

/// In-memory replay guard keyed by the client's `X-Idempotency-Key` header.
/// Error responses are cached too, so a retry never re-executes a failed
/// side effect. Entries die with the process and with every pre-retry
/// cleanup.
pub struct IdempotencyCache {
  entries: Mutex<HashMap<String, (Instant, ForwardedResponse)>>,
}

impl IdempotencyCache {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
    }
  }

  pub async fn lookup(&self, key: &str) -> Option<ForwardedResponse> {
    let mut entries = self.entries.lock().await;
    sweep(&mut entries);
    entries.get(key).map(|(_, response)| response.clone())
  }

  pub async fn store(&self, key: String, response: ForwardedResponse) {
    let mut entries = self.entries.lock().await;
    entries.insert(key, (Instant::now(), response));
  }

  pub async fn clear(&self) {
    self.entries.lock().await.clear();
  }

  #[cfg(test)]
  pub async fn len(&self) -> usize {
    self.entries.lock().await.len()
  }

  #[cfg(test)]
  pub async fn backdate(&self, key: &str, age: Duration) {
    let mut entries = self.entries.lock().await;
    if let Some((ts, _)) = entries.get_mut(key) {
      *ts = Instant::now() - age;
    }
  }
}

fn sweep(entries: &mut HashMap<String, (Instant, ForwardedResponse)>) {
  let now = Instant::now();
  entries.retain(|_, (ts, _)| now.duration_since(*ts) <= CACHE_TTL);
  if entries.len() > CACHE_MAX_ENTRIES {
    let mut keys = entries.keys().cloned().collect::<Vec<_>>();
    keys.sort_by_key(|k| entries.get(k).map(|(ts, _)| *ts));
    let evict = entries.len() / 5;
    for key in keys.into_iter().take(evict) {
      entries.remove(&key);
    }
  }
}

/// The header lookup is case-insensitive; the cloud is not consistent about
/// casing.
pub fn idempotency_key(headers: Option<&HashMap<String, String>>) -> Option<String> {
  headers.and_then(|headers| {
    headers
      .iter()
      .find(|(k, _)| k.to_lowercase() == "x-idempotency-key")
      .map(|(_, v)| v.clone())
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn response(tag: u8) -> ForwardedResponse {
    ForwardedResponse {
      status: 200,
      headers: HashMap::new(),
      body: vec![tag],
    }
  }

  #[tokio::test]
  async fn replay_returns_stored_response() {
    let cache = IdempotencyCache::new();
    cache.store("abc".to_string(), response(1)).await;
    let hit = cache.lookup("abc").await.unwrap();
    assert_eq!(hit.body, vec![1]);
  }

  #[tokio::test]
  async fn error_responses_are_cached() {
    let cache = IdempotencyCache::new();
    let mut failed = response(9);
    failed.status = 500;
    cache.store("oops".to_string(), failed).await;
    assert_eq!(cache.lookup("oops").await.unwrap().status, 500);
  }

  #[tokio::test]
  async fn expired_entries_are_swept_on_lookup() {
    let cache = IdempotencyCache::new();
    cache.store("old".to_string(), response(1)).await;
    cache.backdate("old", CACHE_TTL + Duration::from_secs(1)).await;
    assert!(cache.lookup("old").await.is_none());
    assert_eq!(cache.len().await, 0);
  }

  #[tokio::test]
  async fn overflow_evicts_oldest_fifth() {
    let cache = IdempotencyCache::new();
    for i in 0..=CACHE_MAX_ENTRIES {
      cache.store(format!("key-{i}"), response(0)).await;
    }
    // Spread timestamps so the eviction order is deterministic: lower
    // indexes are older.
    for i in 0..=CACHE_MAX_ENTRIES {
      cache
        .backdate(&format!("key-{i}"), Duration::from_millis((CACHE_MAX_ENTRIES - i) as u64))
        .await;
    }
    assert_eq!(cache.len().await, CACHE_MAX_ENTRIES + 1);
    // Any lookup sweeps first: 1001 entries -> evict 1001/5 = 200 oldest.
    let _ = cache.lookup("key-1000").await;
    assert_eq!(cache.len().await, CACHE_MAX_ENTRIES + 1 - 200);
    assert!(cache.lookup("key-0").await.is_none());
    assert!(cache.lookup("key-199").await.is_none());
    assert!(cache.lookup("key-200").await.is_some());
    assert!(cache.lookup("key-1000").await.is_some());
  }

  #[tokio::test]
  async fn clear_empties_the_cache() {
    let cache = IdempotencyCache::new();
    cache.store("abc".to_string(), response(1)).await;
    cache.clear().await;
    assert!(cache.lookup("abc").await.is_none());
  }

  #[test]
  fn key_lookup_is_case_insensitive() {
    let headers = HashMap::from([("X-IDEMPOTENCY-KEY".to_string(), "k1".to_string())]);
    assert_eq!(idempotency_key(Some(&headers)), Some("k1".to_string()));
    let lower = HashMap::from([("x-idempotency-key".to_string(), "k2".to_string())]);
    assert_eq!(idempotency_key(Some(&lower)), Some("k2".to_string()));
    assert_eq!(idempotency_key(None), None);
  }
}
