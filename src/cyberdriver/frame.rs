use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tungstenite::Message;

/// Response body chunks sent to the cloud must not exceed this size; the
/// control plane reassembles them in order.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024;

/// Literal text frame that closes a request or response on the wire.
pub const END_MARKER: &str = "end";

#[derive(Clone, Debug, Deserialize)]
pub struct RequestMeta {
  #[serde(rename = "requestId")]
  pub request_id: String,
  pub method: String,
  pub path: String,
  pub query: Option<String>,
  pub headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Serialize)]
pub struct ResponseMeta<'a> {
  #[serde(rename = "requestId")]
  pub request_id: &'a str,
  pub status: u16,
  pub headers: HashMap<String, String>,
}

#[derive(Debug)]
pub enum FrameItem {
  Meta(RequestMeta),
  Chunk(Bytes),
  End,
}

/// Framing violations. All of these are fatal for the session that sees them.
#[derive(Debug)]
pub enum FrameError {
  InvalidMeta(serde_json::Error),
  MetaWhileOpen,
  ChunkBeforeMeta,
  EndBeforeMeta,
}

impl std::fmt::Display for FrameError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::InvalidMeta(err) => write!(f, "invalid request meta: {err}"),
      Self::MetaWhileOpen => write!(f, "new request meta while a request is open"),
      Self::ChunkBeforeMeta => write!(f, "body chunk before any request meta"),
      Self::EndBeforeMeta => write!(f, "end marker before any request meta"),
    }
  }
}

impl std::error::Error for FrameError {}

/// Decodes the inbound half of the tunnel protocol: one text meta opens a
/// request, binary frames carry its body, the `"end"` text frame closes it.
#[derive(Default)]
pub struct FrameDecoder {
  open: bool,
}

impl FrameDecoder {
  pub fn decode_text(&mut self, text: &str) -> Result<FrameItem, FrameError> {
    if text == END_MARKER {
      if !self.open {
        return Err(FrameError::EndBeforeMeta);
      }
      self.open = false;
      return Ok(FrameItem::End);
    }
    if self.open {
      return Err(FrameError::MetaWhileOpen);
    }
    let meta: RequestMeta = serde_json::from_str(text).map_err(FrameError::InvalidMeta)?;
    self.open = true;
    Ok(FrameItem::Meta(meta))
  }

  pub fn decode_binary(&mut self, bytes: Bytes) -> Result<FrameItem, FrameError> {
    if !self.open {
      return Err(FrameError::ChunkBeforeMeta);
    }
    Ok(FrameItem::Chunk(bytes))
  }
}

/// Layers request assembly on the decoder: yields a complete
/// `(RequestMeta, body)` pair once the `"end"` frame arrives.
#[derive(Default)]
pub struct RequestAssembler {
  decoder: FrameDecoder,
  pending: Option<RequestMeta>,
  body: Vec<u8>,
}

impl RequestAssembler {
  pub fn push_text(&mut self, text: &str) -> Result<Option<(RequestMeta, Vec<u8>)>, FrameError> {
    match self.decoder.decode_text(text)? {
      FrameItem::Meta(meta) => {
        self.pending = Some(meta);
        self.body.clear();
        Ok(None)
      }
      FrameItem::End => {
        let meta = self.pending.take().ok_or(FrameError::EndBeforeMeta)?;
        Ok(Some((meta, std::mem::take(&mut self.body))))
      }
      FrameItem::Chunk(_) => unreachable!("text frames never decode to chunks"),
    }
  }

  pub fn push_binary(&mut self, bytes: Bytes) -> Result<Option<(RequestMeta, Vec<u8>)>, FrameError> {
    match self.decoder.decode_binary(bytes)? {
      FrameItem::Chunk(chunk) => {
        self.body.extend_from_slice(&chunk);
        Ok(None)
      }
      _ => unreachable!("binary frames only decode to chunks"),
    }
  }
}

/// Encodes one complete response as the ordered frame sequence
/// meta, chunks (each at most [`MAX_CHUNK_SIZE`]), `"end"`.
pub fn response_frames(
  meta: &ResponseMeta<'_>,
  body: &[u8],
) -> Result<Vec<Message>, serde_json::Error> {
  let mut frames = Vec::with_capacity(2 + body.len().div_ceil(MAX_CHUNK_SIZE));
  frames.push(Message::Text(serde_json::to_string(meta)?.into()));
  for chunk in body.chunks(MAX_CHUNK_SIZE) {
    frames.push(Message::Binary(Bytes::copy_from_slice(chunk)));
  }
  frames.push(Message::Text(END_MARKER.into()));
  Ok(frames)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn meta_json(request_id: &str) -> String {
    format!(
      r#"{{"requestId":"{request_id}","method":"GET","path":"/ping","query":"","headers":{{}}}}"#
    )
  }

  #[test]
  fn assembler_yields_complete_request() {
    let mut assembler = RequestAssembler::default();
    assert!(assembler.push_text(&meta_json("r1")).unwrap().is_none());
    assert!(assembler.push_binary(Bytes::from_static(b"hel")).unwrap().is_none());
    assert!(assembler.push_binary(Bytes::from_static(b"lo")).unwrap().is_none());
    let (meta, body) = assembler.push_text(END_MARKER).unwrap().unwrap();
    assert_eq!(meta.request_id, "r1");
    assert_eq!(meta.method, "GET");
    assert_eq!(body, b"hello");
  }

  #[test]
  fn empty_body_request_has_no_chunks() {
    let mut assembler = RequestAssembler::default();
    assembler.push_text(&meta_json("r2")).unwrap();
    let (_, body) = assembler.push_text(END_MARKER).unwrap().unwrap();
    assert!(body.is_empty());
  }

  #[test]
  fn meta_while_open_is_a_violation() {
    let mut assembler = RequestAssembler::default();
    assembler.push_text(&meta_json("r1")).unwrap();
    let err = assembler.push_text(&meta_json("r2")).unwrap_err();
    assert!(matches!(err, FrameError::MetaWhileOpen));
  }

  #[test]
  fn chunk_before_meta_is_a_violation() {
    let mut assembler = RequestAssembler::default();
    let err = assembler.push_binary(Bytes::from_static(b"x")).unwrap_err();
    assert!(matches!(err, FrameError::ChunkBeforeMeta));
  }

  #[test]
  fn end_before_meta_is_a_violation() {
    let mut decoder = FrameDecoder::default();
    let err = decoder.decode_text(END_MARKER).unwrap_err();
    assert!(matches!(err, FrameError::EndBeforeMeta));
  }

  #[test]
  fn invalid_meta_json_is_a_violation() {
    let mut decoder = FrameDecoder::default();
    let err = decoder.decode_text("{not json").unwrap_err();
    assert!(matches!(err, FrameError::InvalidMeta(_)));
  }

  #[test]
  fn response_frames_chunk_at_sixteen_kib() {
    let meta = ResponseMeta {
      request_id: "r1",
      status: 200,
      headers: HashMap::new(),
    };
    let body = vec![7u8; MAX_CHUNK_SIZE + 1];
    let frames = response_frames(&meta, &body).unwrap();
    // meta + 16384-byte chunk + 1-byte chunk + end
    assert_eq!(frames.len(), 4);
    match (&frames[1], &frames[2]) {
      (Message::Binary(a), Message::Binary(b)) => {
        assert_eq!(a.len(), MAX_CHUNK_SIZE);
        assert_eq!(b.len(), 1);
      }
      other => panic!("unexpected frames: {other:?}"),
    }
    match &frames[3] {
      Message::Text(text) => assert_eq!(text.as_str(), END_MARKER),
      other => panic!("unexpected trailer: {other:?}"),
    }
  }

  #[test]
  fn response_frames_empty_body_is_meta_then_end() {
    let meta = ResponseMeta {
      request_id: "r9",
      status: 204,
      headers: HashMap::new(),
    };
    let frames = response_frames(&meta, &[]).unwrap();
    assert_eq!(frames.len(), 2);
    assert!(matches!(frames[0], Message::Text(_)));
    assert!(matches!(&frames[1], Message::Text(text) if text.as_str() == END_MARKER));
  }

  #[test]
  fn encoded_body_reassembles_to_original() {
    // 40000 bytes must split as 16384 + 16384 + 7232.
    let body: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
    let meta = ResponseMeta {
      request_id: "r1",
      status: 200,
      headers: HashMap::new(),
    };
    let frames = response_frames(&meta, &body).unwrap();
    let chunks: Vec<&Bytes> = frames
      .iter()
      .filter_map(|frame| match frame {
        Message::Binary(bytes) => Some(bytes),
        _ => None,
      })
      .collect();
    assert_eq!(
      chunks.iter().map(|c| c.len()).collect::<Vec<_>>(),
      vec![16384, 16384, 7232]
    );
    let reassembled: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
    assert_eq!(reassembled, body);
  }

  #[test]
  fn response_meta_serializes_camel_case() {
    let meta = ResponseMeta {
      request_id: "abc",
      status: 404,
      headers: HashMap::from([("content-type".to_string(), "text/plain".to_string())]),
    };
    let json = serde_json::to_string(&meta).unwrap();
    assert!(json.contains(r#""requestId":"abc""#));
    assert!(json.contains(r#""status":404"#));
  }
}
