//! クライアントナビゲーション用トランスポート（event stream）
//!
//! ## フレーム形式
//! ```text
//! event: <name>\n
//! data: <1 行の JSON>\n
//! \n
//! ```
//!
//! markup は送らない。クライアントは settle 通知を直接レジストリに入れ、自分で描画する。

use log::{trace, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chunk::{CriticalChunk, DeferredChunk, SettleNotification};
use crate::error::WireError;
use crate::{SettleTransport, EVENT_STREAM_CONTENT_TYPE};

const EVENT_CRITICAL: &str = "critical";
const EVENT_SETTLE: &str = "settle";
const EVENT_REDIRECT: &str = "redirect";
const EVENT_DONE: &str = "done";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CriticalFrame {
    route_id: String,
    payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct RedirectFrame {
    status: u16,
    location: String,
}

/// デコードされた 1 イベント
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Critical { route_id: String, payload: Value },
    Settle(SettleNotification),
    /// ナビゲーション先がリダイレクトした（レジストリには何も入れない）
    Redirect { status: u16, location: String },
    Done,
}

fn frame(event: &str, data: &str) -> Vec<u8> {
    format!("event: {event}\ndata: {data}\n\n").into_bytes()
}

/// event stream でチャンクを書くトランスポート
#[derive(Debug, Clone, Copy, Default)]
pub struct EventStreamTransport;

impl EventStreamTransport {
    /// リダイレクトを 1 フレームで表す（他のフレームは一切送らない）
    pub fn encode_redirect(&self, status: u16, location: &str) -> Result<Vec<u8>, WireError> {
        let data = serde_json::to_string(&RedirectFrame { status, location: location.to_owned() })?;
        Ok(frame(EVENT_REDIRECT, &data))
    }
}

impl SettleTransport for EventStreamTransport {
    fn content_type(&self) -> &'static str {
        EVENT_STREAM_CONTENT_TYPE
    }

    fn encode_critical(&self, chunk: &CriticalChunk) -> Result<Vec<u8>, WireError> {
        let data = serde_json::to_string(&CriticalFrame {
            route_id: chunk.route_id.clone(),
            payload: chunk.payload.clone(),
        })?;
        Ok(frame(EVENT_CRITICAL, &data))
    }

    fn encode_deferred(&self, chunk: &DeferredChunk) -> Result<Vec<u8>, WireError> {
        Ok(frame(EVENT_SETTLE, &chunk.notification().to_json()?))
    }

    fn encode_close(&self) -> Vec<u8> {
        frame(EVENT_DONE, "{}")
    }

    fn wants_markup(&self) -> bool {
        false
    }
}

/// `feed` 1 回分の結果
///
/// 不正なフレームはそこだけ飛ばし、前後の正しいフレームのイベントは捨てない。
#[derive(Debug, Default)]
pub struct Decoded {
    /// 到着順のイベント
    pub events: Vec<StreamEvent>,
    /// 飛ばしたフレームのエラー（到着順）
    pub errors: Vec<WireError>,
}

impl Decoded {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// 任意の位置で分割されたバイト列から event stream のフレームを組み立てる
///
/// 空行（`\n\n`）までが 1 フレーム。未完成のフレームは次の `feed` まで保持する。
/// フレーム境界より前で UTF-8 の文字が切れていても問題ない（バイト単位でバッファする）。
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        EventStreamDecoder { buffer: Vec::new() }
    }

    /// バイト列を追加し、完成したイベントを到着順に返す
    ///
    /// 各フレームのエラー（`WireError::InvalidUtf8` / `UnknownEvent` / `MissingData` / `Json`）は
    /// `Decoded::errors` に入り、後続のフレームのデコードは続く。
    pub fn feed(&mut self, bytes: &[u8]) -> Decoded {
        self.buffer.extend_from_slice(bytes);

        let mut decoded = Decoded::default();
        while let Some(end) = find_frame_end(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let frame = core::str::from_utf8(&raw[..end])
                .map_err(|_| WireError::InvalidUtf8)
                .and_then(parse_frame);
            match frame {
                Ok(Some(event)) => decoded.events.push(event),
                Ok(None) => {}
                Err(e) => {
                    warn!("skipping malformed event stream frame: {}", e);
                    decoded.errors.push(e);
                }
            }
        }
        decoded
    }

    /// 未完成のフレームが残っているか
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// 未完成のフレームを捨てる（新しいストリームを読み始める前に呼ぶ）
    pub fn reset(&mut self) {
        if !self.buffer.is_empty() {
            trace!("discarding {} buffered bytes", self.buffer.len());
        }
        self.buffer.clear();
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn parse_frame(text: &str) -> Result<Option<StreamEvent>, WireError> {
    let mut event = None;
    let mut data: Option<String> = None;

    for line in text.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            // コメント行
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_owned()),
            "data" => match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_owned()),
            },
            _ => {}
        }
    }

    let Some(event) = event else {
        // event 名のないフレーム（keep-alive 等）は無視
        return Ok(None);
    };
    trace!("event stream frame: {}", event);

    let data = data.ok_or_else(|| WireError::MissingData(event.clone()))?;
    let parsed = match event.as_str() {
        EVENT_CRITICAL => {
            let frame: CriticalFrame = serde_json::from_str(&data)?;
            StreamEvent::Critical { route_id: frame.route_id, payload: frame.payload }
        }
        EVENT_SETTLE => StreamEvent::Settle(SettleNotification::from_json(&data)?),
        EVENT_REDIRECT => {
            let frame: RedirectFrame = serde_json::from_str(&data)?;
            StreamEvent::Redirect { status: frame.status, location: frame.location }
        }
        EVENT_DONE => StreamEvent::Done,
        _ => return Err(WireError::UnknownEvent(event)),
    };
    Ok(Some(parsed))
}
