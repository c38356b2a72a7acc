//! # defer-wire
//!
//! チャンクのモデルと、それをバイト列にする 2 つのトランスポート。
//!
//! ## ドキュメントロード（インラインスクリプト）
//!
//! ```text
//! CriticalChunk:
//!   [head][ページ markup（fallback 領域 <template id="B:N"> を含む）]
//!   <script type="application/json" id="__deferred-critical" data-route="ROUTE">PAYLOAD</script>
//!   <script>bootstrap（レジストリ・activation 関数の定義）</script>
//!
//! DeferredChunk（settle した順に 1 つずつ）:
//!   <div hidden id="S:N">MARKUP</div>
//!   <script>window.__deferredData["ROUTE"]["KEY"]=VALUE;window.__deferredSettle(N,"ROUTE","KEY",IS_ERROR)</script>
//!
//! close:
//!   [tail]（既定は </body></html>）
//! ```
//!
//! ## クライアントナビゲーション（event stream）
//!
//! ```text
//! event: critical\ndata: {"routeId":…,"payload":…}\n\n
//! event: settle\ndata: <SettleNotification>\n\n    ← スロットごと
//! event: done\ndata: {}\n\n
//! ```
//!
//! どちらも「(routeId, key, value|error) を到着順にクライアントへ届ける」という
//! 同じ契約（`SettleTransport`）の実装にすぎない。

pub mod chunk;
pub mod error;
pub mod escape;
pub mod event_stream;
pub mod script;

pub use chunk::{Chunk, CriticalChunk, DeferredChunk, SettleNotification};
pub use error::WireError;
pub use event_stream::{Decoded, EventStreamDecoder, EventStreamTransport, StreamEvent};
pub use script::{fallback_region, placeholder_id, DocumentTemplate, ScriptTransport};

/// 隠しマークアップ要素の ID 接頭辞（`S:<slotId>`）
pub const PLACEHOLDER_PREFIX: &str = "S:";

/// fallback 領域の開始 `<template>` の ID 接頭辞（`B:<slotId>`）
pub const FALLBACK_PREFIX: &str = "B:";

/// クライアントのレジストリオブジェクトの既定名（`window.__deferredData`）
pub const DEFAULT_REGISTRY_GLOBAL: &str = "__deferredData";

/// activation 関数の既定名（`window.__deferredSettle`）
pub const DEFAULT_SETTLE_FUNCTION: &str = "__deferredSettle";

/// クリティカルペイロードのデータアイランドの既定 ID
pub const DEFAULT_DATA_ISLAND_ID: &str = "__deferred-critical";

/// settle 時に document へ dispatch される DOM イベント名
pub const SETTLE_EVENT: &str = "deferred:settle";

/// event stream の Content-Type
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// ドキュメントの Content-Type
pub const DOCUMENT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// 1 つのスロット分をバイト列にするトランスポート
///
/// 実装はステートレスで、エンコーダーが到着順に呼び出す。
pub trait SettleTransport {
    /// レスポンスの Content-Type
    fn content_type(&self) -> &'static str;

    /// 必ず最初に 1 回だけ送られるチャンク
    fn encode_critical(&self, chunk: &CriticalChunk) -> Result<Vec<u8>, WireError>;

    /// settle したスロット 1 つ分
    fn encode_deferred(&self, chunk: &DeferredChunk) -> Result<Vec<u8>, WireError>;

    /// ストリームを閉じる直前に書く末尾
    fn encode_close(&self) -> Vec<u8>;

    /// 遅延値の markup をサーバーで描画する必要があるか
    fn wants_markup(&self) -> bool {
        true
    }
}
