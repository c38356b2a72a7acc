//! # defer-value
//!
//! ローダーが返す値ツリー（ValueTree）のモデルと、
//! クリティカル / 遅延（deferred）への分類器。
//!
//! ## 分類の役割
//!
//! ローダーの戻り値は JSON 互換の値と「まだ解決していない非同期値」が混在したツリー。
//! 分類器はこれを以下の 2 つに分ける：
//! - **クリティカルペイロード**: 即座にシリアライズできる部分。未解決値は
//!   `{"__ref": slotId}` マーカーに置き換わる
//! - **PendingSlot 列**: 未解決値そのもの。slotId とキーパスでタグ付けされる
//!
//! ```text
//! {foo: "pizza", bar: <pending>}
//!   → payload: {"foo": "pizza", "bar": {"__ref": 0}}
//!   → pending: [PendingRef { key: "bar", slot_id: 0 }]
//! ```
//!
//! 分類は何も await しない。解決は `defer-server` のエンコーダーが駆動する。

pub mod classify;
pub mod error;
pub mod node;
pub mod path;

pub use classify::{
    as_marker, classify, classify_nested, marker, scan_markers, Classified, PendingRef,
    PendingSlot, SlotAllocator, SlotId,
};
pub use error::ClassificationError;
pub use node::{DeferredError, Node, Outcome, PendingFuture, PendingValue};
pub use path::KeyPath;

/// クリティカルペイロード内で未解決値を指すマーカーのキー
pub const REF_MARKER_KEY: &str = "__ref";

/// クライアントから見える値の中で失敗を表すマーカーのキー
pub const ERROR_MARKER_KEY: &str = "__error";

/// 中断された遅延値に付けるエラーメッセージ
pub const ABORTED_MESSAGE: &str = "deferred value aborted";
