//! defer-wire エラー型

use thiserror::Error;

/// ワイヤフォーマットのエンコード/デコードエラー
#[derive(Debug, Error)]
pub enum WireError {
    /// JSON のシリアライズ/デシリアライズに失敗
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    /// event stream のフレームが UTF-8 ではない
    #[error("Event stream frame is not valid UTF-8")]
    InvalidUtf8,
    /// 未知の event 名
    #[error("Unknown event `{0}`")]
    UnknownEvent(String),
    /// data 行がないフレーム
    #[error("Event `{0}` has no data")]
    MissingData(String),
}
