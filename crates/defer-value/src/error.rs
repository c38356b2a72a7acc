//! defer-value エラー型

use thiserror::Error;

/// ローダー結果の分類エラー
///
/// どれも致命的で、1 バイトも送信する前にリクエスト全体を失敗させる。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassificationError {
    /// route_id が空
    #[error("Route id must not be empty")]
    EmptyRouteId,
    /// ツリーの根そのものが未解決値（キーを持たないのでスロットに紐付けられない）
    #[error("The root of a value tree cannot be pending")]
    PendingRoot,
    /// マーカーと衝突する予約キーがデータに含まれている
    #[error("Reserved key `{key}` found at `{path}`")]
    ReservedKey { key: String, path: String },
    /// 同じオブジェクトに同じキーが 2 回現れた
    #[error("Duplicate key `{key}` at `{path}`")]
    DuplicateKey { key: String, path: String },
    /// 未解決値を含むキーに `.` が入っている（キーパスの区切りと区別できない）
    #[error("Key `{key}` at `{path}` contains `.` and cannot address a deferred value")]
    SeparatorInKey { key: String, path: String },
    /// HTTP ステータスが 100..=599 の範囲外
    #[error("Invalid status code: {0}")]
    InvalidStatus(u16),
    /// 3xx ステータスなのに Location がない
    #[error("Redirect status {0} without a Location target")]
    MissingLocation(u16),
}
