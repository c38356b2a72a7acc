//! defer-stream エラー型

use thiserror::Error;

/// 下位の接続がチャンクを受け付けなかった
///
/// レスポンスにとっては非致命的。以後のチャンクが届かなくなるだけ。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// クライアントが切断した（受信側が閉じている）
    #[error("Connection closed by peer")]
    Disconnected,
    /// close 済みのストリームに書こうとした
    #[error("Stream already closed")]
    Closed,
    /// 受信側の読み取りが追いつかず、上限までチャンクが溜まった
    #[error("Receiver fell behind; {0} chunks already buffered")]
    Overflowed(usize),
    /// I/O エラー
    #[error("I/O error: {0}")]
    Io(String),
}
