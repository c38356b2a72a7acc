//! defer-server エラー型

use thiserror::Error;

use defer_value::ClassificationError;
use defer_wire::WireError;

use crate::provider::ProviderError;

/// リクエスト全体を失敗させるエラー
///
/// どれも 1 バイトも書く前に起きる（`Wire` だけは CriticalChunk のエンコード時）。
/// 個々の遅延値の失敗はここには来ない。
#[derive(Debug, Error)]
pub enum ServeError {
    /// DataProvider 自体が失敗した（エラーページ側の担当）
    #[error("Data provider failed: {0}")]
    Provider(#[from] ProviderError),
    /// ローダー結果が不正
    #[error("Malformed provider result: {0}")]
    Classification(#[from] ClassificationError),
    /// チャンクのエンコードに失敗
    #[error("Wire encoding failed: {0}")]
    Wire(#[from] WireError),
    /// EncoderOptions が不正
    #[error("Invalid encoder options: {0}")]
    InvalidOptions(String),
}

impl ServeError {
    /// 汎用エラーレスポンスのステータス
    pub fn status_code(&self) -> u16 {
        500
    }
}
