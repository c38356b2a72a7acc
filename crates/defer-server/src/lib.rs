//! # defer-server
//!
//! 遅延値ストリーミングのサーバー側状態機械。
//!
//! ## 処理の流れ
//!
//! ```text
//! DataProvider::provide(ctx)
//!   → RedirectGuard::inspect      … 3xx + Location ならここで終わり（何もストリームしない）
//!   → classify                     … クリティカルペイロード + PendingSlot 列
//!   → ResponseEncoder::run         … CriticalChunk を即座に書き、
//!                                    settle した順に DeferredChunk を 1 つずつ書く
//!   → StreamWriter                 … 追記専用の sink
//! ```
//!
//! ## エンコーダーの保証
//!
//! - PendingRef が N 個なら DeferredChunk はちょうど N 個（失敗も `Failed` チャンクになる）
//! - 先に settle したスロットが先に書かれる。同時に settle したものは slotId 昇順
//! - 1 つの遅延値の失敗は兄弟スロットにもクリティカルペイロードにも影響しない
//! - sink が切断されたら書き込みをやめるが、残りの Future は最後まで駆動する

pub mod encoder;
pub mod error;
pub mod options;
pub mod provider;
pub mod redirect;
pub mod render;
pub mod respond;

pub use encoder::{ResponseEncoder, StreamSummary};
pub use error::ServeError;
pub use options::EncoderOptions;
pub use provider::{DataProvider, Envelope, ProviderError, ProviderResult, RequestContext};
pub use redirect::{Guarded, RedirectGuard, RedirectResponse};
pub use render::{NoMarkup, Renderer};
pub use respond::{
    prepare_document, prepare_navigation, prepare_navigation_stream, DocumentResponse,
    NavigationData, NavigationResponse, StreamPlan,
};

/// ステータス未指定時のレスポンスステータス
pub const DEFAULT_STATUS: u16 = 200;

/// リダイレクト指定時のステータス既定値
pub const DEFAULT_REDIRECT_STATUS: u16 = 302;

/// Location ヘッダー名
pub const LOCATION_HEADER: &str = "Location";
