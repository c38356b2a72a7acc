//! defer-client エラー型

use thiserror::Error;

use defer_wire::WireError;

/// レジストリ操作のエラー
///
/// 遅延値そのものの失敗（`DeferredError`）はここには来ない。
/// それはエントリの `Failed` 状態として記録される。
#[derive(Debug, Error)]
pub enum HydrationError {
    /// ルートがマウントされていない（アンマウント済みを含む）
    #[error("Route `{0}` is not mounted")]
    UnknownRoute(String),
    /// ルートにそのキーのエントリがない
    #[error("No hydration entry for `{route_id}`[`{key}`]")]
    UnknownEntry { route_id: String, key: String },
    /// すでに settle したエントリを追跡し直そうとした
    #[error("Hydration entry `{route_id}`[`{key}`] has already settled")]
    AlreadySettled { route_id: String, key: String },
    /// レジストリがすでに破棄されている
    #[error("Hydration registry has been dropped")]
    RegistryDropped,
    /// 受信した通知・データアイランドが読めない
    #[error("Malformed settle notification: {0}")]
    Wire(#[from] WireError),
}
