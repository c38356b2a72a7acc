//! Rendering contract
//!
//! UI ライブラリ側の描画を抽象化する。同期的で副作用を持たないこと。

use serde_json::Value;

use defer_value::{Outcome, PendingRef};

pub trait Renderer: Send + Sync {
    /// クリティカル描画
    ///
    /// 遅延スロットの位置には `defer_wire::fallback_region` で fallback を置く。
    fn render_page(&self, route_id: &str, payload: &Value, slots: &[PendingRef]) -> String;

    /// settle したスロットの markup（成功時は内容、失敗時はエラービュー）
    fn render_deferred(&self, slot: &PendingRef, outcome: &Outcome) -> String;
}

/// markup を作らない Renderer（event stream でのナビゲーション用）
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMarkup;

impl Renderer for NoMarkup {
    fn render_page(&self, _route_id: &str, _payload: &Value, _slots: &[PendingRef]) -> String {
        String::new()
    }

    fn render_deferred(&self, _slot: &PendingRef, _outcome: &Outcome) -> String {
        String::new()
    }
}
