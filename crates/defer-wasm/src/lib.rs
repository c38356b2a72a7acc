//! # defer-wasm
//!
//! wasm-bindgen エクスポート：ブラウザから呼び出す遅延値ランタイムの公開 API。
//!
//! ## 使用方法（TypeScript）
//!
//! ```typescript
//! import { DeferredRuntime, init_panic_hook, settleEventName } from './pkg/defer_wasm';
//!
//! // パニック時のスタックトレースを有効化（開発時）
//! init_panic_hook();
//!
//! const runtime = new DeferredRuntime();
//!
//! // ドキュメントロード: データアイランドから Pending エントリを作る
//! const island = document.getElementById("__deferred-critical")!;
//! runtime.bootstrapCritical(island.dataset.route!, island.textContent!);
//!
//! // activation スクリプトの settle イベントでレジストリの値を渡す
//! document.addEventListener(settleEventName(), (e: CustomEvent) => {
//!     const { slot, routeId, key } = e.detail;
//!     const value = window.__deferredData[routeId][key];
//!     runtime.deliverValue(routeId, key, slot, JSON.stringify(value));
//!     requestAnimationFrame(() => runtime.flush());
//! });
//!
//! // 表示の更新
//! runtime.subscribe((routeId, key, state) => rerender(routeId, key, JSON.parse(state)));
//!
//! // クライアントナビゲーション（event stream）
//! runtime.resetStream(); // 前のナビゲーションの読みかけを捨てる
//! const reader = (await fetch(url, { headers: { Accept: "text/event-stream" } })).body!.getReader();
//! for (;;) {
//!     const { value, done } = await reader.read();
//!     if (done) break;
//!     const redirect = runtime.feedEventStream(value);
//!     if (redirect) { navigate(redirect); break; }
//! }
//! ```

use wasm_bindgen::prelude::*;

pub mod runtime;

pub use runtime::DeferredRuntime;

/// パニック時にブラウザコンソールにスタックトレースを出力する
///
/// 開発時に必ず呼び出すこと。本番ビルドでは feature flag で無効化可能。
#[wasm_bindgen]
pub fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// activation スクリプトが dispatch する DOM イベント名
#[wasm_bindgen(js_name = "settleEventName")]
pub fn settle_event_name() -> String {
    defer_wire::SETTLE_EVENT.to_owned()
}

/// サーバー側の既定設定と同じレジストリのグローバル名
#[wasm_bindgen(js_name = "registryGlobal")]
pub fn registry_global() -> String {
    defer_wire::DEFAULT_REGISTRY_GLOBAL.to_owned()
}
