//! DeferredRuntime wasm-bindgen エクスポート
//!
//! ブラウザ側のエントリポイント。インラインスクリプトの activation 関数と
//! ナビゲーション時の event stream の両方から settle 通知を受け、
//! HydrationRegistry に入れて UI 側のコールバックへ通知する。

use std::collections::BTreeMap;

use js_sys::{Function, Promise};
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;

use defer_client::{
    Boundary, BoundaryView, Delivery, EntryState, HydrationRegistry, RouteScope, Subscription,
};
use defer_value::{DeferredError, Outcome, SlotId};
use defer_wire::{EventStreamDecoder, SettleNotification, StreamEvent};

/// JS の Promise が理由なしで reject されたときのメッセージ
const UNKNOWN_REJECTION: &str = "deferred value rejected";

/// 遅延値ランタイム
///
/// ## 内部アーキテクチャ
///
/// ```text
/// DeferredRuntime
///   ├── HydrationRegistry  (defer-client) - (routeId, key) ごとの状態表
///   ├── RouteScope*        (defer-client) - マウント中のルート（drop でスライス破棄）
///   ├── Subscription*      (defer-client) - JS コールバックの購読
///   └── EventStreamDecoder (defer-wire)   - ナビゲーション応答のフレーム組み立て
/// ```
///
/// ## スレッド安全性
///
/// WASM はシングルスレッドなので `Rc` / `RefCell` のまま公開する。
#[wasm_bindgen]
pub struct DeferredRuntime {
    registry: HydrationRegistry,
    scopes: BTreeMap<String, RouteScope>,
    subscriptions: BTreeMap<u64, Subscription>,
    decoder: EventStreamDecoder,
}

impl Default for DeferredRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[wasm_bindgen]
impl DeferredRuntime {
    #[wasm_bindgen(constructor)]
    pub fn new() -> DeferredRuntime {
        DeferredRuntime {
            registry: HydrationRegistry::new(),
            scopes: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            decoder: EventStreamDecoder::new(),
        }
    }

    /// ルートをマウントする（同じルートなら新しいインスタンスに置き換わる）
    #[wasm_bindgen(js_name = "mountRoute")]
    pub fn mount_route(&mut self, route_id: &str) {
        let scope = self.registry.mount_route(route_id);
        self.scopes.insert(route_id.to_owned(), scope);
    }

    /// ルートをアンマウントする。未 settle の値は以後捨てられる
    ///
    /// # 戻り値
    /// マウントされていたか
    #[wasm_bindgen(js_name = "unmountRoute")]
    pub fn unmount_route(&mut self, route_id: &str) -> bool {
        self.scopes.remove(route_id).is_some()
    }

    /// データアイランドのクリティカルペイロードを取り込む
    ///
    /// ルートが未マウントならマウントする。
    ///
    /// # 引数
    /// - `route_id`: データアイランドの `data-route`
    /// - `payload_json`: データアイランドの中身
    ///
    /// # 戻り値
    /// Pending として登録したエントリ数
    ///
    /// # エラー
    /// - JSON として読めない
    #[wasm_bindgen(js_name = "bootstrapCritical")]
    pub fn bootstrap_critical(&mut self, route_id: &str, payload_json: &str) -> Result<u32, JsError> {
        let payload: Value = serde_json::from_str(payload_json)
            .map_err(|e| JsError::new(&format!("Invalid critical payload: {}", e)))?;
        if !self.scopes.contains_key(route_id) {
            self.mount_route(route_id);
        }
        let created = self
            .registry
            .hydrate_critical(route_id, payload)
            .map_err(|e| JsError::new(&format!("Hydration failed: {}", e)))?;
        Ok(created as u32)
    }

    /// JSON の settle 通知をキューに積む（反映は `flush`）
    ///
    /// # 戻り値
    /// `"queued"` / `"duplicate"` / `"unknownRoute"`
    #[wasm_bindgen]
    pub fn deliver(&mut self, notification_json: &str) -> Result<String, JsError> {
        let delivery = self
            .registry
            .deliver_json(notification_json)
            .map_err(|e| JsError::new(&format!("Invalid settle notification: {}", e)))?;
        Ok(delivery_name(delivery).to_owned())
    }

    /// activation スクリプトがレジストリに書いた値をそのまま渡す
    ///
    /// `{"__error": {...}}` マーカーなら失敗として扱う。
    #[wasm_bindgen(js_name = "deliverValue")]
    pub fn deliver_value(
        &mut self,
        route_id: &str,
        key: &str,
        slot: u32,
        value_json: &str,
    ) -> Result<String, JsError> {
        let value: Value = serde_json::from_str(value_json)
            .map_err(|e| JsError::new(&format!("Invalid deferred value: {}", e)))?;
        let delivery = self.registry.deliver(SettleNotification {
            route_id: route_id.to_owned(),
            key: key.to_owned(),
            slot: SlotId(slot),
            outcome: Outcome::from_client_value(value),
        });
        Ok(delivery_name(delivery).to_owned())
    }

    /// キューを反映し、購読中のコールバックを呼ぶ
    ///
    /// 描画中に呼ばれた場合は何もしない（`requestAnimationFrame` 等で再度呼ぶこと）。
    #[wasm_bindgen]
    pub fn flush(&mut self) -> u32 {
        self.registry.flush() as u32
    }

    /// ナビゲーション応答（event stream）の受信バイト列を処理する
    ///
    /// `critical` でルートを新しくマウントし、`settle` を deliver して最後に flush する。
    /// 不正なフレームはそこだけ飛ばし、正しいフレームをすべて反映してからエラーを返す。
    ///
    /// # 戻り値
    /// `redirect` フレームを受け取ったら遷移先。そのフレーム以降は捨て、次の
    /// ストリームのためにデコーダーを空にする
    ///
    /// # エラー
    /// - フレームの JSON が不正
    /// - 未知のイベント名
    #[wasm_bindgen(js_name = "feedEventStream")]
    pub fn feed_event_stream(&mut self, bytes: &[u8]) -> Result<Option<String>, JsError> {
        let decoded = self.decoder.feed(bytes);
        let mut failure = decoded.errors.first().map(|e| format!("Event stream decode failed: {}", e));

        let mut redirect = None;
        for event in decoded.events {
            match event {
                StreamEvent::Critical { route_id, payload } => {
                    self.mount_route(&route_id);
                    if let Err(e) = self.registry.hydrate_critical(&route_id, payload) {
                        failure.get_or_insert_with(|| format!("Hydration failed: {}", e));
                    }
                }
                StreamEvent::Settle(notification) => {
                    let delivery = self.registry.deliver(notification);
                    if delivery != Delivery::Queued {
                        debug!("settle frame ignored ({})", delivery_name(delivery));
                    }
                }
                StreamEvent::Redirect { status, location } => {
                    debug!("navigation redirected to {} ({})", location, status);
                    self.decoder.reset();
                    redirect = Some(location);
                    break;
                }
                StreamEvent::Done => debug!("navigation stream done"),
            }
        }
        self.registry.flush();

        match (redirect, failure) {
            (Some(location), Some(message)) => {
                // 遷移が優先（残りのフレームはもう使わない）
                warn!("{}; following redirect anyway", message);
                Ok(Some(location))
            }
            (redirect, None) => Ok(redirect),
            (None, Some(message)) => Err(JsError::new(&message)),
        }
    }

    /// 新しいナビゲーション応答を読み始める
    ///
    /// 前のナビゲーションを途中で捨てたとき、残っている未完成のフレームを破棄する。
    #[wasm_bindgen(js_name = "resetStream")]
    pub fn reset_stream(&mut self) {
        self.decoder.reset();
    }

    /// 未完成のフレームを保持しているか
    #[wasm_bindgen(js_name = "hasPartialFrame")]
    pub fn has_partial_frame(&self) -> bool {
        self.decoder.has_partial()
    }

    /// エントリの状態を JSON で返す
    ///
    /// ```json
    /// {"state": "pending"}
    /// {"state": "settled", "value": "hamburger"}
    /// {"state": "failed", "error": "Oh, no!"}
    /// ```
    #[wasm_bindgen(js_name = "entryState")]
    pub fn entry_state(&self, route_id: &str, key: &str) -> Option<String> {
        self.registry.entry(route_id, key).map(|state| state_json(&state))
    }

    /// ルートのまだ Pending のエントリ数
    #[wasm_bindgen(js_name = "pendingCount")]
    pub fn pending_count(&self, route_id: &str) -> u32 {
        self.registry.pending_count(route_id) as u32
    }

    /// settle 通知を購読する
    ///
    /// `callback(routeId, key, stateJson)` が flush のたびにエントリごとに 1 回呼ばれる。
    ///
    /// # 戻り値
    /// `unsubscribe` に渡す ID
    #[wasm_bindgen]
    pub fn subscribe(&mut self, callback: Function) -> f64 {
        let subscription = self.registry.subscribe(move |change| {
            let result = callback.call3(
                &JsValue::NULL,
                &JsValue::from_str(&change.route_id),
                &JsValue::from_str(&change.key),
                &JsValue::from_str(&state_json(&change.state)),
            );
            if result.is_err() {
                warn!("settle callback threw for {}[{}]", change.route_id, change.key);
            }
        });
        let id = subscription.id();
        self.subscriptions.insert(id, subscription);
        id as f64
    }

    #[wasm_bindgen]
    pub fn unsubscribe(&mut self, id: f64) -> bool {
        self.subscriptions.remove(&(id as u64)).is_some()
    }

    /// クライアントナビゲーションで得た Promise を Pending として追跡する
    ///
    /// Promise の解決値は JSON 化して Settled、reject は Failed になる。
    ///
    /// # エラー
    /// - ルートがマウントされていない
    #[wasm_bindgen(js_name = "trackPromise")]
    pub fn track_promise(&mut self, route_id: &str, key: &str, promise: Promise) -> Result<(), JsError> {
        let tracked = self
            .registry
            .track_local(route_id, key, async move {
                match JsFuture::from(promise).await {
                    Ok(value) => Outcome::Settled(js_to_json(&value)),
                    Err(reason) => Outcome::Failed(DeferredError::new(rejection_message(&reason))),
                }
            })
            .map_err(|e| JsError::new(&format!("Cannot track promise: {}", e)))?;
        wasm_bindgen_futures::spawn_local(tracked);
        Ok(())
    }

    /// Boundary の現在の表示状態を JSON で返す
    ///
    /// 何度呼んでもエントリを読むだけで、非同期処理を再開しない。
    ///
    /// ```json
    /// {"view": "waiting"}
    /// {"view": "resolved", "value": "hamburger"}
    /// {"view": "errored", "markup": "Oh, no!"}
    /// {"view": "propagate", "error": "Oh, no!"}
    /// ```
    ///
    /// # 引数
    /// - `has_error_view`: このバウンダリが自前のエラービューを持つか。
    ///   持つ場合の `markup` はエラーメッセージ（描画は JS 側）
    #[wasm_bindgen(js_name = "renderBoundary")]
    pub fn render_boundary(
        &self,
        route_id: &str,
        key: &str,
        has_error_view: bool,
    ) -> Result<String, JsError> {
        let mut boundary = Boundary::new(&self.registry, route_id, key);
        if has_error_view {
            boundary = boundary.with_error_view(|e| e.message.clone());
        }
        let view = boundary
            .view()
            .map_err(|e| JsError::new(&format!("Boundary lookup failed: {}", e)))?;
        Ok(view_json(&view))
    }
}

// ===== JSON 変換 =====

#[derive(Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
enum EntrySnapshot<'a> {
    Pending,
    Settled { value: &'a Value },
    Failed { error: &'a str },
}

#[derive(Serialize)]
#[serde(tag = "view", rename_all = "camelCase")]
enum ViewSnapshot<'a> {
    Waiting,
    Resolved { value: &'a Value },
    Errored { markup: &'a str },
    Propagate { error: &'a str },
}

pub(crate) fn state_json(state: &EntryState) -> String {
    let snapshot = match state {
        EntryState::Pending => EntrySnapshot::Pending,
        EntryState::Settled(value) => EntrySnapshot::Settled { value },
        EntryState::Failed(error) => EntrySnapshot::Failed { error: &error.message },
    };
    serde_json::to_string(&snapshot).unwrap_or_default()
}

pub(crate) fn view_json(view: &BoundaryView) -> String {
    let snapshot = match view {
        BoundaryView::Waiting => ViewSnapshot::Waiting,
        BoundaryView::Resolved(value) => ViewSnapshot::Resolved { value },
        BoundaryView::Errored(markup) => ViewSnapshot::Errored { markup },
        BoundaryView::Propagate(error) => ViewSnapshot::Propagate { error: &error.message },
    };
    serde_json::to_string(&snapshot).unwrap_or_default()
}

pub(crate) fn delivery_name(delivery: Delivery) -> &'static str {
    match delivery {
        Delivery::Queued => "queued",
        Delivery::Duplicate => "duplicate",
        Delivery::UnknownRoute => "unknownRoute",
    }
}

/// JS の値を JSON 経由で serde_json の値にする（undefined・関数は null）
fn js_to_json(value: &JsValue) -> Value {
    js_sys::JSON::stringify(value)
        .ok()
        .and_then(|s| s.as_string())
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null)
}

fn rejection_message(reason: &JsValue) -> String {
    reason
        .dyn_ref::<js_sys::Error>()
        .map(|e| String::from(e.message()))
        .or_else(|| reason.as_string())
        .unwrap_or_else(|| UNKNOWN_REJECTION.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_json_shapes() {
        assert_eq!(state_json(&EntryState::Pending), r#"{"state":"pending"}"#);
        assert_eq!(
            state_json(&EntryState::Settled(json!("hamburger"))),
            r#"{"state":"settled","value":"hamburger"}"#
        );
        assert_eq!(
            state_json(&EntryState::Failed(DeferredError::new("Oh, no!"))),
            r#"{"state":"failed","error":"Oh, no!"}"#
        );
    }

    #[test]
    fn test_view_json_shapes() {
        assert_eq!(view_json(&BoundaryView::Waiting), r#"{"view":"waiting"}"#);
        assert_eq!(
            view_json(&BoundaryView::Errored("Oh, no!".to_owned())),
            r#"{"view":"errored","markup":"Oh, no!"}"#
        );
        assert_eq!(
            view_json(&BoundaryView::Propagate(DeferredError::new("Oh, no!"))),
            r#"{"view":"propagate","error":"Oh, no!"}"#
        );
    }

    #[test]
    fn test_delivery_names() {
        assert_eq!(delivery_name(Delivery::Queued), "queued");
        assert_eq!(delivery_name(Delivery::UnknownRoute), "unknownRoute");
    }
}
