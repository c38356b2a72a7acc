//! ドキュメントロード用トランスポート（インラインスクリプト）
//!
//! 遅延値の markup はサーバーで描画済みのまま `hidden` で送り、
//! 直後の activation スクリプトが fallback 領域と差し替える。
//! クライアントで再描画せずに fallback を置き換えるための形式。

use serde::Deserialize;

use defer_value::SlotId;

use crate::chunk::{CriticalChunk, DeferredChunk};
use crate::error::WireError;
use crate::escape::{escape_html, script_json};
use crate::{
    SettleTransport, DEFAULT_DATA_ISLAND_ID, DEFAULT_REGISTRY_GLOBAL, DEFAULT_SETTLE_FUNCTION,
    DOCUMENT_CONTENT_TYPE, FALLBACK_PREFIX, PLACEHOLDER_PREFIX, SETTLE_EVENT,
};

/// activation 関数の本体
///
/// `S:<id>` の子要素を `B:<id>` から `<!--/$-->` までの fallback と入れ替え、
/// settle イベントを dispatch する。`$SETTLE$` / `$EVENT$` は生成時に置換される。
const ACTIVATION_JS: &str = concat!(
    "if(!w.$SETTLE$){w.$SETTLE$=function(id,r,k,e){",
    "var s=document.getElementById(\"S:\"+id),b=document.getElementById(\"B:\"+id);",
    "if(s&&b){var p=b.parentNode,n=b.nextSibling;",
    "while(n&&!(n.nodeType===8&&n.data===\"/$\")){var x=n.nextSibling;p.removeChild(n);n=x}",
    "while(s.firstChild)p.insertBefore(s.firstChild,n);p.removeChild(b);s.parentNode.removeChild(s)}",
    "document.dispatchEvent(new CustomEvent(\"$EVENT$\",{detail:{slot:id,routeId:r,key:k,error:e}}))}}",
);

/// ドキュメントの外枠とクライアント側グローバル名
///
/// `registry_global` と `settle_function` は JS の識別子として埋め込まれる。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DocumentTemplate {
    /// CriticalChunk の先頭に置く文字列（`<!DOCTYPE html>` から `<body>` まで）
    pub head: String,
    /// close 時に書く文字列
    pub tail: String,
    pub registry_global: String,
    pub settle_function: String,
    pub data_island_id: String,
}

impl Default for DocumentTemplate {
    fn default() -> Self {
        DocumentTemplate {
            head: "<!DOCTYPE html><html><head><meta charset=\"utf-8\"></head><body>".to_owned(),
            tail: "</body></html>".to_owned(),
            registry_global: DEFAULT_REGISTRY_GLOBAL.to_owned(),
            settle_function: DEFAULT_SETTLE_FUNCTION.to_owned(),
            data_island_id: DEFAULT_DATA_ISLAND_ID.to_owned(),
        }
    }
}

impl DocumentTemplate {
    /// グローバル名が JS の識別子として使えるか
    pub fn has_valid_globals(&self) -> bool {
        is_js_identifier(&self.registry_global) && is_js_identifier(&self.settle_function)
    }
}

fn is_js_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// 隠しマークアップ要素の ID（`S:<slotId>`）
pub fn placeholder_id(slot: SlotId) -> String {
    format!("{PLACEHOLDER_PREFIX}{slot}")
}

/// ページ markup 内の fallback 領域
///
/// Rendering contract はクリティカル描画時に遅延値の位置へこれを置く。
pub fn fallback_region(slot: SlotId, fallback_markup: &str) -> String {
    format!("<!--$?--><template id=\"{FALLBACK_PREFIX}{slot}\"></template>{fallback_markup}<!--/$-->")
}

/// インラインスクリプトでチャンクを書くトランスポート
#[derive(Debug, Clone, Default)]
pub struct ScriptTransport {
    template: DocumentTemplate,
}

impl ScriptTransport {
    pub fn new(template: DocumentTemplate) -> Self {
        ScriptTransport { template }
    }

    pub fn template(&self) -> &DocumentTemplate {
        &self.template
    }

    /// レジストリのルートスライスと activation 関数を用意するスクリプト
    fn bootstrap(&self, route_id: &str) -> Result<String, WireError> {
        let t = &self.template;
        let activation = ACTIVATION_JS
            .replace("$SETTLE$", &t.settle_function)
            .replace("$EVENT$", SETTLE_EVENT);
        Ok(format!(
            "<script>(function(w){{var d=w.{reg}=w.{reg}||{{}};d[{route}]={{}};{activation}}})(window)</script>",
            reg = t.registry_global,
            route = script_json(route_id)?,
        ))
    }
}

impl SettleTransport for ScriptTransport {
    fn content_type(&self) -> &'static str {
        DOCUMENT_CONTENT_TYPE
    }

    fn encode_critical(&self, chunk: &CriticalChunk) -> Result<Vec<u8>, WireError> {
        let t = &self.template;
        let mut out = String::with_capacity(t.head.len() + chunk.markup.len() + 256);
        out.push_str(&t.head);
        out.push_str(&chunk.markup);
        out.push_str(&format!(
            "<script type=\"application/json\" id=\"{}\" data-route=\"{}\">{}</script>",
            escape_html(&t.data_island_id),
            escape_html(&chunk.route_id),
            script_json(&chunk.payload)?,
        ));
        out.push_str(&self.bootstrap(&chunk.route_id)?);
        Ok(out.into_bytes())
    }

    fn encode_deferred(&self, chunk: &DeferredChunk) -> Result<Vec<u8>, WireError> {
        let t = &self.template;
        let reference = &chunk.reference;
        let route = script_json(&reference.route_id)?;
        let key = script_json(&reference.key.to_string())?;
        let value = script_json(&chunk.outcome.to_client_value())?;

        let out = format!(
            "<div hidden id=\"{id}\">{markup}</div>\
             <script>window.{reg}[{route}][{key}]={value};\
             window.{settle}({slot},{route},{key},{failed})</script>",
            id = placeholder_id(reference.slot_id),
            markup = chunk.markup,
            reg = t.registry_global,
            settle = t.settle_function,
            slot = reference.slot_id,
            failed = chunk.outcome.is_failed(),
        );
        Ok(out.into_bytes())
    }

    fn encode_close(&self) -> Vec<u8> {
        self.template.tail.clone().into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use defer_value::{DeferredError, KeyPath, Outcome, PendingRef};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn deferred(key: &str, slot: u32, outcome: Outcome, markup: &str) -> DeferredChunk {
        DeferredChunk {
            reference: PendingRef {
                route_id: "routes/deferred".to_owned(),
                key: KeyPath::from(key),
                slot_id: SlotId(slot),
            },
            outcome,
            markup: markup.to_owned(),
        }
    }

    #[test]
    fn test_deferred_chunk_wire_text() {
        let transport = ScriptTransport::default();
        let chunk = deferred("bar", 0, Outcome::Settled(json!("hamburger")), "<div>hamburger</div>");
        let text = String::from_utf8(transport.encode_deferred(&chunk).unwrap()).unwrap();

        assert_eq!(
            text,
            concat!(
                r#"<div hidden id="S:0"><div>hamburger</div></div>"#,
                r#"<script>window.__deferredData["routes/deferred"]["bar"]="hamburger";"#,
                r#"window.__deferredSettle(0,"routes/deferred","bar",false)</script>"#,
            )
        );
    }

    #[test]
    fn test_failed_chunk_carries_error_marker() {
        let transport = ScriptTransport::default();
        let chunk = deferred(
            "bar",
            0,
            Outcome::Failed(DeferredError::new("Oh, no!")),
            "<div>Oh, no!</div>",
        );
        let text = String::from_utf8(transport.encode_deferred(&chunk).unwrap()).unwrap();

        assert!(text.contains(r#"<div hidden id="S:0"><div>Oh, no!</div>"#));
        assert!(text.contains(
            r#"window.__deferredData["routes/deferred"]["bar"]={"__error":{"message":"Oh, no!"}}"#
        ));
        assert!(text.ends_with(r#",true)</script>"#));
    }

    #[test]
    fn test_critical_chunk_contains_island_and_bootstrap() {
        let transport = ScriptTransport::default();
        let chunk = CriticalChunk {
            route_id: "routes/deferred".to_owned(),
            payload: json!({"foo": "pizza", "bar": {"__ref": 0}}),
            markup: format!("<div>pizza{}</div>", fallback_region(SlotId(0), "Loading")),
        };
        let text = String::from_utf8(transport.encode_critical(&chunk).unwrap()).unwrap();

        assert!(text.starts_with("<!DOCTYPE html>"));
        assert!(text.contains(r#"<template id="B:0"></template>Loading<!--/$-->"#));
        assert!(text.contains(
            r#"id="__deferred-critical" data-route="routes/deferred">{"foo":"pizza","bar":{"__ref":0}}</script>"#
        ));
        assert!(text.contains(r#"var d=w.__deferredData=w.__deferredData||{};d["routes/deferred"]={};"#));
        assert!(text.contains("w.__deferredSettle=function(id,r,k,e)"));
        assert!(text.contains("deferred:settle"));
    }

    #[test]
    fn test_close_writes_tail() {
        let transport = ScriptTransport::default();
        assert_eq!(transport.encode_close(), b"</body></html>".to_vec());
    }

    #[test]
    fn test_globals_must_be_identifiers() {
        let mut template = DocumentTemplate::default();
        assert!(template.has_valid_globals());
        template.registry_global = "a-b".to_owned();
        assert!(!template.has_valid_globals());
        template.registry_global = "9abc".to_owned();
        assert!(!template.has_valid_globals());
    }
}
