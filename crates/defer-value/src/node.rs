//! ValueTree のノードと、遅延値の終端状態

use core::fmt;
use core::future::Future;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{ABORTED_MESSAGE, ERROR_MARKER_KEY};

/// 遅延値が解決するまでの Future
///
/// 解決値自体がさらに Pending を含むこともある（deferred-within-deferred）。
pub type PendingFuture = BoxFuture<'static, Result<Node, DeferredError>>;

/// 1 つの遅延値（まだ分類されていない非同期値）
///
/// 一度だけ消費される。分類器は中身に触れず、エンコーダーへそのまま渡す。
pub struct PendingValue(PendingFuture);

impl PendingValue {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<Node, DeferredError>> + Send + 'static,
    {
        PendingValue(future.boxed())
    }

    /// すでに解決済みの値を Pending として包む（テスト・ナビゲーション用）
    pub fn resolved(value: impl Into<Node>) -> Self {
        let node = value.into();
        PendingValue::new(async move { Ok(node) })
    }

    /// 即座に失敗する Pending
    pub fn rejected(message: impl Into<String>) -> Self {
        let error = DeferredError::new(message);
        PendingValue::new(async move { Err(error) })
    }

    pub fn into_future(self) -> PendingFuture {
        self.0
    }
}

impl fmt::Debug for PendingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PendingValue(..)")
    }
}

/// ValueTree のノード
///
/// `Object` はキー挿入順を保持する。この順序が slotId の採番順を決める。
#[derive(Debug)]
pub enum Node {
    /// JSON 互換のプレーンな値（そのままコピーされる）
    Value(Value),
    /// 挿入順付きのオブジェクト
    Object(Vec<(String, Node)>),
    Array(Vec<Node>),
    /// 未解決の非同期値
    Pending(PendingValue),
}

impl Node {
    /// `(key, node)` の列からオブジェクトノードを組み立てる
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Node)>,
    {
        Node::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<Node, DeferredError>> + Send + 'static,
    {
        Node::Pending(PendingValue::new(future))
    }

    /// ツリーのどこかに Pending を含むか
    pub fn has_pending(&self) -> bool {
        match self {
            Node::Value(_) => false,
            Node::Pending(_) => true,
            Node::Object(entries) => entries.iter().any(|(_, node)| node.has_pending()),
            Node::Array(items) => items.iter().any(Node::has_pending),
        }
    }
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        Node::Value(value)
    }
}

impl From<&str> for Node {
    fn from(s: &str) -> Self {
        Node::Value(Value::String(s.to_owned()))
    }
}

impl From<String> for Node {
    fn from(s: String) -> Self {
        Node::Value(Value::String(s))
    }
}

impl From<PendingValue> for Node {
    fn from(pending: PendingValue) -> Self {
        Node::Pending(pending)
    }
}

/// 遅延値の失敗（DeferredValueError）
///
/// レスポンス全体にとっては非致命的。該当スロットの `Failed` 終端状態として記録される。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct DeferredError {
    pub message: String,
}

impl DeferredError {
    pub fn new(message: impl Into<String>) -> Self {
        DeferredError { message: message.into() }
    }

    /// 中断シグナルで打ち切られたスロット用のエラー
    pub fn aborted() -> Self {
        DeferredError::new(ABORTED_MESSAGE)
    }
}

/// 遅延値の終端状態
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Settled(Value),
    Failed(DeferredError),
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// クライアントのレジストリオブジェクトに書き込む値へ変換する
    ///
    /// 失敗は `{"__error": {"message": "..."}}` マーカーになる。
    pub fn to_client_value(&self) -> Value {
        match self {
            Outcome::Settled(value) => value.clone(),
            Outcome::Failed(error) => {
                let mut marker = Map::new();
                marker.insert(ERROR_MARKER_KEY.to_owned(), json!({ "message": error.message }));
                Value::Object(marker)
            }
        }
    }

    /// `to_client_value` の逆変換
    pub fn from_client_value(value: Value) -> Self {
        if let Some(message) = error_marker_message(&value) {
            return Outcome::Failed(DeferredError::new(message));
        }
        Outcome::Settled(value)
    }
}

fn error_marker_message(value: &Value) -> Option<String> {
    let object: &Map<String, Value> = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    let inner = object.get(ERROR_MARKER_KEY)?;
    let message = inner.get("message")?.as_str()?;
    Some(message.to_owned())
}
