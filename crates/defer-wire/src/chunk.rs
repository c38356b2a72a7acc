//! 出力チャンク
//!
//! 1 レスポンスは CriticalChunk 1 つと、PendingRef ごとに DeferredChunk 1 つからなる。
//! DeferredChunk は slotId 順ではなく settle 順に送られる。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use defer_value::{Outcome, PendingRef, SlotId};

/// ドキュメントシェル + クリティカルペイロード（常に最初、1 レスポンスに 1 つ）
#[derive(Debug, Clone, PartialEq)]
pub struct CriticalChunk {
    pub route_id: String,
    /// マーカー置換済みのペイロード
    pub payload: Value,
    /// Rendering contract が描画したページ markup（fallback 領域を含む）
    pub markup: String,
}

/// 1 スロット分の settle 結果
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredChunk {
    pub reference: PendingRef,
    pub outcome: Outcome,
    /// サーバー側で描画済みの markup（ドキュメントロードでのみ使う）
    pub markup: String,
}

impl DeferredChunk {
    pub fn slot_id(&self) -> SlotId {
        self.reference.slot_id
    }

    /// トランスポート非依存の settle 通知に変換する
    pub fn notification(&self) -> SettleNotification {
        SettleNotification {
            route_id: self.reference.route_id.clone(),
            key: self.reference.key.to_string(),
            slot: self.reference.slot_id,
            outcome: self.outcome.clone(),
        }
    }
}

/// チャンク（エンコーダーが書き出す単位）
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Critical(CriticalChunk),
    Deferred(DeferredChunk),
}

/// クライアントへ届ける `(routeId, key, value|error)` の組
///
/// インラインスクリプトでも event stream でも、クライアントから見える内容はこれ。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleNotification {
    pub route_id: String,
    /// `KeyPath` の文字列表現
    pub key: String,
    pub slot: SlotId,
    pub outcome: Outcome,
}

impl SettleNotification {
    pub fn to_json(&self) -> Result<String, crate::WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self, crate::WireError> {
        Ok(serde_json::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use defer_value::{DeferredError, KeyPath};
    use serde_json::json;

    fn reference() -> PendingRef {
        PendingRef {
            route_id: "routes/deferred".to_owned(),
            key: KeyPath::from("bar"),
            slot_id: SlotId(0),
        }
    }

    #[test]
    fn test_notification_from_chunk() {
        let chunk = DeferredChunk {
            reference: reference(),
            outcome: Outcome::Settled(json!("hamburger")),
            markup: "<div>hamburger</div>".to_owned(),
        };
        let n = chunk.notification();
        assert_eq!(n.route_id, "routes/deferred");
        assert_eq!(n.key, "bar");
        assert_eq!(n.slot, SlotId(0));
        assert_eq!(n.outcome, Outcome::Settled(json!("hamburger")));
    }

    #[test]
    fn test_notification_json_shape() {
        let n = SettleNotification {
            route_id: "r".to_owned(),
            key: "bar".to_owned(),
            slot: SlotId(1),
            outcome: Outcome::Failed(DeferredError::new("Oh, no!")),
        };
        let text = n.to_json().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&text).unwrap(),
            json!({"routeId": "r", "key": "bar", "slot": 1, "outcome": {"failed": {"message": "Oh, no!"}}})
        );
        assert_eq!(SettleNotification::from_json(&text).unwrap(), n);
    }
}
