//! Value Classifier
//!
//! ValueTree をキー挿入順の深さ優先で走査し、クリティカルペイロードと
//! PendingSlot 列に分ける。

use core::fmt;

use log::trace;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ClassificationError;
use crate::node::{Node, PendingValue};
use crate::path::KeyPath;
use crate::{ERROR_MARKER_KEY, REF_MARKER_KEY};

/// 1 レスポンス内で遅延値を識別する番号（0 始まり、出現順）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// レスポンス単位の slotId 採番器
///
/// ネストした遅延値の再分類でも同じ採番器を使い続けるので、
/// 内側のスロットは外側のスロットの続きから番号が振られる。
#[derive(Debug, Default)]
pub struct SlotAllocator {
    next: u32,
}

impl SlotAllocator {
    pub fn new() -> Self {
        SlotAllocator { next: 0 }
    }

    /// `next` 番から払い出す採番器（別プロセスで採番済みの続きを振る）
    pub fn starting_at(next: u32) -> Self {
        SlotAllocator { next }
    }

    /// 次の slotId を払い出す
    pub fn next(&mut self) -> SlotId {
        let id = SlotId(self.next);
        self.next += 1;
        id
    }

    /// これまでに払い出したスロット数
    pub fn allocated(&self) -> u32 {
        self.next
    }
}

/// 1 つの遅延値への参照
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRef {
    /// 所有ルート
    pub route_id: String,
    /// ValueTree 内の位置
    pub key: KeyPath,
    pub slot_id: SlotId,
}

/// 分類済みの遅延値（参照 + まだ誰も poll していない Future）
#[derive(Debug)]
pub struct PendingSlot {
    pub reference: PendingRef,
    pub value: PendingValue,
}

/// 分類結果
#[derive(Debug)]
pub struct Classified {
    pub route_id: String,
    /// マーカー置換済みのクリティカルペイロード
    pub payload: Value,
    /// slotId 昇順の遅延値
    pub pending: Vec<PendingSlot>,
}

impl Classified {
    /// 遅延値を 1 つも含まない（通常の JSON と同じ）か
    pub fn is_critical_only(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn references(&self) -> impl Iterator<Item = &PendingRef> {
        self.pending.iter().map(|slot| &slot.reference)
    }
}

/// ローダー結果のツリーを分類する
///
/// # エラー
/// - `ClassificationError::EmptyRouteId`
/// - `ClassificationError::PendingRoot`: ツリーの根が Pending
/// - `ClassificationError::ReservedKey` / `DuplicateKey`: データがマーカーと衝突する
/// - `ClassificationError::SeparatorInKey`: 未解決値へ至るキーに `.` が含まれる
pub fn classify(
    route_id: &str,
    tree: Node,
    slots: &mut SlotAllocator,
) -> Result<Classified, ClassificationError> {
    if route_id.is_empty() {
        return Err(ClassificationError::EmptyRouteId);
    }
    classify_at(route_id, KeyPath::root(), tree, slots)
}

/// 解決済みの遅延値に含まれていた Pending を再分類する
///
/// 内側のスロットのキーは外側のキーパスを接頭辞に持つ。
pub fn classify_nested(
    parent: &PendingRef,
    settled: Node,
    slots: &mut SlotAllocator,
) -> Result<Classified, ClassificationError> {
    classify_at(&parent.route_id, parent.key.clone(), settled, slots)
}

fn classify_at(
    route_id: &str,
    base: KeyPath,
    tree: Node,
    slots: &mut SlotAllocator,
) -> Result<Classified, ClassificationError> {
    if matches!(tree, Node::Pending(_)) {
        return Err(ClassificationError::PendingRoot);
    }

    let mut walker = Walker { route_id, slots, pending: Vec::new() };
    let payload = walker.walk(&base, tree)?;

    Ok(Classified {
        route_id: route_id.to_owned(),
        payload,
        pending: walker.pending,
    })
}

struct Walker<'a> {
    route_id: &'a str,
    slots: &'a mut SlotAllocator,
    pending: Vec<PendingSlot>,
}

impl Walker<'_> {
    fn walk(&mut self, path: &KeyPath, node: Node) -> Result<Value, ClassificationError> {
        match node {
            Node::Value(value) => {
                check_reserved(path, &value)?;
                Ok(value)
            }
            Node::Object(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (key, child) in entries {
                    check_key(path, &key)?;
                    if map.contains_key(&key) {
                        return Err(ClassificationError::DuplicateKey {
                            key,
                            path: path.to_string(),
                        });
                    }
                    if key.contains('.') && child.has_pending() {
                        return Err(ClassificationError::SeparatorInKey {
                            key,
                            path: path.to_string(),
                        });
                    }
                    let value = self.walk(&path.child(&key), child)?;
                    map.insert(key, value);
                }
                Ok(Value::Object(map))
            }
            Node::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    values.push(self.walk(&path.index(i), item)?);
                }
                Ok(Value::Array(values))
            }
            Node::Pending(value) => {
                let slot_id = self.slots.next();
                trace!("slot {} assigned to {}/{}", slot_id, self.route_id, path);
                self.pending.push(PendingSlot {
                    reference: PendingRef {
                        route_id: self.route_id.to_owned(),
                        key: path.clone(),
                        slot_id,
                    },
                    value,
                });
                Ok(marker(slot_id))
            }
        }
    }
}

fn check_key(path: &KeyPath, key: &str) -> Result<(), ClassificationError> {
    if key == REF_MARKER_KEY || key == ERROR_MARKER_KEY {
        return Err(ClassificationError::ReservedKey {
            key: key.to_owned(),
            path: path.to_string(),
        });
    }
    Ok(())
}

/// プレーンな JSON 値の中に予約キーがないか確認する
fn check_reserved(path: &KeyPath, value: &Value) -> Result<(), ClassificationError> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                check_key(path, key)?;
                check_reserved(&path.child(key), child)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                check_reserved(&path.index(i), item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// `{"__ref": slotId}` マーカーを生成する
pub fn marker(slot_id: SlotId) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(REF_MARKER_KEY.to_owned(), Value::from(slot_id.0));
    Value::Object(map)
}

/// 値がマーカーなら slotId を返す
pub fn as_marker(value: &Value) -> Option<SlotId> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let id = map.get(REF_MARKER_KEY)?.as_u64()?;
    u32::try_from(id).ok().map(SlotId)
}

/// ペイロード中のマーカーを深さ優先で列挙する
///
/// クライアントはこの結果からクリティカルペイロード受信時に Pending エントリを作る。
pub fn scan_markers(payload: &Value) -> Vec<(KeyPath, SlotId)> {
    let mut found = Vec::new();
    scan_into(&KeyPath::root(), payload, &mut found);
    found
}

fn scan_into(path: &KeyPath, value: &Value, found: &mut Vec<(KeyPath, SlotId)>) {
    if let Some(slot_id) = as_marker(value) {
        found.push((path.clone(), slot_id));
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                scan_into(&path.child(key), child, found);
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                scan_into(&path.index(i), item, found);
            }
        }
        _ => {}
    }
}
