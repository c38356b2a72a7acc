//! Hydration Registry
//!
//! `(routeId, key)` ごとの遅延値の状態表。ルートのインスタンスごとにスライスを持ち、
//! `RouteScope` が drop されるとスライスごと消える。
//!
//! ## 状態遷移
//!
//! ```text
//! Pending ──deliver + flush──→ Settled(value)
//!    │
//!    └────deliver + flush──→ Failed(error)
//!
//! Settled / Failed への 2 回目の deliver は Duplicate（何も変わらない）
//! ```
//!
//! `deliver` はキューに積むだけで、状態の変更とリスナーへの通知は `flush` で
//! まとめて行う。`RenderPass` が生きている間の `flush` は何もしないので、
//! 描画の途中で一部だけ反映された状態が見えることはない。保留された分は
//! 最後の `RenderPass` が閉じたときに反映される。
//!
//! 追跡中の Future の結果は、追跡を始めたときのルートインスタンスにしか入らない。
//! アンマウント後に同じルートをマウントし直しても、古い実行の値は捨てられる。

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::rc::{Rc, Weak};

use futures::future::{BoxFuture, FutureExt, LocalBoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, trace, warn};
use serde_json::Value;

use defer_value::{
    classify_nested, scan_markers, Classified, DeferredError, KeyPath, Node, Outcome, PendingRef,
    PendingSlot, PendingValue, SlotAllocator, SlotId,
};
use defer_wire::SettleNotification;

use crate::error::HydrationError;

/// 1 エントリの状態
#[derive(Debug, Clone, PartialEq)]
pub enum EntryState {
    Pending,
    Settled(Value),
    Failed(DeferredError),
}

impl EntryState {
    pub fn is_pending(&self) -> bool {
        matches!(self, EntryState::Pending)
    }
}

impl From<Outcome> for EntryState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Settled(value) => EntryState::Settled(value),
            Outcome::Failed(error) => EntryState::Failed(error),
        }
    }
}

/// `deliver` の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// 次の `flush` で反映される
    Queued,
    /// すでに settle 済み、またはキューに同じエントリがある
    Duplicate,
    /// ルートがマウントされていない
    UnknownRoute,
}

/// `flush` で settle したエントリ（リスナーに渡される）
#[derive(Debug, Clone, PartialEq)]
pub struct EntryChange {
    pub route_id: String,
    pub key: String,
    pub state: EntryState,
}

type Listener = Rc<dyn Fn(&EntryChange)>;

struct RouteSlice {
    /// マウントごとに変わる番号（古い RouteScope が新しいスライスを消さないため）
    instance: u64,
    critical: Option<Value>,
    entries: BTreeMap<String, EntryState>,
    /// クライアント側で新しく採番するときの次の slotId
    next_slot: u32,
}

impl RouteSlice {
    /// 追跡を始めるエントリを Pending にする（settle 済みは戻さない）
    fn begin_tracking(&mut self, route_id: &str, key: &str) -> Result<(), HydrationError> {
        let state = self.entries.entry(key.to_owned()).or_insert(EntryState::Pending);
        if !state.is_pending() {
            return Err(HydrationError::AlreadySettled {
                route_id: route_id.to_owned(),
                key: key.to_owned(),
            });
        }
        Ok(())
    }
}

struct QueuedSettle {
    route_id: String,
    /// 宛先のルートインスタンス
    instance: u64,
    key: String,
    outcome: Outcome,
}

#[derive(Default)]
struct RegistryState {
    routes: BTreeMap<String, RouteSlice>,
    queue: Vec<QueuedSettle>,
    /// 生きている RenderPass の数
    rendering: u32,
    listeners: Vec<(u64, Listener)>,
    next_id: u64,
}

impl RegistryState {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn is_queued(&self, route_id: &str, key: &str) -> bool {
        self.queue.iter().any(|q| q.route_id == route_id && q.key == key)
    }

    /// キューの 1 件を反映する。反映したら変更を返す
    fn apply(&mut self, settle: QueuedSettle) -> Option<EntryChange> {
        let Some(slice) = self.routes.get_mut(&settle.route_id) else {
            trace!("route {} unmounted before flush; dropping {}", settle.route_id, settle.key);
            return None;
        };
        if slice.instance != settle.instance {
            trace!("{}[{}] belongs to a previous mount; dropped", settle.route_id, settle.key);
            return None;
        }

        match slice.entries.get(&settle.key) {
            Some(state) if !state.is_pending() => return None,
            Some(_) => {}
            None => trace!("{}[{}] settled without a marker", settle.route_id, settle.key),
        }

        let state = EntryState::from(settle.outcome);
        if let EntryState::Settled(value) = &state {
            // 解決値に含まれるマーカーはネストした遅延値
            let base = KeyPath::from(settle.key.as_str());
            for (path, slot) in scan_markers(value) {
                let key = base.join(&path).to_string();
                trace!("{}[{}] pending (nested slot {})", settle.route_id, key, slot);
                slice.next_slot = slice.next_slot.max(slot.0 + 1);
                slice.entries.entry(key).or_insert(EntryState::Pending);
            }
        }
        slice.entries.insert(settle.key.clone(), state.clone());

        Some(EntryChange { route_id: settle.route_id, key: settle.key, state })
    }
}

/// クライアント側の遅延値レジストリ
///
/// `Rc` ベースのハンドルで、clone しても同じ表を指す。シングルスレッド専用。
#[derive(Clone, Default)]
pub struct HydrationRegistry {
    inner: Rc<RefCell<RegistryState>>,
}

/// レジストリへの弱参照（Boundary や追跡中の Future が持つ）
#[derive(Clone)]
pub struct WeakRegistry {
    inner: Weak<RefCell<RegistryState>>,
}

impl WeakRegistry {
    pub fn upgrade(&self) -> Option<HydrationRegistry> {
        self.inner.upgrade().map(|inner| HydrationRegistry { inner })
    }
}

impl HydrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn downgrade(&self) -> WeakRegistry {
        WeakRegistry { inner: Rc::downgrade(&self.inner) }
    }

    /// ルートのインスタンスをマウントする
    ///
    /// 同じルートがすでにマウントされていれば、そのスライスは新しいものに置き換わる。
    pub fn mount_route(&self, route_id: impl Into<String>) -> RouteScope {
        let route_id = route_id.into();
        let mut state = self.inner.borrow_mut();
        let instance = state.next_id();
        let previous = state.routes.insert(
            route_id.clone(),
            RouteSlice { instance, critical: None, entries: BTreeMap::new(), next_slot: 0 },
        );
        if previous.is_some() {
            debug!("route {} remounted; previous entries discarded", route_id);
        }
        state.queue.retain(|q| q.route_id != route_id);

        RouteScope { registry: self.downgrade(), route_id, instance }
    }

    pub fn is_mounted(&self, route_id: &str) -> bool {
        self.inner.borrow().routes.contains_key(route_id)
    }

    /// クリティカルペイロードを受け取り、マーカーごとに Pending エントリを作る
    ///
    /// # 戻り値
    /// 作った Pending エントリの数
    ///
    /// # エラー
    /// - `HydrationError::UnknownRoute`: ルートがマウントされていない
    pub fn hydrate_critical(&self, route_id: &str, payload: Value) -> Result<usize, HydrationError> {
        let mut state = self.inner.borrow_mut();
        let slice = state
            .routes
            .get_mut(route_id)
            .ok_or_else(|| HydrationError::UnknownRoute(route_id.to_owned()))?;

        let mut created = 0;
        for (path, slot) in scan_markers(&payload) {
            slice.next_slot = slice.next_slot.max(slot.0 + 1);
            let key = path.to_string();
            if !slice.entries.contains_key(&key) {
                slice.entries.insert(key, EntryState::Pending);
                created += 1;
            }
        }
        slice.critical = Some(payload);
        debug!("{}: hydrated critical payload with {} pending entries", route_id, created);
        Ok(created)
    }

    /// クリティカルペイロード
    pub fn critical(&self, route_id: &str) -> Option<Value> {
        self.inner.borrow().routes.get(route_id)?.critical.clone()
    }

    /// エントリの現在の状態
    pub fn entry(&self, route_id: &str, key: &str) -> Option<EntryState> {
        self.inner.borrow().routes.get(route_id)?.entries.get(key).cloned()
    }

    /// ルートの全エントリ（キー順）
    pub fn entries(&self, route_id: &str) -> Vec<(String, EntryState)> {
        match self.inner.borrow().routes.get(route_id) {
            Some(slice) => slice.entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            None => Vec::new(),
        }
    }

    /// まだ Pending のエントリ数
    pub fn pending_count(&self, route_id: &str) -> usize {
        match self.inner.borrow().routes.get(route_id) {
            Some(slice) => slice.entries.values().filter(|s| s.is_pending()).count(),
            None => 0,
        }
    }

    /// settle 通知を現在マウント中のインスタンス宛てにキューに積む（反映は `flush`）
    pub fn deliver(&self, notification: SettleNotification) -> Delivery {
        self.enqueue(notification.route_id, notification.key, notification.outcome, None)
    }

    /// JSON の settle 通知（event stream の `settle` フレームの data）をキューに積む
    pub fn deliver_json(&self, text: &str) -> Result<Delivery, HydrationError> {
        Ok(self.deliver(SettleNotification::from_json(text)?))
    }

    /// `expected` が `Some` なら、そのインスタンスがまだマウント中のときだけ積む
    fn enqueue(
        &self,
        route_id: String,
        key: String,
        outcome: Outcome,
        expected: Option<u64>,
    ) -> Delivery {
        let mut state = self.inner.borrow_mut();
        let Some(slice) = state.routes.get(&route_id) else {
            trace!("settle for unmounted route {} ignored", route_id);
            return Delivery::UnknownRoute;
        };
        let instance = slice.instance;
        if expected.is_some_and(|e| e != instance) {
            debug!("{}[{}] settled for a previous mount; ignored", route_id, key);
            return Delivery::UnknownRoute;
        }
        let settled = slice.entries.get(&key).is_some_and(|s| !s.is_pending());
        if settled || state.is_queued(&route_id, &key) {
            warn!("duplicate settle for {}[{}] ignored", route_id, key);
            return Delivery::Duplicate;
        }

        trace!("{}[{}] queued ({})", route_id, key, if outcome.is_failed() { "failed" } else { "settled" });
        state.queue.push(QueuedSettle { route_id, instance, key, outcome });
        Delivery::Queued
    }

    /// キューを反映し、settle したエントリごとに 1 回リスナーへ通知する
    ///
    /// # 戻り値
    /// 反映したエントリ数。`RenderPass` が生きている間は常に 0（キューは残る）
    pub fn flush(&self) -> usize {
        let (changes, listeners) = {
            let mut state = self.inner.borrow_mut();
            if state.rendering > 0 {
                trace!("flush deferred: {} queued during render", state.queue.len());
                return 0;
            }
            let queue = std::mem::take(&mut state.queue);
            let changes: Vec<EntryChange> =
                queue.into_iter().filter_map(|settle| state.apply(settle)).collect();
            let listeners: Vec<Listener> =
                state.listeners.iter().map(|(_, l)| Rc::clone(l)).collect();
            (changes, listeners)
        };

        // 借用を解放してから通知する（リスナーがレジストリを読めるように）
        for change in &changes {
            for listener in &listeners {
                listener(change);
            }
        }
        changes.len()
    }

    /// 描画パスを開始する（drop まで `flush` が保留される）
    pub fn begin_render(&self) -> RenderPass {
        self.inner.borrow_mut().rendering += 1;
        RenderPass { registry: self.downgrade() }
    }

    /// settle 通知を購読する（`Subscription` を drop すると解除）
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&EntryChange) + 'static,
    {
        let mut state = self.inner.borrow_mut();
        let id = state.next_id();
        state.listeners.push((id, Rc::new(listener)));
        Subscription { registry: self.downgrade(), id }
    }

    /// 遅延値を 1 つ Pending として登録し、完了時に deliver + flush する Future を返す
    ///
    /// 返り値の Future はホストのエグゼキューターで駆動する（`spawn_local` など）。
    /// レジストリやルートが先に消えても Future は最後まで動き、結果は捨てられる。
    ///
    /// すでに Pending のエントリなら先に settle した方が残る。
    ///
    /// # エラー
    /// - `HydrationError::UnknownRoute`: ルートがマウントされていない
    /// - `HydrationError::AlreadySettled`: エントリがすでに Settled / Failed
    pub fn track(
        &self,
        route_id: &str,
        key: KeyPath,
        value: PendingValue,
    ) -> Result<LocalBoxFuture<'static, ()>, HydrationError> {
        let (instance, slot_id, next_slot) = {
            let mut state = self.inner.borrow_mut();
            let slice = state
                .routes
                .get_mut(route_id)
                .ok_or_else(|| HydrationError::UnknownRoute(route_id.to_owned()))?;
            slice.begin_tracking(route_id, &key.to_string())?;
            let slot_id = SlotId(slice.next_slot);
            slice.next_slot += 1;
            (slice.instance, slot_id, slice.next_slot)
        };

        let reference = PendingRef { route_id: route_id.to_owned(), key, slot_id };
        Ok(drive(
            self.downgrade(),
            instance,
            SlotAllocator::starting_at(next_slot),
            vec![PendingSlot { reference, value }],
        ))
    }

    /// `Send` でない Future（JS の Promise など）を Pending として登録する
    ///
    /// 値はすでに JSON なので再分類はしない。マーカーが含まれていれば
    /// `flush` 時にネストしたエントリが Pending で作られる。
    ///
    /// # エラー
    /// - `HydrationError::UnknownRoute`: ルートがマウントされていない
    /// - `HydrationError::AlreadySettled`: エントリがすでに Settled / Failed
    pub fn track_local<F>(
        &self,
        route_id: &str,
        key: &str,
        future: F,
    ) -> Result<LocalBoxFuture<'static, ()>, HydrationError>
    where
        F: Future<Output = Outcome> + 'static,
    {
        let instance = {
            let mut state = self.inner.borrow_mut();
            let slice = state
                .routes
                .get_mut(route_id)
                .ok_or_else(|| HydrationError::UnknownRoute(route_id.to_owned()))?;
            slice.begin_tracking(route_id, key)?;
            slice.instance
        };

        let registry = self.downgrade();
        let (route_id, key) = (route_id.to_owned(), key.to_owned());
        Ok(async move {
            let outcome = future.await;
            match registry.upgrade() {
                Some(registry) => {
                    registry.enqueue(route_id, key, outcome, Some(instance));
                    registry.flush();
                }
                None => debug!("registry dropped; {} settled unobserved", key),
            }
        }
        .boxed_local())
    }

    /// インプロセスのナビゲーション結果を取り込む
    ///
    /// クリティカルペイロードを反映し、各遅延値を追跡する Future を 1 つにまとめて返す。
    ///
    /// # エラー
    /// - `HydrationError::UnknownRoute`: ルートがマウントされていない
    pub fn hydrate_navigation(
        &self,
        classified: Classified,
    ) -> Result<LocalBoxFuture<'static, ()>, HydrationError> {
        let Classified { route_id, payload, pending } = classified;
        self.hydrate_critical(&route_id, payload)?;
        let instance = self
            .inner
            .borrow()
            .routes
            .get(&route_id)
            .map(|slice| slice.instance)
            .ok_or_else(|| HydrationError::UnknownRoute(route_id.clone()))?;

        let next_slot = pending.iter().map(|s| s.reference.slot_id.0 + 1).max().unwrap_or(0);
        Ok(drive(self.downgrade(), instance, SlotAllocator::starting_at(next_slot), pending))
    }
}

type Settlement = (PendingRef, Result<Node, DeferredError>);

fn settle_one(slot: PendingSlot) -> BoxFuture<'static, Settlement> {
    let PendingSlot { reference, value } = slot;
    async move { (reference, value.into_future().await) }.boxed()
}

/// 追跡中の遅延値をすべて駆動し、settle したものから `instance` 宛てに deliver する
fn drive(
    registry: WeakRegistry,
    instance: u64,
    mut slots: SlotAllocator,
    pending: Vec<PendingSlot>,
) -> LocalBoxFuture<'static, ()> {
    async move {
        let mut in_flight: FuturesUnordered<_> = pending.into_iter().map(settle_one).collect();

        while let Some((reference, result)) = in_flight.next().await {
            let outcome = match result {
                Ok(Node::Pending(inner)) => {
                    in_flight.push(settle_one(PendingSlot { reference, value: inner }));
                    continue;
                }
                Ok(node) => match classify_nested(&reference, node, &mut slots) {
                    Ok(nested) => {
                        in_flight.extend(nested.pending.into_iter().map(settle_one));
                        Outcome::Settled(nested.payload)
                    }
                    Err(e) => Outcome::Failed(DeferredError::new(e.to_string())),
                },
                Err(error) => Outcome::Failed(error),
            };

            let Some(registry) = registry.upgrade() else {
                debug!("registry dropped; {} settled unobserved", reference.key);
                continue;
            };
            registry.enqueue(reference.route_id, reference.key.to_string(), outcome, Some(instance));
            registry.flush();
        }
    }
    .boxed_local()
}

/// マウント中のルートインスタンス
///
/// drop（または `unmount`）でスライスが消え、以後の通知は `Delivery::UnknownRoute` になる。
pub struct RouteScope {
    registry: WeakRegistry,
    route_id: String,
    instance: u64,
}

impl RouteScope {
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn unmount(self) {}
}

impl Drop for RouteScope {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut state = registry.inner.borrow_mut();
        // 再マウント後の古いスコープは何も消さない
        if state.routes.get(&self.route_id).map(|s| s.instance) != Some(self.instance) {
            return;
        }
        if let Some(slice) = state.routes.remove(&self.route_id) {
            let abandoned = slice.entries.values().filter(|s| s.is_pending()).count();
            debug!("route {} unmounted ({} pending abandoned)", self.route_id, abandoned);
        }
        let route_id = &self.route_id;
        state.queue.retain(|q| &q.route_id != route_id);
    }
}

/// 描画パス（生きている間 `flush` を保留し、最後の 1 つが閉じたら反映する）
pub struct RenderPass {
    registry: WeakRegistry,
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let held_back = {
            let mut state = registry.inner.borrow_mut();
            state.rendering = state.rendering.saturating_sub(1);
            state.rendering == 0 && !state.queue.is_empty()
        };
        // 描画中に積まれた分は描画の直後にまとめて反映する
        if held_back {
            registry.flush();
        }
    }
}

/// 購読ハンドル（drop で解除）
pub struct Subscription {
    registry: WeakRegistry,
    id: u64,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.inner.borrow_mut().listeners.retain(|(id, _)| *id != self.id);
        }
    }
}
