//! Boundary Runtime
//!
//! 遅延値 1 つ分の表示状態。
//!
//! ```text
//! Waiting ──settled──→ Resolved(value)
//!    │
//!    └─────failed───→ Errored(ローカルのエラービュー)
//!                      または Propagate(error) → 最も近い祖先のエラーバウンダリ
//! ```
//!
//! Boundary はエントリを所有しない（`WeakRegistry` 越しに引くだけ）。
//! `view()` は毎回エントリの現在の状態を読むので、別の理由で描画し直しても
//! Pending からやり直したり、非同期処理を再開したりすることはない。

use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use defer_value::DeferredError;

use crate::error::HydrationError;
use crate::registry::{EntryState, HydrationRegistry, WeakRegistry};

/// エラーを markup にする関数
pub type ErrorView = Rc<dyn Fn(&DeferredError) -> String>;

/// Boundary の表示状態
#[derive(Debug, Clone, PartialEq)]
pub enum BoundaryView {
    /// fallback を表示する
    Waiting,
    Resolved(Value),
    /// このバウンダリ自身のエラービューの markup
    Errored(String),
    /// エラービューがないので祖先へ伝播する
    Propagate(DeferredError),
}

/// 遅延値 1 つを表示する単位
#[derive(Clone)]
pub struct Boundary {
    route_id: String,
    key: String,
    registry: WeakRegistry,
    error_view: Option<ErrorView>,
}

impl Boundary {
    pub fn new(registry: &HydrationRegistry, route_id: impl Into<String>, key: impl Into<String>) -> Self {
        Boundary {
            route_id: route_id.into(),
            key: key.into(),
            registry: registry.downgrade(),
            error_view: None,
        }
    }

    /// ローカルのエラービューを設定する
    pub fn with_error_view<F>(mut self, view: F) -> Self
    where
        F: Fn(&DeferredError) -> String + 'static,
    {
        self.error_view = Some(Rc::new(view));
        self
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn has_error_view(&self) -> bool {
        self.error_view.is_some()
    }

    /// エントリの現在の状態から表示を決める
    ///
    /// # エラー
    /// - `HydrationError::RegistryDropped`: レジストリが破棄済み
    /// - `HydrationError::UnknownEntry`: ルートがアンマウント済み、またはエントリがない
    pub fn view(&self) -> Result<BoundaryView, HydrationError> {
        let registry = self.registry.upgrade().ok_or(HydrationError::RegistryDropped)?;
        let state = registry.entry(&self.route_id, &self.key).ok_or_else(|| {
            HydrationError::UnknownEntry { route_id: self.route_id.clone(), key: self.key.clone() }
        })?;

        Ok(match state {
            EntryState::Pending => BoundaryView::Waiting,
            EntryState::Settled(value) => BoundaryView::Resolved(value),
            EntryState::Failed(error) => match &self.error_view {
                Some(view) => BoundaryView::Errored(view(&error)),
                None => BoundaryView::Propagate(error),
            },
        })
    }
}

impl fmt::Debug for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Boundary")
            .field("route_id", &self.route_id)
            .field("key", &self.key)
            .field("error_view", &self.error_view.is_some())
            .finish()
    }
}

/// 祖先のエラーバウンダリ
#[derive(Clone)]
struct ErrorBoundary {
    id: String,
    render: ErrorView,
}

/// 伝播したエラーの行き先
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorResolution {
    /// 最も近い祖先のエラーバウンダリがその部分木全体を置き換える
    Boundary { id: String, markup: String },
    /// 祖先にエラーバウンダリがない（ページ全体の失敗）
    PageFatal(DeferredError),
}

/// 外側から内側の順に並んだエラーバウンダリ
#[derive(Clone, Default)]
pub struct ErrorBoundaryChain {
    ancestors: Vec<ErrorBoundary>,
}

impl ErrorBoundaryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内側にエラーバウンダリを 1 つ足す
    pub fn with<F>(mut self, id: impl Into<String>, render: F) -> Self
    where
        F: Fn(&DeferredError) -> String + 'static,
    {
        self.ancestors.push(ErrorBoundary { id: id.into(), render: Rc::new(render) });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ancestors.is_empty()
    }

    pub fn resolve(&self, error: &DeferredError) -> ErrorResolution {
        match self.ancestors.last() {
            Some(nearest) => ErrorResolution::Boundary {
                id: nearest.id.clone(),
                markup: (nearest.render)(error),
            },
            None => ErrorResolution::PageFatal(error.clone()),
        }
    }
}

impl fmt::Debug for ErrorBoundaryChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ancestors.iter().map(|b| &b.id)).finish()
    }
}

/// ルート内の 1 領域の表示
#[derive(Debug, Clone, PartialEq)]
pub enum RegionView {
    Fallback,
    Content(Value),
    Error(String),
}

/// ルート全体の描画結果
#[derive(Debug, Clone, PartialEq)]
pub enum RouteRender {
    /// 通常のページ（クリティカル内容 + 各領域）
    Page { critical: Value, regions: Vec<(String, RegionView)> },
    /// 伝播したエラーをエラーバウンダリが表示する
    ErrorBoundary { id: String, markup: String, error: DeferredError },
    /// どこにも受け止められなかった
    Fatal(DeferredError),
}

/// ルートのクリティカル内容とバウンダリをまとめて描画する
#[derive(Clone)]
pub struct RouteView {
    route_id: String,
    registry: WeakRegistry,
    chain: ErrorBoundaryChain,
    boundaries: Vec<Boundary>,
}

impl RouteView {
    pub fn new(registry: &HydrationRegistry, route_id: impl Into<String>) -> Self {
        RouteView {
            route_id: route_id.into(),
            registry: registry.downgrade(),
            chain: ErrorBoundaryChain::new(),
            boundaries: Vec::new(),
        }
    }

    /// ルートを囲むエラーバウンダリ（最後に足したものが最も近い）
    pub fn with_error_boundary<F>(mut self, id: impl Into<String>, render: F) -> Self
    where
        F: Fn(&DeferredError) -> String + 'static,
    {
        self.chain = self.chain.with(id, render);
        self
    }

    /// 遅延値の領域を足す
    pub fn with_boundary(mut self, boundary: Boundary) -> Self {
        self.boundaries.push(boundary);
        self
    }

    /// キーだけ指定して領域を足す（エラービューなし）
    pub fn with_region(self, key: impl Into<String>) -> Self {
        let boundary = Boundary {
            route_id: self.route_id.clone(),
            key: key.into(),
            registry: self.registry.clone(),
            error_view: None,
        };
        self.with_boundary(boundary)
    }

    pub fn boundaries(&self) -> &[Boundary] {
        &self.boundaries
    }

    /// 現在のエントリの状態で描画する
    ///
    /// 描画中は `RenderPass` を開いておくので、途中で flush が割り込むことはない。
    /// 伝播するエラーが複数あれば、領域の並び順で最初のものが採用される。
    pub fn render(&self) -> Result<RouteRender, HydrationError> {
        let registry = self.registry.upgrade().ok_or(HydrationError::RegistryDropped)?;
        let _pass = registry.begin_render();
        let critical = registry
            .critical(&self.route_id)
            .ok_or_else(|| HydrationError::UnknownRoute(self.route_id.clone()))?;

        let mut regions = Vec::with_capacity(self.boundaries.len());
        for boundary in &self.boundaries {
            let region = match boundary.view()? {
                BoundaryView::Waiting => RegionView::Fallback,
                BoundaryView::Resolved(value) => RegionView::Content(value),
                BoundaryView::Errored(markup) => RegionView::Error(markup),
                BoundaryView::Propagate(error) => {
                    return Ok(match self.chain.resolve(&error) {
                        ErrorResolution::Boundary { id, markup } => {
                            RouteRender::ErrorBoundary { id, markup, error }
                        }
                        ErrorResolution::PageFatal(error) => RouteRender::Fatal(error),
                    });
                }
            };
            regions.push((boundary.key().to_owned(), region));
        }
        Ok(RouteRender::Page { critical, regions })
    }
}

impl fmt::Debug for RouteView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteView")
            .field("route_id", &self.route_id)
            .field("chain", &self.chain)
            .field("boundaries", &self.boundaries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use defer_value::{KeyPath, Node, Outcome, PendingValue, SlotId};
    use defer_wire::SettleNotification;
    use futures::executor::block_on;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::registry::RouteScope;

    const ROUTE: &str = "routes/deferred-error";

    fn setup() -> (HydrationRegistry, RouteScope) {
        let registry = HydrationRegistry::new();
        let scope = registry.mount_route(ROUTE);
        registry
            .hydrate_critical(ROUTE, json!({"foo": "pizza", "bar": {"__ref": 0}}))
            .unwrap();
        (registry, scope)
    }

    fn settle(registry: &HydrationRegistry, outcome: Outcome) {
        registry.deliver(SettleNotification {
            route_id: ROUTE.to_owned(),
            key: "bar".to_owned(),
            slot: SlotId(0),
            outcome,
        });
        registry.flush();
    }

    fn error_view(e: &DeferredError) -> String {
        format!("<div id=\"error\">{}</div>", e.message)
    }

    #[test]
    fn test_waiting_then_resolved() {
        let (registry, _scope) = setup();
        let boundary = Boundary::new(&registry, ROUTE, "bar");
        assert_eq!(boundary.view().unwrap(), BoundaryView::Waiting);

        settle(&registry, Outcome::Settled(json!("hamburger")));
        assert_eq!(boundary.view().unwrap(), BoundaryView::Resolved(json!("hamburger")));
    }

    #[test]
    fn test_local_error_view() {
        let (registry, _scope) = setup();
        let boundary = Boundary::new(&registry, ROUTE, "bar").with_error_view(error_view);
        settle(&registry, Outcome::Failed(DeferredError::new("Oh, no!")));
        assert_eq!(
            boundary.view().unwrap(),
            BoundaryView::Errored("<div id=\"error\">Oh, no!</div>".to_owned())
        );
    }

    #[test]
    fn test_propagates_without_error_view() {
        let (registry, _scope) = setup();
        let boundary = Boundary::new(&registry, ROUTE, "bar");
        settle(&registry, Outcome::Failed(DeferredError::new("Oh, no!")));
        assert_eq!(
            boundary.view().unwrap(),
            BoundaryView::Propagate(DeferredError::new("Oh, no!"))
        );
    }

    #[test]
    fn test_chain_picks_nearest_ancestor() {
        let chain = ErrorBoundaryChain::new()
            .with("root", |_| "root".to_owned())
            .with("error-boundary", |_| "<div id=\"error-boundary\">Error Boundary</div>".to_owned());
        let error = DeferredError::new("Oh, no!");
        assert_eq!(
            chain.resolve(&error),
            ErrorResolution::Boundary {
                id: "error-boundary".to_owned(),
                markup: "<div id=\"error-boundary\">Error Boundary</div>".to_owned(),
            }
        );
        assert_eq!(ErrorBoundaryChain::new().resolve(&error), ErrorResolution::PageFatal(error));
    }

    #[test]
    fn test_rerender_reads_current_state_without_rework() {
        let registry = HydrationRegistry::new();
        let _scope = registry.mount_route(ROUTE);
        registry.hydrate_critical(ROUTE, json!({"foo": "pizza"})).unwrap();

        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let value = PendingValue::new(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Node::from("hamburger"))
        });
        block_on(registry.track(ROUTE, KeyPath::from("bar"), value).unwrap());

        // 無関係な状態変更で何度描画し直しても、同じエントリを読むだけ
        for _ in 0..3 {
            let boundary = Boundary::new(&registry, ROUTE, "bar");
            assert_eq!(boundary.view().unwrap(), BoundaryView::Resolved(json!("hamburger")));
        }
        assert_eq!(polls.load(Ordering::SeqCst), 1, "非同期処理は 1 回だけ実行されるべき");
    }

    #[test]
    fn test_route_view_page_with_error_region() {
        let (registry, _scope) = setup();
        let view = RouteView::new(&registry, ROUTE)
            .with_boundary(Boundary::new(&registry, ROUTE, "bar").with_error_view(error_view));

        assert_eq!(
            view.render().unwrap(),
            RouteRender::Page {
                critical: json!({"foo": "pizza", "bar": {"__ref": 0}}),
                regions: vec![("bar".to_owned(), RegionView::Fallback)],
            }
        );

        settle(&registry, Outcome::Failed(DeferredError::new("Oh, no!")));
        match view.render().unwrap() {
            RouteRender::Page { critical, regions } => {
                assert_eq!(critical["foo"], "pizza");
                assert_eq!(
                    regions,
                    vec![("bar".to_owned(), RegionView::Error("<div id=\"error\">Oh, no!</div>".to_owned()))]
                );
            }
            other => panic!("unexpected render: {:?}", other),
        }
    }

    #[test]
    fn test_route_view_falls_back_to_route_error_boundary() {
        let (registry, _scope) = setup();
        let view = RouteView::new(&registry, ROUTE)
            .with_error_boundary("error-boundary", |_| "Error Boundary".to_owned())
            .with_region("bar");
        settle(&registry, Outcome::Failed(DeferredError::new("Oh, no!")));

        assert_eq!(
            view.render().unwrap(),
            RouteRender::ErrorBoundary {
                id: "error-boundary".to_owned(),
                markup: "Error Boundary".to_owned(),
                error: DeferredError::new("Oh, no!"),
            }
        );
    }

    #[test]
    fn test_route_view_fatal_without_any_boundary() {
        let (registry, _scope) = setup();
        let view = RouteView::new(&registry, ROUTE).with_region("bar");
        settle(&registry, Outcome::Failed(DeferredError::new("Oh, no!")));
        assert_eq!(view.render().unwrap(), RouteRender::Fatal(DeferredError::new("Oh, no!")));
    }

    #[test]
    fn test_render_blocks_concurrent_flush() {
        let (registry, _scope) = setup();
        let view = RouteView::new(&registry, ROUTE).with_region("bar");
        let pass = registry.begin_render();
        settle(&registry, Outcome::Settled(json!("hamburger")));
        // flush は保留されたまま
        let regions = |render: RouteRender| match render {
            RouteRender::Page { regions, .. } => regions,
            other => panic!("unexpected render: {:?}", other),
        };
        assert_eq!(regions(view.render().unwrap())[0].1, RegionView::Fallback);
        // 描画が終われば保留分が反映される
        drop(pass);
        assert_eq!(regions(view.render().unwrap())[0].1, RegionView::Content(json!("hamburger")));
    }

    #[test]
    fn test_dropped_registry() {
        let registry = HydrationRegistry::new();
        let boundary = Boundary::new(&registry, ROUTE, "bar");
        drop(registry);
        assert!(matches!(boundary.view(), Err(HydrationError::RegistryDropped)));
    }

    #[test]
    fn test_unknown_entry_after_unmount() {
        let (registry, scope) = setup();
        let boundary = Boundary::new(&registry, ROUTE, "bar");
        drop(scope);
        assert!(matches!(boundary.view(), Err(HydrationError::UnknownEntry { .. })));
    }
}
