//! # defer-client
//!
//! ブラウザ側のランタイム。サーバーから届く settle 通知（インラインスクリプト or
//! event stream）と、ナビゲーション時に直接待つ Future の両方を同じレジストリに入れ、
//! Boundary がそこから表示を決める。
//!
//! ```text
//! SettleNotification ──deliver──┐
//!                               ├─→ HydrationRegistry ──flush/notify──→ Boundary::view()
//! PendingValue ─────────track───┘     (route ごとのスライス)              RouteView::render()
//! ```
//!
//! シングルスレッド専用（`Rc` / `RefCell`）。

pub mod boundary;
pub mod error;
pub mod registry;

pub use boundary::{
    Boundary, BoundaryView, ErrorBoundaryChain, ErrorResolution, ErrorView, RegionView,
    RouteRender, RouteView,
};
pub use error::HydrationError;
pub use registry::{
    Delivery, EntryChange, EntryState, HydrationRegistry, RenderPass, RouteScope, Subscription,
    WeakRegistry,
};
