//! Data Provider の契約
//!
//! ルートのローダーに相当する。戻り値のツリーには Pending が任意の深さで混ざってよい。

use futures::future::{self, BoxFuture, FutureExt};
use thiserror::Error;

use defer_value::Node;

use crate::{DEFAULT_REDIRECT_STATUS, DEFAULT_STATUS, LOCATION_HEADER};

/// リクエストのうちコアが参照する部分
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// ルーティング側で決まったルート ID（例: `routes/deferred`）
    pub route_id: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl RequestContext {
    pub fn new(route_id: impl Into<String>, url: impl Into<String>) -> Self {
        RequestContext { route_id: route_id.into(), url: url.into(), headers: Vec::new() }
    }
}

/// DataProvider 自体の失敗（リクエスト全体の失敗）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProviderError(pub String);

/// ツリーとレスポンスの付帯情報
#[derive(Debug)]
pub struct Envelope {
    pub tree: Node,
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl Envelope {
    pub fn new(tree: Node) -> Self {
        Envelope { tree, status: DEFAULT_STATUS, headers: Vec::new() }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// ヘッダーを名前（大文字小文字無視）で引く
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn location(&self) -> Option<&str> {
        self.header(LOCATION_HEADER)
    }
}

/// DataProvider の戻り値
#[derive(Debug)]
pub enum ProviderResult {
    /// ツリー（3xx + Location を持つ場合はリダイレクトとして扱われる）
    Data(Envelope),
    /// 明示的なリダイレクト
    Redirect { status: u16, location: String },
}

impl ProviderResult {
    /// ステータス 200 のツリー
    pub fn deferred(tree: Node) -> Self {
        ProviderResult::Data(Envelope::new(tree))
    }

    /// 302 リダイレクト
    pub fn redirect(location: impl Into<String>) -> Self {
        ProviderResult::Redirect { status: DEFAULT_REDIRECT_STATUS, location: location.into() }
    }
}

/// ルートのデータを返すもの
pub trait DataProvider: Send + Sync {
    fn provide<'a>(
        &'a self,
        ctx: &'a RequestContext,
    ) -> BoxFuture<'a, Result<ProviderResult, ProviderError>>;
}

/// 同期クロージャもそのまま DataProvider になる
///
/// ツリー内の Pending は後で駆動されるので、ローダー自体は即座に返してよい。
impl<F> DataProvider for F
where
    F: Fn(&RequestContext) -> Result<ProviderResult, ProviderError> + Send + Sync,
{
    fn provide<'a>(
        &'a self,
        ctx: &'a RequestContext,
    ) -> BoxFuture<'a, Result<ProviderResult, ProviderError>> {
        future::ready(self(ctx)).boxed()
    }
}
