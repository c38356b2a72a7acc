//! リクエスト単位の組み立て
//!
//! DataProvider の呼び出しからエンコーダーの用意までを、ドキュメントロードと
//! クライアントナビゲーションの 2 経路でまとめる。どちらも最初のバイトを書く前に
//! リダイレクトを判定する。

use log::{debug, info};

use defer_stream::{StreamSink, StreamWriter};
use defer_value::{classify, Classified, SlotAllocator};
use defer_wire::{EventStreamTransport, ScriptTransport, SettleTransport};

use crate::encoder::{ResponseEncoder, StreamSummary};
use crate::error::ServeError;
use crate::options::EncoderOptions;
use crate::provider::{DataProvider, RequestContext};
use crate::redirect::{Guarded, RedirectGuard, RedirectResponse};
use crate::render::{NoMarkup, Renderer};

/// ストリーミングを始める直前の状態（ステータスとヘッダーは確定済み）
pub struct StreamPlan<'r, T, R: ?Sized> {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub encoder: ResponseEncoder<'r, T, R>,
}

impl<'r, T, R> StreamPlan<'r, T, R>
where
    T: SettleTransport,
    R: Renderer + ?Sized,
{
    /// 中断シグナルを設定する（`ResponseEncoder::with_abort` と同じ）
    pub fn with_abort<F>(mut self, signal: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.encoder = self.encoder.with_abort(signal);
        self
    }

    /// ボディを書き切る
    pub async fn run<S: StreamSink>(
        self,
        writer: &mut StreamWriter<S>,
    ) -> Result<StreamSummary, ServeError> {
        self.encoder.run(writer).await
    }
}

/// ドキュメントロードの応答
pub enum DocumentResponse<'r, R: ?Sized> {
    /// 通常のリダイレクト（ボディなし）
    Redirect(RedirectResponse),
    Stream(StreamPlan<'r, ScriptTransport, R>),
}

/// インプロセスのナビゲーション結果（クライアントが Future を直接待つ場合）
#[derive(Debug)]
pub enum NavigationData {
    Redirect(RedirectResponse),
    Data { status: u16, classified: Classified },
}

/// event stream でのナビゲーション応答
pub enum NavigationResponse {
    /// redirect フレーム 1 つだけのボディ
    Redirect {
        redirect: RedirectResponse,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    Stream(StreamPlan<'static, EventStreamTransport, NoMarkup>),
}

/// ドキュメントロードを用意する
///
/// # 引数
/// * `provider` - ルートの DataProvider
/// * `ctx` - リクエスト
/// * `renderer` - ページと遅延スロットの markup を作る
/// * `options` - ドキュメントの外枠とヘッダーの設定
///
/// # 戻り値
/// リダイレクトならボディなしの応答、そうでなければ走らせる前のエンコーダー
///
/// # エラー
/// - `ServeError::InvalidOptions`: `options` が不正
/// - `ServeError::Provider`: DataProvider 自体の失敗
/// - `ServeError::Classification`: ローダー結果が不正
pub async fn prepare_document<'r, P, R>(
    provider: &P,
    ctx: &RequestContext,
    renderer: &'r R,
    options: &EncoderOptions,
) -> Result<DocumentResponse<'r, R>, ServeError>
where
    P: DataProvider + ?Sized,
    R: Renderer + ?Sized,
{
    options.validate()?;
    let result = provider.provide(ctx).await?;

    let envelope = match RedirectGuard::inspect(result)? {
        Guarded::Redirect(redirect) => {
            info!("{} redirected to {} ({})", ctx.url, redirect.location, redirect.status);
            return Ok(DocumentResponse::Redirect(redirect));
        }
        Guarded::Proceed(envelope) => envelope,
    };

    let mut slots = SlotAllocator::new();
    let classified = classify(&ctx.route_id, envelope.tree, &mut slots)?;
    debug!("{}: {} deferred values", ctx.route_id, classified.pending.len());

    let transport = ScriptTransport::new(options.document.clone());
    let mut headers = envelope.headers;
    headers.extend(options.streaming_headers(transport.content_type()));

    Ok(DocumentResponse::Stream(StreamPlan {
        status: envelope.status,
        headers,
        encoder: ResponseEncoder::new(classified, slots, transport, renderer),
    }))
}

/// インプロセスのナビゲーション用にデータだけ用意する
///
/// 遅延値の Future は `Classified::pending` に入ったまま返る。
pub async fn prepare_navigation<P>(
    provider: &P,
    ctx: &RequestContext,
) -> Result<NavigationData, ServeError>
where
    P: DataProvider + ?Sized,
{
    let result = provider.provide(ctx).await?;
    match RedirectGuard::inspect(result)? {
        Guarded::Redirect(redirect) => Ok(NavigationData::Redirect(redirect)),
        Guarded::Proceed(envelope) => {
            let mut slots = SlotAllocator::new();
            let classified = classify(&ctx.route_id, envelope.tree, &mut slots)?;
            Ok(NavigationData::Data { status: envelope.status, classified })
        }
    }
}

/// event stream でのナビゲーションを用意する
///
/// リダイレクトでも HTTP ステータスは 200 のまま、ボディの redirect フレームで伝える。
///
/// # エラー
/// - `ServeError::InvalidOptions`: `options` が不正（DataProvider は呼ばれない）
/// - `ServeError::Provider` / `ServeError::Classification`: `prepare_document` と同じ
pub async fn prepare_navigation_stream<P>(
    provider: &P,
    ctx: &RequestContext,
    options: &EncoderOptions,
) -> Result<NavigationResponse, ServeError>
where
    P: DataProvider + ?Sized,
{
    options.validate()?;
    let result = provider.provide(ctx).await?;
    let transport = EventStreamTransport;
    let headers = options.streaming_headers(transport.content_type());

    let envelope = match RedirectGuard::inspect(result)? {
        Guarded::Redirect(redirect) => {
            let body = transport.encode_redirect(redirect.status, &redirect.location)?;
            return Ok(NavigationResponse::Redirect { redirect, headers, body });
        }
        Guarded::Proceed(envelope) => envelope,
    };

    let mut slots = SlotAllocator::new();
    let classified = classify(&ctx.route_id, envelope.tree, &mut slots)?;

    let mut all_headers = envelope.headers;
    all_headers.extend(headers);
    Ok(NavigationResponse::Stream(StreamPlan {
        status: envelope.status,
        headers: all_headers,
        encoder: ResponseEncoder::new(classified, slots, transport, &NoMarkup),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use defer_stream::VecSink;
    use defer_value::{Node, Outcome, PendingRef, PendingValue};
    use defer_wire::fallback_region;
    use futures::executor::block_on;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::provider::{Envelope, ProviderError, ProviderResult};

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    struct FoodRenderer;

    impl Renderer for FoodRenderer {
        fn render_page(&self, _route_id: &str, payload: &Value, slots: &[PendingRef]) -> String {
            let mut out = String::new();
            if let Some(foo) = payload.get("foo").and_then(Value::as_str) {
                out.push_str(&format!("<div id=\"foo\">{foo}</div>"));
            }
            for slot in slots {
                out.push_str(&fallback_region(slot.slot_id, "<div>Loading</div>"));
            }
            out
        }

        fn render_deferred(&self, slot: &PendingRef, outcome: &Outcome) -> String {
            match outcome {
                Outcome::Settled(Value::String(s)) => format!("<div id=\"{}\">{s}</div>", slot.key),
                Outcome::Settled(other) => format!("<div id=\"{}\">{other}</div>", slot.key),
                Outcome::Failed(e) => format!("<div id=\"{}\">Error: {}</div>", slot.key, e.message),
            }
        }
    }

    fn deferred_route(_ctx: &RequestContext) -> Result<ProviderResult, ProviderError> {
        Ok(ProviderResult::deferred(Node::object([
            ("foo", Node::from("pizza")),
            ("bar", Node::Pending(PendingValue::resolved("hamburger"))),
        ])))
    }

    fn redirect_route(_ctx: &RequestContext) -> Result<ProviderResult, ProviderError> {
        let tree = Node::object([
            ("food", Node::from("pizza")),
            ("unused", Node::Pending(PendingValue::resolved("never"))),
        ]);
        Ok(ProviderResult::Data(
            Envelope::new(tree).with_status(301).with_header("Location", "/?redirected"),
        ))
    }

    fn failing_route(_ctx: &RequestContext) -> Result<ProviderResult, ProviderError> {
        Err(ProviderError("database unavailable".to_owned()))
    }

    #[test]
    fn test_document_streams_critical_then_deferred() {
        init_logger();
        let ctx = RequestContext::new("routes/deferred", "/deferred");
        let response = block_on(prepare_document(
            &deferred_route,
            &ctx,
            &FoodRenderer,
            &EncoderOptions::default(),
        ))
        .unwrap();

        let plan = match response {
            DocumentResponse::Stream(plan) => plan,
            DocumentResponse::Redirect(r) => panic!("unexpected redirect: {:?}", r),
        };
        assert_eq!(plan.status, 200);
        assert!(plan
            .headers
            .contains(&("X-Accel-Buffering".to_owned(), "no".to_owned())));

        let mut writer = StreamWriter::new(VecSink::new());
        let summary = block_on(plan.run(&mut writer)).unwrap();
        assert_eq!(summary.delivered, 1);

        let chunks = writer.sink().chunks();
        let critical = String::from_utf8_lossy(&chunks[0]);
        assert!(critical.contains("<div id=\"foo\">pizza</div>"));
        assert!(critical.contains("<template id=\"B:0\"></template><div>Loading</div>"));
        assert!(!critical.contains("hamburger"), "クリティカルに遅延値が混ざってはいけない");

        let deferred = String::from_utf8_lossy(&chunks[1]);
        assert!(deferred.starts_with("<div hidden id=\"S:0\"><div id=\"bar\">hamburger</div></div>"));
    }

    #[test]
    fn test_document_redirect_has_no_body() {
        let ctx = RequestContext::new("routes/redirect", "/redirect");
        let response = block_on(prepare_document(
            &redirect_route,
            &ctx,
            &FoodRenderer,
            &EncoderOptions::default(),
        ))
        .unwrap();
        match response {
            DocumentResponse::Redirect(redirect) => {
                assert_eq!(redirect.status, 301);
                assert_eq!(redirect.location, "/?redirected");
            }
            DocumentResponse::Stream(_) => panic!("redirect must not stream"),
        }
    }

    #[test]
    fn test_provider_failure_is_request_failure() {
        let ctx = RequestContext::new("routes/broken", "/broken");
        let result = block_on(prepare_document(
            &failing_route,
            &ctx,
            &FoodRenderer,
            &EncoderOptions::default(),
        ));
        let err = result.err().unwrap();
        assert!(matches!(err, ServeError::Provider(_)));
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_invalid_options_rejected_before_provider() {
        let mut options = EncoderOptions::default();
        options.document.registry_global = "window.x".to_owned();
        let ctx = RequestContext::new("routes/deferred", "/deferred");
        let result = block_on(prepare_document(&deferred_route, &ctx, &FoodRenderer, &options));
        assert!(matches!(result, Err(ServeError::InvalidOptions(_))));
    }

    #[test]
    fn test_invalid_options_rejected_before_navigation_provider() {
        let called = AtomicBool::new(false);
        let route = |ctx: &RequestContext| {
            called.store(true, Ordering::SeqCst);
            deferred_route(ctx)
        };
        let mut options = EncoderOptions::default();
        options.document.settle_function = "bad-name".to_owned();
        let ctx = RequestContext::new("routes/deferred", "/deferred");

        let result = block_on(prepare_navigation_stream(&route, &ctx, &options));
        assert!(matches!(result, Err(ServeError::InvalidOptions(_))));
        assert!(!called.load(Ordering::SeqCst), "不正なオプションでローダーが呼ばれた");
    }

    #[test]
    fn test_navigation_data_keeps_futures() {
        let ctx = RequestContext::new("routes/deferred", "/deferred");
        match block_on(prepare_navigation(&deferred_route, &ctx)).unwrap() {
            NavigationData::Data { status, classified } => {
                assert_eq!(status, 200);
                assert_eq!(classified.pending.len(), 1);
                assert_eq!(classified.payload["foo"], "pizza");
            }
            other => panic!("unexpected navigation result: {:?}", other),
        }
    }

    #[test]
    fn test_navigation_stream_redirect_is_single_frame() {
        let ctx = RequestContext::new("routes/redirect", "/redirect");
        let response =
            block_on(prepare_navigation_stream(&redirect_route, &ctx, &EncoderOptions::default()))
                .unwrap();
        match response {
            NavigationResponse::Redirect { redirect, body, .. } => {
                assert_eq!(redirect.location, "/?redirected");
                assert_eq!(
                    String::from_utf8(body).unwrap(),
                    "event: redirect\ndata: {\"status\":301,\"location\":\"/?redirected\"}\n\n"
                );
            }
            NavigationResponse::Stream(_) => panic!("redirect must not stream"),
        }
    }

    #[test]
    fn test_navigation_stream_events() {
        let ctx = RequestContext::new("routes/deferred", "/deferred");
        let response =
            block_on(prepare_navigation_stream(&deferred_route, &ctx, &EncoderOptions::default()))
                .unwrap();
        let NavigationResponse::Stream(plan) = response else {
            panic!("expected stream");
        };
        assert_eq!(plan.headers[0].1, "text/event-stream");

        let mut writer = StreamWriter::new(VecSink::new());
        block_on(plan.run(&mut writer)).unwrap();
        let chunks = writer.sink().chunks();
        assert_eq!(chunks.len(), 3);
        assert!(String::from_utf8_lossy(&chunks[1]).contains("\"hamburger\""));
    }
}
