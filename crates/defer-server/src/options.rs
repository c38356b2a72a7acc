//! エンコーダーの設定

use serde::Deserialize;

use defer_wire::DocumentTemplate;

use crate::error::ServeError;

/// レスポンス単位の設定
///
/// JSON から読み込める。未指定の項目は既定値になる。
///
/// ```json
/// {
///   "document": { "registryGlobal": "__deferredData", "tail": "</body></html>" },
///   "disableProxyBuffering": true
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EncoderOptions {
    pub document: DocumentTemplate,
    /// `X-Accel-Buffering: no` を付けて、リバースプロキシにチャンクを溜めさせない
    pub disable_proxy_buffering: bool,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        EncoderOptions { document: DocumentTemplate::default(), disable_proxy_buffering: true }
    }
}

impl EncoderOptions {
    pub fn from_json(text: &str) -> Result<Self, ServeError> {
        let options: EncoderOptions =
            serde_json::from_str(text).map_err(|e| ServeError::InvalidOptions(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// グローバル名が JS の識別子として埋め込めるか確認する
    pub fn validate(&self) -> Result<(), ServeError> {
        if !self.document.has_valid_globals() {
            return Err(ServeError::InvalidOptions(format!(
                "registry/settle globals must be JS identifiers: `{}`, `{}`",
                self.document.registry_global, self.document.settle_function
            )));
        }
        Ok(())
    }

    /// ストリーミングレスポンスに足すヘッダー
    pub(crate) fn streaming_headers(&self, content_type: &str) -> Vec<(String, String)> {
        let mut headers = vec![("Content-Type".to_owned(), content_type.to_owned())];
        if self.disable_proxy_buffering {
            headers.push(("X-Accel-Buffering".to_owned(), "no".to_owned()));
        }
        headers
    }
}
