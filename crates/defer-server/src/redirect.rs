//! Redirect Guard
//!
//! 最初のバイトを書く前にローダー結果を検査する。リダイレクトなら分類器も
//! エンコーダーも呼ばれず、ツリー内の Future は一度も poll されずに捨てられる。

use log::debug;

use defer_value::ClassificationError;

use crate::provider::{Envelope, ProviderResult};
use crate::LOCATION_HEADER;

/// 通常のリダイレクトレスポンス
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectResponse {
    pub status: u16,
    pub location: String,
    /// ローダーが付けた他のヘッダー（Set-Cookie 等）。Location は含まない
    pub headers: Vec<(String, String)>,
}

impl RedirectResponse {
    /// Location を含む全ヘッダー
    pub fn all_headers(&self) -> Vec<(String, String)> {
        let mut headers = self.headers.clone();
        headers.push((LOCATION_HEADER.to_owned(), self.location.clone()));
        headers
    }
}

/// 検査結果
#[derive(Debug)]
pub enum Guarded {
    Redirect(RedirectResponse),
    /// ストリーミングに進む
    Proceed(Envelope),
}

pub struct RedirectGuard;

impl RedirectGuard {
    /// ローダー結果を検査する
    ///
    /// # エラー
    /// - `ClassificationError::InvalidStatus`: ステータスが 100..=599 の範囲外、
    ///   または明示的なリダイレクトのステータスが 3xx でない
    /// - `ClassificationError::MissingLocation`: 3xx なのに Location がない
    pub fn inspect(result: ProviderResult) -> Result<Guarded, ClassificationError> {
        match result {
            ProviderResult::Redirect { status, location } => {
                if !is_redirect(status) {
                    return Err(ClassificationError::InvalidStatus(status));
                }
                Ok(Guarded::Redirect(RedirectResponse { status, location, headers: Vec::new() }))
            }
            ProviderResult::Data(envelope) => {
                if !(100..=599).contains(&envelope.status) {
                    return Err(ClassificationError::InvalidStatus(envelope.status));
                }
                if !is_redirect(envelope.status) {
                    return Ok(Guarded::Proceed(envelope));
                }

                let status = envelope.status;
                let location = envelope
                    .location()
                    .map(str::to_owned)
                    .ok_or(ClassificationError::MissingLocation(status))?;
                let headers = envelope
                    .headers
                    .into_iter()
                    .filter(|(name, _)| !name.eq_ignore_ascii_case(LOCATION_HEADER))
                    .collect();

                if envelope.tree.has_pending() {
                    debug!("redirect to {} discards pending values unobserved", location);
                }
                // tree はここで drop される（Future は一度も poll されない）
                Ok(Guarded::Redirect(RedirectResponse { status, location, headers }))
            }
        }
    }
}

fn is_redirect(status: u16) -> bool {
    (300..=399).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use defer_value::Node;

    #[test]
    fn test_plain_data_proceeds() {
        let result = ProviderResult::deferred(Node::from("pizza"));
        assert!(matches!(RedirectGuard::inspect(result), Ok(Guarded::Proceed(_))));
    }

    #[test]
    fn test_status_and_location_is_redirect() {
        let polled = Arc::new(AtomicBool::new(false));
        let flag = polled.clone();
        let tree = Node::object([
            ("food", Node::from("pizza")),
            (
                "unused",
                Node::pending(async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(Node::from("never"))
                }),
            ),
        ]);
        let envelope = Envelope::new(tree)
            .with_status(301)
            .with_header("Location", "/?redirected")
            .with_header("Set-Cookie", "a=b");

        match RedirectGuard::inspect(ProviderResult::Data(envelope)).unwrap() {
            Guarded::Redirect(redirect) => {
                assert_eq!(redirect.status, 301);
                assert_eq!(redirect.location, "/?redirected");
                assert_eq!(redirect.headers, vec![("Set-Cookie".to_owned(), "a=b".to_owned())]);
            }
            other => panic!("expected redirect, got {:?}", other),
        }
        assert!(!polled.load(Ordering::SeqCst), "リダイレクト時に Future が poll されてはいけない");
    }

    #[test]
    fn test_explicit_redirect() {
        match RedirectGuard::inspect(ProviderResult::redirect("/login")).unwrap() {
            Guarded::Redirect(redirect) => {
                assert_eq!(redirect.status, 302);
                assert_eq!(
                    redirect.all_headers(),
                    vec![("Location".to_owned(), "/login".to_owned())]
                );
            }
            other => panic!("expected redirect, got {:?}", other),
        }
    }

    #[test]
    fn test_redirect_status_without_location_rejected() {
        let envelope = Envelope::new(Node::from("x")).with_status(302);
        let err = RedirectGuard::inspect(ProviderResult::Data(envelope)).unwrap_err();
        assert_eq!(err, ClassificationError::MissingLocation(302));
    }

    #[test]
    fn test_invalid_status_rejected() {
        let envelope = Envelope::new(Node::from("x")).with_status(42);
        assert_eq!(
            RedirectGuard::inspect(ProviderResult::Data(envelope)).unwrap_err(),
            ClassificationError::InvalidStatus(42)
        );

        let explicit = ProviderResult::Redirect { status: 200, location: "/".to_owned() };
        assert_eq!(
            RedirectGuard::inspect(explicit).unwrap_err(),
            ClassificationError::InvalidStatus(200)
        );
    }
}
