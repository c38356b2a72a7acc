//! HTML / インラインスクリプト用のエスケープ
//!
//! スクリプト要素に埋め込む JSON は `</script>` や `<!--` で要素を閉じられないよう、
//! `<` `>` `&` と JS で改行扱いになる U+2028 / U+2029 を `\uXXXX` に置き換える。

use serde::Serialize;

use crate::error::WireError;

/// 値を JSON にしてスクリプト埋め込み用にエスケープする
pub fn script_json<T: Serialize + ?Sized>(value: &T) -> Result<String, WireError> {
    let json = serde_json::to_string(value)?;
    Ok(escape_script(&json))
}

/// JSON テキストをスクリプト要素の中で安全な形にする
///
/// JSON 文字列リテラルの内外どちらでも `\uXXXX` は同じ文字として解釈される。
pub fn escape_script(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        match c {
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            _ => out.push(c),
        }
    }
    out
}

/// HTML テキスト / 属性値のエスケープ
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_json_cannot_close_element() {
        let text = script_json("</script><script>alert(1)</script>").unwrap();
        assert!(!text.contains("</script"));
        assert_eq!(
            text,
            r#""\u003c/script\u003e\u003cscript\u003ealert(1)\u003c/script\u003e""#
        );
    }

    #[test]
    fn test_line_separators_escaped() {
        let text = script_json("a\u{2028}b\u{2029}c").unwrap();
        assert_eq!(text, r#""a\u2028b\u2029c""#);
    }

    #[test]
    fn test_escaped_json_still_parses() {
        let original = serde_json::json!({"html": "<b>&</b>"});
        let text = script_json(&original).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<a href="x">'&'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;&#39;&amp;&#39;&lt;/a&gt;"
        );
    }
}
