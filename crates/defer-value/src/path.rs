//! ValueTree 内の位置を表すキーパス
//!
//! 文字列表現はセグメントを `.` で連結したもので、クライアント側レジストリの
//! `registry[routeId][key]` の `key` にそのまま使われる。

use core::fmt;

use serde::{Deserialize, Serialize};

/// ValueTree のキーチェーン
///
/// 配列要素のセグメントは 10 進数のインデックス文字列になる。
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    /// 空のパス（ツリーの根）
    pub fn root() -> Self {
        KeyPath(Vec::new())
    }

    /// オブジェクトキーを 1 つ足した新しいパスを返す
    pub fn child(&self, key: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(key.to_owned());
        KeyPath(segments)
    }

    /// 配列インデックスを 1 つ足した新しいパスを返す
    pub fn index(&self, index: usize) -> Self {
        self.child(&index.to_string())
    }

    /// 別のパスを後ろに連結する（ネストした遅延値の再分類用）
    pub fn join(&self, tail: &KeyPath) -> Self {
        let mut segments = self.0.clone();
        segments.extend(tail.0.iter().cloned());
        KeyPath(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

impl From<&str> for KeyPath {
    /// `.` 区切りの文字列からパスを復元する
    fn from(s: &str) -> Self {
        if s.is_empty() {
            return KeyPath::root();
        }
        KeyPath(s.split('.').map(str::to_owned).collect())
    }
}
