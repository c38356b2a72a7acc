//! # defer-stream
//!
//! 追記専用のストリーム書き込み抽象化レイヤー
//!
//! エンコーダーが生成したチャンクのバイト列を、到着順にそのまま接続へ流す。
//! 一度書いたバイトを巻き戻したり書き換えたりする手段は持たない。
//!
//! ## 切断時の振る舞い
//!
//! ```text
//! write(chunk0) → Delivered
//! write(chunk1) → sink がエラー → Dropped（以後 broken）
//! write(chunk2) → Dropped（sink には触れない）
//! ```
//!
//! エンコーダーから見ると失敗は静かで、再送もしない。

pub mod error;
pub mod sink;
pub mod writer;

pub use error::TransportError;
pub use sink::{BoundedChannelSink, ChannelSink, IoSink, StreamSink, VecSink};
pub use writer::{StreamWriter, WriteStatus, WriterStats};
