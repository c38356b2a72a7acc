//! 書き込み先（sink）の実装

use std::io::Write;

use futures::channel::mpsc::{Sender, UnboundedSender};

use crate::error::TransportError;

/// バイト列を受け取る接続
///
/// HTTP フレームワーク側のレスポンスボディはこの trait で包む。
pub trait StreamSink {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// メモリ上に書き込む sink（テスト・バッファリング用）
///
/// チャンク境界を保持するので、送信順の検証に使える。
#[derive(Debug, Default)]
pub struct VecSink {
    chunks: Vec<Vec<u8>>,
    closed: bool,
}

impl VecSink {
    pub fn new() -> Self {
        VecSink { chunks: Vec::new(), closed: false }
    }

    /// 書き込まれたチャンクを順番に返す
    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    /// 全チャンクを連結したバイト列
    pub fn bytes(&self) -> Vec<u8> {
        self.chunks.concat()
    }

    /// 全チャンクを連結した文字列（不正な UTF-8 は置換文字になる）
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl StreamSink for VecSink {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.chunks.push(bytes.to_vec());
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}

/// チャネルに流す sink
///
/// 受信側をレスポンスボディのストリームとして HTTP フレームワークに渡す。
/// 受信側が drop されたら切断とみなす。
///
/// キューに上限はなく、`write` は受信側を待たない。読み取りが遅い接続では
/// 未送信のチャンクがメモリに溜まり続ける。上限が要るなら `BoundedChannelSink`。
#[derive(Debug)]
pub struct ChannelSink {
    tx: UnboundedSender<Vec<u8>>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<Vec<u8>>) -> Self {
        ChannelSink { tx }
    }
}

impl StreamSink for ChannelSink {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.tx
            .unbounded_send(bytes.to_vec())
            .map_err(|_| TransportError::Disconnected)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.tx.close_channel();
        Ok(())
    }
}

/// 上限付きチャネルに流す sink
///
/// `write` は同期なので待たずに、溜まったチャンクが上限に達した時点で
/// `TransportError::Overflowed` を返す。`StreamWriter` はそれを切断と同じく扱い、
/// 以後のチャンクを捨てる。
///
/// ```text
/// Sender::channel(buffer) の容量 = buffer + 送信側の数（ここでは 1）
/// ```
#[derive(Debug)]
pub struct BoundedChannelSink {
    tx: Sender<Vec<u8>>,
    capacity: usize,
}

impl BoundedChannelSink {
    /// `mpsc::channel(buffer)` の送信側と、その `buffer` を渡す
    pub fn new(tx: Sender<Vec<u8>>, buffer: usize) -> Self {
        BoundedChannelSink { tx, capacity: buffer + 1 }
    }
}

impl StreamSink for BoundedChannelSink {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.tx.try_send(bytes.to_vec()).map_err(|e| {
            if e.is_full() {
                TransportError::Overflowed(self.capacity)
            } else {
                TransportError::Disconnected
            }
        })
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.tx.close_channel();
        Ok(())
    }
}

/// `std::io::Write` に書く sink（チャンクごとに flush する）
#[derive(Debug)]
pub struct IoSink<W> {
    inner: W,
}

impl<W: Write> IoSink<W> {
    pub fn new(inner: W) -> Self {
        IoSink { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> StreamSink for IoSink<W> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.inner.write_all(bytes).map_err(io_error)?;
        self.inner.flush().map_err(io_error)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.inner.flush().map_err(io_error)
    }
}

fn io_error(e: std::io::Error) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
            TransportError::Disconnected
        }
        _ => TransportError::Io(e.to_string()),
    }
}
