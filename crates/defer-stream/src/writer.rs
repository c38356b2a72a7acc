//! 追記専用ストリームライター

use log::{debug, warn};

use crate::error::TransportError;
use crate::sink::StreamSink;

/// 1 回の書き込みの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// sink が受け付けた
    Delivered,
    /// 届かなかった（切断済み・close 済み）
    Dropped,
}

/// 書き込み統計
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// sink が受け付けたバイト数
    pub bytes_sent: u64,
    pub chunks_delivered: u32,
    pub chunks_dropped: u32,
}

/// 追記専用のチャンクライター
///
/// sink が一度でも失敗したら broken になり、以後の write は sink に触れずに
/// `Dropped` を返す。エラーは最初の 1 回だけ `last_error` に残る。
pub struct StreamWriter<S> {
    sink: S,
    broken: bool,
    closed: bool,
    last_error: Option<TransportError>,
    stats: WriterStats,
}

impl<S: StreamSink> StreamWriter<S> {
    pub fn new(sink: S) -> Self {
        StreamWriter {
            sink,
            broken: false,
            closed: false,
            last_error: None,
            stats: WriterStats::default(),
        }
    }

    /// チャンクを 1 つ追記する
    pub fn write(&mut self, bytes: &[u8]) -> WriteStatus {
        if self.broken || self.closed {
            self.stats.chunks_dropped += 1;
            return WriteStatus::Dropped;
        }

        match self.sink.write(bytes) {
            Ok(()) => {
                self.stats.bytes_sent += bytes.len() as u64;
                self.stats.chunks_delivered += 1;
                WriteStatus::Delivered
            }
            Err(e) => {
                warn!("stream sink rejected a write, dropping the rest: {}", e);
                self.broken = true;
                self.last_error = Some(e);
                self.stats.chunks_dropped += 1;
                WriteStatus::Dropped
            }
        }
    }

    /// ストリームを閉じる（2 回目以降は何もしない）
    pub fn close(&mut self) -> WriteStatus {
        if self.closed {
            return WriteStatus::Dropped;
        }
        self.closed = true;
        if self.broken {
            return WriteStatus::Dropped;
        }

        match self.sink.close() {
            Ok(()) => {
                debug!("stream closed after {} bytes", self.stats.bytes_sent);
                WriteStatus::Delivered
            }
            Err(e) => {
                warn!("stream sink failed to close: {}", e);
                self.broken = true;
                self.last_error = Some(e);
                WriteStatus::Dropped
            }
        }
    }

    /// sink が失敗して以後の書き込みが届かない状態か
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_inner(self) -> S {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::VecSink;

    /// n 回目の書き込みから失敗する sink
    struct FlakySink {
        accepted: Vec<Vec<u8>>,
        fail_from: usize,
        attempts: usize,
    }

    impl StreamSink for FlakySink {
        fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.attempts += 1;
            if self.accepted.len() >= self.fail_from {
                return Err(TransportError::Disconnected);
            }
            self.accepted.push(bytes.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_write_appends_in_order() {
        let mut writer = StreamWriter::new(VecSink::new());
        assert_eq!(writer.write(b"one"), WriteStatus::Delivered);
        assert_eq!(writer.write(b"two"), WriteStatus::Delivered);
        assert_eq!(writer.close(), WriteStatus::Delivered);

        assert_eq!(writer.sink().text(), "onetwo");
        assert!(writer.sink().is_closed());
        assert_eq!(writer.stats().bytes_sent, 6);
        assert_eq!(writer.stats().chunks_delivered, 2);
    }

    #[test]
    fn test_failure_is_sticky_and_silent() {
        let sink = FlakySink { accepted: Vec::new(), fail_from: 1, attempts: 0 };
        let mut writer = StreamWriter::new(sink);

        assert_eq!(writer.write(b"critical"), WriteStatus::Delivered);
        assert_eq!(writer.write(b"slot 0"), WriteStatus::Dropped);
        assert_eq!(writer.write(b"slot 1"), WriteStatus::Dropped);

        assert!(writer.is_broken());
        assert_eq!(writer.last_error(), Some(&TransportError::Disconnected));
        // broken 以後は sink に触れない（再送しない）
        assert_eq!(writer.sink().attempts, 2);
        assert_eq!(writer.stats().chunks_dropped, 2);
    }

    #[test]
    fn test_write_after_close_dropped() {
        let mut writer = StreamWriter::new(VecSink::new());
        writer.close();
        assert_eq!(writer.write(b"late"), WriteStatus::Dropped);
        assert_eq!(writer.close(), WriteStatus::Dropped);
        assert!(writer.sink().chunks().is_empty());
    }
}
