//! Response Encoder
//!
//! CriticalChunk を即座に書き、残りの遅延値を `FuturesUnordered` で競わせて
//! settle した順に DeferredChunk を書く。逐次 poll はしない。

use std::collections::BTreeMap;

use futures::future::{self, BoxFuture, Either, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, warn};

use defer_stream::{StreamSink, StreamWriter, WriteStatus};
use defer_value::{
    classify_nested, Classified, DeferredError, Node, Outcome, PendingRef, PendingValue,
    SlotAllocator, SlotId,
};
use defer_wire::{Chunk, CriticalChunk, DeferredChunk, SettleTransport};

use crate::error::ServeError;
use crate::render::Renderer;

type Settlement = (PendingRef, Result<Node, DeferredError>);

/// 1 レスポンス分の結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// 採番されたスロット数（ネストした遅延値を含む）
    pub slots: u32,
    /// sink まで届いた DeferredChunk 数
    pub delivered: u32,
    /// sink 切断で届かなかった DeferredChunk 数
    pub dropped: u32,
    /// `Failed` で終わったスロット数（中断を含む）
    pub failed: u32,
    /// 中断シグナルで打ち切られたスロット数
    pub aborted: u32,
    /// settle を処理した順の slotId（届かなかったものも含む）
    pub emitted: Vec<SlotId>,
    /// 途中で sink が失敗したか
    pub transport_failed: bool,
}

/// 1 レスポンス分のエンコーダー
///
/// 一度 `run` したら消費される（Future を 2 回開始しないため）。
pub struct ResponseEncoder<'r, T, R: ?Sized> {
    classified: Classified,
    slots: SlotAllocator,
    transport: T,
    renderer: &'r R,
    abort: Option<BoxFuture<'static, ()>>,
}

impl<'r, T, R> ResponseEncoder<'r, T, R>
where
    T: SettleTransport,
    R: Renderer + ?Sized,
{
    /// `slots` は `classified` を作ったときの採番器（ネストした遅延値が続きの番号を使う）
    pub fn new(classified: Classified, slots: SlotAllocator, transport: T, renderer: &'r R) -> Self {
        ResponseEncoder { classified, slots, transport, renderer, abort: None }
    }

    /// 中断シグナルを設定する
    ///
    /// シグナルが完了した時点で未 settle のスロットはすべて
    /// `Failed("deferred value aborted")` として slotId 順に書かれる。
    pub fn with_abort<F>(mut self, signal: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.abort = Some(signal.boxed());
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// 最初のチャンクから close までを書き切る
    ///
    /// # エラー
    /// - `ServeError::Wire`: チャンクのエンコード失敗
    ///
    /// sink の失敗はエラーにならず `StreamSummary::transport_failed` に記録される。
    pub async fn run<S: StreamSink>(
        self,
        writer: &mut StreamWriter<S>,
    ) -> Result<StreamSummary, ServeError> {
        let ResponseEncoder { classified, mut slots, transport, renderer, mut abort } = self;
        let mut state = EncodeState {
            transport,
            renderer,
            summary: StreamSummary::default(),
            outstanding: BTreeMap::new(),
        };

        let references: Vec<PendingRef> = classified.references().cloned().collect();
        let markup = if state.transport.wants_markup() {
            renderer.render_page(&classified.route_id, &classified.payload, &references)
        } else {
            String::new()
        };
        state.emit(
            Chunk::Critical(CriticalChunk {
                route_id: classified.route_id,
                payload: classified.payload,
                markup,
            }),
            writer,
        )?;

        let mut in_flight: FuturesUnordered<BoxFuture<'static, Settlement>> = FuturesUnordered::new();
        for slot in classified.pending {
            state.outstanding.insert(slot.reference.slot_id, slot.reference.clone());
            in_flight.push(track(slot.reference, slot.value));
        }

        loop {
            let first = match abort.as_mut() {
                Some(signal) => match future::select(in_flight.next(), signal).await {
                    Either::Left((item, _)) => item,
                    Either::Right(((), _)) => {
                        state.abort_outstanding(writer)?;
                        break;
                    }
                },
                None => in_flight.next().await,
            };
            let Some(first) = first else {
                break;
            };

            // 同時に settle したものは slotId 昇順にまとめて書く
            let mut batch = vec![first];
            while let Some(Some(item)) = in_flight.next().now_or_never() {
                batch.push(item);
            }
            batch.sort_by_key(|(reference, _)| reference.slot_id);

            for (reference, result) in batch {
                state.settle(reference, result, &mut slots, &mut in_flight, writer)?;
            }
        }

        // 残りは中断で捨てる（abort 時のみ非空）
        drop(in_flight);

        let tail = state.transport.encode_close();
        let tail_status = writer.write(&tail);
        let close_status = writer.close();
        if tail_status == WriteStatus::Dropped || close_status == WriteStatus::Dropped {
            state.summary.transport_failed = true;
        }
        state.summary.slots = slots.allocated();
        state.summary.transport_failed |= writer.is_broken();

        debug!(
            "stream finished: {} slots, {} delivered, {} dropped, {} failed",
            state.summary.slots, state.summary.delivered, state.summary.dropped, state.summary.failed
        );
        Ok(state.summary)
    }
}

fn track(reference: PendingRef, value: PendingValue) -> BoxFuture<'static, Settlement> {
    async move {
        let result = value.into_future().await;
        (reference, result)
    }
    .boxed()
}

struct EncodeState<'r, T, R: ?Sized> {
    transport: T,
    renderer: &'r R,
    summary: StreamSummary,
    /// まだ DeferredChunk を書いていないスロット
    outstanding: BTreeMap<SlotId, PendingRef>,
}

impl<T, R> EncodeState<'_, T, R>
where
    T: SettleTransport,
    R: Renderer + ?Sized,
{
    /// 1 つの settle を処理する
    fn settle<S: StreamSink>(
        &mut self,
        reference: PendingRef,
        result: Result<Node, DeferredError>,
        slots: &mut SlotAllocator,
        in_flight: &mut FuturesUnordered<BoxFuture<'static, Settlement>>,
        writer: &mut StreamWriter<S>,
    ) -> Result<(), ServeError> {
        let outcome = match result {
            // Future が別の Future に解決した: 同じスロットのまま待ち続ける
            Ok(Node::Pending(inner)) => {
                in_flight.push(track(reference, inner));
                return Ok(());
            }
            Ok(node) if writer.is_broken() => {
                // 誰にも届かないので、ネストした遅延値は開始しない
                drop(node);
                Outcome::Settled(serde_json::Value::Null)
            }
            Ok(node) => match classify_nested(&reference, node, slots) {
                Ok(nested) => {
                    for slot in nested.pending {
                        debug!(
                            "slot {} nested under slot {} ({})",
                            slot.reference.slot_id, reference.slot_id, slot.reference.key
                        );
                        self.outstanding.insert(slot.reference.slot_id, slot.reference.clone());
                        in_flight.push(track(slot.reference, slot.value));
                    }
                    Outcome::Settled(nested.payload)
                }
                // 解決値が不正でもそのスロットだけの失敗に留める
                Err(e) => Outcome::Failed(DeferredError::new(e.to_string())),
            },
            Err(error) => Outcome::Failed(error),
        };

        self.emit_deferred(reference, outcome, writer)
    }

    /// 未 settle のスロットをすべて中断扱いで書く
    fn abort_outstanding<S: StreamSink>(
        &mut self,
        writer: &mut StreamWriter<S>,
    ) -> Result<(), ServeError> {
        let remaining: Vec<PendingRef> = self.outstanding.values().cloned().collect();
        if !remaining.is_empty() {
            warn!("aborting {} unsettled deferred values", remaining.len());
        }
        for reference in remaining {
            self.summary.aborted += 1;
            self.emit_deferred(reference, Outcome::Failed(DeferredError::aborted()), writer)?;
        }
        Ok(())
    }

    fn emit_deferred<S: StreamSink>(
        &mut self,
        reference: PendingRef,
        outcome: Outcome,
        writer: &mut StreamWriter<S>,
    ) -> Result<(), ServeError> {
        self.outstanding.remove(&reference.slot_id);
        if outcome.is_failed() {
            self.summary.failed += 1;
        }
        self.summary.emitted.push(reference.slot_id);

        if writer.is_broken() {
            debug!("slot {} settled after disconnect; not delivered", reference.slot_id);
            self.summary.dropped += 1;
            return Ok(());
        }

        let markup = if self.transport.wants_markup() {
            self.renderer.render_deferred(&reference, &outcome)
        } else {
            String::new()
        };
        self.emit(Chunk::Deferred(DeferredChunk { reference, outcome, markup }), writer)
    }

    fn emit<S: StreamSink>(
        &mut self,
        chunk: Chunk,
        writer: &mut StreamWriter<S>,
    ) -> Result<(), ServeError> {
        let (bytes, slot) = match &chunk {
            Chunk::Critical(critical) => (self.transport.encode_critical(critical)?, None),
            Chunk::Deferred(deferred) => {
                (self.transport.encode_deferred(deferred)?, Some(deferred.slot_id()))
            }
        };

        let status = writer.write(&bytes);
        match slot {
            Some(slot) => {
                debug!("slot {} written ({:?})", slot, status);
                match status {
                    WriteStatus::Delivered => self.summary.delivered += 1,
                    WriteStatus::Dropped => self.summary.dropped += 1,
                }
            }
            None => debug!("critical chunk written ({:?})", status),
        }
        if status == WriteStatus::Dropped {
            self.summary.transport_failed = true;
        }
        Ok(())
    }
}
