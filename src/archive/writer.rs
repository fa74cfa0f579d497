// =============================================================================
// Archive writer — buffering, hour-boundary flushes, snapshot-on-flush
// =============================================================================
//
// `write` is a non-blocking enqueue: it appends to the partition buffer and,
// when a batch fills or the tick stream crosses an hour boundary, DETACHES
// the due buffers into a pending list. Actual I/O happens in
// `flush_pending`/`flush_all`, always against detached batches — the live
// buffers are never handed to a flush, so concurrent enqueues cannot race a
// clear and a record is flushed at most once.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use crate::archive::{PartitionKey, PartitionSink};
use crate::runtime_config::ArchiveConfig;
use crate::types::{Tick, TickKind};

/// Counters for the stats endpoint and the shutdown round-trip check.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveStats {
    pub enqueued: u64,
    pub written: u64,
    pub batches_flushed: u64,
    pub flush_failures: u64,
    pub buffered: usize,
}

struct BufferState {
    buffers: HashMap<PartitionKey, Vec<Tick>>,
    /// Hour of the most recent record accepted, used to force a flush of the
    /// previous hour's buffers at the boundary.
    current_hour: Option<(NaiveDate, u32)>,
    /// Detached batches awaiting I/O.
    pending: Vec<(PartitionKey, Vec<Tick>)>,
}

pub struct ArchiveWriter {
    root: PathBuf,
    batch_size: usize,
    sink: Arc<dyn PartitionSink>,

    state: Mutex<BufferState>,

    enqueued: AtomicU64,
    written: AtomicU64,
    batches_flushed: AtomicU64,
    flush_failures: AtomicU64,
}

impl ArchiveWriter {
    pub fn new(cfg: &ArchiveConfig, sink: Arc<dyn PartitionSink>) -> Self {
        Self {
            root: PathBuf::from(&cfg.data_root),
            batch_size: cfg.batch_size.max(1),
            sink,
            state: Mutex::new(BufferState {
                buffers: HashMap::new(),
                current_hour: None,
                pending: Vec::new(),
            }),
            enqueued: AtomicU64::new(0),
            written: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
        }
    }

    /// Non-blocking enqueue. Detaches due batches (full, or belonging to a
    /// previous hour once the stream crosses an hour boundary) for the next
    /// `flush_pending` call.
    pub fn write(&self, tick: Tick) {
        let key = PartitionKey::for_tick(&tick);
        let tick_hour = (key.date, key.hour);

        let mut state = self.state.lock();

        // Hour boundary: everything buffered for earlier hours is detached
        // before the new hour's first record is accepted.
        if let Some(current) = state.current_hour {
            if current != tick_hour {
                let stale: Vec<PartitionKey> = state
                    .buffers
                    .keys()
                    .filter(|k| (k.date, k.hour) != tick_hour)
                    .cloned()
                    .collect();
                for k in stale {
                    if let Some(batch) = state.buffers.remove(&k) {
                        if !batch.is_empty() {
                            state.pending.push((k, batch));
                        }
                    }
                }
            }
        }
        state.current_hour = Some(tick_hour);

        let buffer = state.buffers.entry(key.clone()).or_default();
        buffer.push(tick);
        self.enqueued.fetch_add(1, Ordering::Relaxed);

        if buffer.len() >= self.batch_size {
            let batch = std::mem::take(buffer);
            state.buffers.remove(&key);
            state.pending.push((key, batch));
        }
    }

    /// Write every detached batch to its partition. Returns the number of
    /// records persisted. A failing partition is logged and counted; the
    /// remaining batches still go out.
    pub async fn flush_pending(&self) -> usize {
        let pending: Vec<(PartitionKey, Vec<Tick>)> = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.pending)
        };
        self.write_batches(pending).await
    }

    /// Snapshot-and-clear every live buffer plus the pending list, then
    /// write all batches concurrently. This is the shutdown flush.
    pub async fn flush_all(&self) -> usize {
        let batches: Vec<(PartitionKey, Vec<Tick>)> = {
            let mut state = self.state.lock();
            let mut batches = std::mem::take(&mut state.pending);
            for (key, batch) in state.buffers.drain() {
                if !batch.is_empty() {
                    batches.push((key, batch));
                }
            }
            batches
        };
        self.write_batches(batches).await
    }

    async fn write_batches(&self, batches: Vec<(PartitionKey, Vec<Tick>)>) -> usize {
        if batches.is_empty() {
            return 0;
        }

        let futures = batches.into_iter().map(|(key, batch)| {
            let sink = self.sink.clone();
            let dir = key.dir_path(&self.root);
            async move {
                let first_ts = batch.first().map(|t| t.ts).unwrap_or_default();
                let file_name = key.file_name(first_ts, sink.extension());
                let count = batch.len();
                match sink.write_batch(&dir, &file_name, &batch).await {
                    Ok(()) => Ok(count),
                    Err(e) => Err((key, e)),
                }
            }
        });

        let mut written = 0;
        for result in futures_util::future::join_all(futures).await {
            match result {
                Ok(count) => {
                    written += count;
                    self.written.fetch_add(count as u64, Ordering::Relaxed);
                    self.batches_flushed.fetch_add(1, Ordering::Relaxed);
                }
                Err((key, e)) => {
                    self.flush_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        partition = %format!("{}/{}/{:02}", key.exchange.as_str(), key.symbol, key.hour),
                        error = %e,
                        "partition flush failed, records lost"
                    );
                }
            }
        }
        if written > 0 {
            info!(records = written, "archive batches flushed");
        }
        written
    }

    pub fn stats(&self) -> ArchiveStats {
        let state = self.state.lock();
        let buffered =
            state.buffers.values().map(Vec::len).sum::<usize>()
                + state.pending.iter().map(|(_, b)| b.len()).sum::<usize>();
        ArchiveStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            buffered,
        }
    }
}

// =============================================================================
// Default sink — CSV batches via tokio::fs
// =============================================================================

/// Plain-text sink: one CSV file per flushed batch. Stands in for the
/// columnar writer while exercising the identical partition layout.
pub struct CsvPartitionSink;

#[async_trait]
impl PartitionSink for CsvPartitionSink {
    fn extension(&self) -> &'static str {
        "csv"
    }

    async fn write_batch(
        &self,
        dir: &Path,
        file_name: &str,
        records: &[Tick],
    ) -> anyhow::Result<()> {
        use anyhow::Context;

        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create partition dir {}", dir.display()))?;

        let mut out = String::with_capacity(records.len() * 96);
        out.push_str("ts_us,symbol,f1,f2,f3,f4,f5\n");
        for tick in records {
            let ts_us = tick.ts.timestamp_micros();
            match &tick.kind {
                TickKind::Spread {
                    best_bid,
                    best_ask,
                    spread_pct,
                    bid_qty,
                    ask_qty,
                } => {
                    out.push_str(&format!(
                        "{ts_us},{},{best_bid},{best_ask},{spread_pct},{bid_qty},{ask_qty}\n",
                        tick.symbol
                    ));
                }
                TickKind::Trade { price, qty, side } => {
                    out.push_str(&format!(
                        "{ts_us},{},{price},{qty},{side},,\n",
                        tick.symbol
                    ));
                }
            }
        }

        let path = dir.join(file_name);
        tokio::fs::write(&path, out)
            .await
            .with_context(|| format!("write partition file {}", path.display()))?;
        Ok(())
    }
}
