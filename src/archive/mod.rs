// =============================================================================
// Archive Module
// =============================================================================
//
// Consumes the archive channel and persists ticks in hive-partitioned form:
//
//   exchange=<e>/symbol=<S>/date=<YYYY-MM-DD>/hour=<HH>/<kind>-<mm-ss.fffffff>.<ext>
//
// The byte encoding lives behind `PartitionSink`; the columnar format proper
// is an external collaborator. The shipped default writes CSV batches, which
// keeps the partition plumbing, hour-boundary flushes, and the
// snapshot-on-flush contract fully exercised end to end.

pub mod writer;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};

use crate::types::{ExchangeId, Tick};

pub use writer::{ArchiveStats, ArchiveWriter, CsvPartitionSink};

// =============================================================================
// Partition identity
// =============================================================================

/// Destination partition of one buffered batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub exchange: ExchangeId,
    pub symbol: String,
    pub date: NaiveDate,
    pub hour: u32,
    /// `spreads` or `trades`.
    pub kind: &'static str,
}

impl PartitionKey {
    pub fn for_tick(tick: &Tick) -> Self {
        Self {
            exchange: tick.exchange,
            symbol: tick.symbol.clone(),
            date: tick.ts.date_naive(),
            hour: tick.ts.hour(),
            kind: tick.kind_str(),
        }
    }

    /// Hive-style directory under `root`.
    pub fn dir_path(&self, root: &Path) -> PathBuf {
        root.join(format!("exchange={}", self.exchange.as_str()))
            .join(format!("symbol={}", self.symbol))
            .join(format!(
                "date={:04}-{:02}-{:02}",
                self.date.year(),
                self.date.month(),
                self.date.day()
            ))
            .join(format!("hour={:02}", self.hour))
    }

    /// `<kind>-<mm-ss.fffffff>.<ext>`, stamped from the batch's first record
    /// (fraction in 100 ns ticks).
    pub fn file_name(&self, first_ts: DateTime<Utc>, ext: &str) -> String {
        format!(
            "{}-{:02}-{:02}.{:07}.{ext}",
            self.kind,
            first_ts.minute(),
            first_ts.second(),
            first_ts.nanosecond() / 100,
        )
    }
}

// =============================================================================
// Sink boundary
// =============================================================================

/// Encodes one detached batch into one partition file. Implementations own
/// the file format; the writer owns buffering, partitioning, and flush
/// discipline.
#[async_trait]
pub trait PartitionSink: Send + Sync {
    fn extension(&self) -> &'static str;

    async fn write_batch(
        &self,
        dir: &Path,
        file_name: &str,
        records: &[Tick],
    ) -> anyhow::Result<()>;
}
