//! Per-stream metrics records and the snapshot region.
//!
//! A worker owns exactly one [`StreamStruct`]; it updates byte counters on
//! every delivered buffer and publishes the whole record once per second.
//! The supervisor never writes the record -- it samples published snapshots
//! and reads one final snapshot after the worker has been reaped.
//!
//! Publication is by whole-record replace (write a temp file, rename over
//! `stats.json`), so a reader can never observe a torn record.  The primary
//! metrics channel is the `statistic_stream` broadcast; the region exists for
//! the fields the supervisor needs at the instant a worker exits.  A
//! broadcast may carry a newer `total_bytes` than the next region sample.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::{ChannelId, StreamId, StreamStatus, StreamType, TimestampMs};

pub const STATS_FILE_NAME: &str = "stats.json";

/// Byte accounting for one input or output endpoint.
///
/// `total_bytes` only grows; `prev_total_bytes` trails it at checkpoints, so
/// `diff_total_bytes` is the traffic of the current measurement window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    id: ChannelId,
    last_update_ms: TimestampMs,
    total_bytes: u64,
    prev_total_bytes: u64,
    bytes_per_second: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    desired_bps_min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    desired_bps_max: Option<u64>,
}

impl ChannelStats {
    pub fn new(id: ChannelId) -> Self {
        ChannelStats {
            id,
            last_update_ms: 0,
            total_bytes: 0,
            prev_total_bytes: 0,
            bytes_per_second: 0,
            desired_bps_min: None,
            desired_bps_max: None,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn prev_total_bytes(&self) -> u64 {
        self.prev_total_bytes
    }

    pub fn bps(&self) -> u64 {
        self.bytes_per_second
    }

    pub fn last_update_ms(&self) -> TimestampMs {
        self.last_update_ms
    }

    /// Account `n` more bytes delivered to this endpoint.
    pub fn add_bytes(&mut self, n: u64, now_ms: TimestampMs) {
        self.total_bytes += n;
        if now_ms > self.last_update_ms {
            self.last_update_ms = now_ms;
        }
    }

    /// Bytes accumulated since the last checkpoint.
    pub fn diff_total_bytes(&self) -> u64 {
        self.total_bytes - self.prev_total_bytes
    }

    /// Recompute `bps` over a window of `sec` seconds.  A zero window is
    /// ignored.
    pub fn update_bps(&mut self, sec: u64) {
        if sec == 0 {
            return;
        }
        self.bytes_per_second = self.diff_total_bytes() / sec;
    }

    /// Close the measurement window: the next `diff_total_bytes` starts
    /// from the current total.
    pub fn update_checkpoint(&mut self) {
        self.prev_total_bytes = self.total_bytes;
    }

    pub fn set_desired_bps(&mut self, min: Option<u64>, max: Option<u64>) {
        self.desired_bps_min = min;
        self.desired_bps_max = max;
    }
}

/// The whole-record metrics snapshot for one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStruct {
    pub id: StreamId,
    pub stream_type: StreamType,
    pub start_time_ms: TimestampMs,
    /// Stamped on every publication tick.
    pub loop_time_ms: TimestampMs,
    /// Read-only mirror of the supervisor's restart budget.
    pub restarts_left: u32,
    pub status: StreamStatus,
    pub cpu_load: f64,
    pub rss_bytes: u64,
    pub input: Vec<ChannelStats>,
    pub output: Vec<ChannelStats>,
}

impl StreamStruct {
    pub fn new(
        id: StreamId,
        stream_type: StreamType,
        input_channels: &[ChannelId],
        output_channels: &[ChannelId],
        restarts_left: u32,
        now_ms: TimestampMs,
    ) -> Self {
        StreamStruct {
            id,
            stream_type,
            start_time_ms: now_ms,
            loop_time_ms: now_ms,
            restarts_left,
            status: StreamStatus::New,
            cpu_load: 0.0,
            rss_bytes: 0,
            input: input_channels.iter().map(|&c| ChannelStats::new(c)).collect(),
            output: output_channels.iter().map(|&c| ChannelStats::new(c)).collect(),
        }
    }

    pub fn uptime_secs(&self, now_ms: TimestampMs) -> u64 {
        let up = now_ms.saturating_sub(self.start_time_ms);
        (up / 1000).max(0) as u64
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt snapshot: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Handle to the snapshot file inside a stream's feedback directory.
///
/// The worker is the only writer; the supervisor only samples and finally
/// removes the file after the reap-time snapshot has been drained.
#[derive(Debug, Clone)]
pub struct StatsRegion {
    path: PathBuf,
}

impl StatsRegion {
    pub fn new(feedback_dir: &Path) -> Self {
        StatsRegion {
            path: feedback_dir.join(STATS_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the snapshot atomically.
    pub fn publish(&self, record: &StreamStruct) -> Result<(), StatsError> {
        let tmp = self.path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&serde_json::to_vec(record)?)?;
        file.flush()?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Read the latest published snapshot, `None` if nothing was published
    /// yet.
    pub fn sample(&self) -> Result<Option<StreamStruct>, StatsError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the snapshot after the final drain.
    pub fn remove(&self) -> Result<(), StatsError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
