//! Loss-aware counters for the acquisition worker.
//!
//! The worker owns an `Arc<WorkerStats>` and bumps counters as it goes; any
//! number of observers can take a [`StatsSnapshot`] without coordinating with
//! the worker thread.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared atomic counters.
#[derive(Debug, Default)]
pub struct WorkerStats {
    frames_acquired: AtomicU64,
    headers_seen: AtomicU64,
    frames_dropped: AtomicU64,
    bytes_resynced: AtomicU64,
    stale_bytes_flushed: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_timed_out: AtomicU64,
    jobs_cancelled: AtomicU64,
    jobs_failed: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Images counted towards a job
    pub frames_acquired: u64,
    /// Acquisition headers received (never counted as frames)
    pub headers_seen: u64,
    /// Payloads dropped because they failed to decode
    pub frames_dropped: u64,
    /// Bytes discarded while resynchronizing onto a frame header
    pub bytes_resynced: u64,
    /// Bytes drained from the data socket before a job started
    pub stale_bytes_flushed: u64,
    /// Jobs that received every requested frame
    pub jobs_completed: u64,
    /// Jobs ended by silence after a stop hint
    pub jobs_timed_out: u64,
    /// Jobs ended by `Cancel` or a closed channel
    pub jobs_cancelled: u64,
    /// Jobs ended by an error
    pub jobs_failed: u64,
}

impl StatsSnapshot {
    /// Frames the worker saw but could not deliver.
    pub fn frames_lost(&self) -> u64 {
        self.frames_dropped
    }
}

impl WorkerStats {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one acquired image.
    pub fn record_frame(&self) {
        self.frames_acquired.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one acquisition header.
    pub fn record_header(&self) {
        self.headers_seen.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one payload dropped on a decode error.
    pub fn record_dropped_frame(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish the codec's running total of discarded bytes.
    pub fn set_bytes_resynced(&self, total: u64) {
        self.bytes_resynced.store(total, Ordering::Relaxed);
    }

    /// Add bytes drained before a job.
    pub fn record_stale_bytes(&self, count: u64) {
        self.stale_bytes_flushed.fetch_add(count, Ordering::Relaxed);
    }

    /// Count a job that finished with outcome `Completed`.
    pub fn record_job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a job that finished with outcome `TimedOut`.
    pub fn record_job_timed_out(&self) {
        self.jobs_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a job that finished with outcome `Cancelled`.
    pub fn record_job_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed job.
    pub fn record_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_acquired: self.frames_acquired.load(Ordering::Relaxed),
            headers_seen: self.headers_seen.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            bytes_resynced: self.bytes_resynced.load(Ordering::Relaxed),
            stale_bytes_flushed: self.stale_bytes_flushed.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_timed_out: self.jobs_timed_out.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
        }
    }
}
