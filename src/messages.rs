//! Job channel between the control client and the acquisition worker.
//!
//! Two ordered tokio `mpsc` queues: job messages flow control → worker and
//! worker events flow back. Every job carries a [`JobId`] that the worker
//! echoes in its completion notice, so a caller only ever observes the notice
//! of the job it submitted. The control side keeps the event receiver behind
//! a tokio mutex so that exactly one caller at a time can wait for a
//! completion notice, while every other control request proceeds.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::error::{AppResult, MerlinError};

/// Identifies one submitted job; assigned by [`ControlEndpoint::submit`].
pub type JobId = u64;

/// What the worker should acquire next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    /// Destination file; `None` acquires and counts frames without storing them.
    pub filename: Option<PathBuf>,
    /// Images to acquire before the job completes.
    pub frame_count: u64,
}

/// Control → worker messages.
#[derive(Debug, Clone, PartialEq)]
pub enum JobMessage {
    /// Begin a job.
    Start {
        /// Echoed in the job's completion notice.
        id: JobId,
        /// What to acquire.
        job: JobConfig,
    },
    /// The detector was told to stop; give up after a multiple of this time
    /// without data.
    Stop {
        /// Acquisition time per frame, in seconds.
        acquisition_time_seconds: f64,
    },
    /// Abandon the current job.
    Cancel,
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// All requested frames arrived.
    Completed,
    /// The data stream went quiet after a stop hint.
    TimedOut,
    /// A `Cancel` message ended the job.
    Cancelled,
}

/// Completion notice for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobReport {
    /// Job this report belongs to.
    pub id: JobId,
    /// Frames the job asked for.
    pub requested: u64,
    /// Images actually received.
    pub acquired: u64,
    /// Why the job ended.
    pub outcome: JobOutcome,
}

impl JobReport {
    /// Whether every requested frame arrived.
    pub fn is_complete(&self) -> bool {
        self.outcome == JobOutcome::Completed
    }
}

/// Worker → control messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The job ended normally.
    Done(JobReport),
    /// The job could not finish; `acquired` frames were handled before the failure.
    Failed {
        /// Job that failed.
        id: JobId,
        /// Images received before the failure.
        acquired: u64,
        /// Rendered error.
        reason: String,
    },
}

impl WorkerEvent {
    /// Job the event reports on.
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Done(report) => report.id,
            Self::Failed { id, .. } => *id,
        }
    }
}

/// Control side of the job channel.
#[derive(Debug)]
pub struct ControlEndpoint {
    jobs: mpsc::Sender<JobMessage>,
    events: Mutex<mpsc::Receiver<WorkerEvent>>,
    next_id: AtomicU64,
}

/// Worker side of the job channel.
#[derive(Debug)]
pub struct WorkerEndpoint {
    jobs: mpsc::Receiver<JobMessage>,
    events: mpsc::Sender<WorkerEvent>,
}

/// Create a connected pair of endpoints with `capacity` slots per direction.
pub fn job_channel(capacity: usize) -> (ControlEndpoint, WorkerEndpoint) {
    let (job_tx, job_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::channel(capacity);
    (
        ControlEndpoint {
            jobs: job_tx,
            events: Mutex::new(event_rx),
            next_id: AtomicU64::new(1),
        },
        WorkerEndpoint {
            jobs: job_rx,
            events: event_tx,
        },
    )
}

impl ControlEndpoint {
    /// Queue a message for the worker without waiting.
    ///
    /// Fails with [`MerlinError::JobChannelFull`] when the worker has fallen
    /// `capacity` messages behind.
    pub fn send(&self, message: JobMessage) -> AppResult<()> {
        self.jobs.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => MerlinError::JobChannelFull,
            TrySendError::Closed(_) => MerlinError::JobChannelClosed,
        })
    }

    /// Queue a new job and return the id its completion notice will carry.
    pub fn submit(&self, job: JobConfig) -> AppResult<JobId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(JobMessage::Start { id, job })?;
        Ok(id)
    }

    /// Take the exclusive right to wait for the next completion notice.
    ///
    /// Fails with [`MerlinError::JobInFlight`] while another caller holds it.
    /// Events left over from an abandoned wait are discarded.
    pub fn claim(&self) -> AppResult<MutexGuard<'_, mpsc::Receiver<WorkerEvent>>> {
        let mut events = self
            .events
            .try_lock()
            .map_err(|_| MerlinError::JobInFlight)?;
        while let Ok(stale) = events.try_recv() {
            warn!(?stale, "discarding worker event from an abandoned job");
        }
        Ok(events)
    }

    /// Whether the worker has dropped its end.
    pub fn is_closed(&self) -> bool {
        self.jobs.is_closed()
    }
}

impl WorkerEndpoint {
    /// Next job message; `None` once the control side is gone.
    pub async fn recv(&mut self) -> Option<JobMessage> {
        self.jobs.recv().await
    }

    /// Post an event to the control side.
    pub async fn post(&self, event: WorkerEvent) -> AppResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| MerlinError::JobChannelClosed)
    }
}
