//! Acquisition worker.
//!
//! The worker owns the data socket. It waits for a [`JobConfig`] on the job
//! channel, then multiplexes three sources until the job ends:
//!
//! - data frames from the detector, decoded and appended to the sink
//! - job messages (stop hint, cancel)
//! - an inactivity timer, armed only once a stop hint has arrived
//!
//! A job ends when `frame_count` images have arrived, when the stream stays
//! quiet for `inactivity_factor × acquisition time` after a stop hint, or on
//! `Cancel`. The sink is closed on every exit path, then a completion notice
//! is posted and the worker waits for the next job.
//!
//! In production the worker runs on its own OS thread with a current-thread
//! tokio runtime ([`spawn_worker_thread`]), so blocking storage writes never
//! stall the control client.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::config::MerlinConfig;
use crate::error::{AppResult, MerlinError};
use crate::frame::{decode_data_payload, DataPayload};
use crate::messages::{JobConfig, JobId, JobMessage, JobOutcome, JobReport, WorkerEndpoint, WorkerEvent};
use crate::protocol::MpxCodec;
use crate::stats::WorkerStats;
use crate::storage::{ImageSink, StorageBackend};

/// A job that ended in an error after `acquired` frames.
#[derive(Debug)]
struct JobFailure {
    acquired: u64,
    error: MerlinError,
}

/// Wait this long without data after a stop hint carrying `acquisition_time_seconds`.
pub fn inactivity_timeout(acquisition_time_seconds: f64, factor: f64) -> Duration {
    let secs = acquisition_time_seconds * factor;
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Receive loop for one data connection.
pub struct AcquisitionWorker<R> {
    frames: FramedRead<R, MpxCodec>,
    channel: WorkerEndpoint,
    backend: Arc<dyn StorageBackend>,
    stats: Arc<WorkerStats>,
    inactivity_factor: f64,
    flush_stale_data: bool,
    /// `Start` messages that arrived while a job was running.
    deferred: VecDeque<(JobId, JobConfig)>,
}

impl<R> AcquisitionWorker<R>
where
    R: AsyncRead + Unpin,
{
    /// Worker reading frames from `reader` and jobs from `channel`.
    pub fn new(
        reader: R,
        channel: WorkerEndpoint,
        backend: Arc<dyn StorageBackend>,
        stats: Arc<WorkerStats>,
        config: &MerlinConfig,
    ) -> Self {
        Self {
            frames: FramedRead::new(reader, MpxCodec::new(config.protocol.max_resync_bytes)),
            channel,
            backend,
            stats,
            inactivity_factor: config.acquisition.inactivity_factor,
            flush_stale_data: config.acquisition.flush_stale_data,
            deferred: VecDeque::new(),
        }
    }

    /// Shared counters updated by this worker.
    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Process jobs until the control side drops its end of the job channel.
    ///
    /// Returns an error only when the data connection itself fails; the
    /// control side has been sent a `Failed` event by then.
    pub async fn run(mut self) -> AppResult<()> {
        info!(backend = self.backend.name(), "Acquisition worker started");

        loop {
            let (id, job) = match self.deferred.pop_front() {
                Some(next) => next,
                None => match self.next_job().await {
                    Some(next) => next,
                    None => {
                        info!("Job channel closed, acquisition worker exiting");
                        return Ok(());
                    }
                },
            };

            let span = info_span!("acquisition", job_id = id, frame_count = job.frame_count);
            let result = async {
                if self.flush_stale_data {
                    self.flush_stale()
                        .await
                        .map_err(|error| JobFailure { acquired: 0, error })?;
                }
                self.run_job(id, &job).await
            }
            .instrument(span)
            .await;

            match result {
                Ok(report) => {
                    match report.outcome {
                        JobOutcome::Completed => self.stats.record_job_completed(),
                        JobOutcome::TimedOut => self.stats.record_job_timed_out(),
                        JobOutcome::Cancelled => self.stats.record_job_cancelled(),
                    }
                    info!(
                        requested = report.requested,
                        acquired = report.acquired,
                        outcome = ?report.outcome,
                        "Job finished"
                    );
                    if self.channel.post(WorkerEvent::Done(report)).await.is_err() {
                        debug!("Control side gone before completion notice");
                    }
                }
                Err(JobFailure { acquired, error }) => {
                    self.stats.record_job_failed();
                    error!(acquired, %error, "Job failed");
                    let fatal = error.is_fatal();
                    let event = WorkerEvent::Failed {
                        id,
                        acquired,
                        reason: error.to_string(),
                    };
                    if self.channel.post(event).await.is_err() {
                        debug!("Control side gone before failure notice");
                    }
                    if fatal {
                        return Err(error);
                    }
                }
            }
        }
    }

    /// Wait for the next `Start`, ignoring hints that belong to no job.
    async fn next_job(&mut self) -> Option<(JobId, JobConfig)> {
        loop {
            match self.channel.recv().await? {
                JobMessage::Start { id, job } => return Some((id, job)),
                JobMessage::Stop { .. } => debug!("Stop hint with no job in flight, ignoring"),
                JobMessage::Cancel => debug!("Cancel with no job in flight, ignoring"),
            }
        }
    }

    /// Drop whatever is already waiting on the data socket.
    async fn flush_stale(&mut self) -> AppResult<()> {
        let mut drained = self.frames.read_buffer().len() as u64;
        self.frames.read_buffer_mut().clear();
        self.frames.decoder_mut().reset();

        let mut scratch = [0u8; 8192];
        loop {
            match self.frames.get_mut().read(&mut scratch).now_or_never() {
                Some(Ok(0)) => {
                    return Err(MerlinError::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "data connection closed",
                    )))
                }
                Some(Ok(n)) => drained += n as u64,
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }

        if drained > 0 {
            warn!(bytes = drained, "Flushed stale bytes from data socket");
            self.stats.record_stale_bytes(drained);
        }
        Ok(())
    }

    async fn run_job(&mut self, id: JobId, job: &JobConfig) -> Result<JobReport, JobFailure> {
        let mut sink = match &job.filename {
            Some(path) => {
                let sink = self
                    .backend
                    .open(path)
                    .map_err(|error| JobFailure { acquired: 0, error })?;
                info!(path = %path.display(), "Writing frames");
                Some(sink)
            }
            None => {
                info!("No filename, counting frames without storing them");
                None
            }
        };

        let result = self.receive(id, job, sink.as_deref_mut()).await;

        let closed = match sink {
            Some(sink) => sink.close(),
            None => Ok(()),
        };
        match (result, closed) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(report), Err(error)) => Err(JobFailure {
                acquired: report.acquired,
                error,
            }),
            (Err(failure), closed) => {
                if let Err(error) = closed {
                    warn!(%error, "Failed to close sink after job failure");
                }
                Err(failure)
            }
        }
    }

    async fn receive(
        &mut self,
        id: JobId,
        job: &JobConfig,
        mut sink: Option<&mut (dyn ImageSink + '_)>,
    ) -> Result<JobReport, JobFailure> {
        let report = |acquired, outcome| JobReport {
            id,
            requested: job.frame_count,
            acquired,
            outcome,
        };
        let mut acquired = 0u64;
        let mut inactivity: Option<Duration> = None;

        while acquired < job.frame_count {
            let idle = async move {
                match inactivity {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                frame = self.frames.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(error)) => return Err(JobFailure { acquired, error }),
                        None => {
                            return Err(JobFailure {
                                acquired,
                                error: MerlinError::Transport(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "data connection closed",
                                )),
                            })
                        }
                    };
                    self.stats.set_bytes_resynced(self.frames.decoder().total_discarded());

                    match decode_data_payload(frame.payload()) {
                        Ok(DataPayload::AcquisitionHeader) => {
                            self.stats.record_header();
                            debug!("Acquisition header received");
                        }
                        Ok(DataPayload::Image(image)) => {
                            acquired += 1;
                            self.stats.record_frame();
                            trace!(acquired, frame_number = ?image.frame_number(), "Frame acquired");
                            if let Some(sink) = sink.as_deref_mut() {
                                sink.append(image).map_err(|error| JobFailure { acquired, error })?;
                            }
                        }
                        Err(error) => {
                            self.stats.record_dropped_frame();
                            warn!(%error, acquired, "Dropping undecodable data payload");
                        }
                    }
                }
                message = self.channel.recv() => match message {
                    Some(JobMessage::Stop { acquisition_time_seconds }) => {
                        let timeout = inactivity_timeout(acquisition_time_seconds, self.inactivity_factor);
                        info!(acquisition_time_seconds, ?timeout, "Stop hint received");
                        inactivity = Some(timeout);
                    }
                    Some(JobMessage::Cancel) => {
                        info!(acquired, "Job cancelled");
                        return Ok(report(acquired, JobOutcome::Cancelled));
                    }
                    Some(JobMessage::Start { id: next_id, job: next }) => {
                        warn!(next_id, ?next, "Start received while a job is running, deferring");
                        self.deferred.push_back((next_id, next));
                    }
                    None => {
                        info!(acquired, "Job channel closed mid-job");
                        return Ok(report(acquired, JobOutcome::Cancelled));
                    }
                },
                _ = idle => {
                    warn!(acquired, requested = job.frame_count, "No data within inactivity timeout");
                    return Ok(report(acquired, JobOutcome::TimedOut));
                }
            }
        }

        Ok(report(acquired, JobOutcome::Completed))
    }
}

/// Handle to a worker running on its own thread.
pub struct WorkerHandle {
    thread: JoinHandle<AppResult<()>>,
    stats: Arc<WorkerStats>,
    ready: Option<oneshot::Receiver<()>>,
}

impl WorkerHandle {
    /// Counters shared with the worker thread.
    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Wait until the worker has connected its data socket.
    pub async fn wait_ready(&mut self) -> AppResult<()> {
        let Some(ready) = self.ready.take() else {
            return Ok(());
        };
        ready
            .await
            .map_err(|_| MerlinError::Worker("worker exited before connecting the data channel".to_string()))
    }

    /// Whether the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the worker thread exits and return its result.
    pub fn join(self) -> AppResult<()> {
        self.thread
            .join()
            .map_err(|_| MerlinError::Worker("worker thread panicked".to_string()))?
    }
}

async fn connect_data(config: &MerlinConfig) -> AppResult<TcpStream> {
    let addr = config.detector.data_addr();
    let stream = tokio::time::timeout(config.detector.connect_timeout(), TcpStream::connect(&addr))
        .await
        .map_err(|_| MerlinError::Timeout(format!("connecting data channel {}", addr)))??;
    stream.set_nodelay(true)?;
    info!(%addr, "Data channel connected");
    Ok(stream)
}

/// Start the worker on a dedicated `merlin-worker` thread.
///
/// The thread builds a current-thread runtime, connects the data socket and
/// runs [`AcquisitionWorker::run`] until the job channel closes.
pub fn spawn_worker_thread(
    config: &MerlinConfig,
    channel: WorkerEndpoint,
    backend: Arc<dyn StorageBackend>,
) -> AppResult<WorkerHandle> {
    let stats = Arc::new(WorkerStats::new());
    let (ready_tx, ready_rx) = oneshot::channel();
    let config = config.clone();
    let worker_stats = Arc::clone(&stats);

    let thread = std::thread::Builder::new()
        .name("merlin-worker".to_string())
        .spawn(move || -> AppResult<()> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(async move {
                let stream = connect_data(&config).await?;
                let _ = ready_tx.send(());
                AcquisitionWorker::new(stream, channel, backend, worker_stats, &config)
                    .run()
                    .await
            })
        })?;

    Ok(WorkerHandle {
        thread,
        stats,
        ready: Some(ready_rx),
    })
}
