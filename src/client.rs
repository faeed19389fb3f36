//! Control client for the Merlin control channel.
//!
//! Every request is one MPX frame out and one MPX frame back. The framed
//! transport sits behind a tokio mutex, so requests from concurrent tasks are
//! serialized while [`ControlClient::start`] waits on the job channel without
//! holding it: `get`, `set`, `stop` and `arm` stay usable during an
//! acquisition.

use std::io;
use std::path::PathBuf;
use std::sync::{Mutex as StdMutex, PoisonError};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::config::{AcquisitionConfig, MerlinConfig};
use crate::error::{AppResult, MerlinError};
use crate::messages::{ControlEndpoint, JobConfig, JobMessage, JobReport, WorkerEvent};
use crate::property::{Property, PropertyValue, SOFTWARE_TRIGGER};
use crate::protocol::{ControlRequest, ControlResponse, MpxCodec, StatusCode};

/// `DETECTORSTATUS` values that mean the detector is armed.
pub const ARMED_STATUSES: [i64; 2] = [1, 4];

/// Progress of the arm sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArmState {
    /// Not armed
    #[default]
    Idle,
    /// `STARTACQUISITION` sent
    CommandSent,
    /// Polling `DETECTORSTATUS`
    Polling,
    /// `DETECTORSTATUS` reported 1 or 4
    Armed,
}

struct Transport<S> {
    framed: Framed<S, MpxCodec>,
    /// Requests whose reply was never read because the caller gave up.
    unanswered: usize,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn read_reply(&mut self) -> AppResult<ControlResponse> {
        let frame = self.framed.next().await.ok_or_else(|| {
            MerlinError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control connection closed",
            ))
        })??;
        ControlResponse::parse(frame.payload())
    }

    async fn flush(&mut self) -> AppResult<()> {
        SinkExt::<ControlRequest>::flush(&mut self.framed).await
    }

    async fn round_trip(&mut self, request: ControlRequest) -> AppResult<ControlResponse> {
        // An abandoned request may still sit in the write buffer.
        self.flush().await?;
        while self.unanswered > 0 {
            let stale = self.read_reply().await;
            warn!(?stale, "Discarding reply to an abandoned request");
            self.unanswered -= 1;
        }

        debug!(%request, "Sending control request");
        // Counted as soon as it is encoded, before the flush can be abandoned.
        self.framed.feed(request).await?;
        self.unanswered += 1;
        self.flush().await?;
        let reply = self.read_reply().await;
        self.unanswered -= 1;
        let reply = reply?;
        trace!(status = ?reply.status(), fields = ?reply.fields(), "Control response");
        Ok(reply)
    }
}

/// Client for the detector's control channel.
pub struct ControlClient<S> {
    transport: Mutex<Transport<S>>,
    jobs: ControlEndpoint,
    acquisition: AcquisitionConfig,
    filename: StdMutex<Option<PathBuf>>,
    arm_state: StdMutex<ArmState>,
}

impl ControlClient<TcpStream> {
    /// Connect to the control port named in `config`.
    pub async fn connect(config: &MerlinConfig, jobs: ControlEndpoint) -> AppResult<Self> {
        let addr = config.detector.control_addr();
        let stream = tokio::time::timeout(config.detector.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| MerlinError::Timeout(format!("connecting control channel {}", addr)))??;
        stream.set_nodelay(true)?;
        info!(%addr, "Control channel connected");
        Ok(Self::new(stream, jobs, config))
    }
}

impl<S> ControlClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already-connected control stream.
    pub fn new(stream: S, jobs: ControlEndpoint, config: &MerlinConfig) -> Self {
        Self {
            transport: Mutex::new(Transport {
                framed: Framed::new(stream, MpxCodec::new(config.protocol.max_resync_bytes)),
                unanswered: 0,
            }),
            jobs,
            acquisition: config.acquisition.clone(),
            filename: StdMutex::new(None),
            arm_state: StdMutex::new(ArmState::Idle),
        }
    }

    async fn request(&self, request: ControlRequest) -> AppResult<ControlResponse> {
        self.transport.lock().await.round_trip(request).await
    }

    /// Read a property; fails with a command error unless the status is `0`.
    pub async fn get(&self, name: &str) -> AppResult<String> {
        let response = self.request(ControlRequest::get(name)).await?;
        response.check()?;
        response.value().map(str::to_string)
    }

    /// Write a property; fails with a command error unless the status is `0`.
    pub async fn set(&self, name: &str, value: impl std::fmt::Display) -> AppResult<()> {
        self.request(ControlRequest::set(name, value)).await?.check()
    }

    /// Execute a command and return its status without interpreting it.
    pub async fn cmd(&self, name: &str) -> AppResult<StatusCode> {
        Ok(self.request(ControlRequest::cmd(name)).await?.status())
    }

    /// Execute a command that must succeed.
    async fn checked_cmd(&self, name: &str) -> AppResult<()> {
        self.cmd(name).await?.check().map_err(MerlinError::from)
    }

    /// Typed read of a catalogued property.
    pub async fn read_property(&self, property: Property) -> AppResult<PropertyValue> {
        let text = self.get(property.name()).await?;
        property.parse_value(&text)
    }

    /// Typed write of a catalogued property.
    pub async fn write_property(&self, property: Property, value: PropertyValue) -> AppResult<()> {
        if value.kind() != property.kind() {
            return Err(MerlinError::Configuration(format!(
                "{} takes {:?} values, got {:?}",
                property,
                property.kind(),
                value.kind()
            )));
        }
        self.set(property.name(), value).await
    }

    /// Current `DETECTORSTATUS`.
    pub async fn detector_status(&self) -> AppResult<i64> {
        self.read_property(Property::DetectorStatus)
            .await?
            .as_i64()
            .ok_or_else(|| MerlinError::Decode("DETECTORSTATUS is not an integer".to_string()))
    }

    /// Where the arm sequence currently stands.
    pub fn arm_state(&self) -> ArmState {
        *self.arm_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_arm_state(&self, state: ArmState) {
        *self.arm_state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// File the next job writes to; `None` counts frames without storing them.
    pub fn set_filename(&self, filename: Option<PathBuf>) {
        info!(filename = ?filename, "Output file set");
        *self.filename.lock().unwrap_or_else(PoisonError::into_inner) = filename;
    }

    /// File the next job writes to.
    pub fn filename(&self) -> Option<PathBuf> {
        self.filename
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start the acquisition and wait until `DETECTORSTATUS` reports armed.
    ///
    /// Fails with [`MerlinError::Timeout`] if the detector does not arm within
    /// `acquisition.arm_timeout_ms`.
    pub async fn arm(&self) -> AppResult<()> {
        let limit = self.acquisition.arm_timeout();
        let result = match tokio::time::timeout(limit, self.arm_sequence()).await {
            Ok(result) => result,
            Err(_) => Err(MerlinError::Timeout(format!(
                "detector not armed within {:?}",
                limit
            ))),
        };
        if result.is_err() {
            self.set_arm_state(ArmState::Idle);
        }
        result
    }

    async fn arm_sequence(&self) -> AppResult<()> {
        self.set_arm_state(ArmState::CommandSent);
        self.checked_cmd("STARTACQUISITION").await?;
        tokio::time::sleep(self.acquisition.arm_initial_delay()).await;

        self.set_arm_state(ArmState::Polling);
        loop {
            let status = self.detector_status().await?;
            if ARMED_STATUSES.contains(&status) {
                self.set_arm_state(ArmState::Armed);
                info!(status, "Detector armed");
                return Ok(());
            }
            trace!(status, "Waiting for detector to arm");
            tokio::time::sleep(self.acquisition.arm_poll_interval()).await;
        }
    }

    /// Hand a job to the worker, trigger if the detector expects a software
    /// trigger, and wait for the completion notice.
    ///
    /// Returns `Ok(None)` if the worker went away without reporting. Only one
    /// `start` may wait at a time; a second concurrent call fails with
    /// [`MerlinError::JobInFlight`]. Notices for other jobs, such as one whose
    /// `start` was dropped before it finished, are skipped.
    pub async fn start(&self, frame_count: u64) -> AppResult<Option<JobReport>> {
        let mut events = self.jobs.claim()?;
        let job = JobConfig {
            filename: self.filename(),
            frame_count,
        };
        info!(frame_count, filename = ?job.filename, "Starting acquisition job");
        let id = self.jobs.submit(job)?;

        if let Err(error) = self.trigger_if_software().await {
            warn!(%error, "Trigger check failed, cancelling job");
            if self.jobs.send(JobMessage::Cancel).is_err() {
                debug!("Worker already gone");
            }
            return Err(error);
        }

        let event = loop {
            match events.recv().await {
                Some(event) if event.job_id() != id => {
                    warn!(job_id = id, other = ?event, "Skipping completion notice of another job");
                }
                event => break event,
            }
        };
        self.set_arm_state(ArmState::Idle);
        match event {
            Some(WorkerEvent::Done(report)) => Ok(Some(report)),
            Some(WorkerEvent::Failed { acquired, reason, .. }) => Err(MerlinError::Worker(format!(
                "{} ({} frames acquired)",
                reason, acquired
            ))),
            None => {
                warn!("Worker closed the job channel without a completion notice");
                Ok(None)
            }
        }
    }

    async fn trigger_if_software(&self) -> AppResult<()> {
        let trigger = self.read_property(Property::TriggerStart).await?;
        if trigger.as_i64() == Some(SOFTWARE_TRIGGER) {
            debug!("Software trigger mode, sending SOFTTRIGGER");
            self.soft_trigger().await?;
        }
        Ok(())
    }

    /// Stop the detector and tell the worker to give up once data stops.
    pub async fn stop(&self) -> AppResult<()> {
        let acquisition_time_ms = self
            .read_property(Property::AcquisitionTime)
            .await?
            .as_f64();
        let acquisition_time_seconds = acquisition_time_ms * 1.0e-3;
        self.checked_cmd("STOPACQUISITION").await?;
        self.jobs.send(JobMessage::Stop {
            acquisition_time_seconds,
        })?;
        info!(acquisition_time_seconds, "Acquisition stopped");
        Ok(())
    }

    /// Abandon the running job; `start` returns with a `Cancelled` report.
    pub async fn cancel(&self) -> AppResult<()> {
        self.jobs.send(JobMessage::Cancel)
    }

    /// Send `SOFTTRIGGER`.
    pub async fn soft_trigger(&self) -> AppResult<()> {
        self.checked_cmd("SOFTTRIGGER").await
    }

    /// Send `RESET`.
    pub async fn reset(&self) -> AppResult<()> {
        self.checked_cmd("RESET").await
    }

    /// Whether the worker side of the job channel is gone.
    pub fn worker_gone(&self) -> bool {
        self.jobs.is_closed()
    }
}
