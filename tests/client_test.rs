//! Control client against a simulated detector, with and without a worker.

mod common;

use common::{image_payload, send_payload, spawn_control_detector, test_config, Request, PIPE_CAPACITY};
use merlin_daq::client::{ArmState, ControlClient};
use merlin_daq::error::{CommandError, MerlinError};
use merlin_daq::messages::{job_channel, JobMessage, JobOutcome, WorkerEndpoint};
use merlin_daq::stats::WorkerStats;
use merlin_daq::storage::MemoryBackend;
use merlin_daq::worker::AcquisitionWorker;
use merlin_daq::MerlinConfig;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

fn client_with<F>(config: &MerlinConfig, handler: F) -> (ControlClient<DuplexStream>, WorkerEndpoint, tokio::task::JoinHandle<Vec<Request>>)
where
    F: FnMut(&Request) -> String + Send + 'static,
{
    let (client_io, detector_io) = tokio::io::duplex(64 * 1024);
    let detector = spawn_control_detector(detector_io, handler);
    let (control, worker_end) = job_channel(8);
    (ControlClient::new(client_io, control, config), worker_end, detector)
}

#[tokio::test]
async fn test_arm_polls_until_armed() {
    let polls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&polls);
    let (client, _worker, detector) = client_with(&test_config(), move |req| match req.name.as_str() {
        "STARTACQUISITION" => req.ok(),
        "DETECTORSTATUS" => {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            req.reply(Some(if n < 3 { "0" } else { "4" }), 0)
        }
        _ => req.reply(None, 2),
    });

    client.arm().await.expect("armed");
    assert_eq!(client.arm_state(), ArmState::Armed);
    assert_eq!(polls.load(Ordering::SeqCst), 4);

    drop(client);
    let seen = detector.await.expect("detector task");
    assert_eq!(seen[0].verb, "CMD");
    assert_eq!(seen[0].name, "STARTACQUISITION");
    assert!(seen[1..].iter().all(|r| r.name == "DETECTORSTATUS"));
}

#[tokio::test]
async fn test_arm_accepts_status_one() {
    let (client, _worker, _detector) = client_with(&test_config(), |req| match req.name.as_str() {
        "DETECTORSTATUS" => req.reply(Some("1"), 0),
        _ => req.ok(),
    });
    client.arm().await.expect("armed");
}

#[tokio::test]
async fn test_arm_times_out() {
    let mut config = test_config();
    config.acquisition.arm_timeout_ms = 50;
    let (client, _worker, _detector) = client_with(&config, |req| match req.name.as_str() {
        "DETECTORSTATUS" => req.reply(Some("0"), 0),
        _ => req.ok(),
    });

    let result = client.arm().await;
    assert!(matches!(result, Err(MerlinError::Timeout(_))), "{:?}", result);
    assert_eq!(client.arm_state(), ArmState::Idle);

    // The connection stays usable after the abandoned poll.
    assert_eq!(client.get("DETECTORSTATUS").await.expect("get"), "0");
}

#[tokio::test]
async fn test_arm_reports_busy_detector() {
    let (client, _worker, _detector) = client_with(&test_config(), |req| req.reply(None, 1));
    assert!(matches!(
        client.arm().await,
        Err(MerlinError::Command(CommandError::Busy))
    ));
}

#[tokio::test]
async fn test_request_abandoned_mid_write_does_not_shift_replies() {
    // An 8-byte pipe stalls the first request part-way through its flush.
    let (client_io, detector_io) = tokio::io::duplex(8);
    let (control, _worker) = job_channel(4);
    let client = ControlClient::new(client_io, control, &test_config());

    let abandoned = tokio::time::timeout(Duration::from_millis(20), client.get("FIRSTPROPERTY")).await;
    assert!(abandoned.is_err());

    let detector = spawn_control_detector(detector_io, |req| req.reply(Some(req.name.as_str()), 0));
    assert_eq!(client.get("SECONDPROPERTY").await.expect("get"), "SECONDPROPERTY");

    drop(client);
    let seen = detector.await.expect("detector task");
    let names: Vec<_> = seen.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["FIRSTPROPERTY", "SECONDPROPERTY"]);
}

#[tokio::test]
async fn test_status_codes_surface_as_distinct_errors() {
    let (client, _worker, _detector) = client_with(&test_config(), |req| match req.name.as_str() {
        "BUSY" => req.reply(Some("x"), 1),
        "NOSUCH" => req.reply(Some("x"), 2),
        "RANGE" => req.reply(Some("x"), 3),
        _ => req.reply(Some("8.5"), 0),
    });

    for (name, expected) in [
        ("BUSY", CommandError::Busy),
        ("NOSUCH", CommandError::Unrecognized),
        ("RANGE", CommandError::OutOfRange),
    ] {
        match client.get(name).await {
            Err(MerlinError::Command(kind)) => assert_eq!(kind, expected),
            other => panic!("{}: unexpected {:?}", name, other),
        }
    }
    assert_eq!(client.get("OPERATINGENERGY").await.expect("ok"), "8.5");
}

/// Client plus a worker fed by a detector that emits `frames_per_trigger`
/// images on each SOFTTRIGGER.
struct Rig {
    client: Arc<ControlClient<DuplexStream>>,
    backend: MemoryBackend,
    stats: Arc<WorkerStats>,
}

fn rig(frames_per_trigger: u32, acquisition_time_ms: &'static str) -> Rig {
    let config = test_config();
    let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel::<()>();

    let (client_io, detector_io) = tokio::io::duplex(64 * 1024);
    spawn_control_detector(detector_io, move |req| match req.name.as_str() {
        "TRIGGERSTART" => req.reply(Some("5"), 0),
        "ACQUISITIONTIME" => req.reply(Some(acquisition_time_ms), 0),
        "SOFTTRIGGER" => {
            let _ = trigger_tx.send(());
            req.ok()
        }
        _ => req.ok(),
    });

    let (mut data_tx, data_rx) = tokio::io::duplex(PIPE_CAPACITY);
    tokio::spawn(async move {
        let mut next = 1;
        while trigger_rx.recv().await.is_some() {
            for _ in 0..frames_per_trigger {
                send_payload(&mut data_tx, &image_payload(next, 42)).await;
                next += 1;
            }
        }
        // keep the data stream open until the control side is gone
        drop(data_tx);
    });

    let (control, worker_end) = job_channel(8);
    let backend = MemoryBackend::new();
    let stats = Arc::new(WorkerStats::new());
    let worker = AcquisitionWorker::new(data_rx, worker_end, Arc::new(backend.clone()), Arc::clone(&stats), &config);
    tokio::spawn(worker.run());

    Rig {
        client: Arc::new(ControlClient::new(client_io, control, &config)),
        backend,
        stats,
    }
}

#[tokio::test]
async fn test_start_soft_triggers_and_returns_report() {
    let rig = rig(3, "10");
    let path = PathBuf::from("run.h5");
    rig.client.set_filename(Some(path.clone()));

    let report = tokio::time::timeout(Duration::from_secs(5), rig.client.start(3))
        .await
        .expect("finished in time")
        .expect("start")
        .expect("completion notice");

    assert_eq!(report.outcome, JobOutcome::Completed);
    assert_eq!(report.acquired, 3);
    assert_eq!(rig.backend.frame_count(&path).expect("count"), 3);
}

#[tokio::test]
async fn test_stop_during_start_returns_partial_report() {
    let rig = rig(2, "10");

    let client = Arc::clone(&rig.client);
    let start = tokio::spawn(async move { client.start(5).await });

    let stats = Arc::clone(&rig.stats);
    common::wait_until(move || stats.snapshot().frames_acquired == 2).await;

    // Control requests keep working while start() waits.
    assert_eq!(rig.client.get("TRIGGERSTART").await.expect("get"), "5");
    rig.client.stop().await.expect("stop");

    let report = tokio::time::timeout(Duration::from_secs(5), start)
        .await
        .expect("finished in time")
        .expect("task")
        .expect("start")
        .expect("completion notice");
    assert_eq!(report.outcome, JobOutcome::TimedOut);
    assert_eq!(report.acquired, 2);
}

#[tokio::test]
async fn test_second_start_is_rejected_while_job_in_flight() {
    let rig = rig(1, "10");

    let client = Arc::clone(&rig.client);
    let first = tokio::spawn(async move { client.start(5).await });
    let stats = Arc::clone(&rig.stats);
    common::wait_until(move || stats.snapshot().frames_acquired == 1).await;

    assert!(matches!(rig.client.start(1).await, Err(MerlinError::JobInFlight)));

    rig.client.cancel().await.expect("cancel");
    let report = first
        .await
        .expect("task")
        .expect("start")
        .expect("completion notice");
    assert_eq!(report.outcome, JobOutcome::Cancelled);
    assert_eq!(report.acquired, 1);
}

#[tokio::test]
async fn test_start_skips_notice_of_abandoned_job() {
    let rig = rig(2, "10");

    // Caller goes away after the first trigger; its job keeps running.
    let client = Arc::clone(&rig.client);
    let abandoned = tokio::spawn(async move { client.start(3).await });
    let stats = Arc::clone(&rig.stats);
    common::wait_until(move || stats.snapshot().frames_acquired == 2).await;
    abandoned.abort();
    assert!(abandoned.await.is_err());

    // The next trigger finishes the abandoned job first, then this one.
    let report = tokio::time::timeout(Duration::from_secs(5), rig.client.start(1))
        .await
        .expect("finished in time")
        .expect("start")
        .expect("completion notice");
    assert_eq!(report.requested, 1);
    assert_eq!(report.acquired, 1);
    assert_eq!(report.outcome, JobOutcome::Completed);
    assert_eq!(rig.stats.snapshot().jobs_completed, 2);
}

#[tokio::test]
async fn test_start_without_worker() {
    let (client, worker, _detector) = client_with(&test_config(), |req| req.reply(Some("0"), 0));
    drop(worker);
    assert!(matches!(client.start(1).await, Err(MerlinError::JobChannelClosed)));
}

#[tokio::test]
async fn test_start_tolerates_worker_hanging_up() {
    let (client, mut worker, _detector) = client_with(&test_config(), |req| req.reply(Some("0"), 0));
    tokio::spawn(async move {
        assert!(matches!(worker.recv().await, Some(JobMessage::Start { .. })));
        drop(worker);
    });
    let report = client.start(1).await.expect("start");
    assert!(report.is_none());
}
