//! Session bootstrap over loopback TCP: worker thread, control client, shutdown.

mod common;

use common::{image_payload, send_payload, spawn_control_detector, test_config};
use merlin_daq::error::MerlinError;
use merlin_daq::messages::JobOutcome;
use merlin_daq::storage::MemoryBackend;
use merlin_daq::MerlinSession;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    (listener, port)
}

#[tokio::test]
async fn test_session_runs_job_and_shuts_down() {
    let (control_listener, control_port) = listener().await;
    let (data_listener, data_port) = listener().await;
    let mut config = test_config();
    config.detector.host = "127.0.0.1".to_string();
    config.detector.control_port = control_port;
    config.detector.data_port = data_port;

    let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel::<()>();
    tokio::spawn(async move {
        let (mut data, _) = data_listener.accept().await.expect("data connection");
        let mut next = 1;
        while trigger_rx.recv().await.is_some() {
            for _ in 0..2 {
                send_payload(&mut data, &image_payload(next, 9)).await;
                next += 1;
            }
        }
    });
    tokio::spawn(async move {
        let (stream, _) = control_listener.accept().await.expect("control connection");
        spawn_control_detector(stream, move |req| match req.name.as_str() {
            "TRIGGERSTART" => req.reply(Some("5"), 0),
            "SOFTTRIGGER" => {
                let _ = trigger_tx.send(());
                req.ok()
            }
            _ => req.ok(),
        })
        .await
        .expect("detector task")
    });

    let backend = MemoryBackend::new();
    let session = MerlinSession::connect(&config, Arc::new(backend.clone()))
        .await
        .expect("session connects");

    let path = PathBuf::from("session.h5");
    session.client().set_filename(Some(path.clone()));
    let report = tokio::time::timeout(Duration::from_secs(5), session.client().start(2))
        .await
        .expect("finished in time")
        .expect("start")
        .expect("completion notice");

    assert_eq!(report.outcome, JobOutcome::Completed);
    assert_eq!(report.acquired, 2);
    assert_eq!(session.stats().frames_acquired, 2);

    tokio::time::timeout(Duration::from_secs(5), session.shutdown())
        .await
        .expect("worker joined in time")
        .expect("worker exits cleanly");
    assert_eq!(backend.frame_count(&path).expect("count"), 2);
    assert_eq!(backend.open_sinks().expect("count"), 0);
}

#[tokio::test]
async fn test_session_surfaces_data_connect_failure() {
    let (_control_listener, control_port) = listener().await;
    let (closed, data_port) = listener().await;
    drop(closed);

    let mut config = test_config();
    config.detector.host = "127.0.0.1".to_string();
    config.detector.control_port = control_port;
    config.detector.data_port = data_port;

    let result = MerlinSession::connect(&config, Arc::new(MemoryBackend::new())).await;
    match result {
        Err(MerlinError::Transport(error)) => {
            assert_eq!(error.kind(), std::io::ErrorKind::ConnectionRefused)
        }
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("connected without a data port"),
    }
}
