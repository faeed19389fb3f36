//! Simulated Merlin detector for integration tests.
//!
//! The control side answers MPX requests through a handler closure; the data
//! side is a plain stream (duplex or TCP) the test writes encoded frames into.

#![allow(dead_code)]

use futures::StreamExt;
use merlin_daq::config::MerlinConfig;
use merlin_daq::frame::PIXELS_PER_FRAME;
use merlin_daq::protocol::MpxCodec;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

/// Size of each duplex pipe; large enough for a couple of U16 frames.
pub const PIPE_CAPACITY: usize = 4 * 1024 * 1024;

const MQ1_HEADER_SIZE: usize = 384;

/// Configuration with timings shrunk for tests.
pub fn test_config() -> MerlinConfig {
    let mut config = MerlinConfig::default();
    config.acquisition.arm_initial_delay_ms = 1;
    config.acquisition.arm_poll_interval_us = 200;
    config.acquisition.arm_timeout_ms = 2_000;
    config
}

/// Wrap `payload` in an MPX header.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("MPX,{:010}", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out
}

/// Acquisition header payload.
pub fn header_payload() -> Vec<u8> {
    b",HDR,\nTime and Date Stamp (day, mnth, yr, hr, min, s):\t01/01/2020 00:00:00\nEnd\t".to_vec()
}

/// MQ1 payload with every pixel set to `value`.
pub fn image_payload(frame_number: u32, value: u16) -> Vec<u8> {
    image_payload_with_depth(frame_number, "U16", |_| value)
}

/// MQ1 payload whose pixel depth tag is `depth`; pixels are always 16-bit.
pub fn image_payload_with_depth(frame_number: u32, depth: &str, pixel: impl Fn(usize) -> u16) -> Vec<u8> {
    let mut payload = format!(
        ",MQ1,{:06},{:05},01,0515,0515,{},R64,   1x1,01,2020-01-01 00:00:00.000000,0.010000,0,0,0,",
        frame_number, MQ1_HEADER_SIZE, depth
    )
    .into_bytes();
    payload.resize(MQ1_HEADER_SIZE + 1, b'0');
    payload.reserve(PIXELS_PER_FRAME * 2);
    for idx in 0..PIXELS_PER_FRAME {
        payload.extend_from_slice(&pixel(idx).to_be_bytes());
    }
    payload
}

/// Write one framed payload to the data stream.
pub async fn send_payload<W: AsyncWrite + Unpin>(data: &mut W, payload: &[u8]) {
    data.write_all(&encode_frame(payload))
        .await
        .expect("data stream open");
}

/// A decoded control request as seen by the simulated detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub verb: String,
    pub name: String,
    pub value: Option<String>,
}

impl Request {
    fn parse(payload: &str) -> Self {
        let mut fields = payload.trim_start_matches(',').splitn(3, ',');
        Self {
            verb: fields.next().unwrap_or_default().to_string(),
            name: fields.next().unwrap_or_default().to_string(),
            value: fields.next().map(str::to_string),
        }
    }

    /// Response payload echoing the request with `value` and `status`.
    pub fn reply(&self, value: Option<&str>, status: u8) -> String {
        match (self.verb.as_str(), value.or(self.value.as_deref())) {
            ("CMD", _) | (_, None) => format!(",{},{},{}", self.verb, self.name, status),
            (_, Some(value)) => format!(",{},{},{},{}", self.verb, self.name, value, status),
        }
    }

    pub fn ok(&self) -> String {
        self.reply(None, 0)
    }
}

/// Serve the control channel until the client hangs up.
///
/// Returns every request seen, in order.
pub fn spawn_control_detector<S, F>(stream: S, mut handler: F) -> JoinHandle<Vec<Request>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: FnMut(&Request) -> String + Send + 'static,
{
    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(stream);
        let mut frames = FramedRead::new(read, MpxCodec::default());
        let mut seen = Vec::new();
        while let Some(Ok(frame)) = frames.next().await {
            let request = Request::parse(&String::from_utf8_lossy(frame.payload()));
            let reply = handler(&request);
            seen.push(request);
            if write.write_all(&encode_frame(reply.as_bytes())).await.is_err() {
                break;
            }
        }
        seen
    })
}

/// Poll `condition` every few milliseconds for up to two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
