//! Control and data acquisition for the Quantum Detectors Merlin pixel detector.
//!
//! The detector speaks the MPX protocol on two TCP sockets: a control channel
//! for GET/SET/CMD requests and a data channel streaming acquisition headers
//! and 515x515 images. This crate provides:
//!
//! - [`protocol`]: MPX framing with bounded resynchronization
//! - [`frame`]: data payload decoding (U16/U32, big-endian to host order)
//! - [`client`]: the control client and its arm/start/stop sequence
//! - [`worker`]: the acquisition worker that owns the data socket
//! - [`messages`]: the job channel between the two
//! - [`storage`]: append-only image sinks (HDF5, in-memory)
//! - [`session`]: connects everything for a live detector

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod logging;
pub mod messages;
pub mod property;
pub mod protocol;
pub mod session;
pub mod stats;
pub mod storage;
pub mod worker;

pub use client::ControlClient;
pub use config::MerlinConfig;
pub use error::{AppResult, CommandError, MerlinError};
pub use messages::{JobConfig, JobOutcome, JobReport};
pub use session::MerlinSession;
