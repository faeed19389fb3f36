//! Control-channel requests and their ASCII encoding.

use std::fmt;

use super::{LENGTH_DIGITS, MAGIC};

/// A request sent on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Read a detector property
    Get(String),
    /// Write a detector property
    Set(String, String),
    /// Execute a detector command
    Cmd(String),
}

impl ControlRequest {
    /// `GET,<name>`
    pub fn get(name: impl Into<String>) -> Self {
        Self::Get(name.into())
    }

    /// `SET,<name>,<value>`
    pub fn set(name: impl Into<String>, value: impl fmt::Display) -> Self {
        Self::Set(name.into(), value.to_string())
    }

    /// `CMD,<name>`
    pub fn cmd(name: impl Into<String>) -> Self {
        Self::Cmd(name.into())
    }

    /// Property or command name this request targets.
    pub fn name(&self) -> &str {
        match self {
            Self::Get(name) | Self::Set(name, _) | Self::Cmd(name) => name,
        }
    }

    /// Everything after the length field, including the leading comma.
    pub fn payload(&self) -> String {
        match self {
            Self::Get(name) => format!(",GET,{}", name),
            Self::Set(name, value) => format!(",SET,{},{}", name, value),
            Self::Cmd(name) => format!(",CMD,{}", name),
        }
    }

    /// Full wire frame: `MPX,<10-digit length><payload>`.
    ///
    /// The length counts the payload bytes after the length field, so it is
    /// computed before the header is formatted.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut frame = Vec::with_capacity(MAGIC.len() + 1 + LENGTH_DIGITS + payload.len());
        frame.extend_from_slice(MAGIC);
        frame.extend_from_slice(format!(",{:0width$}", payload.len(), width = LENGTH_DIGITS).as_bytes());
        frame.extend_from_slice(payload.as_bytes());
        frame
    }
}

impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get(name) => write!(f, "GET {}", name),
            Self::Set(name, value) => write!(f, "SET {}={}", name, value),
            Self::Cmd(name) => write!(f, "CMD {}", name),
        }
    }
}

/// Encode a GET request.
pub fn encode_get(name: &str) -> Vec<u8> {
    ControlRequest::get(name).encode()
}

/// Encode a SET request.
pub fn encode_set(name: &str, value: impl fmt::Display) -> Vec<u8> {
    ControlRequest::set(name, value).encode()
}

/// Encode a CMD request.
pub fn encode_cmd(name: &str) -> Vec<u8> {
    ControlRequest::cmd(name).encode()
}
