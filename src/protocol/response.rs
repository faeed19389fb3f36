//! Control-channel responses.

use crate::error::{AppResult, CommandError, MerlinError};

/// One-character status code terminating every control response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// `0`
    Ok,
    /// `1`
    Busy,
    /// `2`
    Unrecognized,
    /// `3`
    OutOfRange,
}

impl StatusCode {
    /// Parse the status digit.
    pub fn from_byte(byte: u8) -> AppResult<Self> {
        match byte {
            b'0' => Ok(Self::Ok),
            b'1' => Ok(Self::Busy),
            b'2' => Ok(Self::Unrecognized),
            b'3' => Ok(Self::OutOfRange),
            other => Err(MerlinError::Decode(format!(
                "unknown status code {:?}",
                other as char
            ))),
        }
    }

    /// Numeric value as sent on the wire.
    pub fn code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Busy => 1,
            Self::Unrecognized => 2,
            Self::OutOfRange => 3,
        }
    }

    /// `Ok(())` for status `0`, the matching [`CommandError`] otherwise.
    pub fn check(self) -> Result<(), CommandError> {
        match self {
            Self::Ok => Ok(()),
            Self::Busy => Err(CommandError::Busy),
            Self::Unrecognized => Err(CommandError::Unrecognized),
            Self::OutOfRange => Err(CommandError::OutOfRange),
        }
    }
}

/// A decoded control response: comma-separated fields plus the status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    fields: Vec<String>,
    status: StatusCode,
}

impl ControlResponse {
    /// Parse a response payload (everything after the 14-byte header).
    ///
    /// Example payload of a GET: `,GET,DETECTORSTATUS,4,0`.
    pub fn parse(payload: &[u8]) -> AppResult<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| MerlinError::Decode(format!("response is not ASCII: {}", e)))?;
        let text = text.trim_end_matches(['\0', '\r', '\n']);

        let last = text
            .as_bytes()
            .last()
            .copied()
            .ok_or_else(|| MerlinError::Decode("empty response".to_string()))?;
        let status = StatusCode::from_byte(last)?;

        let fields = text.split(',').map(str::to_string).collect();
        Ok(Self { fields, status })
    }

    /// Status code of the response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// All comma-separated fields, including the leading empty one.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Second-to-last field: the property value of a GET response.
    pub fn value(&self) -> AppResult<&str> {
        self.fields
            .len()
            .checked_sub(2)
            .and_then(|idx| self.fields.get(idx))
            .map(String::as_str)
            .ok_or_else(|| MerlinError::Decode("response carries no value field".to_string()))
    }

    /// Fail with the matching [`CommandError`] unless the status is `0`.
    pub fn check(&self) -> AppResult<()> {
        self.status.check().map_err(MerlinError::from)
    }
}
