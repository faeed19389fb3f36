//! MPX wire protocol shared by the control and data channels.

pub mod codec;
pub mod request;
pub mod response;

pub use codec::{MpxCodec, WireFrame};
pub use request::{encode_cmd, encode_get, encode_set, ControlRequest};
pub use response::{ControlResponse, StatusCode};

/// Frame magic.
pub const MAGIC: &[u8] = b"MPX";
/// Separator between header fields.
pub const SEPARATOR: u8 = b',';
/// Padding byte the detector may insert inside a header.
pub const PADDING: u8 = 0;
/// Width of the zero-padded decimal length field.
pub const LENGTH_DIGITS: usize = 10;
/// `MPX` + `,` + 10 digits.
pub const HEADER_LEN: usize = 3 + 1 + LENGTH_DIGITS;
/// Largest payload the decoder accepts; a 515x515 U32 image is about 1 MiB.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;
