//! Data-channel payload decoding.
//!
//! A data payload is either an acquisition header (`HDR`), which carries
//! no pixels, or an `MQ1` frame: an ASCII frame header followed by one
//! 515x515 big-endian pixel matrix.
//!
//! ```text
//! ,MQ1,000001,00384,01,0515,0515,U16,...<pixels>
//!  ^^^ ^^^^^^ ^^^^^                  ^^^
//!  tag frame  header size            pixel depth
//! ```
//!
//! The header-size field under-counts the leading comma by one, so pixel
//! data starts at `header_size + 1`.

use std::ops::Range;

use crate::error::{AppResult, MerlinError};

/// Image width in pixels.
pub const FRAME_WIDTH: usize = 515;
/// Image height in pixels.
pub const FRAME_HEIGHT: usize = 515;
/// Pixels in one image.
pub const PIXELS_PER_FRAME: usize = FRAME_WIDTH * FRAME_HEIGHT;

const TAG: Range<usize> = 1..4;
const FRAME_NUMBER: Range<usize> = 5..11;
const HEADER_SIZE: Range<usize> = 12..17;
const PIXEL_DEPTH: Range<usize> = 31..34;

/// Tag of an acquisition header payload.
pub const ACQUISITION_HEADER_TAG: &[u8] = b"HDR";
/// Tag of an image payload.
pub const IMAGE_TAG: &[u8] = b"MQ1";

/// Element width of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelDepth {
    /// 16-bit counters (`U16`)
    U16,
    /// 32-bit counters (`U32`)
    U32,
}

impl PixelDepth {
    /// Parse the three-character depth tag.
    pub fn from_tag(tag: &[u8]) -> AppResult<Self> {
        match tag {
            b"U16" => Ok(Self::U16),
            b"U32" => Ok(Self::U32),
            other => Err(MerlinError::Decode(format!(
                "unknown pixel depth {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Three-character tag as sent by the detector.
    pub fn tag(self) -> &'static str {
        match self {
            Self::U16 => "U16",
            Self::U32 => "U32",
        }
    }

    /// Bytes per pixel on the wire.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// Pixel values in host byte order, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelData {
    /// 16-bit pixels
    U16(Vec<u16>),
    /// 32-bit pixels
    U32(Vec<u32>),
}

impl PixelData {
    /// Element width of these pixels.
    pub fn depth(&self) -> PixelDepth {
        match self {
            Self::U16(_) => PixelDepth::U16,
            Self::U32(_) => PixelDepth::U32,
        }
    }

    /// Number of pixels.
    pub fn len(&self) -> usize {
        match self {
            Self::U16(values) => values.len(),
            Self::U32(values) => values.len(),
        }
    }

    /// Whether there are no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One decoded detector image. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    frame_number: Option<u32>,
    pixels: PixelData,
}

impl Image {
    /// Build an image from host-order pixels; the pixel count must be 515x515.
    pub fn new(frame_number: Option<u32>, pixels: PixelData) -> AppResult<Self> {
        if pixels.len() != PIXELS_PER_FRAME {
            return Err(MerlinError::Decode(format!(
                "image has {} pixels, expected {}",
                pixels.len(),
                PIXELS_PER_FRAME
            )));
        }
        Ok(Self {
            frame_number,
            pixels,
        })
    }

    /// Frame number from the MQ1 header, when it parsed.
    pub fn frame_number(&self) -> Option<u32> {
        self.frame_number
    }

    /// `(rows, columns)`
    pub fn shape(&self) -> (usize, usize) {
        (FRAME_HEIGHT, FRAME_WIDTH)
    }

    /// Element width of the image.
    pub fn depth(&self) -> PixelDepth {
        self.pixels.depth()
    }

    /// Row-major pixel values.
    pub fn pixels(&self) -> &PixelData {
        &self.pixels
    }

    /// Take the pixel buffer.
    pub fn into_pixels(self) -> PixelData {
        self.pixels
    }

    /// Pixel value at `(row, col)` widened to `u32`.
    pub fn get(&self, row: usize, col: usize) -> Option<u32> {
        if row >= FRAME_HEIGHT || col >= FRAME_WIDTH {
            return None;
        }
        let idx = row * FRAME_WIDTH + col;
        match &self.pixels {
            PixelData::U16(values) => values.get(idx).map(|&v| u32::from(v)),
            PixelData::U32(values) => values.get(idx).copied(),
        }
    }
}

/// A decoded data-channel payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataPayload {
    /// Acquisition header; carries no image and is not counted.
    AcquisitionHeader,
    /// An image frame.
    Image(Image),
}

impl DataPayload {
    /// The image, if this payload carried one.
    pub fn into_image(self) -> Option<Image> {
        match self {
            Self::AcquisitionHeader => None,
            Self::Image(image) => Some(image),
        }
    }
}

fn field<'a>(payload: &'a [u8], range: Range<usize>, what: &str) -> AppResult<&'a [u8]> {
    payload.get(range).ok_or_else(|| {
        MerlinError::Decode(format!(
            "payload of {} bytes too short for {}",
            payload.len(),
            what
        ))
    })
}

fn ascii_number<T: std::str::FromStr>(bytes: &[u8]) -> Option<T> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

/// Decode one data payload into an image or an acquisition-header marker.
pub fn decode_data_payload(payload: &[u8]) -> AppResult<DataPayload> {
    let tag = field(payload, TAG, "tag")?;
    if tag == ACQUISITION_HEADER_TAG {
        return Ok(DataPayload::AcquisitionHeader);
    }
    if tag != IMAGE_TAG {
        return Err(MerlinError::Decode(format!(
            "unknown data tag {:?}",
            String::from_utf8_lossy(tag)
        )));
    }

    let header_size: usize = ascii_number(field(payload, HEADER_SIZE, "header size")?)
        .ok_or_else(|| MerlinError::Decode("unparsable MQ1 header size".to_string()))?;
    let data_offset = header_size + 1;
    let depth = PixelDepth::from_tag(field(payload, PIXEL_DEPTH, "pixel depth")?)?;
    let frame_number: Option<u32> = payload.get(FRAME_NUMBER).and_then(ascii_number);

    let raw = payload.get(data_offset..).unwrap_or_default();
    let expected = PIXELS_PER_FRAME * depth.bytes_per_pixel();
    if raw.len() != expected {
        return Err(MerlinError::Decode(format!(
            "{} image needs {} pixel bytes after offset {}, got {}",
            depth.tag(),
            expected,
            data_offset,
            raw.len()
        )));
    }

    let pixels = match depth {
        PixelDepth::U16 => PixelData::U16(
            raw.chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect(),
        ),
        PixelDepth::U32 => PixelData::U32(
            raw.chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
    };

    Image::new(frame_number, pixels).map(DataPayload::Image)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER_SIZE_VALUE: usize = 384;

    fn mq1_header(frame_number: u32, depth: &str) -> Vec<u8> {
        let mut header = format!(
            ",MQ1,{:06},{:05},01,0515,0515,{},R64,   1x1,01,2020-01-01 00:00:00.000000,0.001000,0,0,0,",
            frame_number, HEADER_SIZE_VALUE, depth
        )
        .into_bytes();
        header.resize(HEADER_SIZE_VALUE + 1, b'0');
        header
    }

    fn u16_payload(frame_number: u32, pixel: impl Fn(usize) -> u16) -> Vec<u8> {
        let mut payload = mq1_header(frame_number, "U16");
        for idx in 0..PIXELS_PER_FRAME {
            payload.extend_from_slice(&pixel(idx).to_be_bytes());
        }
        payload
    }

    #[test]
    fn test_acquisition_header_has_no_image() {
        let payload = b",HDR,\nTime and Date Stamp (day, mnth, yr, hr, min, s):\t01/01/2020";
        assert_eq!(
            decode_data_payload(payload).expect("decodes"),
            DataPayload::AcquisitionHeader
        );
    }

    #[test]
    fn test_u16_payload_is_host_order() {
        let payload = u16_payload(7, |idx| (idx % 65_521) as u16 ^ 0x0102);
        let image = decode_data_payload(&payload)
            .expect("decodes")
            .into_image()
            .expect("image");

        assert_eq!(image.depth(), PixelDepth::U16);
        assert_eq!(image.shape(), (515, 515));
        assert_eq!(image.frame_number(), Some(7));
        let PixelData::U16(values) = image.pixels() else {
            panic!("expected U16 pixels");
        };
        assert_eq!(values.len(), PIXELS_PER_FRAME);
        for (idx, &value) in values.iter().enumerate() {
            assert_eq!(value, (idx % 65_521) as u16 ^ 0x0102);
        }
        assert_eq!(image.get(0, 1), Some(1 ^ 0x0102));
        assert_eq!(image.get(515, 0), None);
    }

    #[test]
    fn test_u32_payload_is_host_order() {
        let mut payload = mq1_header(1, "U32");
        for idx in 0..PIXELS_PER_FRAME {
            payload.extend_from_slice(&(idx as u32 * 3 + 0x0100_0000).to_be_bytes());
        }
        let image = decode_data_payload(&payload)
            .expect("decodes")
            .into_image()
            .expect("image");
        assert_eq!(image.depth(), PixelDepth::U32);
        assert_eq!(image.get(0, 0), Some(0x0100_0000));
        assert_eq!(image.get(514, 514), Some((PIXELS_PER_FRAME as u32 - 1) * 3 + 0x0100_0000));
    }

    #[test]
    fn test_unknown_depth_is_decode_error() {
        let mut payload = mq1_header(1, "U08");
        payload.extend(std::iter::repeat(0).take(PIXELS_PER_FRAME));
        assert!(matches!(
            decode_data_payload(&payload),
            Err(MerlinError::Decode(_))
        ));
    }

    #[test]
    fn test_short_payload_is_decode_error() {
        let mut payload = u16_payload(1, |_| 0);
        payload.truncate(payload.len() - 1);
        assert!(matches!(
            decode_data_payload(&payload),
            Err(MerlinError::Decode(_))
        ));
        assert!(matches!(decode_data_payload(b",MQ"), Err(MerlinError::Decode(_))));
        assert!(matches!(
            decode_data_payload(&mq1_header(1, "U16")[..20]),
            Err(MerlinError::Decode(_))
        ));
    }

    #[test]
    fn test_unknown_tag_is_decode_error() {
        assert!(matches!(
            decode_data_payload(b",XYZ,000001"),
            Err(MerlinError::Decode(_))
        ));
    }

    #[test]
    fn test_image_new_checks_pixel_count() {
        assert!(Image::new(None, PixelData::U16(vec![0; 10])).is_err());
        assert!(Image::new(None, PixelData::U32(vec![0; PIXELS_PER_FRAME])).is_ok());
    }
}
