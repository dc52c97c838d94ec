//! Captured frame value type.
//!
//! A `Frame` is one decoded picture pulled off a device stream: the raw
//! encoded bytes, the decoded image when decoding succeeded, and the capture
//! timestamp. Frames are created once by the stream source and handed off
//! through the pipeline to the sink; nothing mutates or shares them.

use image::DynamicImage;

use crate::now_millis;

#[derive(Debug)]
pub struct Frame {
    /// Encoded bytes exactly as captured. Kept even when decoding fails, so a
    /// corrupt picture never vanishes from the stream.
    pub raw: Vec<u8>,
    /// Decoded image, absent if the raw bytes could not be decoded.
    pub image: Option<DynamicImage>,
    /// Capture time in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

impl Frame {
    /// Build a frame from captured JPEG bytes, stamping it with the current
    /// time. Decode failure is tolerated: the raw bytes are preserved and the
    /// decoded image is left empty.
    pub fn from_jpeg(raw: Vec<u8>) -> Self {
        let image = match image::load_from_memory(&raw) {
            Ok(img) => Some(img),
            Err(e) => {
                log::warn!("error decoding image, keeping raw bytes: {}", e);
                None
            }
        };
        Self {
            raw,
            image,
            timestamp_ms: now_millis(),
        }
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        use image::GenericImageView;
        self.image.as_ref().map(|img| img.dimensions())
    }
}
