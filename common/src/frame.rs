use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};

/// A decoded camera frame with capture metadata.
///
/// Produced once per loop iteration by a frame source and dropped after
/// display.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at_ms: i64,
    pub seq: u64,
}

/// JPEG bytes of a frame together with the dimensions they encode.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    jpeg: Vec<u8>,
    width: u32,
    height: u32,
    seq: u64,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            image,
            captured_at_ms,
            seq,
        }
    }

    /// Decode a JPEG (or any format the image crate can sniff) into a frame.
    pub fn from_jpeg(data: &[u8], captured_at_ms: i64, seq: u64) -> Result<Self, FrameError> {
        let image = image::load_from_memory(data)
            .map_err(FrameError::Decode)?
            .to_rgb8();
        Ok(Self::new(image, captured_at_ms, seq))
    }

    /// Encode as baseline JPEG. `quality` is clamped to 1..=100.
    pub fn encode_jpeg(&self, quality: u8) -> Result<EncodedFrame, FrameError> {
        if self.image.width() == 0 || self.image.height() == 0 {
            return Err(FrameError::Empty);
        }
        let mut jpeg = Vec::with_capacity(64 * 1024);
        JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
            .encode_image(&self.image)
            .map_err(FrameError::Encode)?;
        Ok(EncodedFrame {
            jpeg,
            width: self.image.width(),
            height: self.image.height(),
            seq: self.seq,
        })
    }
}

impl EncodedFrame {
    pub fn bytes(&self) -> &[u8] {
        &self.jpeg
    }

    pub fn len(&self) -> usize {
        self.jpeg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jpeg.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Decode the JPEG bytes back into a raster for local redisplay.
    pub fn decode(&self) -> Result<RgbImage, FrameError> {
        let image = image::load_from_memory_with_format(&self.jpeg, ImageFormat::Jpeg)
            .map_err(FrameError::Decode)?
            .to_rgb8();
        Ok(image)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame has no pixels")]
    Empty,
    #[error("JPEG encode failed: {0}")]
    Encode(image::ImageError),
    #[error("image decode failed: {0}")]
    Decode(image::ImageError),
}
