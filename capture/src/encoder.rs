//! Frame → JPEG.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::source::Frame;

pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

/// One compressed frame, ready to be framed into a multipart part.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub bytes: Bytes,
    pub content_type: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("empty frame ({width}x{height})")]
    Empty { width: u32, height: u32 },

    #[error("frame buffer is {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("jpeg encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

pub trait FrameEncoder: Send + Sync + 'static {
    fn encode(&self, frame: &Frame) -> Result<EncodedChunk, EncodeError>;
}

/// Baseline JPEG at a fixed quality.
#[derive(Debug, Clone, Copy)]
pub struct JpegFrameEncoder {
    quality: u8,
}

impl JpegFrameEncoder {
    pub fn new(quality: u8) -> Self {
        JpegFrameEncoder {
            quality: quality.clamp(1, 100),
        }
    }

    #[cfg(test)]
    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for JpegFrameEncoder {
    fn default() -> Self {
        JpegFrameEncoder::new(70)
    }
}

impl FrameEncoder for JpegFrameEncoder {
    fn encode(&self, frame: &Frame) -> Result<EncodedChunk, EncodeError> {
        if frame.width == 0 || frame.height == 0 {
            return Err(EncodeError::Empty {
                width: frame.width,
                height: frame.height,
            });
        }
        // The image encoder panics on a length mismatch, so check first.
        let expected = Frame::rgb8_len(frame.width, frame.height);
        if frame.data.len() != expected {
            return Err(EncodeError::BufferSize {
                expected,
                actual: frame.data.len(),
            });
        }

        let mut out = Vec::with_capacity(expected / 8);
        JpegEncoder::new_with_quality(&mut out, self.quality).encode(
            &frame.data,
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )?;

        Ok(EncodedChunk {
            bytes: Bytes::from(out),
            content_type: JPEG_CONTENT_TYPE,
        })
    }
}
