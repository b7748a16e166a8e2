pub mod jxl_engine;
pub mod rgb_conversion;
#[cfg(test)]
pub(crate) mod scripted;

use std::io::Cursor;

use image::{ImageBuffer, ImageFormat, Rgba};
use thiserror::Error;

pub use jxl_engine::{JxlEngine, JxlEngineFactory};

/// Rendering options applied after a frame has been finalized
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderOverride {
    /// Always produce 8-bit sRGB output, even for high bit depth images
    pub force_srgb: bool,
}

/// Interleaved RGBA samples
#[derive(Clone, Debug)]
pub enum RasterPixels {
    Rgba8(Vec<u8>),
    Rgba16(Vec<u16>),
}

/// A rendered frame, ready to be encoded
#[derive(Clone, Debug)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub pixels: RasterPixels,
}

impl Raster {
    /// Encode the raster as PNG
    pub fn encode_png(&self) -> Result<Vec<u8>, EngineError> {
        let mut out = Cursor::new(Vec::new());
        match &self.pixels {
            RasterPixels::Rgba8(samples) => {
                let buffer: ImageBuffer<Rgba<u8>, _> =
                    ImageBuffer::from_raw(self.width, self.height, samples.as_slice())
                        .ok_or(EngineError::RasterSize {
                            width: self.width,
                            height: self.height,
                        })?;
                buffer.write_to(&mut out, ImageFormat::Png)?;
            }
            RasterPixels::Rgba16(samples) => {
                let buffer: ImageBuffer<Rgba<u16>, _> =
                    ImageBuffer::from_raw(self.width, self.height, samples.as_slice())
                        .ok_or(EngineError::RasterSize {
                            width: self.width,
                            height: self.height,
                        })?;
                buffer.write_to(&mut out, ImageFormat::Png)?;
            }
        }
        Ok(out.into_inner())
    }
}

/// Output of a successful decode call
#[derive(Clone, Debug)]
pub struct EncodedImage {
    /// PNG bytes
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Suggested file name, derived from the source name
    pub file_name: String,
    /// Prefix of the source that was fed to the engine
    pub bytes_fed: usize,
    pub total_bytes: usize,
}

impl EncodedImage {
    pub fn is_complete(&self) -> bool {
        self.bytes_fed >= self.total_bytes
    }
}

/// Failures reported across the engine boundary
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed or unsupported data
    #[error("{0}")]
    Malformed(String),

    /// No frame can be produced from the bytes fed so far
    #[error("not enough data to render after {fed} bytes")]
    Incomplete { fed: usize },

    /// Render was requested before the image was finalized
    #[error("image is not initialized")]
    NotReady,

    #[error("raster buffer does not match {width}x{height}")]
    RasterSize { width: u32, height: u32 },

    #[error("failed to encode output: {0}")]
    Encode(#[from] image::ImageError),
}

impl EngineError {
    pub(crate) fn malformed(err: impl std::fmt::Display) -> Self {
        EngineError::Malformed(err.to_string())
    }
}

/// One stateful decoder instance.
///
/// Bytes are fed in order; the cumulative total only grows for the lifetime of
/// an instance. Dropping the instance releases all engine-side resources.
pub trait DecodeEngine: Send + 'static {
    /// Append the next chunk of the source.
    fn feed(&mut self, bytes: &[u8]) -> Result<(), EngineError>;

    /// Try to get the image ready for rendering. `Ok(false)` means more bytes are needed.
    fn try_finalize(&mut self) -> Result<bool, EngineError>;

    /// Render the current frame with whatever data is available.
    fn render(&mut self, render_override: Option<RenderOverride>) -> Result<Raster, EngineError>;

    /// Encode a rendered raster into the output image format.
    fn encode(&mut self, raster: &Raster) -> Result<Vec<u8>, EngineError> {
        raster.encode_png()
    }
}

/// Builds engine instances for sessions
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: DecodeEngine;

    fn create(&self) -> Result<Self::Engine, EngineError>;

    /// Identifier of the underlying decoder
    fn version(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_png_rgba8() {
        let raster = Raster {
            width: 2,
            height: 1,
            pixels: RasterPixels::Rgba8(vec![255, 0, 0, 255, 0, 255, 0, 128]),
        };
        let png = raster.encode_png().unwrap();

        let decoded = image::load_from_memory(&png).unwrap().to_rgba8();
        assert_eq!(decoded.dimensions(), (2, 1));
        assert_eq!(decoded.get_pixel(1, 0).0, [0, 255, 0, 128]);
    }

    #[test]
    fn test_encode_png_rgba16_keeps_depth() {
        let raster = Raster {
            width: 1,
            height: 1,
            pixels: RasterPixels::Rgba16(vec![65535, 1000, 0, 65535]),
        };
        let png = raster.encode_png().unwrap();

        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!(decoded.color(), image::ColorType::Rgba16);
        assert_eq!(decoded.to_rgba16().get_pixel(0, 0).0, [65535, 1000, 0, 65535]);
    }

    #[test]
    fn test_encode_png_rejects_short_buffer() {
        let raster = Raster {
            width: 4,
            height: 4,
            pixels: RasterPixels::Rgba8(vec![0; 8]),
        };
        assert!(matches!(
            raster.encode_png(),
            Err(EngineError::RasterSize { width: 4, height: 4 })
        ));
    }
}
