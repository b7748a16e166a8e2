use super::rgb_conversion::{jxl_to_rgba, samples_per_pixel};
use super::{DecodeEngine, EngineError, EngineFactory, Raster, RasterPixels, RenderOverride};
use jxl::api::{
    states::{Initialized, WithFrameInfo, WithImageInfo},
    JxlBitDepth, JxlColorType, JxlDecoder, JxlDecoderOptions, JxlOutputBuffer, ProcessingResult,
};
use jxl::image::{Image, Rect};
use std::time::Instant;

/// Decoder progress, advanced with whatever bytes have been fed so far
enum DecoderState {
    /// Waiting for the image header
    Initialized(JxlDecoder<Initialized>),
    /// Header parsed, waiting for the first frame header
    WithImageInfo(JxlDecoder<WithImageInfo>),
    /// Frame header parsed, pixels may be partially decoded
    WithFrameInfo(JxlDecoder<WithFrameInfo>),
    /// First frame fully decoded
    Complete,
    /// A decoder call failed and consumed the decoder
    Poisoned,
}

/// Geometry and pixel format of the image, known once the header is parsed
#[derive(Clone, Copy)]
struct FrameLayout {
    width: usize,
    height: usize,
    color_type: JxlColorType,
    extra_channels: usize,
    high_bit_depth: bool,
}

impl FrameLayout {
    fn from_decoder(decoder: &JxlDecoder<WithImageInfo>) -> Self {
        let basic_info = decoder.basic_info();
        let (width, height) = basic_info.size;
        let high_bit_depth = match basic_info.bit_depth {
            JxlBitDepth::Int { bits_per_sample } => bits_per_sample > 8,
            JxlBitDepth::Float { .. } => true,
        };

        Self {
            width,
            height,
            color_type: decoder.current_pixel_format().color_type,
            extra_channels: basic_info.extra_channels.len(),
            high_bit_depth,
        }
    }
}

/// Output buffers, kept across render calls so progressive passes accumulate
struct PixelBuffers {
    main: Image<f32>,
    extras: Vec<Image<f32>>,
}

impl PixelBuffers {
    fn new(layout: &FrameLayout) -> Result<Self, EngineError> {
        let main = Image::<f32>::new((layout.width * samples_per_pixel(layout.color_type), layout.height))
            .map_err(EngineError::malformed)?;
        let extras = (0..layout.extra_channels)
            .map(|_| Image::<f32>::new((layout.width, layout.height)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(EngineError::malformed)?;
        Ok(Self { main, extras })
    }

    fn output_buffers(&mut self) -> Vec<JxlOutputBuffer<'_>> {
        let rect = Rect {
            size: self.main.size(),
            origin: (0, 0),
        };
        let mut bufs = vec![JxlOutputBuffer::from_image_rect_mut(
            self.main.get_rect_mut(rect).into_raw(),
        )];
        for extra in &mut self.extras {
            let extra_rect = Rect {
                size: extra.size(),
                origin: (0, 0),
            };
            bufs.push(JxlOutputBuffer::from_image_rect_mut(
                extra.get_rect_mut(extra_rect).into_raw(),
            ));
        }
        bufs
    }

    fn to_raster(&self, layout: &FrameLayout, render_override: Option<RenderOverride>) -> Raster {
        let force_srgb = render_override.map(|o| o.force_srgb).unwrap_or(false);
        // Alpha, when present, is the first extra channel
        let alpha = self.extras.first();
        let (width, height) = (layout.width, layout.height);

        let pixels = if layout.high_bit_depth && !force_srgb {
            RasterPixels::Rgba16(jxl_to_rgba(&self.main, alpha, layout.color_type, width, height))
        } else {
            RasterPixels::Rgba8(jxl_to_rgba(&self.main, alpha, layout.color_type, width, height))
        };

        Raster {
            width: width as u32,
            height: height as u32,
            pixels,
        }
    }
}

/// Incremental JPEG XL decoder backed by jxl-rs.
///
/// Fed bytes are buffered; the typestate decoder consumes them as far as it can
/// on each `try_finalize`/`render` call. Only the first frame of an animation is
/// rendered.
pub struct JxlEngine {
    data: Vec<u8>,
    consumed: usize,
    state: DecoderState,
    layout: Option<FrameLayout>,
    pixels: Option<PixelBuffers>,
}

impl JxlEngine {
    pub fn new() -> Self {
        let mut options = JxlDecoderOptions::default();
        options.adjust_orientation = true;
        options.coalescing = true;
        options.enable_flush_pixels = true; // Progressive previews from partial data
        options.premultiply_output = false; // PNG output is straight alpha

        Self {
            data: Vec::new(),
            consumed: 0,
            state: DecoderState::Initialized(JxlDecoder::new(options)),
            layout: None,
            pixels: None,
        }
    }

    /// Advance through the headers. Returns true once the frame header is known.
    fn advance_headers(&mut self) -> Result<bool, EngineError> {
        loop {
            let state = std::mem::replace(&mut self.state, DecoderState::Poisoned);
            let mut input: &[u8] = &self.data[self.consumed..];
            let available_before = input.len();

            match state {
                DecoderState::Initialized(decoder) => {
                    let result = decoder.process(&mut input);
                    self.consumed += available_before - input.len();
                    match result.map_err(EngineError::malformed)? {
                        ProcessingResult::Complete { result } => {
                            let layout = FrameLayout::from_decoder(&result);
                            log::debug!(
                                "JXL header: {}x{}, color type: {:?}, extra channels: {}",
                                layout.width,
                                layout.height,
                                layout.color_type,
                                layout.extra_channels
                            );
                            self.layout = Some(layout);
                            self.state = DecoderState::WithImageInfo(result);
                        }
                        ProcessingResult::NeedsMoreInput { fallback, .. } => {
                            self.state = DecoderState::Initialized(fallback);
                            return Ok(false);
                        }
                    }
                }
                DecoderState::WithImageInfo(decoder) => {
                    let result = decoder.process(&mut input);
                    self.consumed += available_before - input.len();
                    match result.map_err(EngineError::malformed)? {
                        ProcessingResult::Complete { result } => {
                            self.state = DecoderState::WithFrameInfo(result);
                        }
                        ProcessingResult::NeedsMoreInput { fallback, .. } => {
                            self.state = DecoderState::WithImageInfo(fallback);
                            return Ok(false);
                        }
                    }
                }
                ready @ (DecoderState::WithFrameInfo(_) | DecoderState::Complete) => {
                    self.state = ready;
                    return Ok(true);
                }
                DecoderState::Poisoned => {
                    return Err(EngineError::Malformed("decoder failed earlier".to_string()));
                }
            }
        }
    }

    /// Decode as much of the frame as the fed bytes allow.
    fn decode_frame(&mut self, layout: &FrameLayout) -> Result<(), EngineError> {
        if self.pixels.is_none() {
            self.pixels = Some(PixelBuffers::new(layout)?);
        }
        let Some(pixels) = self.pixels.as_mut() else {
            return Err(EngineError::NotReady);
        };

        match std::mem::replace(&mut self.state, DecoderState::Poisoned) {
            DecoderState::WithFrameInfo(decoder) => {
                let mut input: &[u8] = &self.data[self.consumed..];
                let available_before = input.len();

                let mut output_bufs = pixels.output_buffers();
                let process_result = decoder.process(&mut input, &mut output_bufs);
                self.consumed += available_before - input.len();
                // Release mutable borrows before flushing into the same buffers
                drop(output_bufs);

                match process_result.map_err(EngineError::malformed)? {
                    ProcessingResult::Complete { result: _ } => {
                        self.state = DecoderState::Complete;
                        Ok(())
                    }
                    ProcessingResult::NeedsMoreInput { mut fallback, size_hint } => {
                        let mut flush_bufs = pixels.output_buffers();
                        let flushed = fallback.flush_pixels(&mut flush_bufs);
                        drop(flush_bufs);

                        let passes = fallback.num_completed_passes();
                        self.state = DecoderState::WithFrameInfo(fallback);

                        match flushed {
                            Ok(()) => {
                                log::debug!(
                                    "Flushed partial frame after {} passes, need {} more bytes",
                                    passes,
                                    size_hint
                                );
                                Ok(())
                            }
                            Err(e) => {
                                log::debug!("flush_pixels error (expected early): {}", e);
                                Err(EngineError::Incomplete { fed: self.data.len() })
                            }
                        }
                    }
                }
            }
            DecoderState::Complete => {
                self.state = DecoderState::Complete;
                Ok(())
            }
            other => {
                self.state = other;
                Err(EngineError::NotReady)
            }
        }
    }
}

impl Default for JxlEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodeEngine for JxlEngine {
    fn feed(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        if matches!(self.state, DecoderState::Poisoned) {
            return Err(EngineError::Malformed("decoder failed earlier".to_string()));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    fn try_finalize(&mut self) -> Result<bool, EngineError> {
        self.advance_headers()
    }

    fn render(&mut self, render_override: Option<RenderOverride>) -> Result<Raster, EngineError> {
        let layout = self.layout.ok_or(EngineError::NotReady)?;
        let start = Instant::now();

        self.decode_frame(&layout)?;

        let pixels = self.pixels.as_ref().ok_or(EngineError::NotReady)?;
        let raster = pixels.to_raster(&layout, render_override);
        log::info!(
            "Rendered {}x{} from {} bytes in {:?}{}",
            raster.width,
            raster.height,
            self.data.len(),
            start.elapsed(),
            if matches!(self.state, DecoderState::Complete) { "" } else { " (partial)" }
        );
        Ok(raster)
    }
}

/// Creates [`JxlEngine`] instances
#[derive(Clone, Copy, Debug, Default)]
pub struct JxlEngineFactory;

impl EngineFactory for JxlEngineFactory {
    type Engine = JxlEngine;

    fn create(&self) -> Result<JxlEngine, EngineError> {
        Ok(JxlEngine::new())
    }

    fn version(&self) -> String {
        format!("jxl-rs (flush-pixels-impl), {} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }
}
