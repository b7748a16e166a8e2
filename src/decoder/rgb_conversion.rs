use jxl::{api::JxlColorType, image::Image};

/// Integer sample type produced from JXL's f32 [0,1] output
pub trait Sample: Copy + Default {
    const MAX: Self;

    fn from_unit(val: f32) -> Self;
}

impl Sample for u8 {
    const MAX: Self = u8::MAX;

    #[inline]
    fn from_unit(val: f32) -> Self {
        (val * 255.0).clamp(0.0, 255.0) as u8
    }
}

impl Sample for u16 {
    const MAX: Self = u16::MAX;

    #[inline]
    fn from_unit(val: f32) -> Self {
        (val * 65535.0).clamp(0.0, 65535.0) as u16
    }
}

/// Number of interleaved samples jxl-rs writes into the main output buffer.
///
/// Alpha is never part of the main buffer; it arrives as the first extra channel.
pub fn samples_per_pixel(color_type: JxlColorType) -> usize {
    match color_type {
        JxlColorType::Grayscale | JxlColorType::GrayscaleAlpha => 1,
        JxlColorType::Rgb | JxlColorType::Bgr | JxlColorType::Rgba | JxlColorType::Bgra => 3,
    }
}

/// Convert JXL's f32 output into interleaved RGBA.
///
/// `main` holds 1 (gray) or 3 (RGB/BGR) interleaved samples per pixel, `alpha`
/// is the planar alpha extra channel if the image has one. Values are in the
/// [0.0, 1.0] range. Pixels without alpha are written fully opaque.
pub fn jxl_to_rgba<S: Sample>(
    main: &Image<f32>,
    alpha: Option<&Image<f32>>,
    color_type: JxlColorType,
    width: usize,
    height: usize,
) -> Vec<S> {
    let mut rgba = vec![S::default(); width * height * 4];

    let swap_rb = matches!(color_type, JxlColorType::Bgr | JxlColorType::Bgra);
    let channels = samples_per_pixel(color_type);

    for y in 0..height {
        let row = main.row(y);
        let alpha_row = alpha.map(|a| a.row(y));

        for x in 0..width {
            let idx = (y * width + x) * 4;

            if channels == 1 {
                let gray = S::from_unit(row[x]);
                rgba[idx] = gray;
                rgba[idx + 1] = gray;
                rgba[idx + 2] = gray;
            } else {
                let src = x * 3;
                let (r, b) = if swap_rb { (src + 2, src) } else { (src, src + 2) };
                rgba[idx] = S::from_unit(row[r]);
                rgba[idx + 1] = S::from_unit(row[src + 1]);
                rgba[idx + 2] = S::from_unit(row[b]);
            }

            rgba[idx + 3] = match alpha_row {
                Some(alpha_row) => S::from_unit(alpha_row[x]),
                None => S::MAX,
            };
        }
    }

    rgba
}

#[cfg(test)]
mod tests {
    use super::*;
    use jxl::image::Image;

    #[test]
    fn test_rgb_conversion() {
        let width = 2;
        let height = 2;

        let mut main = Image::<f32>::new((width * 3, height)).unwrap();
        for y in 0..height {
            let row = main.row_mut(y);
            for x in 0..width {
                row[x * 3] = 1.0;
                row[x * 3 + 1] = 0.5;
                row[x * 3 + 2] = 0.0;
            }
        }

        let rgba = jxl_to_rgba::<u8>(&main, None, JxlColorType::Rgb, width, height);

        assert_eq!(rgba[0], 255); // R: 1.0 -> 255
        assert_eq!(rgba[1], 127); // G: 0.5 -> 127
        assert_eq!(rgba[2], 0);
        assert_eq!(rgba[3], 255); // opaque
        assert_eq!(rgba.len(), width * height * 4);
    }

    #[test]
    fn test_bgr_swaps_channels() {
        let mut main = Image::<f32>::new((3, 1)).unwrap();
        let row = main.row_mut(0);
        row[0] = 0.0;
        row[1] = 0.5;
        row[2] = 1.0;

        let rgba = jxl_to_rgba::<u8>(&main, None, JxlColorType::Bgr, 1, 1);
        assert_eq!(&rgba[..3], &[255, 127, 0]);
    }

    #[test]
    fn test_grayscale_alpha_conversion() {
        let mut gray = Image::<f32>::new((2, 1)).unwrap();
        gray.fill(0.5_f32);
        let mut alpha = Image::<f32>::new((2, 1)).unwrap();
        alpha.fill(0.0_f32);

        let rgba = jxl_to_rgba::<u8>(&gray, Some(&alpha), JxlColorType::GrayscaleAlpha, 2, 1);
        assert_eq!(&rgba[..4], &[127, 127, 127, 0]);
    }

    #[test]
    fn test_sixteen_bit_range() {
        let mut gray = Image::<f32>::new((1, 1)).unwrap();
        gray.fill(1.5_f32);

        let rgba = jxl_to_rgba::<u16>(&gray, None, JxlColorType::Grayscale, 1, 1);
        assert_eq!(rgba, vec![65535, 65535, 65535, 65535]);
    }
}
