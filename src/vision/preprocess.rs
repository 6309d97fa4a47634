//! Answer-sheet image preprocessing
//!
//! Edge-preserving denoising, grayscale conversion and local contrast
//! enhancement (CLAHE). Sheets are never binarized here: a hard black/white
//! threshold wipes out faint pen strokes before the recognizer sees them.

use image::{imageops::FilterType, DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use imageproc::edges::canny;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use imageproc::hough::{detect_lines, LineDetectionOptions};
use tracing::{debug, info, warn};

use crate::config::PreprocessSettings;
use crate::errors::{GradingError, GradingResult};

/// Bilateral filter neighbourhood diameter
const BILATERAL_DIAMETER: u32 = 9;
/// Bilateral filter sigma in colour space
const BILATERAL_SIGMA_COLOR: f32 = 75.0;
/// Bilateral filter sigma in coordinate space
const BILATERAL_SIGMA_SPACE: f32 = 75.0;

/// Canny thresholds used by skew detection
const SKEW_CANNY_LOW: f32 = 100.0;
const SKEW_CANNY_HIGH: f32 = 200.0;
/// Minimum Hough votes for a line to count towards the skew estimate
const SKEW_VOTE_THRESHOLD: u32 = 50;

/// Result of a skew correction attempt
pub struct SkewCorrection {
    /// The (possibly rotated) image
    pub image: DynamicImage,
    /// Median detected line angle in degrees, `None` when no line was found
    pub angle_degrees: Option<f32>,
}

/// Preprocesses raw answer-sheet photos before line detection
#[derive(Debug, Clone, Default)]
pub struct ImagePreprocessor {
    settings: PreprocessSettings,
}

impl ImagePreprocessor {
    /// Create a preprocessor with the given settings
    pub fn new(settings: PreprocessSettings) -> Self {
        Self { settings }
    }

    /// Denoise, convert to grayscale and enhance local contrast
    pub fn preprocess(&self, image: &DynamicImage) -> GradingResult<GrayImage> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(GradingError::InvalidImage(format!(
                "image has no pixels ({}x{})",
                width, height
            )));
        }

        if !self.settings.enabled {
            debug!("Sheet preprocessing disabled");
            return Ok(to_grayscale(&image.to_rgb8()));
        }

        let mut working = if self.settings.limit_size {
            limit_size(image, self.settings.max_width, self.settings.max_height)
        } else {
            image.clone()
        };

        if self.settings.deskew {
            working = self.correct_skew(&working).image;
        }

        let mut rgb = working.to_rgb8();
        if self.settings.denoise {
            rgb = bilateral_filter(
                &rgb,
                BILATERAL_DIAMETER,
                BILATERAL_SIGMA_COLOR,
                BILATERAL_SIGMA_SPACE,
            );
        }

        let gray = to_grayscale(&rgb);
        let enhanced = clahe(&gray, self.settings.clahe_clip_limit, self.settings.clahe_tiles);

        debug!(
            "Preprocessed {}x{} sheet (denoise={}, deskew={})",
            enhanced.width(),
            enhanced.height(),
            self.settings.denoise,
            self.settings.deskew
        );

        Ok(enhanced)
    }

    /// Detect the dominant line angle and rotate the sheet to undo it
    ///
    /// Returns the image unchanged when no line can be detected.
    pub fn correct_skew(&self, image: &DynamicImage) -> SkewCorrection {
        let rgb = image.to_rgb8();
        let gray = to_grayscale(&rgb);
        let edges = canny(&gray, SKEW_CANNY_LOW, SKEW_CANNY_HIGH);

        let lines = detect_lines(
            &edges,
            LineDetectionOptions {
                vote_threshold: SKEW_VOTE_THRESHOLD,
                suppression_radius: 8,
            },
        );

        // Polar lines store the normal angle; the line itself runs 90 degrees off it
        let mut angles: Vec<f32> = lines
            .iter()
            .map(|line| line.angle_in_degrees as f32 - 90.0)
            .collect();

        let Some(median) = median(&mut angles) else {
            warn!("No lines detected for skew correction; leaving sheet unchanged");
            return SkewCorrection {
                image: image.clone(),
                angle_degrees: None,
            };
        };

        info!("Correcting sheet skew of {:.2} degrees ({} lines)", median, angles.len());

        if median.abs() < f32::EPSILON {
            return SkewCorrection {
                image: image.clone(),
                angle_degrees: Some(median),
            };
        }

        let rotated = rotate_about_center(
            &rgb,
            (-median).to_radians(),
            Interpolation::Bilinear,
            Rgb([255, 255, 255]),
        );

        SkewCorrection {
            image: DynamicImage::ImageRgb8(rotated),
            angle_degrees: Some(median),
        }
    }
}

/// Shrink an image to fit within the given bounds, keeping its aspect ratio
///
/// Images already within bounds are returned as-is.
pub fn limit_size(image: &DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    if width <= max_width && height <= max_height {
        return image.clone();
    }

    let resized = image.resize(max_width, max_height, FilterType::Triangle);
    info!(
        "Reduced sheet from {}x{} to {}x{}",
        width,
        height,
        resized.width(),
        resized.height()
    );
    resized
}

/// Convert RGB to single-channel intensity using standard luminance weights
pub fn to_grayscale(rgb: &RgbImage) -> GrayImage {
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let p = rgb.get_pixel(x, y).0;
        let gray = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
        Luma([gray.round().clamp(0.0, 255.0) as u8])
    })
}

/// Edge-preserving smoothing
///
/// Each output pixel is a weighted mean of its circular neighbourhood where the
/// weight falls off with both spatial distance and colour difference (sum of
/// absolute channel differences). Borders are reflected.
pub fn bilateral_filter(
    rgb: &RgbImage,
    diameter: u32,
    sigma_color: f32,
    sigma_space: f32,
) -> RgbImage {
    let (width, height) = rgb.dimensions();
    let radius = (diameter / 2) as i32;

    let color_coeff = -0.5 / (sigma_color * sigma_color);
    let space_coeff = -0.5 / (sigma_space * sigma_space);

    let color_weights: Vec<f32> = (0..256 * 3)
        .map(|d| ((d * d) as f32 * color_coeff).exp())
        .collect();

    let mut offsets = Vec::new();
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let r2 = (dx * dx + dy * dy) as f32;
            if r2.sqrt() > radius as f32 {
                continue;
            }
            offsets.push((dx, dy, (r2 * space_coeff).exp()));
        }
    }

    let mut output = RgbImage::new(width, height);

    for y in 0..height {
        for x in 0..width {
            let center = rgb.get_pixel(x, y).0;
            let mut sum = [0.0f32; 3];
            let mut weight_sum = 0.0f32;

            for &(dx, dy, space_weight) in &offsets {
                let nx = reflect_101(x as i32 + dx, width);
                let ny = reflect_101(y as i32 + dy, height);
                let p = rgb.get_pixel(nx, ny).0;

                let distance = (0..3)
                    .map(|c| (p[c] as i32 - center[c] as i32).unsigned_abs() as usize)
                    .sum::<usize>();
                let weight = space_weight * color_weights[distance];

                for c in 0..3 {
                    sum[c] += p[c] as f32 * weight;
                }
                weight_sum += weight;
            }

            let pixel = [0, 1, 2].map(|c| (sum[c] / weight_sum).round().clamp(0.0, 255.0) as u8);
            output.put_pixel(x, y, Rgb(pixel));
        }
    }

    output
}

/// Contrast-limited adaptive histogram equalization
///
/// The image is split into a `tiles x tiles` grid. Each tile gets its own
/// equalization curve, with histogram bins clipped at
/// `clip_limit * tile_area / 256` and the excess spread over all bins. Output
/// pixels blend the curves of the four nearest tile centres bilinearly.
pub fn clahe(gray: &GrayImage, clip_limit: f32, tiles: u32) -> GrayImage {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return gray.clone();
    }

    let tiles_x = tiles.clamp(1, width);
    let tiles_y = tiles.clamp(1, height);

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);

    for ty in 0..tiles_y {
        let y0 = ty * height / tiles_y;
        let y1 = (ty + 1) * height / tiles_y;
        for tx in 0..tiles_x {
            let x0 = tx * width / tiles_x;
            let x1 = (tx + 1) * width / tiles_x;

            let mut hist = [0usize; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[gray.get_pixel(x, y).0[0] as usize] += 1;
                }
            }

            let area = ((x1 - x0) * (y1 - y0)) as usize;
            luts.push(tile_lut(&mut hist, area, clip_limit));
        }
    }

    let tile_w = width as f32 / tiles_x as f32;
    let tile_h = height as f32 / tiles_y as f32;

    // Neighbouring tile indices and blend weights along one axis
    let axis = |pos: u32, tile_size: f32, count: u32| -> (usize, usize, f32) {
        let t = (pos as f32 + 0.5) / tile_size - 0.5;
        let t1 = t.floor();
        let frac = t - t1;
        let last = count as i64 - 1;
        let i1 = (t1 as i64).clamp(0, last) as usize;
        let i2 = (t1 as i64 + 1).clamp(0, last) as usize;
        (i1, i2, frac)
    };

    let mut output = GrayImage::new(width, height);
    for y in 0..height {
        let (ty1, ty2, ya) = axis(y, tile_h, tiles_y);
        for x in 0..width {
            let (tx1, tx2, xa) = axis(x, tile_w, tiles_x);
            let v = gray.get_pixel(x, y).0[0] as usize;

            let lut = |tx: usize, ty: usize| luts[ty * tiles_x as usize + tx][v] as f32;

            let top = lut(tx1, ty1) * (1.0 - xa) + lut(tx2, ty1) * xa;
            let bottom = lut(tx1, ty2) * (1.0 - xa) + lut(tx2, ty2) * xa;
            let value = top * (1.0 - ya) + bottom * ya;

            output.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
        }
    }

    output
}

/// Build a clipped equalization curve for one tile histogram
fn tile_lut(hist: &mut [usize; 256], area: usize, clip_limit: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    if area == 0 {
        for (i, slot) in lut.iter_mut().enumerate() {
            *slot = i as u8;
        }
        return lut;
    }

    let clip = ((clip_limit * area as f32 / 256.0) as usize).max(1);

    let mut clipped = 0usize;
    for bin in hist.iter_mut() {
        if *bin > clip {
            clipped += *bin - clip;
            *bin = clip;
        }
    }

    let batch = clipped / 256;
    let mut residual = clipped - batch * 256;
    for bin in hist.iter_mut() {
        *bin += batch;
    }
    if residual > 0 {
        let step = (256 / residual).max(1);
        let mut i = 0;
        while i < 256 && residual > 0 {
            hist[i] += 1;
            residual -= 1;
            i += step;
        }
    }

    let scale = 255.0 / area as f32;
    let mut cumulative = 0usize;
    for (i, count) in hist.iter().enumerate() {
        cumulative += count;
        lut[i] = (cumulative as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }

    lut
}

/// Reflect an out-of-range coordinate back into `0..len` without repeating the edge
fn reflect_101(i: i32, len: u32) -> u32 {
    let n = len as i32;
    if n <= 1 {
        return 0;
    }
    let mut i = i;
    loop {
        if i < 0 {
            i = -i;
        } else if i >= n {
            i = 2 * n - 2 - i;
        } else {
            return i as u32;
        }
    }
}

/// Median of a list of angles (sorts in place)
fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    #[test]
    fn test_grayscale() {
        let rgb = RgbImage::from_pixel(1, 1, Rgb([255, 0, 0]));
        let gray = to_grayscale(&rgb);
        // 0.299 * 255 = 76.245
        assert_eq!(gray.get_pixel(0, 0).0[0], 76);
    }

    #[test]
    fn test_bilateral_uniform_image_unchanged() {
        let rgb = RgbImage::from_pixel(12, 10, Rgb([120, 130, 140]));
        let filtered = bilateral_filter(&rgb, 9, 75.0, 75.0);
        assert_eq!(filtered.dimensions(), (12, 10));
        assert!(filtered.pixels().all(|p| p.0 == [120, 130, 140]));
    }

    #[test]
    fn test_bilateral_preserves_strong_edge() {
        // Left half black ink, right half white paper
        let rgb = RgbImage::from_fn(20, 8, |x, _| {
            if x < 10 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) }
        });
        let filtered = bilateral_filter(&rgb, 9, 75.0, 75.0);

        // Colour distance of 765 makes cross-edge weights negligible
        assert!(filtered.get_pixel(9, 4).0[0] < 10);
        assert!(filtered.get_pixel(10, 4).0[0] > 245);
    }

    #[test]
    fn test_clahe_uniform_image_stays_uniform() {
        let gray = GrayImage::from_pixel(64, 48, Luma([90]));
        let enhanced = clahe(&gray, 2.0, 8);
        let first = enhanced.get_pixel(0, 0).0[0];
        assert!(enhanced.pixels().all(|p| p.0[0] == first));
    }

    #[test]
    fn test_clahe_single_tile_is_monotonic() {
        let gray = GrayImage::from_fn(64, 16, |x, _| Luma([(100 + x / 4) as u8]));
        let enhanced = clahe(&gray, 2.0, 1);

        let mut previous = 0u8;
        for x in 0..64 {
            let v = enhanced.get_pixel(x, 0).0[0];
            assert!(v >= previous, "CLAHE curve must not invert intensities");
            previous = v;
        }
    }

    #[test]
    fn test_clahe_more_tiles_than_pixels() {
        let gray = GrayImage::from_pixel(3, 2, Luma([200]));
        let enhanced = clahe(&gray, 2.0, 8);
        assert_eq!(enhanced.dimensions(), (3, 2));
    }

    #[test]
    fn test_preprocess_rejects_empty_image() {
        let preprocessor = ImagePreprocessor::default();
        let result = preprocessor.preprocess(&DynamicImage::new_rgb8(0, 0));
        assert!(matches!(result, Err(GradingError::InvalidImage(_))));
    }

    #[test]
    fn test_preprocess_returns_same_dimensions() {
        let preprocessor = ImagePreprocessor::new(PreprocessSettings::default());
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(40, 30, |x, y| {
            if (y / 5) % 2 == 0 && x > 4 { Rgb([20, 20, 20]) } else { Rgb([240, 240, 240]) }
        }));

        let enhanced = preprocessor.preprocess(&image).unwrap();
        assert_eq!(enhanced.dimensions(), (40, 30));
    }

    #[test]
    fn test_preprocess_limits_size() {
        let settings = PreprocessSettings {
            limit_size: true,
            max_width: 50,
            max_height: 50,
            denoise: false,
            ..Default::default()
        };
        let preprocessor = ImagePreprocessor::new(settings);
        let image = DynamicImage::new_rgb8(200, 100);

        let enhanced = preprocessor.preprocess(&image).unwrap();
        assert_eq!(enhanced.dimensions(), (50, 25));
    }

    #[test]
    fn test_skew_correction_without_lines_is_noop() {
        let preprocessor = ImagePreprocessor::default();
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(80, 60, Rgb([255, 255, 255])));

        let corrected = preprocessor.correct_skew(&image);
        assert!(corrected.angle_degrees.is_none());
        assert_eq!(corrected.image.dimensions(), (80, 60));
    }

    /// White sheet with four thick strokes tilted `degrees` (positive descends to the right)
    fn tilted_sheet(degrees: f32) -> DynamicImage {
        let slope = degrees.to_radians().tan();
        let gray = GrayImage::from_fn(300, 300, |x, y| {
            let inked = (20..280).contains(&x)
                && [60.0f32, 120.0, 180.0, 240.0].iter().any(|&c| {
                    let centre = c + (x as f32 - 150.0) * slope;
                    (y as f32 - centre).abs() < 2.5
                });
            if inked { Luma([0]) } else { Luma([255]) }
        });
        DynamicImage::ImageLuma8(gray)
    }

    #[test]
    fn test_skew_correction_straightens_tilted_strokes() {
        let preprocessor = ImagePreprocessor::default();

        for tilt in [10.0f32, -8.0] {
            let corrected = preprocessor.correct_skew(&tilted_sheet(tilt));
            let angle = corrected.angle_degrees.unwrap();
            assert!((angle - tilt).abs() <= 2.0, "tilt {} detected as {}", tilt, angle);
            assert_eq!(corrected.image.dimensions(), (300, 300));

            let residual = preprocessor.correct_skew(&corrected.image).angle_degrees.unwrap();
            assert!(residual.abs() <= 2.0, "tilt {} left {} after correction", tilt, residual);
        }
    }

    #[test]
    fn test_reflect_101() {
        assert_eq!(reflect_101(-1, 5), 1);
        assert_eq!(reflect_101(5, 5), 3);
        assert_eq!(reflect_101(2, 5), 2);
        assert_eq!(reflect_101(-3, 1), 0);
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&mut []), None);
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&mut [4.0, 1.0, 2.0, 3.0]), Some(2.5));
    }
}
