use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Pixel, RgbImage};

use crate::context::Scanarium;
use crate::error::{ErrorKind, Result, ScanariumError};

/// Height the detection input is scaled to when it trips the size gate.
/// Detection runs on the scaled image only; rectification always goes back
/// to the original picture.
const PREPARATION_SCALED_HEIGHT: u32 = 1000;
const PREPARATION_TRIP_HEIGHT: u32 = 1300;

fn scale_factor_for(dimension: u32, trip: Option<u32>, scaled: Option<u32>) -> f32 {
    let trip = trip.or(scaled);
    match (trip, scaled) {
        (Some(trip), Some(scaled)) if dimension > trip => scaled as f32 / dimension as f32,
        _ => 1.0,
    }
}

/// Scale an image down when it exceeds the trip thresholds; the smaller of
/// the height and width factors wins. The reported factor maps scaled
/// coordinates back to source coordinates (1 when untouched).
pub fn scale_image<P>(
    image: &ImageBuffer<P, Vec<P::Subpixel>>,
    scaled_height: Option<u32>,
    scaled_width: Option<u32>,
    trip_height: Option<u32>,
    trip_width: Option<u32>,
) -> (ImageBuffer<P, Vec<P::Subpixel>>, f32)
where
    P: Pixel + 'static,
    P::Subpixel: 'static,
{
    let height_factor = scale_factor_for(image.height(), trip_height, scaled_height);
    let width_factor = scale_factor_for(image.width(), trip_width, scaled_width);
    let scale_factor = height_factor.min(width_factor);
    if scale_factor == 1.0 {
        return (image.clone(), 1.0);
    }
    let scaled_width = (image.width() as f32 * scale_factor) as u32;
    let scaled_height = (image.height() as f32 * scale_factor) as u32;
    let scaled = imageops::resize(image, scaled_width, scaled_height, FilterType::Triangle);
    (scaled, scale_factor)
}

/// Scale per the `scan.max_<kind>_{width,height}[_trip]` configuration.
pub fn scale_image_from_config<P>(
    scanarium: &Scanarium,
    image: &ImageBuffer<P, Vec<P::Subpixel>>,
    kind: &str,
) -> Result<(ImageBuffer<P, Vec<P::Subpixel>>, f32)>
where
    P: Pixel + 'static,
    P::Subpixel: 'static,
{
    let get = |key: &str| -> Result<Option<u32>> {
        Ok(scanarium
            .config()
            .opt_int("scan", &format!("max_{kind}_{key}"))?
            .map(|value| value as u32))
    };
    Ok(scale_image(
        image,
        get("height")?,
        get("width")?,
        get("height_trip")?,
        get("width_trip")?,
    ))
}

/// `p -> clip(k*p - 127.5*(k-1), 0, 255)`; identity at `k = 1`.
pub fn stretch_contrast(image: &RgbImage, contrast: f32) -> RgbImage {
    let shift = -127.5 * (contrast - 1.0);
    let mut stretched = image.clone();
    for pixel in stretched.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = (*channel as f32 * contrast + shift).clamp(0.0, 255.0) as u8;
        }
    }
    stretched
}

/// Precomputed per-pixel brightness normalization, `f = 255 / max(b, 1)`.
/// Rewriting the normalization as a single multiplication keeps the
/// per-frame cost down; the factor grid is computed once per process.
#[derive(Debug)]
pub struct BrightnessFactor {
    width: u32,
    height: u32,
    factors: Vec<f32>,
}

impl BrightnessFactor {
    pub fn from_max_brightness(brightness: &GrayImage) -> Self {
        let factors = brightness
            .pixels()
            .map(|pixel| 255.0 / pixel.0[0].max(1) as f32)
            .collect();
        BrightnessFactor {
            width: brightness.width(),
            height: brightness.height(),
            factors,
        }
    }

    fn factor_at(&self, x: u32, y: u32, width: u32, height: u32) -> f32 {
        // Nearest sampling bridges a size mismatch between the reference
        // and the frame being normalized.
        let source_x = (x as u64 * self.width as u64 / width.max(1) as u64) as u32;
        let source_y = (y as u64 * self.height as u64 / height.max(1) as u64) as u32;
        let source_x = source_x.min(self.width - 1);
        let source_y = source_y.min(self.height - 1);
        self.factors[(source_y * self.width + source_x) as usize]
    }

    pub fn apply(&self, image: &mut GrayImage) {
        let (width, height) = image.dimensions();
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let factor = self.factor_at(x, y, width, height);
            pixel.0[0] = (pixel.0[0] as f32 * factor).clamp(0.0, 255.0) as u8;
        }
    }
}

/// Build the brightness factor from `scan.max_brightness`, if configured.
pub fn load_brightness_factor(scanarium: &Scanarium) -> Result<Option<BrightnessFactor>> {
    let Some(file_name) = scanarium.config().opt_string("scan", "max_brightness")? else {
        return Ok(None);
    };
    let brightness = image::open(&file_name)
        .map_err(|_| {
            ScanariumError::with_parameters(
                ErrorKind::Value,
                "Failed to read max brightness image \"{file_name}\"",
                &[("file_name", &file_name)],
            )
        })?
        .to_luma8();
    Ok(Some(BrightnessFactor::from_max_brightness(&brightness)))
}

fn correct_image_brightness(scanarium: &Scanarium, image: &mut GrayImage) -> Result<()> {
    if let Some(factor) = scanarium.brightness_factor()? {
        factor.apply(image);
    }
    Ok(())
}

/// Prepare a frame for detection: scale down, stretch contrast, convert to
/// greyscale, normalize brightness. Reports the scale factor that maps the
/// prepared image's coordinates back to the source frame.
pub fn prepare_image(
    scanarium: &Scanarium,
    image: &RgbImage,
    contrast: f32,
) -> Result<(GrayImage, f32)> {
    let (scaled, scale_factor) = scale_image(
        image,
        Some(PREPARATION_SCALED_HEIGHT),
        None,
        Some(PREPARATION_TRIP_HEIGHT),
        None,
    );
    let scaled = if contrast != 1.0 {
        stretch_contrast(&scaled, contrast)
    } else {
        scaled
    };
    let mut grey = imageops::grayscale(&scaled);
    correct_image_brightness(scanarium, &mut grey)?;
    Ok((grey, scale_factor))
}

/// The detection contrast ladder from `scan.contrasts` (comma-separated
/// factors; blank and zero entries are skipped).
pub fn contrasts(scanarium: &Scanarium) -> Result<Vec<f32>> {
    let raw = scanarium.config().string("scan", "contrasts")?;
    let mut contrasts = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let contrast: f32 = part.parse().map_err(|_| {
            ScanariumError::with_parameters(
                ErrorKind::ConfigValue,
                "Failed to parse contrast \"{contrast}\"",
                &[("contrast", part)],
            )
        })?;
        if contrast != 0.0 {
            contrasts.push(contrast);
        }
    }
    Ok(contrasts)
}

/// Pinhole calibration as stored in an OpenCV-style XML file.
#[derive(Debug, PartialEq)]
pub struct Calibration {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// k1, k2, p1, p2, k3
    pub dist: [f64; 5],
}

fn matrix_data(document: &roxmltree::Document, node_name: &str) -> Option<Vec<f64>> {
    let node = document
        .descendants()
        .find(|node| node.has_tag_name(node_name))?;
    let data = node.children().find(|child| child.has_tag_name("data"))?;
    let values: Vec<f64> = data
        .text()?
        .split_whitespace()
        .map(|token| token.parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    Some(values)
}

pub fn parse_calibration(raw: &str) -> Option<Calibration> {
    let document = roxmltree::Document::parse(raw).ok()?;
    let camera = matrix_data(&document, "cameraMatrix")?;
    if camera.len() != 9 {
        return None;
    }
    let coeffs = matrix_data(&document, "dist_coeffs")?;
    let mut dist = [0.0; 5];
    for (slot, value) in dist.iter_mut().zip(coeffs.iter()) {
        *slot = *value;
    }
    Some(Calibration {
        fx: camera[0],
        fy: camera[4],
        cx: camera[2],
        cy: camera[5],
        dist,
    })
}

impl Calibration {
    /// Forward distortion of normalized camera coordinates.
    fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = self.dist;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        (xd, yd)
    }

    /// Invert the distortion by fixed-point iteration.
    fn undistort(&self, xd: f64, yd: f64) -> (f64, f64) {
        let mut x = xd;
        let mut y = yd;
        for _ in 0..20 {
            let [k1, k2, p1, p2, k3] = self.dist;
            let r2 = x * x + y * y;
            let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        (x, y)
    }

    /// A camera matrix that keeps every source pixel visible after
    /// undistortion (the all-pixels, alpha = 1 choice).
    fn optimal_new_matrix(&self, width: u32, height: u32) -> (f64, f64, f64, f64) {
        let mut min_x = f64::INFINITY;
        let mut min_y = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        let mut max_y = f64::NEG_INFINITY;
        const GRID: u32 = 9;
        for j in 0..=GRID {
            for i in 0..=GRID {
                let u = (width - 1) as f64 * i as f64 / GRID as f64;
                let v = (height - 1) as f64 * j as f64 / GRID as f64;
                let (x, y) = self.undistort((u - self.cx) / self.fx, (v - self.cy) / self.fy);
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }
        let new_fx = (width - 1) as f64 / (max_x - min_x);
        let new_fy = (height - 1) as f64 / (max_y - min_y);
        (new_fx, new_fy, -min_x * new_fx, -min_y * new_fy)
    }

    /// Remap a frame so straight sheet edges come out straight.
    pub fn undistort_image(&self, image: &RgbImage) -> RgbImage {
        let (width, height) = image.dimensions();
        let (new_fx, new_fy, new_cx, new_cy) = self.optimal_new_matrix(width, height);
        let mut undistorted = RgbImage::new(width, height);
        for (u, v, pixel) in undistorted.enumerate_pixels_mut() {
            let x = (u as f64 - new_cx) / new_fx;
            let y = (v as f64 - new_cy) / new_fy;
            let (xd, yd) = self.distort(x, y);
            let source_x = self.fx * xd + self.cx;
            let source_y = self.fy * yd + self.cy;
            *pixel = sample_bilinear(image, source_x as f32, source_y as f32);
        }
        undistorted
    }
}

fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> image::Rgb<u8> {
    let (width, height) = image.dimensions();
    if x < 0.0 || y < 0.0 || x > (width - 1) as f32 || y > (height - 1) as f32 {
        return image::Rgb([0, 0, 0]);
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let tx = x - x0 as f32;
    let ty = y - y0 as f32;
    let mut channels = [0u8; 3];
    for (c, channel) in channels.iter_mut().enumerate() {
        let p00 = image.get_pixel(x0, y0).0[c] as f32;
        let p10 = image.get_pixel(x1, y0).0[c] as f32;
        let p01 = image.get_pixel(x0, y1).0[c] as f32;
        let p11 = image.get_pixel(x1, y1).0[c] as f32;
        let top = p00 + (p10 - p00) * tx;
        let bottom = p01 + (p11 - p01) * tx;
        *channel = (top + (bottom - top) * ty).round().clamp(0.0, 255.0) as u8;
    }
    image::Rgb(channels)
}

/// Undistort a frame per `scan.calibration_xml_file`; a missing setting
/// disables the step.
pub fn undistort_image(scanarium: &Scanarium, image: RgbImage) -> Result<RgbImage> {
    let Some(param_file) = scanarium
        .config()
        .opt_string("scan", "calibration_xml_file")?
    else {
        return Ok(image);
    };
    let calibration = std::fs::read_to_string(&param_file)
        .ok()
        .and_then(|raw| parse_calibration(&raw))
        .ok_or_else(|| {
            ScanariumError::with_parameters(
                ErrorKind::LoadUndistort,
                "Failed to load parameters for undistortion from \"{file_name}\"",
                &[("file_name", &param_file)],
            )
        })?;
    Ok(calibration.undistort_image(&image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn no_scaling_below_trip() {
        let image = RgbImage::new(400, 1200);
        let (scaled, factor) = scale_image(&image, Some(1000), None, Some(1300), None);
        assert_eq!(factor, 1.0);
        assert_eq!(scaled.dimensions(), (400, 1200));
    }

    #[test]
    fn scales_down_past_trip() {
        let image = RgbImage::new(1000, 2000);
        let (scaled, factor) = scale_image(&image, Some(1000), None, Some(1300), None);
        assert_eq!(factor, 0.5);
        assert_eq!(scaled.dimensions(), (500, 1000));
    }

    #[test]
    fn smaller_factor_wins() {
        let image = RgbImage::new(4000, 2000);
        let (scaled, factor) = scale_image(&image, Some(1000), Some(1000), None, None);
        assert_eq!(factor, 0.25);
        assert_eq!(scaled.dimensions(), (1000, 500));
    }

    #[test]
    fn trip_defaults_to_scaled() {
        // With no explicit trip, any dimension above the target triggers.
        assert_eq!(scale_factor_for(1100, None, Some(1000)), 1000.0 / 1100.0);
        assert_eq!(scale_factor_for(900, None, Some(1000)), 1.0);
    }

    #[test]
    fn contrast_identity_and_stretch() {
        let mut image = RgbImage::new(1, 1);
        image.put_pixel(0, 0, image::Rgb([100, 127, 200]));

        let identity = stretch_contrast(&image, 1.0);
        assert_eq!(identity.get_pixel(0, 0), &image::Rgb([100, 127, 200]));

        // k = 2: p -> 2p - 127.5
        let stretched = stretch_contrast(&image, 2.0);
        assert_eq!(stretched.get_pixel(0, 0), &image::Rgb([72, 126, 255]));
    }

    #[test]
    fn brightness_factor_normalizes_to_reference() {
        let mut reference = GrayImage::new(2, 1);
        reference.put_pixel(0, 0, image::Luma([128]));
        reference.put_pixel(1, 0, image::Luma([0]));
        let factor = BrightnessFactor::from_max_brightness(&reference);

        let mut frame = GrayImage::new(2, 1);
        frame.put_pixel(0, 0, image::Luma([128]));
        frame.put_pixel(1, 0, image::Luma([10]));
        factor.apply(&mut frame);

        // A pixel at the reference maximum maps to full brightness; the
        // zero-reference pixel uses the clipped divisor of 1.
        assert_eq!(frame.get_pixel(0, 0).0[0], 255);
        assert_eq!(frame.get_pixel(1, 0).0[0], 255);
    }

    #[test]
    fn prepared_image_reports_scale() {
        let scanarium = Scanarium::new(Config::default());
        let image = RgbImage::new(500, 2600);
        let (grey, factor) = prepare_image(&scanarium, &image, 1.0).unwrap();
        assert_eq!(factor, 1000.0 / 2600.0);
        assert_eq!(grey.height(), 1000);
    }

    const CALIBRATION_XML: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cameraMatrix type_id="opencv-matrix">
  <rows>3</rows><cols>3</cols><dt>d</dt>
  <data>1000. 0. 640. 0. 1000. 360. 0. 0. 1.</data>
</cameraMatrix>
<dist_coeffs type_id="opencv-matrix">
  <rows>1</rows><cols>5</cols><dt>d</dt>
  <data>-0.1 0.01 0. 0. 0.</data>
</dist_coeffs>
</opencv_storage>"#;

    #[test]
    fn calibration_parses() {
        let calibration = parse_calibration(CALIBRATION_XML).unwrap();
        assert_eq!(calibration.fx, 1000.0);
        assert_eq!(calibration.cy, 360.0);
        assert_eq!(calibration.dist[0], -0.1);
    }

    #[test]
    fn undistort_inverts_distortion() {
        let calibration = parse_calibration(CALIBRATION_XML).unwrap();
        let (xd, yd) = calibration.distort(0.3, -0.2);
        let (x, y) = calibration.undistort(xd, yd);
        assert!((x - 0.3).abs() < 1e-9);
        assert!((y + 0.2).abs() < 1e-9);
    }
}
