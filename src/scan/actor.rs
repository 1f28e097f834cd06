use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage, RgbaImage};
use serde_json::{json, Value};

use crate::context::Scanarium;
use crate::error::{ErrorKind, Result, ScanariumError};
use crate::generate::mask::MaskCrop;
use crate::geometry::Rect;
use crate::reindex;
use crate::scan::prepare::scale_image_from_config;
use crate::scan::qr::{extract_qr, QrPayload};
use crate::scan::rectify::rectify_to_qr_parent_rect;

/// Aspect mismatches up to this are tolerated; every resize makes the
/// image more mushy, so a few pixels are not worth one.
const ASPECT_RATIO_TOLERANCE: f32 = 0.05;

fn fine_grained(scanarium: &Scanarium) -> bool {
    scanarium
        .config()
        .boolean_or_false("debug", "fine_grained_errors")
        .unwrap_or(false)
}

/// Collapse a detail error to the generic unknown-QR answer unless fine
/// grained errors are enabled. The check lives here, at the pipeline
/// boundary, and nowhere else.
fn detail_error(scanarium: &Scanarium, error: ScanariumError) -> ScanariumError {
    if fine_grained(scanarium) {
        error
    } else {
        ScanariumError::unknown_qr()
    }
}

/// Bring the sheet into the canonical orientation: landscape, QR code in
/// the bottom-left quadrant.
pub fn orient_image(scanarium: &Scanarium, image: RgbImage) -> Result<RgbImage> {
    let mut image = if image.height() > image.width() {
        imageops::rotate90(&image)
    } else {
        image
    };

    let (qr_rect, _) = extract_qr(scanarium, &image)?;
    if qr_rect.center().x > image.width() as f32 / 2.0 {
        // Landscape with the QR code on the right half means the sheet is
        // upside down.
        image = imageops::rotate180(&image);
    }

    Ok(image)
}

fn align_aspect_ratio(image: RgbImage, target_width: u32, target_height: u32) -> RgbImage {
    let target_ar = target_width as f32 / target_height as f32;
    let image_ar = image.width() as f32 / image.height() as f32;
    if (target_ar - image_ar).abs() <= ASPECT_RATIO_TOLERANCE {
        return image;
    }
    let (new_width, new_height) = if target_ar > image_ar {
        (
            (image.height() as f32 * target_ar).round() as u32,
            image.height(),
        )
    } else {
        (
            image.width(),
            (image.width() as f32 / target_ar).round() as u32,
        )
    };
    imageops::resize(&image, new_width, new_height, FilterType::Triangle)
}

/// Resolve the actor's effective mask, with the scene/actor/mask detail
/// errors collapsing to unknown-QR in production.
fn resolve_mask_path(scanarium: &Scanarium, payload: &QrPayload) -> Result<PathBuf> {
    let scene = &payload.command;
    let scene_dir = scanarium.scenes_dir_abs()?.join(scene);
    if !scene_dir.is_dir() {
        return Err(detail_error(
            scanarium,
            ScanariumError::with_parameters(
                ErrorKind::UnknownScene,
                "Scene \"{scene_name}\" does not exist",
                &[("scene_name", scene)],
            ),
        ));
    }

    let actor = &payload.parameter;
    let actor_dir = scene_dir.join("actors").join(actor);
    if !actor_dir.is_dir() {
        return Err(detail_error(
            scanarium,
            ScanariumError::with_parameters(
                ErrorKind::UnknownActor,
                "Actor \"{actor_name}\" does not exist in scene \"{scene_name}\"",
                &[("scene_name", scene), ("actor_name", actor)],
            ),
        ));
    }

    let decoration_version = payload.decoration_version()?;
    let mask_path = scanarium.versioned_filename(
        &actor_dir,
        &format!("{actor}-mask-effective"),
        "png",
        decoration_version,
    );
    if !mask_path.is_file() {
        return Err(detail_error(
            scanarium,
            ScanariumError::with_parameters(
                ErrorKind::NoMaskPng,
                "Failed to find mask png {file_name}",
                &[("file_name", &mask_path.display().to_string())],
            ),
        ));
    }
    Ok(mask_path)
}

/// Apply the actor mask: align the aspect ratio, then attach the mask as
/// the alpha channel. In visualization mode the mask is multiplied into
/// the color channels instead (floored at `alpha`), without adding an
/// alpha channel.
pub fn mask(
    scanarium: &Scanarium,
    image: RgbImage,
    payload: &QrPayload,
    visualized_alpha: Option<f32>,
) -> Result<(DynamicImage, PathBuf)> {
    let mask_path = resolve_mask_path(scanarium, payload)?;
    let mask = image::open(&mask_path)
        .map_err(|_| {
            detail_error(
                scanarium,
                ScanariumError::with_parameters(
                    ErrorKind::NoMaskPng,
                    "Failed to find mask png {file_name}",
                    &[("file_name", &mask_path.display().to_string())],
                ),
            )
        })?
        .to_luma8();

    let image = align_aspect_ratio(image, mask.width(), mask.height());
    let mask = imageops::resize(&mask, image.width(), image.height(), FilterType::Triangle);

    let masked = match visualized_alpha {
        Some(alpha) => {
            let mut visualized = image;
            for (pixel, mask_pixel) in visualized.pixels_mut().zip(mask.pixels()) {
                let factor = (mask_pixel.0[0] as f32 / 255.0).clamp(alpha, 1.0);
                for channel in pixel.0.iter_mut() {
                    *channel = (*channel as f32 * factor) as u8;
                }
            }
            DynamicImage::ImageRgb8(visualized)
        }
        None => {
            let mut with_alpha = RgbaImage::new(image.width(), image.height());
            for ((pixel, source), mask_pixel) in
                with_alpha.pixels_mut().zip(image.pixels()).zip(mask.pixels())
            {
                pixel.0 = [source.0[0], source.0[1], source.0[2], mask_pixel.0[0]];
            }
            DynamicImage::ImageRgba8(with_alpha)
        }
    };

    Ok((masked, mask_path))
}

/// Crop to the drawing's bounding box from the mask sidecar, scaled from
/// mask coordinates to image coordinates.
pub fn crop(
    scanarium: &Scanarium,
    image: DynamicImage,
    mask_png_path: &Path,
) -> Result<DynamicImage> {
    let sidecar_path = mask_png_path.with_extension("json");
    let sidecar: MaskCrop = fs::read_to_string(&sidecar_path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .ok_or_else(|| {
            detail_error(
                scanarium,
                ScanariumError::with_parameters(
                    ErrorKind::NoMaskJson,
                    "Failed to read mask json {file_name}",
                    &[("file_name", &sidecar_path.display().to_string())],
                ),
            )
        })?;

    let factor_x = image.width() as f64 / sidecar.width as f64;
    let factor_y = image.height() as f64 / sidecar.height as f64;
    let x_min = (sidecar.x_min as f64 * factor_x).round() as u32;
    let x_max_inc = (sidecar.x_max_inc as f64 * factor_x).round() as u32;
    let y_min = (sidecar.y_min as f64 * factor_y).round() as u32;
    let y_max_inc = (sidecar.y_max_inc as f64 * factor_y).round() as u32;

    Ok(image.crop_imm(x_min, y_min, x_max_inc - x_min, y_max_inc - y_min))
}

fn color_samples(image: &mut DynamicImage) -> Option<(&mut [u8], usize)> {
    match image {
        DynamicImage::ImageRgb8(rgb) => Some((&mut **rgb, 3)),
        DynamicImage::ImageRgba8(rgba) => Some((&mut **rgba, 4)),
        _ => None,
    }
}

/// Per-channel percentile stretch: clip 1% per tail and map the rest to
/// the full range.
fn balance_simple(samples: &mut [u8], stride: usize) {
    let pixel_count = samples.len() / stride;
    if pixel_count == 0 {
        return;
    }
    let clip = (pixel_count / 100).max(1);
    for channel in 0..3 {
        let mut histogram = [0usize; 256];
        for pixel in samples.chunks_exact(stride) {
            histogram[pixel[channel] as usize] += 1;
        }
        let mut low = 0usize;
        let mut seen = 0usize;
        while low < 255 && seen + histogram[low] < clip {
            seen += histogram[low];
            low += 1;
        }
        let mut high = 255usize;
        seen = 0;
        while high > 0 && seen + histogram[high] < clip {
            seen += histogram[high];
            high -= 1;
        }
        if high <= low {
            continue;
        }
        let scale = 255.0 / (high - low) as f32;
        for pixel in samples.chunks_exact_mut(stride) {
            let value = (pixel[channel] as f32 - low as f32) * scale;
            pixel[channel] = value.clamp(0.0, 255.0) as u8;
        }
    }
}

/// Grey-world gains over the low-saturation pixels.
fn balance_grayworld(samples: &mut [u8], stride: usize, saturation_threshold: f32) {
    let mut sums = [0f64; 3];
    let mut counted = 0u64;
    for pixel in samples.chunks_exact(stride) {
        let max = pixel[..3].iter().copied().max().unwrap_or(0) as f32;
        let min = pixel[..3].iter().copied().min().unwrap_or(0) as f32;
        let saturation = if max > 0.0 { (max - min) / max } else { 0.0 };
        if saturation < saturation_threshold {
            for (sum, value) in sums.iter_mut().zip(pixel.iter()) {
                *sum += *value as f64;
            }
            counted += 1;
        }
    }
    if counted == 0 {
        return;
    }
    let means: Vec<f64> = sums.iter().map(|sum| sum / counted as f64).collect();
    let grey = (means[0] + means[1] + means[2]) / 3.0;
    let gains: Vec<f64> = means
        .iter()
        .map(|mean| if *mean > 0.0 { grey / mean } else { 1.0 })
        .collect();
    for pixel in samples.chunks_exact_mut(stride) {
        for channel in 0..3 {
            pixel[channel] = (pixel[channel] as f64 * gains[channel]).clamp(0.0, 255.0) as u8;
        }
    }
}

/// White-balance per `scan.white_balance`.
pub fn balance(scanarium: &Scanarium, mut image: DynamicImage) -> Result<DynamicImage> {
    let algo = scanarium
        .config()
        .string("scan", "white_balance")?
        .to_lowercase();
    match algo.as_str() {
        "simple" | "yes" | "true" => {
            if let Some((samples, stride)) = color_samples(&mut image) {
                balance_simple(samples, stride);
            }
        }
        "grayworld" => {
            if let Some((samples, stride)) = color_samples(&mut image) {
                balance_grayworld(samples, stride, 0.95);
            }
        }
        "none" | "no" | "false" => {}
        _ => {
            return Err(ScanariumError::new(
                ErrorKind::ScanUnknownWb,
                "Unknown white balance filter configured",
            ))
        }
    }
    Ok(image)
}

fn scale_final(scanarium: &Scanarium, image: DynamicImage) -> Result<DynamicImage> {
    Ok(match image {
        DynamicImage::ImageRgb8(rgb) => {
            DynamicImage::ImageRgb8(scale_image_from_config(scanarium, &rgb, "final")?.0)
        }
        DynamicImage::ImageRgba8(rgba) => {
            DynamicImage::ImageRgba8(scale_image_from_config(scanarium, &rgba, "final")?.0)
        }
        other => other,
    })
}

/// Persist the artifact atomically: write under a `tmp-` name, embed
/// metadata, then rename into place. Returns the artifact timestamp.
pub fn save_image(
    scanarium: &Scanarium,
    image: &DynamicImage,
    scene: &str,
    actor: &str,
) -> Result<String> {
    let actor_path = Path::new(scene).join("actors").join(actor);
    if !scanarium.scenes_dir_abs()?.join(&actor_path).is_dir() {
        // Masking already proved the actor source exists, but we are about
        // to create directories, so stay wary.
        return Err(ScanariumError::new(
            ErrorKind::SaveMissingPath,
            "Directory to store file in does not exist, or is no directory",
        ));
    }

    let image_dir = scanarium.dynamic_dir_abs()?.join("scenes").join(&actor_path);
    fs::create_dir_all(&image_dir).map_err(|error| {
        ScanariumError::with_parameters(
            ErrorKind::Value,
            "Failed to create \"{dir}\": {error}",
            &[
                ("dir", &image_dir.display().to_string()),
                ("error", &error.to_string()),
            ],
        )
    })?;

    let timestamp = scanarium.timestamp_for_filename();
    let basename = format!("{timestamp}.png");
    let tmp_file = image_dir.join(format!("tmp-{basename}"));
    image.save(&tmp_file).map_err(|error| {
        ScanariumError::with_parameters(
            ErrorKind::Value,
            "Failed to write \"{file_name}\": {error}",
            &[
                ("file_name", &tmp_file.display().to_string()),
                ("error", &error.to_string()),
            ],
        )
    })?;

    if let Err(error) = scanarium.embed_metadata(
        &tmp_file,
        &[
            ("XMP-xmp:CreatorTool".to_string(), "Scanarium".to_string()),
            (
                "XMP-xmp:Label".to_string(),
                format!("scene:{scene}, actor:{actor}, v:1"),
            ),
        ],
    ) {
        log::error!("failed to embed metadata into {}: {error}", tmp_file.display());
    }

    let image_file = image_dir.join(&basename);
    fs::rename(&tmp_file, &image_file).map_err(|error| {
        let _ = fs::remove_file(&tmp_file);
        ScanariumError::with_parameters(
            ErrorKind::Value,
            "Failed to move \"{file_name}\" into place: {error}",
            &[
                ("file_name", &image_file.display().to_string()),
                ("error", &error.to_string()),
            ],
        )
    })?;

    Ok(timestamp)
}

/// The full actor pipeline on a frame that already passed QR extraction:
/// rectify, orient, mask, crop, balance, scale.
pub fn actor_image_pipeline(
    scanarium: &Scanarium,
    image: &RgbImage,
    qr_rect: &Rect,
    payload: &QrPayload,
    visualized_alpha: Option<f32>,
) -> Result<DynamicImage> {
    let image = rectify_to_qr_parent_rect(scanarium, image, qr_rect)?;
    let image = orient_image(scanarium, image)?;
    let (image, mask_path) = mask(scanarium, image, payload, visualized_alpha)?;
    let image = crop(scanarium, image, &mask_path)?;
    let image = balance(scanarium, image)?;

    // The image is now rectified, landscape, QR code in the lower
    // left-hand corner, and white-balanced.
    scale_final(scanarium, image)
}

/// Pipeline plus persistence and the reindex hand-off.
pub fn process_actor_image_with_qr_code(
    scanarium: &Scanarium,
    image: &RgbImage,
    qr_rect: &Rect,
    payload: &QrPayload,
) -> Result<Value> {
    let scene = payload.command.clone();
    let actor = payload.parameter.clone();
    let final_image = actor_image_pipeline(scanarium, image, qr_rect, payload, None)?;
    let flavor = save_image(scanarium, &final_image, &scene, &actor)?;

    reindex::reindex_actors_for_scene(scanarium, &scene)?;

    Ok(json!({
        "scene": scene,
        "actor": actor,
        "flavor": flavor,
    }))
}
