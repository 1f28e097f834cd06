use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use image::RgbImage;

use crate::context::Scanarium;
use crate::error::{ErrorKind, Result, ScanariumError};
use crate::exec::{self, RunError, DEFAULT_TIMEOUT};
use crate::scan::prepare::{scale_image_from_config, undistort_image};

/// Conversion parameters shared by the external ingress pipelines.
const CONVERSION_DPI: u32 = 150;
const CONVERSION_QUALITY: u32 = 75;

fn fine_grained(scanarium: &Scanarium) -> bool {
    scanarium
        .config()
        .boolean_or_false("debug", "fine_grained_errors")
        .unwrap_or(false)
}

fn error_pipeline() -> ScanariumError {
    ScanariumError::new(
        ErrorKind::PipelineError,
        "Server-side image processing failed",
    )
}

fn error_no_raw_image() -> ScanariumError {
    ScanariumError::new(
        ErrorKind::NoRawImage,
        "Failed to retrieve image from camera",
    )
}

/// A frame source: either a real capture device or the configured still
/// image. Devices release on drop; callers either pass a long-lived
/// handle into [`get_image`] or let it open and drop one per frame.
pub enum Camera {
    #[cfg(feature = "camera")]
    Capture(CaptureHandle),
    StaticImage,
}

fn is_static_source(source: &str) -> bool {
    source.starts_with("image:") || !source.starts_with("cam:")
}

/// Open the configured frame source.
pub fn open_camera(scanarium: &Scanarium) -> Result<Camera> {
    let source = scanarium.config().string("scan", "source")?;
    if is_static_source(&source) {
        return Ok(Camera::StaticImage);
    }

    #[cfg(feature = "camera")]
    {
        CaptureHandle::open(scanarium, &source).map(Camera::Capture)
    }
    #[cfg(not(feature = "camera"))]
    {
        Err(ScanariumError::with_parameters(
            ErrorKind::CamTypeUnknown,
            "Camera source \"{source}\" needs the camera feature",
            &[("source", &source)],
        ))
    }
}

#[cfg(feature = "camera")]
pub use capture::CaptureHandle;

#[cfg(feature = "camera")]
mod capture {
    use std::time::Instant;

    use image::RgbImage;
    use v4l::buffer::Type;
    use v4l::io::traits::CaptureStream;
    use v4l::prelude::*;
    use v4l::video::Capture;
    use v4l::FourCC;

    use super::error_no_raw_image;
    use crate::context::Scanarium;
    use crate::error::{ErrorKind, Result, ScanariumError};

    /// An opened V4L2 capture device.
    pub struct CaptureHandle {
        device: Device,
        fourcc: FourCC,
        width: u32,
        height: u32,
        buffers: u32,
    }

    impl CaptureHandle {
        pub(super) fn open(scanarium: &Scanarium, source: &str) -> Result<Self> {
            let config = scanarium.config();
            let stripped = source.trim_start_matches("cam:");
            let index: usize = stripped.parse().map_err(|_| {
                ScanariumError::with_parameters(
                    ErrorKind::Value,
                    "Failed to parse \"{stripped}\" of source \"{source}\" to number",
                    &[("stripped", stripped), ("source", source)],
                )
            })?;

            let error_not_open = || {
                ScanariumError::with_parameters(
                    ErrorKind::CapNotOpen,
                    "Failed to open camera \"{source}\"",
                    &[("source", source)],
                )
            };
            let device = Device::new(index).map_err(|_| error_not_open())?;

            // Basic device setup happens right here, so no external camera
            // tooling is needed for width, height and pixel format.
            let mut format = device.format().map_err(|_| error_not_open())?;
            if let Some(width) = config.opt_int("scan", "width")? {
                format.width = width as u32;
            }
            if let Some(height) = config.opt_int("scan", "height")? {
                format.height = height as u32;
            }
            format.fourcc = FourCC::new(b"MJPG");
            let format = device.set_format(&format).map_err(|_| error_not_open())?;

            // Small buffers mean fewer stale frames to skip, but shrinking
            // them makes some capture pipelines re-initialize, so it is
            // opt-in.
            let buffers = if config.boolean_or_false("scan", "minimize_buffers")? {
                1
            } else {
                4
            };

            let handle = CaptureHandle {
                device,
                fourcc: format.fourcc,
                width: format.width,
                height: format.height,
                buffers,
            };

            if let Some(delay) = config.opt_float("scan", "delay")? {
                // Let auto-exposure settle after the first grab.
                let mut stream =
                    MmapStream::with_buffers(&handle.device, Type::VideoCapture, handle.buffers)
                        .map_err(|_| error_not_open())?;
                let _ = stream.next();
                std::thread::sleep(std::time::Duration::from_secs_f64(delay));
            }

            Ok(handle)
        }

        /// Grab until a dequeue took at least `minimum_grab_time` seconds.
        /// Instant dequeues are stale buffered frames; a slow one means the
        /// driver had to wait for a fresh frame, which is the one we want.
        pub(super) fn grab_image(&mut self, minimum_grab_time: f64) -> Result<RgbImage> {
            let mut stream =
                MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffers)
                    .map_err(|_| error_no_raw_image())?;
            loop {
                let start = Instant::now();
                let (data, _meta) = stream.next().map_err(|_| error_no_raw_image())?;
                if start.elapsed().as_secs_f64() >= minimum_grab_time {
                    return decode_frame(data, self.fourcc, self.width, self.height);
                }
            }
        }
    }

    fn decode_frame(data: &[u8], fourcc: FourCC, width: u32, height: u32) -> Result<RgbImage> {
        match &fourcc.repr {
            b"MJPG" | b"JPEG" => image::load_from_memory(data)
                .map(|decoded| decoded.to_rgb8())
                .map_err(|_| error_no_raw_image()),
            b"YUYV" => yuyv_to_rgb(data, width, height).ok_or_else(error_no_raw_image),
            _ => Err(error_no_raw_image().with_private("fourcc", &fourcc.to_string())),
        }
    }

    /// Packed YUYV 4:2:2 to RGB, BT.601 coefficients.
    fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Option<RgbImage> {
        if (data.len() as u64) < width as u64 * height as u64 * 2 {
            return None;
        }
        let mut rgb = RgbImage::new(width, height);
        for (index, chunk) in data.chunks_exact(4).enumerate() {
            let base = index as u64 * 2;
            let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
            for (offset, luma) in [(0u64, y0), (1u64, y1)] {
                let position = base + offset;
                if position >= width as u64 * height as u64 {
                    break;
                }
                let x = (position % width as u64) as u32;
                let y = (position / width as u64) as u32;
                let luma = luma as f32;
                let cb = u as f32 - 128.0;
                let cr = v as f32 - 128.0;
                let r = (luma + 1.402 * cr).clamp(0.0, 255.0) as u8;
                let g = (luma - 0.344 * cb - 0.714 * cr).clamp(0.0, 255.0) as u8;
                let b = (luma + 1.772 * cb).clamp(0.0, 255.0) as u8;
                rgb.put_pixel(x, y, image::Rgb([r, g, b]));
            }
        }
        Some(rgb)
    }
}

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// Periodically dump raw frames for later calibration or debugging.
fn store_raw_image(scanarium: &Scanarium, image: &RgbImage) -> Result<()> {
    let Some(dir_path) = scanarium
        .config()
        .opt_string("scan", "raw_image_directory")?
    else {
        return Ok(());
    };
    let now = now_unix();
    if scanarium.raw_image_store_due(now) {
        let _ = fs::create_dir_all(&dir_path);
        let file_path = Path::new(&dir_path).join(format!("{now:.6}.png"));
        if let Err(error) = image.save(&file_path) {
            log::error!("failed to store raw image {}: {error}", file_path.display());
        }
        let period = scanarium.config().float("scan", "raw_image_period")?;
        scanarium.schedule_next_raw_image_store(now + period);
    }
    Ok(())
}

/// Identify a still file by its magic bytes, never by its extension.
pub fn guess_image_format(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("png")
    } else if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        Some("jpg")
    } else if bytes.starts_with(b"%PDF") {
        Some("pdf")
    } else if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        match &bytes[8..12] {
            b"heic" | b"heix" | b"mif1" | b"msf1" => Some("heic"),
            _ => None,
        }
    } else if bytes.starts_with(b"GIF8") {
        Some("gif")
    } else if bytes.starts_with(b"BM") {
        Some("bmp")
    } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
        Some("tiff")
    } else if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        Some("webp")
    } else {
        None
    }
}

fn map_pipeline_error(scanarium: &Scanarium, error: RunError) -> ScanariumError {
    let fine = fine_grained(scanarium);
    match error {
        RunError::Os(_) if fine => ScanariumError::new(
            ErrorKind::PipelineOsError,
            "Server-side image processing failed",
        ),
        RunError::Timeout { .. } if fine => ScanariumError::new(
            ErrorKind::PipelineTimeout,
            "Server-side image processing took too long",
        ),
        RunError::ReturnValue { .. } if fine => ScanariumError::new(
            ErrorKind::PipelineReturnValue,
            "Server-side image processing failed",
        ),
        _ => error_pipeline(),
    }
}

/// Run one ingress pipeline for a still file. `Ok(None)` means the
/// pipeline went through but produced nothing decodable.
fn run_get_raw_image_pipeline(
    scanarium: &Scanarium,
    file_path: &Path,
    pipeline: &str,
) -> Result<Option<RgbImage>> {
    if pipeline == "native" {
        return Ok(image::open(file_path).ok().map(|decoded| decoded.to_rgb8()));
    }

    let work_dir = tempfile::Builder::new()
        .prefix("scanarium-conv-")
        .tempdir()
        .map_err(|_| error_pipeline())?;
    let converted_path_base = work_dir.path().join("converted");
    let converted_path = work_dir.path().join("converted.jpg");

    let command: Vec<String> = match pipeline {
        "pdftoppm" => vec![
            scanarium.config().string("programs", "pdftoppm_untrusted")?,
            "-jpeg".to_string(),
            "-singlefile".to_string(),
            "-r".to_string(),
            CONVERSION_DPI.to_string(),
            "-jpegopt".to_string(),
            format!("quality={CONVERSION_QUALITY}"),
            file_path.display().to_string(),
            converted_path_base.display().to_string(),
        ],
        "convert" => vec![
            scanarium.config().string("programs", "convert_untrusted")?,
            "-units".to_string(),
            "pixelsperinch".to_string(),
            "-background".to_string(),
            "white".to_string(),
            "-flatten".to_string(),
            "-density".to_string(),
            CONVERSION_DPI.to_string(),
            "-quality".to_string(),
            CONVERSION_QUALITY.to_string(),
            // [0] selects the first page of multi-page documents.
            format!("{}[0]", file_path.display()),
            converted_path.display().to_string(),
        ],
        _ => {
            return Err(ScanariumError::with_parameters(
                ErrorKind::ScanUnknownPipeline,
                "Unknown conversion pipeline \"{pipeline}\"",
                &[("pipeline", pipeline)],
            ))
        }
    };

    exec::run(&command, DEFAULT_TIMEOUT)
        .map_err(|error| map_pipeline_error(scanarium, error))?;

    Ok(image::open(&converted_path)
        .ok()
        .map(|decoded| decoded.to_rgb8()))
}

fn get_raw_image_from_file(scanarium: &Scanarium, file_path: &Path) -> Result<RgbImage> {
    let config = scanarium.config();
    let bytes = fs::read(file_path).map_err(|_| {
        ScanariumError::with_parameters(
            ErrorKind::StaticSourceMissing,
            "The static source \"{file}\" does not exist",
            &[("file", &file_path.display().to_string())],
        )
    })?;

    let mut image = None;
    if let Some(format) = guess_image_format(&bytes) {
        if config.boolean_or_false("scan", &format!("permit_file_type_{format}"))? {
            let pipeline =
                config.string_or("scan", &format!("pipeline_file_type_{format}"), "convert")?;
            image = run_get_raw_image_pipeline(scanarium, file_path, &pipeline)?;
        }
    }

    image.ok_or_else(|| {
        let supported_formats = config
            .keys("scan")
            .iter()
            .filter_map(|key| key.strip_prefix("permit_file_type_").map(str::to_string))
            .filter(|format| {
                config
                    .boolean_or_false("scan", &format!("permit_file_type_{format}"))
                    .unwrap_or(false)
            })
            .map(|format| format.to_uppercase())
            .collect::<Vec<_>>()
            .join(", ");
        ScanariumError::with_parameters(
            ErrorKind::UnreadableImageType,
            "Only {supported_formats} files are supported.",
            &[("supported_formats", &supported_formats)],
        )
    })
}

/// Obtain a raw frame from the configured source. A `camera` handle may be
/// passed in to keep a device open across frames.
pub fn get_raw_image(scanarium: &Scanarium, camera: Option<&mut Camera>) -> Result<RgbImage> {
    let mut managed;
    let camera = match camera {
        Some(camera) => camera,
        None => {
            managed = open_camera(scanarium)?;
            &mut managed
        }
    };

    let image = match camera {
        #[cfg(feature = "camera")]
        Camera::Capture(handle) => {
            let minimum_grab_time = scanarium.config().float("scan", "minimum_grab_time")?;
            handle.grab_image(minimum_grab_time)?
        }
        Camera::StaticImage => {
            let source = scanarium.config().string("scan", "source")?;
            let file_path = source.strip_prefix("image:").unwrap_or(&source);
            let file_path = Path::new(file_path);
            if !file_path.is_file() {
                return Err(ScanariumError::with_parameters(
                    ErrorKind::StaticSourceMissing,
                    "The static source \"{file}\" does not exist",
                    &[("file", &file_path.display().to_string())],
                ));
            }
            get_raw_image_from_file(scanarium, file_path)?
        }
    };

    store_raw_image(scanarium, &image)?;

    let min_width = scanarium.config().int("scan", "min_raw_width_trip")?;
    if (image.width() as i64) < min_width {
        return Err(ScanariumError::with_parameters(
            ErrorKind::ImageTooSmall,
            "Image is too small. Minimum width is {min_width} pixels",
            &[("min_width", &min_width.to_string())],
        ));
    }

    Ok(image)
}

/// C2 + the raw-size part of C3: acquire, scale to the raw gate, undistort.
pub fn get_image(scanarium: &Scanarium, camera: Option<&mut Camera>) -> Result<RgbImage> {
    let image = get_raw_image(scanarium, camera)?;
    let (image, _) = scale_image_from_config(scanarium, &image, "raw")?;
    undistort_image(scanarium, image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use assert_fs::prelude::*;

    fn scanarium_for(source: &Path, extra_scan: &str) -> Scanarium {
        let config = Config::parse(&format!(
            r#"{{ "scan": {{
                "source": "image:{}",
                "min_raw_width_trip": 100,
                "permit_file_type_png": true,
                "pipeline_file_type_png": "native"{extra_scan}
            }} }}"#,
            source.display()
        ))
        .unwrap();
        Scanarium::new(config)
    }

    fn write_png(path: &Path, width: u32, height: u32) {
        RgbImage::from_pixel(width, height, image::Rgb([255, 255, 255]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn magic_byte_sniffing() {
        assert_eq!(guess_image_format(b"\x89PNG\r\n\x1a\nrest"), Some("png"));
        assert_eq!(guess_image_format(&[0xff, 0xd8, 0xff, 0xe0]), Some("jpg"));
        assert_eq!(guess_image_format(b"%PDF-1.4"), Some("pdf"));
        assert_eq!(guess_image_format(b"\0\0\0\x18ftypheicrest"), Some("heic"));
        assert_eq!(guess_image_format(b"plain text"), None);
    }

    #[test]
    fn native_pipeline_reads_permitted_png() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("in.png");
        write_png(file.path(), 320, 240);

        let scanarium = scanarium_for(file.path(), "");
        let image = get_raw_image(&scanarium, None).unwrap();
        assert_eq!(image.dimensions(), (320, 240));
    }

    #[test]
    fn forbidden_type_is_unreadable() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("in.png");
        write_png(file.path(), 320, 240);

        let config = Config::parse(&format!(
            r#"{{ "scan": {{
                "source": "image:{}",
                "min_raw_width_trip": 100,
                "permit_file_type_jpg": true
            }} }}"#,
            file.path().display()
        ))
        .unwrap();
        let error = get_raw_image(&Scanarium::new(config), None).unwrap_err();
        assert_eq!(error.kind, ErrorKind::UnreadableImageType);
        assert!(error.message.contains("JPG"));
    }

    #[test]
    fn too_narrow_frame_is_rejected() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("in.png");
        write_png(file.path(), 60, 60);

        let scanarium = scanarium_for(file.path(), "");
        let error = get_raw_image(&scanarium, None).unwrap_err();
        assert_eq!(error.kind, ErrorKind::ImageTooSmall);
    }

    #[test]
    fn missing_static_source() {
        let scanarium = scanarium_for(Path::new("/nonexistent/in.png"), "");
        let error = get_raw_image(&scanarium, None).unwrap_err();
        assert_eq!(error.kind, ErrorKind::StaticSourceMissing);
    }

    #[test]
    fn raw_dump_respects_period() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("in.png");
        write_png(file.path(), 320, 240);
        let dump_dir = dir.child("raw");

        let scanarium = scanarium_for(
            file.path(),
            &format!(
                r#", "raw_image_directory": "{}", "raw_image_period": 3600"#,
                dump_dir.path().display()
            ),
        );
        get_raw_image(&scanarium, None).unwrap();
        get_raw_image(&scanarium, None).unwrap();
        let dumped = std::fs::read_dir(dump_dir.path()).unwrap().count();
        assert_eq!(dumped, 1);
    }

    #[test]
    fn unknown_conversion_pipeline() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("in.png");
        write_png(file.path(), 320, 240);

        let config = Config::parse(&format!(
            r#"{{ "scan": {{
                "source": "image:{}",
                "min_raw_width_trip": 100,
                "permit_file_type_png": true,
                "pipeline_file_type_png": "frobnicate"
            }} }}"#,
            file.path().display()
        ))
        .unwrap();
        let error = get_raw_image(&Scanarium::new(config), None).unwrap_err();
        assert_eq!(error.kind, ErrorKind::ScanUnknownPipeline);
    }

    #[test]
    fn broken_converter_maps_to_pipeline_error() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("in.png");
        write_png(file.path(), 320, 240);

        let config = Config::parse(&format!(
            r#"{{
                "scan": {{
                    "source": "image:{}",
                    "min_raw_width_trip": 100,
                    "permit_file_type_png": true,
                    "pipeline_file_type_png": "convert"
                }},
                "programs": {{ "convert_untrusted": "/nonexistent/convert" }}
            }}"#,
            file.path().display()
        ))
        .unwrap();
        let error = get_raw_image(&Scanarium::new(config), None).unwrap_err();
        assert_eq!(error.kind, ErrorKind::PipelineError);
    }

    #[test]
    fn broken_converter_fine_grained() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("in.png");
        write_png(file.path(), 320, 240);

        let config = Config::parse(&format!(
            r#"{{
                "scan": {{
                    "source": "image:{}",
                    "min_raw_width_trip": 100,
                    "permit_file_type_png": true,
                    "pipeline_file_type_png": "convert"
                }},
                "programs": {{ "convert_untrusted": "/nonexistent/convert" }},
                "debug": {{ "fine_grained_errors": true }}
            }}"#,
            file.path().display()
        ))
        .unwrap();
        let error = get_raw_image(&Scanarium::new(config), None).unwrap_err();
        assert_eq!(error.kind, ErrorKind::PipelineOsError);
    }
}
