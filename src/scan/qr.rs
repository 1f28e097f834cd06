use std::collections::BTreeMap;
use std::fs;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbImage};
use rxing::{
    common::HybridBinarizer,
    multi::{GenericMultipleBarcodeReader, MultipleBarcodeReader},
    BarcodeFormat, BinaryBitmap, BufferedImageLuminanceSource,
    DecodeHintType::{POSSIBLE_FORMATS, TRY_HARDER},
    DecodeHintValue::{PossibleFormats, TryHarder},
};

use crate::context::Scanarium;
use crate::error::{ErrorKind, Result, ScanariumError};
use crate::geometry::{Point, Rect};
use crate::scan::prepare::{contrasts, prepare_image};

/// Parsed QR payload: `command ':' parameter (':' key '_' value)*`.
#[derive(Clone, Debug, PartialEq)]
pub struct QrPayload {
    pub command: String,
    pub parameter: String,
    pub extras: BTreeMap<String, String>,
}

impl QrPayload {
    /// The `d` extra, defaulting to 1. Decoration versions start at 1;
    /// anything else is treated as an unknown code, not as a grammar
    /// violation.
    pub fn decoration_version(&self) -> Result<u32> {
        match self.extras.get("d") {
            None => Ok(1),
            Some(raw) => match raw.parse::<u32>() {
                Ok(version) if version >= 1 => Ok(version),
                _ => Err(ScanariumError::unknown_qr()),
            },
        }
    }
}

fn error_misformed_qr_code(scanarium: &Scanarium) -> ScanariumError {
    if scanarium
        .config()
        .boolean_or_false("debug", "fine_grained_errors")
        .unwrap_or(false)
    {
        ScanariumError::new(ErrorKind::MalformedQr, "QR code contains misformed data")
    } else {
        ScanariumError::unknown_qr()
    }
}

fn error_no_qr_code() -> ScanariumError {
    ScanariumError::new(ErrorKind::NoQrCode, "Failed to find QR code in image")
}

fn fine_or_no_qr_code(scanarium: &Scanarium, kind: ErrorKind, template: &'static str) -> ScanariumError {
    if scanarium
        .config()
        .boolean_or_false("debug", "fine_grained_errors")
        .unwrap_or(false)
    {
        ScanariumError::new(kind, template)
    } else {
        error_no_qr_code()
    }
}

/// Decode every QR symbol in a greyscale image. Decoder misses come back
/// as an empty list, not as an error.
fn decode_symbols(grey: &GrayImage) -> Vec<(Rect, String)> {
    let dynamic = DynamicImage::ImageLuma8(grey.clone());
    let bitmap = &mut BinaryBitmap::new(HybridBinarizer::new(BufferedImageLuminanceSource::new(
        dynamic,
    )));
    let reader = rxing::MultiUseMultiFormatReader::default();
    let mut scanner = GenericMultipleBarcodeReader::new(reader);
    let results = match scanner.decode_multiple_with_hints(
        bitmap,
        &rxing::DecodingHintDictionary::from([
            (
                POSSIBLE_FORMATS,
                PossibleFormats(vec![BarcodeFormat::QR_CODE].into_iter().collect()),
            ),
            (TRY_HARDER, TryHarder(true)),
        ]),
    ) {
        Ok(results) => results,
        Err(_) => return Vec::new(),
    };

    results
        .iter()
        .map(|result| {
            let points: Vec<Point> = result
                .getRXingResultPoints()
                .iter()
                .map(|point| Point::new(point.x, point.y))
                .collect();
            (Rect::bounding(&points), result.getText().to_string())
        })
        .collect()
}

fn accept_single_symbol(
    scanarium: &Scanarium,
    mut symbols: Vec<(Rect, String)>,
    scale_factor: f32,
) -> Result<(Rect, String)> {
    if symbols.len() > 1 {
        return Err(ScanariumError::with_parameters(
            ErrorKind::TooManyQrCodes,
            "Expected to find one QR code in image, but found {qr_codes_count}",
            &[("qr_codes_count", &symbols.len().to_string())],
        ));
    }
    let (rect, data) = symbols.remove(0);
    if data.len() > 64 || !data.is_ascii() {
        return Err(error_misformed_qr_code(scanarium));
    }
    Ok((rect.unscale(scale_factor), data))
}

/// Find exactly one QR code. Detection walks the contrast ladder on the
/// prepared (scaled) image; the first contrast that decodes anything wins
/// and the returned rect is mapped back to source coordinates.
pub fn extract_qr(scanarium: &Scanarium, image: &RgbImage) -> Result<(Rect, String)> {
    let contrasts = contrasts(scanarium)?;
    for contrast in &contrasts {
        let (prepared, scale_factor) = prepare_image(scanarium, image, *contrast)?;
        let symbols = decode_symbols(&prepared);
        if !symbols.is_empty() {
            return accept_single_symbol(scanarium, symbols, scale_factor);
        }
    }

    if scanarium.config().boolean_or_false("scan", "qr_shrink_search")? {
        return shrink_search(scanarium, image, contrasts.first().copied().unwrap_or(1.0));
    }

    Err(error_no_qr_code())
}

/// Fallback search that progressively shrinks the prepared image; some
/// decoders lock onto large prints only once the modules get small enough.
fn shrink_search(scanarium: &Scanarium, image: &RgbImage, contrast: f32) -> Result<(Rect, String)> {
    let config = scanarium.config();
    let shrink_factor = config.opt_float("scan", "qr_shrink_factor")?.unwrap_or(0.66) as f32;
    let min_width = config.opt_int("scan", "qr_min_width")?.unwrap_or(150) as u32;
    let max_iterations = config.opt_int("scan", "qr_max_iterations")?.unwrap_or(10);

    let (mut prepared, mut scale_factor) = prepare_image(scanarium, image, contrast)?;
    for _ in 0..max_iterations {
        let width = (prepared.width() as f32 * shrink_factor) as u32;
        let height = (prepared.height() as f32 * shrink_factor) as u32;
        if width < min_width {
            return Err(fine_or_no_qr_code(
                scanarium,
                ErrorKind::ImageGrewTooSmall,
                "Image grew too small while looking for a QR code",
            ));
        }
        prepared = imageops::resize(&prepared, width, height, FilterType::Triangle);
        scale_factor *= shrink_factor;
        let symbols = decode_symbols(&prepared);
        if !symbols.is_empty() {
            return accept_single_symbol(scanarium, symbols, scale_factor);
        }
    }
    Err(fine_or_no_qr_code(
        scanarium,
        ErrorKind::ImageTooManyIterations,
        "Too many iterations while looking for a QR code",
    ))
}

/// One entry of `qr-code.mappings`: a prefix, optionally with a JSON
/// dictionary the remainder is looked up in.
struct MappingSpec {
    prefix: String,
    map_file: Option<String>,
}

fn mapping_specs(scanarium: &Scanarium) -> Result<Vec<MappingSpec>> {
    let Some(raw) = scanarium.config().opt_string("qr-code", "mappings")? else {
        return Ok(Vec::new());
    };
    Ok(raw
        .split(',')
        .filter(|spec| !spec.trim().is_empty())
        .map(|spec| {
            let mut parts = spec.splitn(2, '@');
            let prefix = parts.next().unwrap_or("").trim().to_string();
            let map_file = parts.next().map(|file| file.trim().to_string());
            MappingSpec { prefix, map_file }
        })
        .collect())
}

fn load_code_map(scanarium: &Scanarium, file: &str) -> Result<BTreeMap<String, String>> {
    let path = scanarium.expand_config_dir(file)?;
    let raw = fs::read_to_string(&path).map_err(|_| {
        ScanariumError::with_parameters(
            ErrorKind::Value,
            "Failed to read QR code map \"{file_name}\"",
            &[("file_name", &path.display().to_string())],
        )
    })?;
    serde_json::from_str(&raw).map_err(|_| {
        ScanariumError::with_parameters(
            ErrorKind::Value,
            "Failed to parse QR code map \"{file_name}\"",
            &[("file_name", &path.display().to_string())],
        )
    })
}

/// Expand an abbreviated code: the first matching prefix is stripped and,
/// when the entry names a map file, the remainder is looked up in it
/// (passthrough if absent).
pub fn expand_qr(scanarium: &Scanarium, data: &str) -> Result<String> {
    for spec in mapping_specs(scanarium)? {
        if let Some(rest) = data.strip_prefix(&spec.prefix) {
            let mut expanded = rest.to_string();
            if let Some(file) = &spec.map_file {
                let code_map = load_code_map(scanarium, file)?;
                if let Some(mapped) = code_map.get(&expanded) {
                    expanded = mapped.clone();
                }
            }
            return Ok(expanded);
        }
    }
    Ok(data.to_string())
}

/// The inverse of [`expand_qr`], used when drawing a QR code: if a map
/// entry's value equals the payload, emit `prefix + key` instead.
pub fn abbreviate_qr(scanarium: &Scanarium, data: &str) -> Result<String> {
    for spec in mapping_specs(scanarium)? {
        match &spec.map_file {
            None => return Ok(format!("{}{}", spec.prefix, data)),
            Some(file) => {
                let code_map = load_code_map(scanarium, file)?;
                if let Some((key, _)) = code_map.iter().find(|(_, value)| value.as_str() == data) {
                    return Ok(format!("{}{}", spec.prefix, key));
                }
            }
        }
    }
    Ok(data.to_string())
}

/// Replace every run of characters outside `[0-9A-Za-z:_]` by one `_`.
fn sanitize(data: &str) -> String {
    let mut sanitized = String::with_capacity(data.len());
    let mut in_run = false;
    for c in data.chars() {
        if c.is_ascii_alphanumeric() || c == ':' || c == '_' {
            sanitized.push(c);
            in_run = false;
        } else if !in_run {
            sanitized.push('_');
            in_run = true;
        }
    }
    sanitized
}

/// Parse raw decoded QR data into a payload: prefix expansion, reduction
/// to the part after the last of `/ ? =`, sanitization, then the grammar.
pub fn parse_qr(scanarium: &Scanarium, data: &str) -> Result<QrPayload> {
    let data = expand_qr(scanarium, data)?;
    let data = data.rsplit('/').next().unwrap_or(&data);
    let data = data.rsplit('?').next().unwrap_or(data);
    let data = data.rsplit('=').next().unwrap_or(data);
    let data = sanitize(data);

    let parts: Vec<&str> = data.split(':').collect();
    if parts.len() < 2 {
        return Err(error_misformed_qr_code(scanarium));
    }
    let mut extras = BTreeMap::new();
    for kv in &parts[2..] {
        let (key, value) = kv
            .split_once('_')
            .ok_or_else(|| error_misformed_qr_code(scanarium))?;
        extras.insert(key.to_string(), value.to_string());
    }
    Ok(QrPayload {
        command: parts[0].to_string(),
        parameter: parts[1].to_string(),
        extras,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use assert_fs::prelude::*;
    use qrcode::{Color, EcLevel, QrCode};

    fn scanarium_with(extra: &str) -> Scanarium {
        let config = Config::parse(&format!(
            r#"{{ "scan": {{ "contrasts": "1" }}, "debug": {{ "fine_grained_errors": true }}{extra} }}"#
        ))
        .unwrap();
        Scanarium::new(config)
    }

    fn scanarium() -> Scanarium {
        scanarium_with("")
    }

    #[test]
    fn parses_plain_payload() {
        let payload = parse_qr(&scanarium(), "foo:bar").unwrap();
        assert_eq!(payload.command, "foo");
        assert_eq!(payload.parameter, "bar");
        assert!(payload.extras.is_empty());
    }

    #[test]
    fn reduces_url_payload() {
        let payload = parse_qr(&scanarium(), "http://example.org/q?qr=foo:bar").unwrap();
        assert_eq!(payload.command, "foo");
        assert_eq!(payload.parameter, "bar");
    }

    #[test]
    fn sanitizes_runs_to_single_underscore() {
        let payload = parse_qr(&scanarium(), "fo{o:b}a]r:q+3+").unwrap();
        assert_eq!(payload.command, "fo_o");
        assert_eq!(payload.parameter, "b_a_r");
        assert_eq!(payload.extras.get("q").map(String::as_str), Some("3_"));
    }

    #[test]
    fn key_value_extras() {
        let payload = parse_qr(&scanarium(), "foo:bar:k_v").unwrap();
        assert_eq!(payload.extras.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn bare_separator_yields_empty_fields() {
        let payload = parse_qr(&scanarium(), ":").unwrap();
        assert_eq!(payload.command, "");
        assert_eq!(payload.parameter, "");
        assert!(payload.extras.is_empty());
    }

    #[test]
    fn single_field_is_misformed() {
        let error = parse_qr(&scanarium(), "foo").unwrap_err();
        assert_eq!(error.kind, ErrorKind::MalformedQr);
    }

    #[test]
    fn misformed_collapses_without_fine_grained_errors() {
        let config = Config::parse(r#"{ "scan": { "contrasts": "1" } }"#).unwrap();
        let error = parse_qr(&Scanarium::new(config), "foo").unwrap_err();
        assert_eq!(error.kind, ErrorKind::UnknownQr);
    }

    #[test]
    fn decoration_version_parses_with_default() {
        let payload = parse_qr(&scanarium(), "space:SimpleRocket").unwrap();
        assert_eq!(payload.decoration_version().unwrap(), 1);
        let payload = parse_qr(&scanarium(), "space:SimpleRocket:d_3").unwrap();
        assert_eq!(payload.decoration_version().unwrap(), 3);
        let payload = parse_qr(&scanarium(), "space:SimpleRocket:d_x").unwrap();
        assert_eq!(
            payload.decoration_version().unwrap_err().kind,
            ErrorKind::UnknownQr
        );
        let payload = parse_qr(&scanarium(), "space:SimpleRocket:d_0").unwrap();
        assert_eq!(
            payload.decoration_version().unwrap_err().kind,
            ErrorKind::UnknownQr
        );
    }

    #[test]
    fn prefix_without_map_is_stripped() {
        let scanarium = scanarium_with(r#", "qr-code": { "mappings": "foo" }"#);
        let payload = parse_qr(&scanarium, "foospace:SimpleRocket").unwrap();
        assert_eq!(payload.command, "space");
    }

    #[test]
    fn prefix_with_map_expands_and_abbreviates() {
        let dir = assert_fs::TempDir::new().unwrap();
        let map = dir.child("map.json");
        map.write_str(r#"{"quux": "space:SimpleRocket"}"#).unwrap();
        let scanarium = scanarium_with(&format!(
            r#", "qr-code": {{ "mappings": "foo@{}" }}"#,
            map.path().display()
        ));

        let payload = parse_qr(&scanarium, "fooquux").unwrap();
        assert_eq!(payload.command, "space");
        assert_eq!(payload.parameter, "SimpleRocket");

        // Unmatched remainders pass through the map untouched.
        let payload = parse_qr(&scanarium, "fooocean:Fish").unwrap();
        assert_eq!(payload.command, "ocean");

        assert_eq!(
            abbreviate_qr(&scanarium, "space:SimpleRocket").unwrap(),
            "fooquux"
        );
        assert_eq!(abbreviate_qr(&scanarium, "ocean:Fish").unwrap(), "ocean:Fish");
    }

    #[test]
    fn contrast_ladder_parses() {
        let scanarium = scanarium_with("");
        assert_eq!(contrasts(&scanarium).unwrap(), vec![1.0]);
        let scanarium = Scanarium::new(
            Config::parse(r#"{ "scan": { "contrasts": "10, 1, " } }"#).unwrap(),
        );
        assert_eq!(contrasts(&scanarium).unwrap(), vec![10.0, 1.0]);
    }

    /// Render a QR symbol into `canvas` with its top-left module corner at
    /// `(left, top)`, `module` pixels per module.
    fn draw_qr(canvas: &mut RgbImage, data: &str, left: u32, top: u32, module: u32) {
        let code = QrCode::with_error_correction_level(data.as_bytes(), EcLevel::L).unwrap();
        let width = code.width() as u32;
        let colors = code.to_colors();
        for j in 0..width {
            for i in 0..width {
                if colors[(j * width + i) as usize] == Color::Dark {
                    for dy in 0..module {
                        for dx in 0..module {
                            canvas.put_pixel(
                                left + i * module + dx,
                                top + j * module + dy,
                                image::Rgb([0, 0, 0]),
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn extracts_single_symbol_with_rect() {
        let mut canvas = RgbImage::from_pixel(400, 300, image::Rgb([255, 255, 255]));
        draw_qr(&mut canvas, "space:SimpleRocket:d_1", 60, 60, 6);

        let (rect, data) = extract_qr(&scanarium(), &canvas).unwrap();
        assert_eq!(data, "space:SimpleRocket:d_1");
        // The rect must sit on the symbol, well inside the drawn area.
        assert!(rect.left >= 50.0 && rect.left <= 260.0);
        assert!(rect.top >= 50.0 && rect.top <= 220.0);
    }

    #[test]
    fn zero_symbols_is_no_qr_code() {
        let canvas = RgbImage::from_pixel(200, 200, image::Rgb([255, 255, 255]));
        let error = extract_qr(&scanarium(), &canvas).unwrap_err();
        assert_eq!(error.kind, ErrorKind::NoQrCode);
    }

    #[test]
    fn two_symbols_is_too_many() {
        let mut canvas = RgbImage::from_pixel(500, 250, image::Rgb([255, 255, 255]));
        draw_qr(&mut canvas, "space:SimpleRocket", 40, 40, 6);
        draw_qr(&mut canvas, "space:Satellite", 300, 40, 6);

        let error = extract_qr(&scanarium(), &canvas).unwrap_err();
        assert_eq!(error.kind, ErrorKind::TooManyQrCodes);
    }
}
