use std::fs;
use std::path::{Path, PathBuf};

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::context::Scanarium;
use crate::error::{ErrorKind, Result, ScanariumError};
use crate::generate::filter::{
    filter_svg_tree, show_only_variant, COMMAND_LABEL_SCENE, PARAMETER_LABEL_ACTOR,
};
use crate::generate::svg::{join_style, parse_style, Element, SvgTree};
use crate::generate::{build_versions, generate_full_svg_tree, run_inkscape};
use crate::localize::Localizer;

/// Mask sidecar: the bounding box of the drawing area in mask pixels.
/// The scan pipeline scales this box to the scanned image.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MaskCrop {
    pub width: u32,
    pub height: u32,
    pub x_min: u32,
    pub y_min: u32,
    pub x_max_inc: u32,
    pub y_max_inc: u32,
}

/// The bounding box of all non-zero pixels, exclusive upper bounds.
pub fn crop_box(mask: &GrayImage) -> Result<MaskCrop> {
    let mut x_min = u32::MAX;
    let mut y_min = u32::MAX;
    let mut x_max = 0u32;
    let mut y_max = 0u32;
    let mut any = false;
    for (x, y, pixel) in mask.enumerate_pixels() {
        if pixel.0[0] != 0 {
            any = true;
            x_min = x_min.min(x);
            y_min = y_min.min(y);
            x_max = x_max.max(x);
            y_max = y_max.max(y);
        }
    }
    if !any {
        return Err(ScanariumError::new(
            ErrorKind::Value,
            "Mask does not contain any drawing area",
        ));
    }
    Ok(MaskCrop {
        width: mask.width(),
        height: mask.height(),
        x_min,
        y_min,
        x_max_inc: x_max + 1,
        y_max_inc: y_max + 1,
    })
}

fn adapt_style(style: &str, offset: f64, color: Option<&str>) -> String {
    let mut settings = parse_style(style);
    for (key, value) in settings.iter_mut() {
        if offset != 0.0 && key.as_str() == "stroke-width" {
            match value.trim().parse::<f64>() {
                Ok(width) => *value = format!("{}", width + offset),
                Err(_) => {
                    // Unit-suffixed widths are left alone; inflating them
                    // needs unit handling the sheet sources never use.
                    log::warn!("not inflating stroke-width {value:?}");
                }
            }
        } else if let (Some(color), true) = (color, key.as_str() == "stroke") {
            *value = color.to_string();
        }
    }
    join_style(&settings)
}

fn adapt_descendants(element: &mut Element, offset: f64, color: Option<&str>) {
    for child in element.child_elements_mut() {
        if let Some(style) = child.attribute(None, "style").map(str::to_string) {
            child.set_attribute("style", &adapt_style(&style, offset, color));
        }
        adapt_descendants(child, offset, color);
    }
}

fn find_mask_element<'a>(element: &'a mut Element) -> Option<&'a mut Element> {
    if element.attribute(None, "id") == Some("Mask") {
        return Some(element);
    }
    for child in element.child_elements_mut() {
        if let Some(found) = find_mask_element(child) {
            return Some(found);
        }
    }
    None
}

/// Inflate stroke widths and override stroke colors below the `Mask`
/// element. The "effective" mask gets the inflation so scan imprecision
/// still lands inside the drawing; the "unadapted" mask does not.
fn generate_adapted_mask_source(
    scanarium: &Scanarium,
    tree: &mut SvgTree,
    target: &Path,
    adapt_stroke_width: bool,
) -> Result<()> {
    let offset = if adapt_stroke_width {
        scanarium.config().float("mask", "stroke_offset")?
    } else {
        0.0
    };
    let color = scanarium.config().opt_string("mask", "stroke_color")?;

    if let Some(mask_element) = find_mask_element(&mut tree.root) {
        adapt_descendants(mask_element, offset, color.as_deref());
    }
    tree.write_file(target)
}

fn svg_length_to_px(raw: &str) -> Option<f64> {
    // Inkscape >= 0.92 renders at 96 user units per inch.
    const SVG_DPI: f64 = 96.0;
    if let Some(value) = raw.strip_suffix("mm") {
        value.trim().parse::<f64>().ok().map(|v| v / 25.4 * SVG_DPI)
    } else if let Some(value) = raw.strip_suffix("in") {
        value.trim().parse::<f64>().ok().map(|v| v * SVG_DPI)
    } else if let Some(value) = raw.strip_suffix("px") {
        value.trim().parse::<f64>().ok()
    } else {
        raw.trim().parse::<f64>().ok()
    }
}

fn contour_stroke_width(tree: &SvgTree) -> f64 {
    fn find_contour<'a>(element: &'a Element) -> Option<&'a Element> {
        if element.attribute(None, "id") == Some("contour") {
            return Some(element);
        }
        element.child_elements().find_map(find_contour)
    }
    find_contour(&tree.root)
        .and_then(|contour| contour.attribute(None, "style"))
        .map(|style| {
            parse_style(style)
                .iter()
                .find(|(key, _)| key == "stroke-width")
                .and_then(|(_, value)| value.trim().parse::<f64>().ok())
                .unwrap_or(0.0)
        })
        .unwrap_or(0.0)
}

/// The inner area of the `contour` rect as an `--export-area` argument.
///
/// The rasterizer only reports the rect's outer box, so the stroke width
/// is moved inwards manually, and its export origin is the bottom-left
/// paper corner rather than SVG's top-left one.
fn contour_inner_export_area(scanarium: &Scanarium, svg_path: &Path) -> Result<String> {
    let tree = SvgTree::parse_file(svg_path)?;
    let stroke_width = contour_stroke_width(&tree);

    let output = run_inkscape(
        scanarium,
        &["--query-all".to_string(), svg_path.display().to_string()],
    )?;

    let mut geometry: Option<(f64, f64, f64, f64)> = None;
    for line in output.lines() {
        if geometry.is_none() || line.starts_with("contour,") {
            let fields: Vec<f64> = line
                .split(',')
                .skip(1)
                .filter_map(|field| field.trim().parse().ok())
                .collect();
            if fields.len() == 4 {
                geometry = Some((fields[0], fields[1], fields[2], fields[3]));
            }
        }
    }
    let (x, y_top, width, height) = geometry.ok_or_else(|| {
        ScanariumError::with_parameters(
            ErrorKind::Value,
            "Failed to query geometry of \"{file_name}\"",
            &[("file_name", &svg_path.display().to_string())],
        )
    })?;

    let paper_height = tree
        .root
        .attribute(None, "height")
        .and_then(svg_length_to_px)
        .unwrap_or(0.0);
    let y_bottom = paper_height - y_top - height;

    Ok(format!(
        "{:.6}:{:.6}:{:.6}:{:.6}",
        x + stroke_width,
        y_bottom + stroke_width,
        x + width - stroke_width,
        y_bottom + height - stroke_width,
    ))
}

/// Build one mask bitmap (`effective` or `unadapted`) for an actor.
fn regenerate_mask_variant(
    scanarium: &Scanarium,
    dir: &Path,
    command: &str,
    name: &str,
    decoration_version: u32,
    force: bool,
    variant_name: &str,
    adapt_stroke_width: bool,
) -> Result<PathBuf> {
    let (mut tree, sources) = generate_full_svg_tree(scanarium, dir, name, decoration_version)?;

    let target = scanarium.versioned_filename(
        dir,
        &format!("{name}-mask-{variant_name}"),
        "png",
        decoration_version,
    );
    let adapted_source = target.with_extension("svg");

    if scanarium.file_needs_update(&adapted_source, &sources, force) {
        show_only_variant(&mut tree, "");
        filter_svg_tree(
            scanarium,
            &mut tree,
            command,
            name,
            "",
            &Localizer::identity(),
            COMMAND_LABEL_SCENE,
            PARAMETER_LABEL_ACTOR,
            decoration_version,
            Some("../.."),
        )?;
        generate_adapted_mask_source(scanarium, &mut tree, &adapted_source, adapt_stroke_width)?;
    }

    if scanarium.file_needs_update(&target, &[adapted_source.clone()], force) {
        let dpi = scanarium.config().int("mask", "dpi")?;
        let contour_area = contour_inner_export_area(scanarium, &adapted_source)?;
        let target_tmp = target.with_extension("tmp.png");
        run_inkscape(
            scanarium,
            &[
                "--export-id=Mask".to_string(),
                "--export-id-only".to_string(),
                format!("--export-area={contour_area}"),
                "--export-background=black".to_string(),
                format!("--export-dpi={dpi}"),
                format!("--export-png={}", target_tmp.display()),
                adapted_source.display().to_string(),
            ],
        )?;
        fs::rename(&target_tmp, &target).map_err(|error| {
            let _ = fs::remove_file(&target_tmp);
            ScanariumError::with_parameters(
                ErrorKind::Value,
                "Failed to move \"{file_name}\" into place: {error}",
                &[
                    ("file_name", &target.display().to_string()),
                    ("error", &error.to_string()),
                ],
            )
        })?;
    }
    Ok(target)
}

/// Build both mask bitmaps and the crop sidecar. The sidecar describes
/// the *unadapted* bitmap (true drawing bounds) and sits next to the
/// *effective* one, which is what the scanner reads.
pub fn regenerate_mask(
    scanarium: &Scanarium,
    dir: &Path,
    command: &str,
    name: &str,
    decoration_version: u32,
    force: bool,
) -> Result<()> {
    let unadapted_mask_png = regenerate_mask_variant(
        scanarium,
        dir,
        command,
        name,
        decoration_version,
        force,
        "unadapted",
        false,
    )?;

    let effective_mask_png = regenerate_mask_variant(
        scanarium,
        dir,
        command,
        name,
        decoration_version,
        force,
        "effective",
        true,
    )?;

    let effective_mask_json = effective_mask_png.with_extension("json");
    if scanarium.file_needs_update(&effective_mask_json, &[unadapted_mask_png.clone()], force) {
        let mask = image::open(&unadapted_mask_png)
            .map_err(|_| {
                ScanariumError::with_parameters(
                    ErrorKind::Value,
                    "Failed to read mask \"{file_name}\"",
                    &[("file_name", &unadapted_mask_png.display().to_string())],
                )
            })?
            .to_luma8();
        scanarium.dump_json(&effective_mask_json, &crop_box(&mask)?)?;
    }
    Ok(())
}

/// Build masks for every decoration version that has an undecorated
/// source; the latest version is always built.
pub fn regenerate_masks(
    scanarium: &Scanarium,
    dir: &Path,
    command: &str,
    name: &str,
    force: bool,
) -> Result<()> {
    for decoration_version in build_versions(scanarium, dir, name)? {
        regenerate_mask(scanarium, dir, command, name, decoration_version, force)?;
    }
    Ok(())
}
