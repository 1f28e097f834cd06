use qrcode::{Color, EcLevel, QrCode};

use crate::context::Scanarium;
use crate::error::{ErrorKind, Result, ScanariumError};
use crate::generate::svg::{
    join_style, parse_style, set_style, Element, Node, SvgTree, INKSCAPE_NS, SVG_NS, XLINK_NS,
};
use crate::localize::Localizer;
use crate::scan::qr::abbreviate_qr;

pub const COMMAND_LABEL_SCENE: &str = "scene";
pub const PARAMETER_LABEL_ACTOR: &str = "actor";

const BACKGROUND_COLOR: &str = "#ffffff";
const LIGHT_COLOR: &str = "#c0c0c0";
const DARK_COLOR: &str = "#808080";
const THICK_WIDTH: &str = "0.75590551";
const THIN_WIDTH: &str = "0.377952755";

const THIN_LIGHT: &[(&str, &str)] = &[("stroke", LIGHT_COLOR), ("stroke-width", THIN_WIDTH)];
const THICK_DARK: &[(&str, &str)] = &[("stroke", DARK_COLOR), ("stroke-width", THICK_WIDTH)];
const THICK_DARK_FILLED: &[(&str, &str)] = &[
    ("stroke", DARK_COLOR),
    ("stroke-width", THICK_WIDTH),
    ("fill", BACKGROUND_COLOR),
];

/// The `(variant, layer) -> style overrides` table. The base variant
/// dims the overlay to a light hairline; the detailed variant prints the
/// overlay and detail layers like the mask contour.
const VARIANT_LAYER_SETTINGS: &[(&str, &str, &[(&str, &str)])] = &[
    ("", "Mask", THICK_DARK_FILLED),
    ("", "Overlay", THIN_LIGHT),
    ("Detailed", "Mask", THICK_DARK_FILLED),
    ("Detailed", "Overlay", THICK_DARK),
    ("Detailed", "Detailed", THICK_DARK),
];

/// Variant names selectable through equally named layers.
pub const SVG_VARIANTS: &[&str] = &["Detailed"];

fn style_enforcements(variant: &str, layer_name: &str) -> &'static [(&'static str, &'static str)] {
    VARIANT_LAYER_SETTINGS
        .iter()
        .find(|(v, layer, _)| *v == variant && *layer == layer_name)
        .map(|(_, _, settings)| *settings)
        .unwrap_or(&[])
}

fn is_layer(element: &Element) -> bool {
    element.is(SVG_NS, "g")
        && element.attribute(Some(INKSCAPE_NS), "groupmode") == Some("layer")
}

/// A layer's name: its id, unless the id is an auto-generated `layer...`,
/// in which case the Inkscape label wins.
pub fn layer_name(element: &Element) -> Option<String> {
    let id = element.attribute(None, "id")?;
    if id.starts_with("layer") {
        element
            .attribute(Some(INKSCAPE_NS), "label")
            .map(str::to_string)
    } else {
        Some(id.to_string())
    }
}

fn variant_of_layer(element: &Element) -> Option<&'static str> {
    let matches = |name: Option<&str>| {
        name.and_then(|name| SVG_VARIANTS.iter().find(|variant| **variant == name))
            .copied()
    };
    matches(element.attribute(None, "id"))
        .or_else(|| matches(element.attribute(Some(INKSCAPE_NS), "label")))
}

/// The variants this tree can produce: the base variant plus one per
/// variant-named top-level layer.
pub fn extract_variants(tree: &SvgTree) -> Vec<String> {
    let mut variants = vec![String::new()];
    for layer in tree.root.child_elements() {
        if layer.is(SVG_NS, "g") {
            if let Some(variant) = variant_of_layer(layer) {
                variants.push(variant.to_string());
            }
        }
    }
    variants
}

/// Toggle variant-named layers so only the target variant is displayed.
pub fn show_only_variant(tree: &mut SvgTree, variant: &str) {
    for layer in tree.root.child_elements_mut() {
        if !layer.is(SVG_NS, "g") {
            continue;
        }
        let Some(layer_variant) = variant_of_layer(layer) else {
            continue;
        };
        let display = if layer_variant == variant {
            "inline"
        } else {
            "none"
        };
        let mut style = parse_style(layer.attribute(None, "style").unwrap_or(""));
        set_style(&mut style, "display", display);
        layer.set_attribute("style", &join_style(&style));
    }
}

/// Append another document's top-level layer groups to `base`.
pub fn append_svg_layers(base: &mut SvgTree, addition: &SvgTree) {
    base.merge_namespaces(addition);
    for layer in addition.root.child_elements() {
        if layer.is(SVG_NS, "g") {
            base.root.children.push(Node::Element(layer.clone()));
        }
    }
}

/// Localize command, parameter and variant, falling back through the
/// legacy parameter classes so older tables keep working.
pub fn localize_command_parameter_variant(
    localizer: &Localizer,
    command: &str,
    parameter: &str,
    variant: &str,
) -> (String, String, String, String) {
    let with_alternatives = |class: &str, value: &str, alternatives: &[&str]| {
        let mut localized = localizer.localize_parameter(class, value);
        for alternative in alternatives {
            if localized == value {
                localized = localizer.localize_parameter(alternative, &localized);
            }
        }
        localized
    };

    let localized_command = with_alternatives("command_name", command, &["scene_name"]);
    let localized_parameter =
        with_alternatives("parameter_name", parameter, &["actor_name", "scene_name"]);
    let localized_variant = localizer.localize_parameter("parameter_variant_name", variant);

    let localized_parameter_with_variant = if variant.is_empty() {
        localized_parameter.clone()
    } else {
        localizer.localize(
            "{parameter_name} ({parameter_variant_name})",
            &[
                ("parameter_name", localized_parameter.clone()),
                ("parameter_variant_name", localized_variant.clone()),
            ],
        )
    };

    (
        localized_command,
        localized_parameter,
        localized_variant,
        localized_parameter_with_variant,
    )
}

struct FilterContext<'a> {
    localizer: &'a Localizer,
    template_parameters: Vec<(&'static str, String)>,
    variant: &'a str,
    href_adjustment: Option<&'a str>,
}

impl FilterContext<'_> {
    fn localize(&self, text: &str) -> String {
        self.localizer.localize(text, &self.template_parameters)
    }
}

fn visit(
    element: &mut Element,
    mut enforcings: &'static [(&'static str, &'static str)],
    context: &FilterContext,
) -> Result<()> {
    if is_layer(element) {
        if let Some(name) = layer_name(element) {
            enforcings = style_enforcements(context.variant, &name);
        }
    }

    for attribute in element.attributes.iter_mut() {
        let mut value = context.localize(&attribute.value);
        let local = attribute.name.local.as_str();
        let namespace = attribute.name.namespace.as_deref();
        if local == "style" && namespace.is_none() {
            let mut style = parse_style(&value);
            for &(key, enforced) in enforcings {
                set_style(&mut style, key, enforced);
            }
            value = join_style(&style);
        }
        if local == "transform" && namespace.is_none() {
            let kind = value.split('(').next().unwrap_or("");
            if kind != "translate" && kind != "rotate" {
                return Err(ScanariumError::new(
                    ErrorKind::SvgTransformScale,
                    "SVG uses unknown transformation",
                ));
            }
        }
        if local == "href" && namespace == Some(XLINK_NS) {
            if let Some(adjustment) = context.href_adjustment {
                if !value.is_empty() && !value.starts_with('/') && !value.contains("://") {
                    value = format!("{adjustment}/{value}");
                }
            }
        }
        attribute.value = value;
    }

    for child in element.children.iter_mut() {
        match child {
            Node::Text(text) => *text = context.localize(text),
            Node::Element(child) => visit(child, enforcings, context)?,
        }
    }
    Ok(())
}

/// Draw a QR code as one SVG path. Each dark module becomes a closed
/// sub-rectangle at `(x + i*x_unit, y - (height-j-1)*y_unit)`, so the
/// placeholder rect's own position and size define the grid origin and
/// unit.
fn qr_path_string(
    scanarium: &Scanarium,
    x: f64,
    y: f64,
    x_unit: f64,
    y_unit: f64,
    data: &str,
) -> Result<String> {
    let data = abbreviate_qr(scanarium, data)?;
    let code = QrCode::with_error_correction_level(data.as_bytes(), EcLevel::L).map_err(|_| {
        ScanariumError::with_parameters(
            ErrorKind::Value,
            "Failed to encode QR code for \"{data}\"",
            &[("data", &data)],
        )
    })?;
    let width = code.width();
    let colors = code.to_colors();
    let dot = format!("h {x_unit:.6} v {y_unit:.6} h {:.6} Z", -x_unit);
    let mut path = String::new();
    for j in 0..width {
        for i in 0..width {
            if colors[j * width + i] == Color::Dark {
                let module_x = x + i as f64 * x_unit;
                let module_y = y - (width - j - 1) as f64 * y_unit;
                path.push_str(&format!("M {module_x:.6} {module_y:.6} {dot} "));
            }
        }
    }
    Ok(path)
}

fn expand_qr_pixel_to_qr_code(
    scanarium: &Scanarium,
    element: &mut Element,
    data: &str,
) -> Result<()> {
    let coordinate = |name: &str| -> Result<f64> {
        element
            .attribute(None, name)
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| {
                ScanariumError::with_parameters(
                    ErrorKind::Value,
                    "QR pixel rect lacks a numeric \"{attribute}\"",
                    &[("attribute", name)],
                )
            })
    };
    let x = coordinate("x")?;
    let y = coordinate("y")?;
    let x_unit = coordinate("width")?;
    let y_unit = coordinate("height")?;

    let path = qr_path_string(scanarium, x, y, x_unit, y_unit, data)?;
    element.name.local = "path".to_string();
    element.set_attribute("d", &path);
    for attribute in ["x", "y", "width", "height", "qr-pixel"] {
        element.remove_attribute(None, attribute);
    }
    Ok(())
}

fn expand_qr_pixels(
    scanarium: &Scanarium,
    element: &mut Element,
    command_label: &str,
    qr_data: &str,
) -> Result<()> {
    if element.is(SVG_NS, "rect") {
        if let Some(qr_pixel) = element.attribute(None, "qr-pixel").map(str::to_string) {
            if qr_pixel == command_label {
                expand_qr_pixel_to_qr_code(scanarium, element, qr_data)?;
            } else {
                // The placeholder is for another sheet type. Other
                // elements may be positioned relative to it, so it is
                // hidden rather than removed to leave the layout alone.
                element.set_attribute("style", "opacity:0");
            }
        }
    }
    for child in element.child_elements_mut() {
        expand_qr_pixels(scanarium, child, command_label, qr_data)?;
    }
    Ok(())
}

/// The deep filter pass: one walk applying text/attribute templating,
/// per-variant style enforcement, transform validation and href
/// adjustment, followed by QR placeholder expansion.
#[allow(clippy::too_many_arguments)]
pub fn filter_svg_tree(
    scanarium: &Scanarium,
    tree: &mut SvgTree,
    command: &str,
    parameter: &str,
    variant: &str,
    localizer: &Localizer,
    command_label: &str,
    parameter_label: &str,
    decoration_version: u32,
    href_adjustment: Option<&str>,
) -> Result<()> {
    let (localized_command, localized_parameter, localized_variant, localized_parameter_with_variant) =
        localize_command_parameter_variant(localizer, command, parameter, variant);
    let localized_command_label = localizer.localize_parameter("command_label", command_label);
    let localized_parameter_label =
        localizer.localize_parameter("parameter_label", parameter_label);

    let context = FilterContext {
        localizer,
        template_parameters: vec![
            ("actor_name", localized_parameter.clone()),
            ("command_label", localized_command_label),
            ("command_name", localized_command.clone()),
            ("command_name_raw", command.to_string()),
            ("parameter_label", localized_parameter_label),
            ("parameter_name", localized_parameter),
            ("parameter_with_variant_name", localized_parameter_with_variant),
            ("parameter_name_raw", parameter.to_string()),
            ("scene_name", localized_command),
            ("variant_name", localized_variant),
        ],
        variant,
        href_adjustment,
    };

    visit(&mut tree.root, &[], &context)?;

    let qr_data = format!("{command}:{parameter}:d_{decoration_version}");
    expand_qr_pixels(scanarium, &mut tree.root, command_label, &qr_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn scanarium() -> Scanarium {
        Scanarium::new(Config::default())
    }

    const SHEET: &str = r#"<?xml version="1.0"?>
<svg xmlns="http://www.w3.org/2000/svg"
     xmlns:inkscape="http://www.inkscape.org/namespaces/inkscape"
     xmlns:xlink="http://www.w3.org/1999/xlink">
  <g id="layer7" inkscape:groupmode="layer" inkscape:label="Mask">
    <rect id="contour" style="stroke:#000000;stroke-width:0.5"/>
    <text>{parameter_name}</text>
  </g>
  <g id="Detailed" inkscape:groupmode="layer" style="display:inline">
    <path style="stroke:#123456"/>
  </g>
  <g id="layer9" inkscape:groupmode="layer" inkscape:label="QR">
    <rect qr-pixel="scene" x="10" y="250" width="1.5" height="1.5"/>
    <rect qr-pixel="command" x="10" y="250" width="1.5" height="1.5"/>
  </g>
  <image xlink:href="textures/paper.png"/>
</svg>"#;

    #[test]
    fn variants_are_discovered() {
        let tree = SvgTree::parse(SHEET).unwrap();
        assert_eq!(extract_variants(&tree), vec!["".to_string(), "Detailed".to_string()]);
    }

    #[test]
    fn show_only_variant_toggles_display() {
        let mut tree = SvgTree::parse(SHEET).unwrap();
        show_only_variant(&mut tree, "");
        let detailed = tree
            .root
            .child_elements()
            .find(|el| el.attribute(None, "id") == Some("Detailed"))
            .unwrap();
        assert!(detailed.attribute(None, "style").unwrap().contains("display:none"));

        show_only_variant(&mut tree, "Detailed");
        let detailed = tree
            .root
            .child_elements()
            .find(|el| el.attribute(None, "id") == Some("Detailed"))
            .unwrap();
        assert!(detailed
            .attribute(None, "style")
            .unwrap()
            .contains("display:inline"));
    }

    #[test]
    fn filter_localizes_and_enforces_styles() {
        let mut tree = SvgTree::parse(SHEET).unwrap();
        let scanarium = scanarium();
        filter_svg_tree(
            &scanarium,
            &mut tree,
            "space",
            "SimpleRocket",
            "",
            &Localizer::identity(),
            COMMAND_LABEL_SCENE,
            PARAMETER_LABEL_ACTOR,
            1,
            Some("../.."),
        )
        .unwrap();

        let written = tree.to_string();
        // Text templating happened.
        assert!(written.contains(">SimpleRocket<"));
        // Mask layer style was enforced onto its children.
        assert!(written.contains("stroke:#808080"));
        assert!(written.contains("fill:#ffffff"));
        // Relative hrefs got the path prefix.
        assert!(written.contains("xlink:href=\"../../textures/paper.png\""));
    }

    #[test]
    fn filter_expands_matching_qr_pixel_and_hides_other() {
        let mut tree = SvgTree::parse(SHEET).unwrap();
        let scanarium = scanarium();
        filter_svg_tree(
            &scanarium,
            &mut tree,
            "space",
            "SimpleRocket",
            "",
            &Localizer::identity(),
            COMMAND_LABEL_SCENE,
            PARAMETER_LABEL_ACTOR,
            2,
            None,
        )
        .unwrap();
        let written = tree.to_string();
        // One placeholder became a path drawing modules, the other got
        // hidden but kept.
        assert!(written.contains("<path d=\"M "));
        assert!(written.contains("opacity:0"));
        assert!(!written.contains("qr-pixel=\"scene\""));
        assert!(written.contains("qr-pixel=\"command\""));
    }

    #[test]
    fn absolute_and_remote_hrefs_stay() {
        let doc = r#"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink">
            <image xlink:href="/abs/x.png"/><image xlink:href="https://example.org/x.png"/></svg>"#;
        let mut tree = SvgTree::parse(doc).unwrap();
        let scanarium = scanarium();
        filter_svg_tree(
            &scanarium,
            &mut tree,
            "space",
            "SimpleRocket",
            "",
            &Localizer::identity(),
            COMMAND_LABEL_SCENE,
            PARAMETER_LABEL_ACTOR,
            1,
            Some("../.."),
        )
        .unwrap();
        let written = tree.to_string();
        assert!(written.contains("\"/abs/x.png\""));
        assert!(written.contains("\"https://example.org/x.png\""));
    }

    #[test]
    fn scaling_transform_is_rejected() {
        let doc = r#"<svg xmlns="http://www.w3.org/2000/svg"><g transform="scale(2)"/></svg>"#;
        let mut tree = SvgTree::parse(doc).unwrap();
        let scanarium = scanarium();
        let error = filter_svg_tree(
            &scanarium,
            &mut tree,
            "space",
            "SimpleRocket",
            "",
            &Localizer::identity(),
            COMMAND_LABEL_SCENE,
            PARAMETER_LABEL_ACTOR,
            1,
            None,
        )
        .unwrap_err();
        assert_eq!(error.kind, ErrorKind::SvgTransformScale);
    }

    #[test]
    fn translate_and_rotate_pass() {
        let doc = r#"<svg xmlns="http://www.w3.org/2000/svg">
            <g transform="translate(1,2)"/><g transform="rotate(45)"/></svg>"#;
        let mut tree = SvgTree::parse(doc).unwrap();
        let scanarium = scanarium();
        filter_svg_tree(
            &scanarium,
            &mut tree,
            "space",
            "SimpleRocket",
            "",
            &Localizer::identity(),
            COMMAND_LABEL_SCENE,
            PARAMETER_LABEL_ACTOR,
            1,
            None,
        )
        .unwrap();
    }

    #[test]
    fn qr_path_covers_dark_modules() {
        let scanarium = scanarium();
        let path = qr_path_string(&scanarium, 10.0, 250.0, 1.5, 1.5, "space:SimpleRocket:d_1")
            .unwrap();
        let code =
            QrCode::with_error_correction_level(b"space:SimpleRocket:d_1", EcLevel::L).unwrap();
        let dark_modules = code
            .to_colors()
            .iter()
            .filter(|color| **color == Color::Dark)
            .count();
        assert_eq!(path.matches("M ").count(), dark_modules);
        assert!(path.contains("h 1.500000 v 1.500000 h -1.500000 Z"));
    }

    #[test]
    fn appended_layers_arrive_at_top_level() {
        let mut base = SvgTree::parse(SHEET).unwrap();
        let decoration = SvgTree::parse(
            r#"<svg xmlns="http://www.w3.org/2000/svg"
                    xmlns:inkscape="http://www.inkscape.org/namespaces/inkscape">
                <g id="layer1" inkscape:groupmode="layer" inkscape:label="Frame"/>
               </svg>"#,
        )
        .unwrap();
        let before = base.root.child_elements().count();
        append_svg_layers(&mut base, &decoration);
        assert_eq!(base.root.child_elements().count(), before + 1);
    }
}
