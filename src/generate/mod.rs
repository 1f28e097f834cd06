pub mod filter;
pub mod mask;
pub mod svg;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;

use crate::context::Scanarium;
use crate::error::{ErrorKind, Result, ScanariumError};
use crate::generate::filter::{
    extract_variants, filter_svg_tree, localize_command_parameter_variant, show_only_variant,
    COMMAND_LABEL_SCENE, PARAMETER_LABEL_ACTOR,
};
use crate::generate::svg::SvgTree;
use crate::localize::{expand_languages, Localizer};

const ARTIFACT_DPI: u32 = 150;
const ARTIFACT_QUALITY: u32 = 75;

/// Run the vector rasterizer with the flags every invocation shares.
pub(crate) fn run_inkscape(scanarium: &Scanarium, arguments: &[String]) -> Result<String> {
    let mut command = vec![
        scanarium.config().string("programs", "inkscape")?,
        "--without-gui".to_string(),
        "--export-text-to-path".to_string(),
    ];
    command.extend(arguments.iter().cloned());
    scanarium.run(&command)
}

fn assert_directory(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(ScanariumError::with_parameters(
            ErrorKind::NoDir,
            "Is not a directory \"{file_name}\"",
            &[("file_name", &dir.display().to_string())],
        ));
    }
    Ok(())
}

/// Make a localized display name safe as a filename.
fn to_safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, ' ' | '(' | ')' | '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Per-language keyword list for artifact metadata, if present.
fn read_keywords(dir: &Path, language: &str) -> (Vec<String>, Option<PathBuf>) {
    let keywords_file = dir.join("keywords").join(format!("{language}.txt"));
    match fs::read_to_string(&keywords_file) {
        Ok(raw) => (
            raw.split_whitespace().map(str::to_string).collect(),
            Some(keywords_file),
        ),
        Err(_) => (Vec::new(), None),
    }
}

/// The pieces of artifact metadata that vary per sheet.
#[derive(Clone, Debug, Default)]
struct ArtifactMetadata {
    coloring_page_l10n: Option<String>,
    localized_command: Option<String>,
    localized_parameter_with_variant: Option<String>,
    keywords: Vec<String>,
}

/// Embed title/description/keywords/copyright/license into an artifact,
/// when metadata embedding is enabled.
fn embed_artifact_metadata(
    scanarium: &Scanarium,
    target: &Path,
    metadata: &ArtifactMetadata,
) -> Result<()> {
    let config = scanarium.config();
    if !config.boolean_or_false("cgi:regenerate-static-content", "embed_metadata")? {
        return Ok(());
    }
    let get = |key: &str| config.string("cgi:regenerate-static-content", key);
    let attribution_name = get("attribution_name")?;
    let attribution_url = get("attribution_url")?;
    let rights_url = get("rights_url")?;
    let license_name = get("license_name")?;
    let license_url = get("license_url")?;
    let copyright_year = get("copyright_year")?;
    let copyright = format!(
        "Copyright (C) {copyright_year}  {attribution_name}. {attribution_url} \
         This work is licensed under {license_name}. See {license_url}"
    );

    let mut keywords = vec!["Scanarium".to_string()];
    for value in [
        &metadata.localized_command,
        &metadata.coloring_page_l10n,
        &metadata.localized_parameter_with_variant,
    ] {
        if let Some(value) = value {
            keywords.push(value.clone());
        }
    }
    keywords.reverse();
    keywords.extend(metadata.keywords.iter().cloned());

    let title = metadata
        .localized_parameter_with_variant
        .clone()
        .unwrap_or_else(|| attribution_name.clone());

    scanarium.embed_metadata(
        target,
        &[
            ("XMP-dc:Title".to_string(), title),
            ("XMP-dc:Description".to_string(), keywords.join(" ")),
            ("XMP-dc:Subject".to_string(), keywords.join(", ")),
            ("XMP-dc:Rights".to_string(), copyright),
            ("XMP-xmp:CreatorTool".to_string(), attribution_name),
            ("XMP-xmpRights:WebStatement".to_string(), rights_url),
            ("XMP-cc:License".to_string(), license_url),
        ],
    )
}

fn move_into_place(target_tmp: &Path, target: &Path) -> Result<()> {
    fs::rename(target_tmp, target).map_err(|error| {
        let _ = fs::remove_file(target_tmp);
        ScanariumError::with_parameters(
            ErrorKind::Value,
            "Failed to move \"{file_name}\" into place: {error}",
            &[
                ("file_name", &target.display().to_string()),
                ("error", &error.to_string()),
            ],
        )
    })
}

/// Render the printable targets of one localized sheet SVG: PDF always,
/// PNG/JPG per configuration. Each render goes to a `.tmp.<ext>` sibling
/// and is moved into place only when complete.
fn generate_pdf(
    scanarium: &Scanarium,
    svg_source: &Path,
    force: bool,
    metadata: &ArtifactMetadata,
) -> Result<PathBuf> {
    let config = scanarium.config();
    let mut formats = vec!["pdf"];
    for format in ["png", "jpg"] {
        if config.boolean_or_false("cgi:regenerate-static-content", &format!("generate_{format}"))? {
            formats.push(format);
        }
    }

    for format in formats {
        let target = svg_source.with_extension(format);
        // The doubled extension keeps the converters able to sniff the
        // intended output format.
        let target_tmp = svg_source.with_extension(format!("tmp.{format}"));
        match format {
            "pdf" | "png" => {
                if scanarium.file_needs_update(&target, &[svg_source.to_path_buf()], force) {
                    let mut arguments = vec![
                        "--export-area-page".to_string(),
                        format!("--export-dpi={ARTIFACT_DPI}"),
                        format!("--export-{format}={}", target_tmp.display()),
                    ];
                    if format == "png" {
                        arguments.push("--export-background=white".to_string());
                    }
                    arguments.push(svg_source.display().to_string());
                    run_inkscape(scanarium, &arguments)?;
                    embed_artifact_metadata(scanarium, &target_tmp, metadata)?;
                    move_into_place(&target_tmp, &target)?;
                }
            }
            _ => {
                let source = svg_source.with_extension("png");
                if !config.boolean_or_false("cgi:regenerate-static-content", "generate_png")? {
                    return Err(ScanariumError::with_parameters(
                        ErrorKind::RegenerateNoSourceForTarget,
                        "You need to enable `cgi:regenerate-static-content.generate_png` to \
                         generate the target file {target_file}.",
                        &[("target_file", &target.display().to_string())],
                    ));
                }
                if scanarium.file_needs_update(&target, &[source.clone()], force) {
                    let command = vec![
                        config.string("programs", "convert")?,
                        source.display().to_string(),
                        "-units".to_string(),
                        "pixelsperinch".to_string(),
                        "-background".to_string(),
                        "white".to_string(),
                        "-flatten".to_string(),
                        "-density".to_string(),
                        ARTIFACT_DPI.to_string(),
                        "-quality".to_string(),
                        ARTIFACT_QUALITY.to_string(),
                        target_tmp.display().to_string(),
                    ];
                    scanarium.run(&command)?;
                    embed_artifact_metadata(scanarium, &target_tmp, metadata)?;
                    move_into_place(&target_tmp, &target)?;
                }
            }
        }
    }

    Ok(svg_source.with_extension("pdf"))
}

/// The decoration versions a sheet is built for: every version that
/// still has an undecorated source, and always the newest one, so old
/// printouts keep their scan-side artifacts. Ascending order.
pub(crate) fn build_versions(
    scanarium: &Scanarium,
    dir: &Path,
    parameter: &str,
) -> Result<Vec<u32>> {
    let latest = scanarium.latest_decoration_version()?;
    let mut versions = Vec::new();
    for version in 1..=latest {
        if version == latest
            || scanarium
                .versioned_filename(dir, &format!("{parameter}-undecorated"), "svg", version)
                .is_file()
        {
            versions.push(version);
        }
    }
    Ok(versions)
}

/// Compose the full layered tree for a sheet: the undecorated actor
/// drawing, the shared decoration, and the scene's extra decoration when
/// present. Reports the source files for staleness checks.
pub(crate) fn generate_full_svg_tree(
    scanarium: &Scanarium,
    dir: &Path,
    parameter: &str,
    decoration_version: u32,
) -> Result<(SvgTree, Vec<PathBuf>)> {
    let undecorated_name = scanarium.versioned_filename(
        dir,
        &format!("{parameter}-undecorated"),
        "svg",
        decoration_version,
    );
    let decoration_name = scanarium.versioned_filename(
        &scanarium.config_dir_abs()?,
        "decoration",
        "svg",
        decoration_version,
    );
    let mut sources = vec![undecorated_name.clone(), decoration_name.clone()];

    let mut tree = SvgTree::parse_file(&undecorated_name)?;
    filter::append_svg_layers(&mut tree, &SvgTree::parse_file(&decoration_name)?);

    let extra_decoration_name = scanarium.versioned_filename(
        dir.parent().unwrap_or(dir),
        "extra-decoration",
        "svg",
        decoration_version,
    );
    if extra_decoration_name.is_file() {
        sources.push(extra_decoration_name.clone());
        filter::append_svg_layers(&mut tree, &SvgTree::parse_file(&extra_decoration_name)?);
    }

    Ok((tree, sources))
}

/// Produce every artifact of one `(sheet, variant, language, decoration
/// version)` tuple. The newest decoration version owns the plain
/// localized filename; older versions carry their version tag so both
/// can coexist next to each other.
#[allow(clippy::too_many_arguments)]
fn svg_variant_pipeline(
    scanarium: &Scanarium,
    dir: &Path,
    command: &str,
    parameter: &str,
    variant: &str,
    mut tree: SvgTree,
    sources: &[PathBuf],
    is_actor: bool,
    language: &str,
    force: bool,
    command_label: &str,
    parameter_label: &str,
    decoration_version: u32,
    is_latest: bool,
) -> Result<PathBuf> {
    let localizer = scanarium.localizer(language)?;
    let (localized_command, _, _, localized_parameter_with_variant) =
        localize_command_parameter_variant(&localizer, command, parameter, variant);

    let safe_name = to_safe_filename(&localized_parameter_with_variant);
    let base_name = if is_latest {
        format!("{safe_name}.svg")
    } else {
        format!("{safe_name}-d-{decoration_version}.svg")
    };
    let pdf_dir = dir.join("pdfs").join(language);
    fs::create_dir_all(&pdf_dir).map_err(|error| {
        ScanariumError::with_parameters(
            ErrorKind::Value,
            "Failed to create \"{dir}\": {error}",
            &[
                ("dir", &pdf_dir.display().to_string()),
                ("error", &error.to_string()),
            ],
        )
    })?;
    let full_svg_name = pdf_dir.join(&base_name);

    let (keywords, keywords_file) = read_keywords(dir, language);
    let mut sources = sources.to_vec();
    if let Some(keywords_file) = keywords_file {
        sources.push(keywords_file);
    }

    let metadata = ArtifactMetadata {
        coloring_page_l10n: is_actor.then(|| localizer.localize("coloring page", &[])),
        localized_command: is_actor.then_some(localized_command),
        localized_parameter_with_variant: is_actor.then_some(localized_parameter_with_variant),
        keywords,
    };

    if scanarium.file_needs_update(&full_svg_name, &sources, force) {
        show_only_variant(&mut tree, variant);
        filter_svg_tree(
            scanarium,
            &mut tree,
            command,
            parameter,
            variant,
            &localizer,
            command_label,
            parameter_label,
            decoration_version,
            Some("../.."),
        )?;
        tree.write_file(&full_svg_name)?;
        embed_artifact_metadata(scanarium, &full_svg_name, &metadata)?;
    }

    generate_pdf(scanarium, &full_svg_name, force, &metadata)
}

fn regenerate_pdf_actor_books_for_language(
    scanarium: &Scanarium,
    actors_dir: &Path,
    scene: &str,
    language: &str,
    pdfs: &[PathBuf],
    force: bool,
) -> Result<()> {
    let localizer = scanarium.localizer(language)?;
    let target_dir = actors_dir
        .parent()
        .unwrap_or(actors_dir)
        .join("pdfs")
        .join(language);
    let book_name = to_safe_filename(&localizer.localize(
        "All {scene_name} coloring pages",
        &[("scene_name", scene.to_string())],
    ));
    let target_file = target_dir.join(format!("{book_name}.pdf"));

    if scanarium.file_needs_update(&target_file, pdfs, force) {
        let _ = fs::create_dir_all(&target_dir);
        let mut pdfs = pdfs.to_vec();
        pdfs.sort_by_key(|pdf| pdf.file_name().map(|name| name.to_os_string()));
        let target_tmp = target_file.with_extension("tmp.pdf");
        let mut command = vec![scanarium.config().string("programs", "pdfunite")?];
        command.extend(pdfs.iter().map(|pdf| pdf.display().to_string()));
        command.push(target_tmp.display().to_string());
        scanarium.run(&command)?;
        move_into_place(&target_tmp, &target_file)?;
    }
    Ok(())
}

fn regenerate_pdf_actor_books(
    scanarium: &Scanarium,
    actors_dir: &Path,
    scene: &str,
    pdfs_by_language: &BTreeMap<String, Vec<PathBuf>>,
    force: bool,
) -> Result<()> {
    for (language, pdfs) in pdfs_by_language {
        regenerate_pdf_actor_books_for_language(scanarium, actors_dir, scene, language, pdfs, force)?;
    }
    Ok(())
}

/// Regenerate one sheet: every variant in every requested language, for
/// every decoration version that still has a source, plus the masks when
/// the sheet is an actor. Listings and books only carry the newest
/// version's artifacts.
fn regenerate_static_content_command_parameter(
    scanarium: &Scanarium,
    dir: &Path,
    command: &str,
    parameter: &str,
    is_actor: bool,
    language: Option<&str>,
    force: bool,
) -> Result<(Vec<String>, BTreeMap<String, Vec<PathBuf>>)> {
    let command_label = if is_actor { COMMAND_LABEL_SCENE } else { "command" };
    let parameter_label = if is_actor { PARAMETER_LABEL_ACTOR } else { "parameter" };
    log::debug!(
        "regenerating content for {command_label} {command:?}, {parameter_label} {parameter:?} ..."
    );

    assert_directory(dir)?;

    let latest = scanarium.latest_decoration_version()?;
    let mut variants: Vec<String> = vec![String::new()];
    let mut pdfs_by_language: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for decoration_version in build_versions(scanarium, dir, parameter)? {
        let is_latest = decoration_version == latest;
        let (raw_tree, sources) =
            generate_full_svg_tree(scanarium, dir, parameter, decoration_version)?;
        let mut version_variants = extract_variants(&raw_tree);
        version_variants.sort();

        for language in expand_languages(&scanarium.localization_dir_abs()?, language) {
            for variant in &version_variants {
                let pdf_name = svg_variant_pipeline(
                    scanarium,
                    dir,
                    command,
                    parameter,
                    variant,
                    raw_tree.clone(),
                    &sources,
                    is_actor,
                    &language,
                    force,
                    command_label,
                    parameter_label,
                    decoration_version,
                    is_latest,
                )?;
                if is_latest {
                    pdfs_by_language.entry(language.clone()).or_default().push(pdf_name);
                }
            }
        }

        if is_latest {
            variants = version_variants;
        }
    }

    if is_actor {
        mask::regenerate_masks(scanarium, dir, command, parameter, force)?;
    }

    Ok((variants, pdfs_by_language))
}

fn regenerate_static_content_command_parameters(
    scanarium: &Scanarium,
    dir: &Path,
    command: &str,
    parameter_arg: Option<&str>,
    is_actor: bool,
    language: Option<&str>,
    force: bool,
) -> Result<()> {
    let parameters: Vec<String> = match parameter_arg {
        Some(parameter) => vec![parameter.to_string()],
        None => fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
                    .sorted()
                    .collect()
            })
            .unwrap_or_default(),
    };

    let mut command_variants: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut command_pdfs: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for parameter in parameters {
        let parameter_dir = dir.join(&parameter);
        if !parameter_dir.is_dir() {
            continue;
        }
        let (variants, pdfs_by_language) = regenerate_static_content_command_parameter(
            scanarium,
            &parameter_dir,
            command,
            &parameter,
            is_actor,
            language,
            force,
        )?;
        if !parameter_dir.join("hidden").exists() {
            command_variants.insert(parameter.clone(), variants);
            for (language, pdfs) in pdfs_by_language {
                command_pdfs.entry(language).or_default().extend(pdfs);
            }
        }
    }

    if is_actor && parameter_arg.is_none() {
        scanarium.dump_json(
            &dir.parent().unwrap_or(dir).join("actor-variants.json"),
            &command_variants,
        )?;
        regenerate_pdf_actor_books(scanarium, dir, command, &command_pdfs, force)?;
    }
    Ok(())
}

fn regenerate_static_content_commands(
    scanarium: &Scanarium,
    root: &Path,
    command_arg: Option<&str>,
    parameter: Option<&str>,
    is_actor: bool,
    language: Option<&str>,
    force: bool,
) -> Result<()> {
    if !root.is_dir() {
        return Ok(());
    }
    let commands: Vec<String> = match command_arg {
        Some(command) => vec![command.to_string()],
        None => fs::read_dir(root)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
                    .sorted()
                    .collect()
            })
            .unwrap_or_default(),
    };

    let mut scenes = Vec::new();
    for command in commands {
        let mut command_dir = root.join(&command);
        if !command_dir.is_dir() {
            continue;
        }
        if is_actor {
            command_dir = command_dir.join("actors");
            scenes.push(command.clone());
        }
        if command_dir.is_dir() {
            regenerate_static_content_command_parameters(
                scanarium,
                &command_dir,
                &command,
                parameter,
                is_actor,
                language,
                force,
            )?;
        }
    }

    if is_actor && command_arg.is_none() {
        scanarium.dump_json(&root.join("scenes.json"), &scenes)?;
    }
    Ok(())
}

/// The generator entry point: walk the command tree and the scene tree,
/// in lexicographic order so output books come out deterministic.
pub fn regenerate_static_content(
    scanarium: &Scanarium,
    command: Option<&str>,
    parameter: Option<&str>,
    language: Option<&str>,
    force: bool,
) -> Result<()> {
    regenerate_static_content_commands(
        scanarium,
        &scanarium.commands_dir_abs()?,
        command,
        parameter,
        false,
        language,
        force,
    )?;
    regenerate_static_content_commands(
        scanarium,
        &scanarium.scenes_dir_abs()?,
        command,
        parameter,
        true,
        language,
        force,
    )
}
