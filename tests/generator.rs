//! Full generator runs against a fixture scene tree, with the external
//! vector rasterizer and PDF concatenator replaced by recording stubs.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Result;
use assert_fs::TempDir;
use serde_json::Value;

use scanarium::config::Config;
use scanarium::context::Scanarium;
use scanarium::generate;
use scanarium::generate::mask::MaskCrop;

const UNDECORATED: &str = r#"<svg xmlns="http://www.w3.org/2000/svg"
    xmlns:inkscape="http://www.inkscape.org/namespaces/inkscape"
    width="100mm" height="70mm">
  <g id="layer1" inkscape:groupmode="layer" inkscape:label="Mask">
    <rect id="contour" x="5" y="5" width="90" height="60"
          style="fill:none;stroke:#000000;stroke-width:0.5"/>
    <path id="bug" style="fill:none;stroke:#000000;stroke-width:0.5"
          d="M 30 30 h 40 v 20 h -40 Z"/>
  </g>
  <g id="layer2" inkscape:groupmode="layer" inkscape:label="Overlay">
    <text style="font-size:4">{parameter_name}</text>
  </g>
</svg>"#;

const DECORATION: &str = r#"<svg xmlns="http://www.w3.org/2000/svg"
    xmlns:inkscape="http://www.inkscape.org/namespaces/inkscape">
  <g id="layer1" inkscape:groupmode="layer" inkscape:label="Frame">
    <rect qr-pixel="scene" x="8" y="62" width="1.2" height="1.2"/>
    <text>{command_label}: {command_name}</text>
  </g>
</svg>"#;

fn write_executable(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content)?;
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

struct Fixture {
    dir: TempDir,
    scanarium: Scanarium,
}

impl Fixture {
    fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let conf = dir.path().join("conf");
        let scenes = dir.path().join("scenes");
        let actor_dir = scenes.join("fairies/actors/RoundBug");
        fs::create_dir_all(&conf)?;
        fs::create_dir_all(&actor_dir)?;

        fs::write(conf.join("decoration-d-1.svg"), DECORATION)?;
        fs::write(actor_dir.join("RoundBug-undecorated-d-1.svg"), UNDECORATED)?;

        // The bitmap the stub rasterizer "renders" for mask exports.
        let mut mask = image::GrayImage::new(100, 70);
        for y in 20..=40u32 {
            for x in 30..=60u32 {
                mask.put_pixel(x, y, image::Luma([255]));
            }
        }
        let mask_fixture = dir.path().join("rendered-mask.png");
        mask.save(&mask_fixture)?;

        // Stub rasterizer: answers geometry queries and writes the
        // requested export targets.
        let inkscape = dir.path().join("inkscape-stub");
        write_executable(
            &inkscape,
            &format!(
                r#"#!/bin/sh
out_pdf=""
out_png=""
query=0
for arg in "$@"; do
  case "$arg" in
    --query-all) query=1 ;;
    --export-pdf=*) out_pdf="${{arg#--export-pdf=}}" ;;
    --export-png=*) out_png="${{arg#--export-png=}}" ;;
  esac
done
if [ "$query" = 1 ]; then
  printf 'svg42,0,0,100,70\ncontour,5,5,90,60\n'
  exit 0
fi
[ -n "$out_pdf" ] && printf '%%PDF-1.4 stub\n' > "$out_pdf"
[ -n "$out_png" ] && cp '{mask_fixture}' "$out_png"
exit 0
"#,
                mask_fixture = mask_fixture.display()
            ),
        )?;

        // Stub concatenator: writes its last argument.
        let pdfunite = dir.path().join("pdfunite-stub");
        write_executable(
            &pdfunite,
            "#!/bin/sh\nfor last; do :; done\nprintf '%%PDF book\\n' > \"$last\"\n",
        )?;

        let config = Config::parse(&format!(
            r##"{{
                "directories": {{
                    "config": "{conf}",
                    "scenes": "{scenes}",
                    "localization": "{l10n}"
                }},
                "programs": {{
                    "inkscape": "{inkscape}",
                    "pdfunite": "{pdfunite}"
                }},
                "mask": {{
                    "dpi": 150,
                    "stroke_offset": 0.4,
                    "stroke_color": "#ffffff"
                }}
            }}"##,
            conf = conf.display(),
            scenes = scenes.display(),
            l10n = dir.path().join("localization").display(),
            inkscape = inkscape.display(),
            pdfunite = pdfunite.display(),
        ))?;
        let scanarium = Scanarium::new(config);
        Ok(Fixture { dir, scanarium })
    }

    fn actor_dir(&self) -> PathBuf {
        self.dir.path().join("scenes/fairies/actors/RoundBug")
    }

    fn generate(&self) -> Result<()> {
        generate::regenerate_static_content(&self.scanarium, None, None, Some("fallback"), false)?;
        Ok(())
    }

    /// Snapshot path -> mtime for everything under the fixture tree.
    fn mtimes(&self) -> BTreeMap<PathBuf, SystemTime> {
        fn walk(dir: &Path, into: &mut BTreeMap<PathBuf, SystemTime>) {
            let Ok(entries) = fs::read_dir(dir) else {
                return;
            };
            for entry in entries.filter_map(|entry| entry.ok()) {
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, into);
                } else if let Ok(modified) =
                    entry.metadata().and_then(|meta| meta.modified())
                {
                    into.insert(path, modified);
                }
            }
        }
        let mut mtimes = BTreeMap::new();
        walk(self.dir.path(), &mut mtimes);
        mtimes
    }
}

#[test]
fn generates_sheet_artifacts_and_masks() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.generate()?;
    let actor_dir = fixture.actor_dir();

    // Localized sheet SVG with the QR placeholder expanded into a path.
    let sheet_svg = actor_dir.join("pdfs/fallback/RoundBug.svg");
    let rendered = fs::read_to_string(&sheet_svg)?;
    assert!(rendered.contains("<path d=\"M "), "QR path expansion missing");
    assert!(!rendered.contains("qr-pixel"), "placeholder survived");
    assert!(rendered.contains(">RoundBug<"), "text templating missing");
    assert!(rendered.contains("scene: fairies"), "label templating missing");

    // The printable PDF was rendered next to it.
    assert!(actor_dir.join("pdfs/fallback/RoundBug.pdf").is_file());

    // Both mask bitmaps plus adapted sources exist.
    assert!(actor_dir.join("RoundBug-mask-effective-d-1.png").is_file());
    assert!(actor_dir.join("RoundBug-mask-unadapted-d-1.png").is_file());
    // The filter pass enforces the Mask contour width (0.75590551); the
    // effective variant then inflates it by the configured 0.4 offset.
    let effective_svg = fs::read_to_string(actor_dir.join("RoundBug-mask-effective-d-1.svg"))?;
    assert!(
        effective_svg.contains("stroke-width:1.15"),
        "effective mask misses the stroke inflation"
    );
    assert!(effective_svg.contains("stroke:#ffffff"));
    let unadapted_svg = fs::read_to_string(actor_dir.join("RoundBug-mask-unadapted-d-1.svg"))?;
    assert!(unadapted_svg.contains("stroke-width:0.75590551"));

    // The sidecar describes the unadapted bitmap's drawing bounds.
    let sidecar: MaskCrop = serde_json::from_str(&fs::read_to_string(
        actor_dir.join("RoundBug-mask-effective-d-1.json"),
    )?)?;
    assert_eq!(
        sidecar,
        MaskCrop {
            width: 100,
            height: 70,
            x_min: 30,
            y_min: 20,
            x_max_inc: 61,
            y_max_inc: 41,
        }
    );

    // Scene book and listings.
    let scenes_root = fixture.dir.path().join("scenes");
    assert!(scenes_root
        .join("fairies/pdfs/fallback/All fairies coloring pages.pdf")
        .is_file());
    let scenes: Vec<String> =
        serde_json::from_str(&fs::read_to_string(scenes_root.join("scenes.json"))?)?;
    assert_eq!(scenes, vec!["fairies".to_string()]);
    let variants: Value = serde_json::from_str(&fs::read_to_string(
        scenes_root.join("fairies/actor-variants.json"),
    )?)?;
    assert_eq!(variants["RoundBug"], serde_json::json!([""]));

    // No half-rendered temporaries anywhere.
    for path in fixture.mtimes().keys() {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        assert!(!name.contains(".tmp."), "leftover temporary {path:?}");
    }
    Ok(())
}

#[test]
fn old_decoration_versions_stay_buildable() -> Result<()> {
    let fixture = Fixture::new()?;
    // A second decoration version arrives while the version-1 actor
    // source is still around: old printouts must keep their masks.
    fs::write(fixture.dir.path().join("conf/decoration-d-2.svg"), DECORATION)?;
    fs::write(
        fixture.actor_dir().join("RoundBug-undecorated-d-2.svg"),
        UNDECORATED,
    )?;

    fixture.generate()?;
    let actor_dir = fixture.actor_dir();

    for version in [1, 2] {
        for artifact in [
            format!("RoundBug-mask-effective-d-{version}.png"),
            format!("RoundBug-mask-unadapted-d-{version}.png"),
            format!("RoundBug-mask-effective-d-{version}.json"),
        ] {
            assert!(actor_dir.join(&artifact).is_file(), "missing {artifact}");
        }
    }

    // The newest version owns the plain localized name; the old sheet
    // coexists under its version tag, with its QR code expanded.
    assert!(actor_dir.join("pdfs/fallback/RoundBug.svg").is_file());
    assert!(actor_dir.join("pdfs/fallback/RoundBug.pdf").is_file());
    assert!(actor_dir.join("pdfs/fallback/RoundBug-d-1.svg").is_file());
    assert!(actor_dir.join("pdfs/fallback/RoundBug-d-1.pdf").is_file());
    let old_sheet = fs::read_to_string(actor_dir.join("pdfs/fallback/RoundBug-d-1.svg"))?;
    assert!(old_sheet.contains("<path d=\"M "));
    Ok(())
}

#[test]
fn second_run_writes_nothing() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.generate()?;
    let before = fixture.mtimes();
    fixture.generate()?;
    let after = fixture.mtimes();
    assert_eq!(before, after, "an unchanged tree must not be rewritten");
    Ok(())
}

#[test]
fn hidden_parameters_stay_out_of_listings() -> Result<()> {
    let fixture = Fixture::new()?;
    let hidden_dir = fixture.dir.path().join("scenes/fairies/actors/SecretBug");
    fs::create_dir_all(&hidden_dir)?;
    fs::write(hidden_dir.join("SecretBug-undecorated-d-1.svg"), UNDECORATED)?;
    fs::write(hidden_dir.join("hidden"), b"")?;

    fixture.generate()?;

    let variants: Value = serde_json::from_str(&fs::read_to_string(
        fixture.dir.path().join("scenes/fairies/actor-variants.json"),
    )?)?;
    assert!(variants.get("SecretBug").is_none());
    // The sheet itself is still generated, it is just unlisted.
    assert!(hidden_dir.join("pdfs/fallback/SecretBug.pdf").is_file());
    Ok(())
}

#[test]
fn force_rebuilds_fresh_targets() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.generate()?;
    let before = fixture.mtimes();
    std::thread::sleep(std::time::Duration::from_millis(20));
    generate::regenerate_static_content(&fixture.scanarium, None, None, Some("fallback"), true)?;
    let after = fixture.mtimes();
    let sheet_pdf = fixture.actor_dir().join("pdfs/fallback/RoundBug.pdf");
    assert!(after[&sheet_pdf] > before[&sheet_pdf], "--force must re-render");
    Ok(())
}
