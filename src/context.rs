use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{ErrorKind, Result, ScanariumError};
use crate::exec::{self, RunError, DEFAULT_TIMEOUT};
use crate::localize::Localizer;
use crate::scan::prepare::BrightnessFactor;

/// Process-wide context: configuration, directory roots, the external
/// process primitive, and the per-process caches. One request or one
/// generation pass runs at a time, so nothing here is thread-shared.
pub struct Scanarium {
    config: Config,
    brightness_factor: RefCell<Option<Option<Rc<BrightnessFactor>>>>,
    latest_decoration_version: Cell<Option<u32>>,
    next_raw_image_store: Cell<f64>,
}

impl Scanarium {
    pub fn new(config: Config) -> Self {
        Scanarium {
            config,
            brightness_factor: RefCell::new(None),
            latest_decoration_version: Cell::new(None),
            next_raw_image_store: Cell::new(0.0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_dir_abs(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.config.string_or("directories", "config", "conf")?))
    }

    pub fn scenes_dir_abs(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.config.string_or("directories", "scenes", "scenes")?))
    }

    pub fn commands_dir_abs(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.config.string_or("directories", "commands", "commands")?))
    }

    pub fn dynamic_dir_abs(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.config.string_or("directories", "dynamic", "dynamic")?))
    }

    pub fn localization_dir_abs(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.config.string_or(
            "directories",
            "localization",
            "localization",
        )?))
    }

    /// Expand a leading `%CONF_DIR%` to the configuration directory.
    pub fn expand_config_dir(&self, path: &str) -> Result<PathBuf> {
        match path.strip_prefix("%CONF_DIR%") {
            Some(rest) => Ok(self.config_dir_abs()?.join(rest.trim_start_matches('/'))),
            None => Ok(PathBuf::from(path)),
        }
    }

    pub fn localizer(&self, language: &str) -> Result<Localizer> {
        if language == "fallback" {
            return Ok(Localizer::identity());
        }
        Ok(Localizer::load(&self.localization_dir_abs()?, language))
    }

    /// Run an external program, mapping failures onto the canonical error
    /// codes. Callers that need to distinguish spawn failures keep using
    /// [`exec::run`] directly.
    pub fn run<S: AsRef<str>>(&self, command: &[S]) -> Result<String> {
        self.run_with_timeout(command, DEFAULT_TIMEOUT)
    }

    pub fn run_with_timeout<S: AsRef<str>>(
        &self,
        command: &[S],
        timeout: Duration,
    ) -> Result<String> {
        exec::run(command, timeout).map_err(|error| match error {
            RunError::Timeout { command, timeout } => ScanariumError::with_parameters(
                ErrorKind::Timeout,
                "The command \"{command}\" did not finish within {timeout} seconds",
                &[
                    ("command", &command),
                    ("timeout", &timeout.as_secs().to_string()),
                ],
            ),
            RunError::ReturnValue { command, .. } => ScanariumError::with_parameters(
                ErrorKind::ReturnValue,
                "The command \"{command}\" did not return 0",
                &[("command", &command)],
            ),
            RunError::Os(os_error) => ScanariumError::with_parameters(
                ErrorKind::Value,
                "Failed to execute command: {error}",
                &[("error", &os_error.to_string())],
            ),
        })
    }

    /// `{base}-d-{version}.{extension}` inside `dir`; the filename scheme
    /// shared by sheet sources, masks and decorations.
    pub fn versioned_filename(
        &self,
        dir: &Path,
        base: &str,
        extension: &str,
        version: u32,
    ) -> PathBuf {
        dir.join(format!("{base}-d-{version}.{extension}"))
    }

    /// Whether `target` has to be (re-)built from `sources`.
    pub fn file_needs_update(&self, target: &Path, sources: &[PathBuf], force: bool) -> bool {
        if force || !target.exists() {
            return true;
        }
        let target_mtime = match fs::metadata(target).and_then(|meta| meta.modified()) {
            Ok(mtime) => mtime,
            Err(_) => return true,
        };
        sources.iter().any(|source| {
            match fs::metadata(source).and_then(|meta| meta.modified()) {
                Ok(mtime) => mtime > target_mtime,
                Err(_) => true,
            }
        })
    }

    /// Serialize `value` to `path`, creating parent directories. The write
    /// is skipped when the file already holds the same content, so an
    /// unchanged generation pass leaves no trace on disk.
    pub fn dump_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let rendered = serde_json::to_string_pretty(value).map_err(|error| {
            ScanariumError::with_parameters(
                ErrorKind::Value,
                "Failed to serialize JSON for \"{file_name}\": {error}",
                &[
                    ("file_name", &path.display().to_string()),
                    ("error", &error.to_string()),
                ],
            )
        })?;
        if let Ok(current) = fs::read_to_string(path) {
            if current == rendered {
                return Ok(());
            }
        }
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        fs::write(path, rendered).map_err(|error| {
            ScanariumError::with_parameters(
                ErrorKind::Value,
                "Failed to write \"{file_name}\": {error}",
                &[
                    ("file_name", &path.display().to_string()),
                    ("error", &error.to_string()),
                ],
            )
        })
    }

    pub fn timestamp_for_filename(&self) -> String {
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S_%3f").to_string()
    }

    /// Embed XMP metadata into an artifact through the configured metadata
    /// tool. A missing tool configuration disables embedding.
    pub fn embed_metadata(&self, file: &Path, tags: &[(String, String)]) -> Result<()> {
        let Some(exiftool) = self.config.opt_string("programs", "exiftool")? else {
            return Ok(());
        };
        let mut command = vec![exiftool, "-overwrite_original".to_string(), "-q".to_string()];
        command.extend(tags.iter().map(|(tag, value)| format!("-{tag}={value}")));
        command.push(file.display().to_string());
        self.run(&command)?;
        Ok(())
    }

    /// The per-process brightness-normalization factor, computed on first
    /// use from `scan.max_brightness` (`None` when unconfigured).
    pub fn brightness_factor(&self) -> Result<Option<Rc<BrightnessFactor>>> {
        if let Some(cached) = self.brightness_factor.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let computed = crate::scan::prepare::load_brightness_factor(self)?.map(Rc::new);
        *self.brightness_factor.borrow_mut() = Some(computed.clone());
        Ok(computed)
    }

    /// Highest decoration version available in the configuration
    /// directory; read once per process.
    pub fn latest_decoration_version(&self) -> Result<u32> {
        if let Some(version) = self.latest_decoration_version.get() {
            return Ok(version);
        }
        let config_dir = self.config_dir_abs()?;
        let mut best: Option<u32> = None;
        if let Ok(entries) = fs::read_dir(&config_dir) {
            for entry in entries.filter_map(|entry| entry.ok()) {
                if let Some(name) = entry.file_name().to_str() {
                    if let Some(version) = parse_decoration_version(name) {
                        best = Some(best.map_or(version, |b| b.max(version)));
                    }
                }
            }
        }
        let version = best.ok_or_else(|| {
            ScanariumError::with_parameters(
                ErrorKind::ConfigMissing,
                "No decoration-d-<N>.svg found in \"{dir}\"",
                &[("dir", &config_dir.display().to_string())],
            )
        })?;
        self.latest_decoration_version.set(Some(version));
        Ok(version)
    }

    /// Wall-clock gate for the optional raw-frame dump.
    pub fn raw_image_store_due(&self, now: f64) -> bool {
        now >= self.next_raw_image_store.get()
    }

    pub fn schedule_next_raw_image_store(&self, at: f64) {
        self.next_raw_image_store.set(at);
    }
}

/// Parse `decoration-d-<N>.svg` into `N`. `N` is a positive decimal
/// without leading zeroes; anything else is not part of the version
/// pool.
fn parse_decoration_version(name: &str) -> Option<u32> {
    let digits = name
        .strip_prefix("decoration-d-")?
        .strip_suffix(".svg")?;
    if digits.is_empty()
        || digits.starts_with('0')
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoration_version_parsing() {
        assert_eq!(parse_decoration_version("decoration-d-1.svg"), Some(1));
        assert_eq!(parse_decoration_version("decoration-d-12.svg"), Some(12));
        assert_eq!(parse_decoration_version("decoration-d-007.svg"), None);
        assert_eq!(parse_decoration_version("decoration-d-0.svg"), None);
        assert_eq!(parse_decoration_version("decoration-d-.svg"), None);
        assert_eq!(parse_decoration_version("decoration-d-1.png"), None);
        assert_eq!(parse_decoration_version("extra-decoration-d-1.svg"), None);
    }

    #[test]
    fn versioned_filename_scheme() {
        let scanarium = Scanarium::new(Config::default());
        let path = scanarium.versioned_filename(
            Path::new("/scenes/space/actors/SimpleRocket"),
            "SimpleRocket-mask-effective",
            "png",
            3,
        );
        assert_eq!(
            path,
            Path::new("/scenes/space/actors/SimpleRocket/SimpleRocket-mask-effective-d-3.png")
        );
    }

    #[test]
    fn conf_dir_expansion() {
        let config =
            Config::parse(r#"{ "directories": { "config": "/etc/scanarium" } }"#).unwrap();
        let scanarium = Scanarium::new(config);
        assert_eq!(
            scanarium.expand_config_dir("%CONF_DIR%/qr-code-maps/a.json").unwrap(),
            Path::new("/etc/scanarium/qr-code-maps/a.json")
        );
        assert_eq!(
            scanarium.expand_config_dir("/plain/path.json").unwrap(),
            Path::new("/plain/path.json")
        );
    }
}
