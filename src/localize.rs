use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

/// One language's string tables. A missing table (or entry) falls through
/// to the identity, which is exactly the `fallback` language.
#[derive(Debug, Default, Deserialize)]
pub struct Localizer {
    /// Whole-template translations, keyed by the source template.
    #[serde(default)]
    strings: HashMap<String, String>,
    /// Per-class parameter translations, e.g.
    /// `parameters.command_name.space = "Weltraum"`.
    #[serde(default)]
    parameters: HashMap<String, HashMap<String, String>>,
}

impl Localizer {
    /// The identity localizer used for the `fallback` language.
    pub fn identity() -> Self {
        Localizer::default()
    }

    /// Load the table for `language` from `<l10n_dir>/<language>.json`.
    /// Unreadable or absent tables degrade to the identity.
    pub fn load(l10n_dir: &Path, language: &str) -> Self {
        let path = l10n_dir.join(format!("{language}.json"));
        match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|error| {
                log::warn!("ignoring malformed localization table {}: {error}", path.display());
                Localizer::identity()
            }),
            Err(_) => Localizer::identity(),
        }
    }

    /// Translate a template, then substitute `{placeholder}` parameters.
    pub fn localize(&self, template: &str, parameters: &[(&str, String)]) -> String {
        let mut text = self
            .strings
            .get(template)
            .cloned()
            .unwrap_or_else(|| template.to_string());
        for (key, value) in parameters {
            text = text.replace(&format!("{{{key}}}"), value);
        }
        text
    }

    /// Translate a single value of a parameter class (`command_name`,
    /// `actor_name`, ...). Unknown values pass through unchanged.
    pub fn localize_parameter(&self, class: &str, value: &str) -> String {
        self.parameters
            .get(class)
            .and_then(|values| values.get(value))
            .cloned()
            .unwrap_or_else(|| value.to_string())
    }
}

/// Expand a `--language` argument into the concrete language list:
/// `all` means the fallback plus every two-letter table present.
pub fn expand_languages(l10n_dir: &Path, language: Option<&str>) -> Vec<String> {
    let language = match language {
        None | Some("") => "fallback",
        Some(language) => language,
    };

    if language != "all" {
        return vec![language.to_string()];
    }

    let mut languages = vec!["fallback".to_string()];
    if let Ok(entries) = fs::read_dir(l10n_dir) {
        let mut found: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_suffix(".json"))
                    .map(str::to_string)
            })
            .filter(|name| name.len() == 2 && name.chars().all(|c| c.is_ascii_lowercase()))
            .collect();
        found.sort();
        languages.extend(found);
    }
    languages
}
