//! File extension to language descriptor lookup.

use std::collections::HashMap;
use std::path::Path;

use crate::config::{LspConfig, ServerConfig};

/// An immutable launch descriptor for one language.
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageDescriptor {
    language_id: String,
    server: ServerConfig,
}

impl LanguageDescriptor {
    #[must_use]
    pub fn new(language_id: impl Into<String>, server: ServerConfig) -> Self {
        Self {
            language_id: language_id.into(),
            server,
        }
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.server.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.server.args
    }

    #[must_use]
    pub fn file_extensions(&self) -> &[String] {
        &self.server.file_extensions
    }

    #[must_use]
    pub fn initialization_options(&self) -> Option<&serde_json::Value> {
        self.server.initialization_options.as_ref()
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim_start_matches('.').to_ascii_lowercase()
}

/// Build extension → language map from config.
///
/// Languages are visited in sorted order so overlapping extensions resolve
/// the same way on every run.
fn build_extension_map(descriptors: &HashMap<String, LanguageDescriptor>) -> HashMap<String, String> {
    let mut extension_map = HashMap::new();
    let mut languages: Vec<&String> = descriptors.keys().collect();
    languages.sort();
    for language in languages {
        for ext in descriptors[language].file_extensions() {
            let ext = normalize_extension(ext);
            if let Some(existing) = extension_map.get(&ext) {
                tracing::warn!(
                    "Multiple language servers configured for extension '{ext}': '{existing}' and '{language}'. Using '{existing}'."
                );
                continue;
            }
            extension_map.insert(ext, language.clone());
        }
    }
    extension_map
}

/// Pure lookup from file path to [`LanguageDescriptor`].
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    descriptors: HashMap<String, LanguageDescriptor>,
    extension_map: HashMap<String, String>,
}

impl ServerRegistry {
    #[must_use]
    pub fn from_config(config: &LspConfig) -> Self {
        if !config.enabled {
            return Self::default();
        }
        let descriptors: HashMap<String, LanguageDescriptor> = config
            .servers()
            .iter()
            .map(|(language, server)| {
                (
                    language.clone(),
                    LanguageDescriptor::new(language.clone(), server.clone()),
                )
            })
            .collect();
        let extension_map = build_extension_map(&descriptors);
        Self {
            descriptors,
            extension_map,
        }
    }

    /// Descriptor for `path`, or `None` for unsupported files.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> Option<&LanguageDescriptor> {
        let ext = path.extension()?.to_str()?;
        let language = self.extension_map.get(&normalize_extension(ext))?;
        self.descriptors.get(language)
    }

    #[must_use]
    pub fn is_language_supported(&self, path: &Path) -> bool {
        self.resolve(path).is_some()
    }

    /// All descriptors, sorted by language identifier.
    #[must_use]
    pub fn descriptors(&self) -> Vec<&LanguageDescriptor> {
        let mut all: Vec<&LanguageDescriptor> = self.descriptors.values().collect();
        all.sort_by(|a, b| a.language_id().cmp(b.language_id()));
        all
    }
}
