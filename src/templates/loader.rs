//! Template file discovery and priority-override merge
//!
//! Three file layers merge by template id, higher priority overriding lower
//! field-by-field:
//!
//! | priority | pattern                              | scope             |
//! |----------|--------------------------------------|-------------------|
//! | 1        | `<provider_instance>_templates.json` | provider instance |
//! | 2        | `<provider_type>prov_templates.json` | provider type     |
//! | 3        | `templates.json`                     | main file         |
//!
//! Files may be a list of template objects or an object map
//! `template_id -> template`; map keys inject `template_id` when missing.

use crate::error::{BrokerError, Result};
use crate::templates::defaults::overlay;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateFileType {
    ProviderInstance,
    ProviderType,
    Main,
    Legacy,
}

impl TemplateFileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateFileType::ProviderInstance => "provider_instance",
            TemplateFileType::ProviderType => "provider_type",
            TemplateFileType::Main => "main",
            TemplateFileType::Legacy => "legacy",
        }
    }
}

/// A merged raw template document with its provenance.
#[derive(Debug, Clone)]
pub struct RawTemplate {
    pub template_id: String,
    pub document: Value,
    /// File that last overrode this template.
    pub source_file: String,
    pub file_type: TemplateFileType,
}

pub struct TemplateFileLoader {
    config_dir: PathBuf,
}

impl TemplateFileLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self { config_dir: config_dir.into() }
    }

    /// Discover and merge template files for the given provider types and
    /// instances. Lowest priority loads first so later layers override.
    pub fn load(
        &self,
        provider_types: &[String],
        provider_instances: &[String],
    ) -> Result<HashMap<String, RawTemplate>> {
        let mut merged: HashMap<String, RawTemplate> = HashMap::new();

        let main = self.config_dir.join("templates.json");
        self.merge_file(&mut merged, &main, TemplateFileType::Main)?;

        for provider_type in provider_types {
            let path = self.config_dir.join(format!("{provider_type}prov_templates.json"));
            self.merge_file(&mut merged, &path, TemplateFileType::ProviderType)?;
        }

        for instance in provider_instances {
            let path = self.config_dir.join(format!("{instance}_templates.json"));
            self.merge_file(&mut merged, &path, TemplateFileType::ProviderInstance)?;
        }

        Ok(merged)
    }

    fn merge_file(
        &self,
        merged: &mut HashMap<String, RawTemplate>,
        path: &Path,
        file_type: TemplateFileType,
    ) -> Result<()> {
        if !path.exists() {
            debug!("Template file {} not present, skipping", path.display());
            return Ok(());
        }
        let content = std::fs::read_to_string(path)?;
        let document: Value = serde_json::from_str(&content).map_err(|e| {
            BrokerError::Configuration {
                message: format!("template file {} is not valid JSON", path.display()),
                source: Some(Box::new(e)),
            }
        })?;
        let source_file = path.display().to_string();

        for (template_id, template) in templates_in_document(document, &source_file)? {
            match merged.get_mut(&template_id) {
                Some(existing) => {
                    overlay(&mut existing.document, &template);
                    existing.source_file = source_file.clone();
                    existing.file_type = file_type;
                }
                None => {
                    merged.insert(
                        template_id.clone(),
                        RawTemplate {
                            template_id,
                            document: template,
                            source_file: source_file.clone(),
                            file_type,
                        },
                    );
                }
            }
        }
        Ok(())
    }
}

/// Flatten a template file into `(template_id, document)` pairs. Accepts a
/// list of objects (each carrying `template_id`) or an object map keyed by
/// template id (key injected as `template_id` when missing). Legacy files
/// wrap the list in a `templates` key.
fn templates_in_document(document: Value, source_file: &str) -> Result<Vec<(String, Value)>> {
    let document = match document {
        Value::Object(ref map) if map.contains_key("templates") => {
            map.get("templates").cloned().unwrap_or(Value::Null)
        }
        other => other,
    };

    match document {
        Value::Array(entries) => entries
            .into_iter()
            .map(|entry| {
                let id = entry
                    .get("template_id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .ok_or_else(|| BrokerError::Configuration {
                        message: format!(
                            "template file {source_file}: list entry missing template_id"
                        ),
                        source: None,
                    })?;
                Ok((id, entry))
            })
            .collect(),
        Value::Object(map) => Ok(map
            .into_iter()
            .filter_map(|(key, mut template)| {
                if !template.is_object() {
                    warn!(
                        "Template file {}: entry '{}' is not an object, ignoring",
                        source_file, key
                    );
                    return None;
                }
                if template.get("template_id").is_none() {
                    template["template_id"] = Value::String(key.clone());
                }
                Some((key, template))
            })
            .collect()),
        _ => {
            warn!("Template file {} has an unsupported shape, ignoring", source_file);
            Ok(Vec::new())
        }
    }
}
