//! Template configuration manager
//!
//! Discovers template files, resolves the three defaults layers, validates
//! the merged documents into immutable `Template` DTOs and serves them
//! through a cache. A reload produces a fresh snapshot; templates are never
//! mutated in place.

pub mod cache;
pub mod defaults;
pub mod loader;

pub use cache::{CacheStats, TemplateCache};
pub use defaults::TemplateDefaultsService;
pub use loader::{RawTemplate, TemplateFileLoader, TemplateFileType};

use crate::config::BrokerConfig;
use crate::domain::Template;
use crate::error::{BrokerError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One validated template with its provenance.
#[derive(Clone)]
pub struct TemplateRecord {
    pub template: Template,
    pub source_file: String,
    pub file_type: TemplateFileType,
}

pub struct LoadedTemplates {
    pub templates: HashMap<String, TemplateRecord>,
}

pub struct TemplateManager {
    config: BrokerConfig,
    loader: TemplateFileLoader,
    defaults: TemplateDefaultsService,
    cache: TemplateCache<LoadedTemplates>,
}

impl TemplateManager {
    pub fn new(config: BrokerConfig) -> Self {
        let loader = TemplateFileLoader::new(config.template.config_dir.clone());
        let cache = if config.performance.enable_caching {
            TemplateCache::with_ttl(Duration::from_secs(config.performance.cache_ttl))
        } else {
            TemplateCache::no_op()
        };
        Self { config, loader, defaults: TemplateDefaultsService::new(), cache }
    }

    /// Load (or fetch cached) templates.
    pub async fn load(&self) -> Result<Arc<LoadedTemplates>> {
        self.cache.get_or_load(|| async { self.load_from_disk() }).await
    }

    /// Drop the cache and load a fresh snapshot.
    pub async fn reload(&self) -> Result<Arc<LoadedTemplates>> {
        self.cache.invalidate().await;
        self.load().await
    }

    pub async fn get_template(&self, template_id: &str) -> Result<Template> {
        let loaded = self.load().await?;
        loaded
            .templates
            .get(template_id)
            .map(|r| r.template.clone())
            .ok_or_else(|| BrokerError::NotFound {
                entity: "template".to_string(),
                id: template_id.to_string(),
            })
    }

    pub async fn list_templates(&self) -> Result<Vec<Template>> {
        let loaded = self.load().await?;
        let mut templates: Vec<_> =
            loaded.templates.values().map(|r| r.template.clone()).collect();
        templates.sort_by(|a, b| a.template_id.cmp(&b.template_id));
        Ok(templates)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.get_stats().await
    }

    fn load_from_disk(&self) -> Result<LoadedTemplates> {
        let provider_types: Vec<String> = {
            let mut types: Vec<String> = self
                .config
                .provider
                .providers
                .iter()
                .map(|p| p.provider_type.clone())
                .collect();
            types.sort();
            types.dedup();
            types
        };
        let provider_instances: Vec<String> =
            self.config.provider.providers.iter().map(|p| p.name.clone()).collect();

        let raw = self.loader.load(&provider_types, &provider_instances)?;
        let mut templates = HashMap::new();

        for (template_id, raw_template) in raw {
            match self.resolve_and_validate(&raw_template) {
                Ok(template) => {
                    templates.insert(
                        template_id,
                        TemplateRecord {
                            template,
                            source_file: raw_template.source_file,
                            file_type: raw_template.file_type,
                        },
                    );
                }
                Err(e) => {
                    // One bad template never takes down the whole catalog.
                    warn!("Skipping invalid template '{}': {}", template_id, e);
                }
            }
        }

        info!("Loaded {} templates", templates.len());
        Ok(LoadedTemplates { templates })
    }

    fn resolve_and_validate(&self, raw: &RawTemplate) -> Result<Template> {
        let (type_defaults, instance_defaults) = self.defaults_for(&raw.document);
        let resolved = self.defaults.resolve(
            &self.config.template.defaults,
            &type_defaults,
            &instance_defaults,
            &raw.document,
        );
        Template::from_value(resolved)
    }

    /// Defaults layers for the provider instance the template binds to;
    /// falls back to the first enabled instance.
    fn defaults_for(&self, document: &Value) -> (Value, Value) {
        let pinned = document.get("provider_name").and_then(|v| v.as_str());
        let instance = match pinned {
            Some(name) => self.config.find_provider_instance(name),
            None => self.config.enabled_provider_instances().next(),
        };
        match instance {
            Some(instance) => {
                let type_defaults = self
                    .config
                    .provider
                    .provider_defaults
                    .get(&instance.provider_type)
                    .map(|d| d.template_defaults.clone())
                    .unwrap_or(Value::Null);
                (type_defaults, instance.template_defaults.clone())
            }
            None => (Value::Null, Value::Null),
        }
    }
}
