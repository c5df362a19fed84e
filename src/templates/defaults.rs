//! Template defaults resolution
//!
//! Three defaults layers merge under the explicit template fields:
//! global (main config `template` block), provider-type, then
//! provider-instance. Explicit fields win over all defaults and `null`
//! never shadows a default.

use serde_json::Value;

pub struct TemplateDefaultsService;

impl TemplateDefaultsService {
    pub fn new() -> Self {
        Self
    }

    /// Overlay `template` on the merged defaults layers.
    pub fn resolve(
        &self,
        global_defaults: &Value,
        provider_type_defaults: &Value,
        provider_instance_defaults: &Value,
        template: &Value,
    ) -> Value {
        let mut merged = Value::Object(serde_json::Map::new());
        overlay(&mut merged, global_defaults);
        overlay(&mut merged, provider_type_defaults);
        overlay(&mut merged, provider_instance_defaults);
        overlay(&mut merged, template);
        merged
    }
}

impl Default for TemplateDefaultsService {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy non-null fields of `layer` over `target`. Top-level field
/// granularity: an explicit object field replaces the whole lower value.
pub(crate) fn overlay(target: &mut Value, layer: &Value) {
    let Value::Object(layer_map) = layer else {
        return;
    };
    let Value::Object(target_map) = target else {
        return;
    };
    for (key, value) in layer_map {
        if value.is_null() {
            continue;
        }
        target_map.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn later_layers_win_per_field() {
        let service = TemplateDefaultsService::new();
        let resolved = service.resolve(
            &json!({"instance_type": "t3.micro", "max_instances": 5, "price_type": "ondemand"}),
            &json!({"instance_type": "t3.large"}),
            &json!({"max_instances": 20}),
            &json!({"template_id": "t1", "image_id": "ami-1"}),
        );

        assert_eq!(resolved["instance_type"], "t3.large");
        assert_eq!(resolved["max_instances"], 20);
        assert_eq!(resolved["price_type"], "ondemand");
        assert_eq!(resolved["image_id"], "ami-1");
    }

    #[test]
    fn explicit_fields_beat_all_defaults() {
        let service = TemplateDefaultsService::new();
        let resolved = service.resolve(
            &json!({"image_id": "ami-global"}),
            &json!({"image_id": "ami-type"}),
            &json!({"image_id": "ami-instance"}),
            &json!({"image_id": "ami-explicit"}),
        );
        assert_eq!(resolved["image_id"], "ami-explicit");
    }

    #[test]
    fn null_does_not_shadow_defaults() {
        let service = TemplateDefaultsService::new();
        let resolved = service.resolve(
            &json!({"key_name": "ops"}),
            &json!({}),
            &json!({}),
            &json!({"key_name": null, "image_id": "ami-1"}),
        );
        assert_eq!(resolved["key_name"], "ops");
    }
}
