//! `model_spec` parsing and model resolution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use trellis_core::{CoreError, Model};

const ENV_PREFIX: &str = "env:";

/// Which model an LLM node talks to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ModelSpec {
    /// Backend family, e.g. `openai`
    pub provider: String,

    /// Model name at the provider
    #[serde(alias = "model")]
    pub model_name: String,

    /// API key or `env:VAR`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Endpoint override or `env:VAR`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Extra request headers; values may be `env:VAR`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl ModelSpec {
    /// Decode and check required fields.
    pub fn parse(raw: &Value) -> Result<Self, String> {
        if !raw.is_object() {
            return Err("model_spec must be an object".to_string());
        }
        let spec: ModelSpec =
            serde_json::from_value(raw.clone()).map_err(|e| format!("invalid model_spec: {}", e))?;
        if spec.provider.trim().is_empty() {
            return Err("model_spec.provider is required".to_string());
        }
        if spec.model_name.trim().is_empty() {
            return Err("model_spec.model_name is required".to_string());
        }
        Ok(spec)
    }

    /// Replace `env:VAR` placeholders with environment values.
    pub fn resolve_env(mut self, allow_env_secrets: bool) -> Result<Self, String> {
        if let Some(key) = self.api_key.take() {
            self.api_key = Some(resolve_secret(key, "model_spec.api_key", allow_env_secrets)?);
        }
        if let Some(url) = self.base_url.take() {
            self.base_url = Some(resolve_secret(url, "model_spec.base_url", allow_env_secrets)?);
        }
        let mut headers = BTreeMap::new();
        for (name, value) in std::mem::take(&mut self.headers) {
            let field = format!("model_spec.headers.{}", name);
            headers.insert(name, resolve_secret(value, &field, allow_env_secrets)?);
        }
        self.headers = headers;
        Ok(self)
    }
}

/// Resolve one `env:VAR` placeholder; literal values pass through.
pub(crate) fn resolve_secret(value: String, field: &str, allow: bool) -> Result<String, String> {
    let Some(var) = value.strip_prefix(ENV_PREFIX) else {
        return Ok(value);
    };
    if !allow {
        return Err(format!(
            "{} uses an env: placeholder but environment secrets are not allowed",
            field
        ));
    }
    std::env::var(var.trim())
        .map_err(|_| format!("environment variable {} referenced by {} is not set", var.trim(), field))
}

/// Creates models for LLM nodes.
#[cfg_attr(test, mockall::automock)]
pub trait ModelProvider: Send + Sync {
    /// Model for a resolved spec
    fn create_model(&self, spec: &ModelSpec) -> trellis_core::Result<Arc<dyn Model>>;
}

/// Provider backed by pre-built models, looked up by model name.
#[derive(Clone, Default)]
pub struct StaticModelProvider {
    models: HashMap<String, Arc<dyn Model>>,
    fallback: Option<Arc<dyn Model>>,
}

impl StaticModelProvider {
    /// Empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `model` for specs naming `model_name`
    pub fn with_model(mut self, model_name: impl Into<String>, model: Arc<dyn Model>) -> Self {
        self.models.insert(model_name.into(), model);
        self
    }

    /// Serve `model` for any spec without an exact match
    pub fn with_fallback(mut self, model: Arc<dyn Model>) -> Self {
        self.fallback = Some(model);
        self
    }
}

impl ModelProvider for StaticModelProvider {
    fn create_model(&self, spec: &ModelSpec) -> trellis_core::Result<Arc<dyn Model>> {
        self.models
            .get(&spec.model_name)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| {
                CoreError::ConfigurationError(format!("no model registered for {}/{}", spec.provider, spec.model_name))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_with_model_alias() {
        let spec = ModelSpec::parse(&json!({"provider": "openai", "model": "gpt-4o-mini"})).unwrap();
        assert_eq!(spec.model_name, "gpt-4o-mini");
        assert_eq!(spec.api_key, None);
    }

    #[test]
    fn requires_provider_and_name() {
        assert_eq!(
            ModelSpec::parse(&json!({"model_name": "x"})).unwrap_err(),
            "invalid model_spec: missing field `provider`"
        );
        assert_eq!(
            ModelSpec::parse(&json!({"provider": " ", "model_name": "x"})).unwrap_err(),
            "model_spec.provider is required"
        );
        assert!(ModelSpec::parse(&json!("openai")).is_err());
    }

    #[test]
    fn env_placeholders_need_permission() {
        let spec = ModelSpec::parse(&json!({
            "provider": "openai",
            "model_name": "gpt",
            "api_key": "env:TRELLIS_DSL_TEST_KEY_A"
        }))
        .unwrap();
        let err = spec.clone().resolve_env(false).unwrap_err();
        assert!(err.contains("model_spec.api_key"), "{}", err);

        std::env::set_var("TRELLIS_DSL_TEST_KEY_A", "sk-test");
        let resolved = spec.resolve_env(true).unwrap();
        assert_eq!(resolved.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn missing_env_var_is_reported() {
        let spec = ModelSpec {
            provider: "openai".into(),
            model_name: "gpt".into(),
            headers: BTreeMap::from([("X-Token".to_string(), "env:TRELLIS_DSL_TEST_UNSET".to_string())]),
            ..Default::default()
        };
        let err = spec.resolve_env(true).unwrap_err();
        assert_eq!(
            err,
            "environment variable TRELLIS_DSL_TEST_UNSET referenced by model_spec.headers.X-Token is not set"
        );
    }

    #[test]
    fn literal_values_pass_through() {
        let spec = ModelSpec {
            provider: "openai".into(),
            model_name: "gpt".into(),
            api_key: Some("sk-literal".into()),
            ..Default::default()
        };
        assert_eq!(spec.clone().resolve_env(false).unwrap(), spec);
    }
}
