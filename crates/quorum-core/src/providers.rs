use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// A parsed `provider/model` reference. The provider segment is everything
/// before the first `/`; the rest is the provider-native model name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub name: String,
}

impl ModelRef {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.split_once('/') {
            Some((provider, name)) if !provider.is_empty() && !name.is_empty() => Ok(Self {
                provider: canonical_provider(provider).to_string(),
                name: name.to_string(),
            }),
            _ => Err(ConfigError::InvalidModelRef(raw.to_string())),
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.name)
    }
}

/// Map model-string prefixes onto canonical provider names.
/// `gemini/*` models are served under the google credential.
fn canonical_provider(prefix: &str) -> &str {
    match prefix {
        "gemini" => "google",
        other => other,
    }
}

struct ProviderSpec {
    name: &'static str,
    key_env: &'static str,
    disable_env: &'static str,
    base_url: &'static str,
}

const PROVIDERS: &[ProviderSpec] = &[
    ProviderSpec {
        name: "openai",
        key_env: "OPENAI_API_KEY",
        disable_env: "DISABLE_OPENAI",
        base_url: "https://api.openai.com/v1",
    },
    ProviderSpec {
        name: "anthropic",
        key_env: "ANTHROPIC_API_KEY",
        disable_env: "DISABLE_ANTHROPIC",
        base_url: "https://api.anthropic.com/v1",
    },
    ProviderSpec {
        name: "google",
        key_env: "GOOGLE_API_KEY",
        disable_env: "DISABLE_GOOGLE",
        base_url: "https://generativelanguage.googleapis.com/v1beta/openai",
    },
    ProviderSpec {
        name: "openrouter",
        key_env: "OPENROUTER_API_KEY",
        disable_env: "DISABLE_OPENROUTER",
        base_url: "https://openrouter.ai/api/v1",
    },
];

#[derive(Clone, Debug)]
struct ProviderState {
    api_key: Option<String>,
    disabled: bool,
    base_url: String,
}

/// Availability of one provider, as reported on the health surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub name: String,
    pub available: bool,
    pub reason: String,
}

/// Resolves providers for `provider/model` references and reports which are
/// enabled. Credentials are snapshotted once at construction; configuration
/// is immutable after startup.
#[derive(Clone, Debug)]
pub struct ProviderRegistry {
    states: BTreeMap<String, ProviderState>,
}

impl ProviderRegistry {
    /// Snapshot provider credentials and disable flags from the environment.
    pub fn from_env() -> Self {
        let mut states = BTreeMap::new();
        for spec in PROVIDERS {
            let api_key = std::env::var(spec.key_env).ok().filter(|k| !k.is_empty());
            let disabled = std::env::var(spec.disable_env)
                .map(|v| is_truthy(&v))
                .unwrap_or(false);
            states.insert(
                spec.name.to_string(),
                ProviderState {
                    api_key,
                    disabled,
                    base_url: spec.base_url.to_string(),
                },
            );
        }
        Self { states }
    }

    /// Registry with explicit credential/disable state, for tests.
    pub fn with_states(entries: &[(&str, Option<&str>, bool)]) -> Self {
        let mut states = BTreeMap::new();
        for (name, key, disabled) in entries {
            let base_url = PROVIDERS
                .iter()
                .find(|s| s.name == *name)
                .map(|s| s.base_url.to_string())
                .unwrap_or_else(|| format!("https://{name}.invalid/v1"));
            states.insert(
                name.to_string(),
                ProviderState {
                    api_key: key.map(str::to_string),
                    disabled: *disabled,
                    base_url,
                },
            );
        }
        Self { states }
    }

    pub fn is_enabled(&self, provider: &str) -> bool {
        self.states
            .get(provider)
            .map(|s| !s.disabled && s.api_key.is_some())
            .unwrap_or(false)
    }

    /// Why a provider cannot be used right now, or None if it can.
    pub fn unavailable_reason(&self, provider: &str) -> Option<&'static str> {
        match self.states.get(provider) {
            None => Some("unknown_provider"),
            Some(state) if state.disabled => Some("provider_disabled"),
            Some(state) if state.api_key.is_none() => Some("missing_credential"),
            Some(_) => None,
        }
    }

    pub fn api_key(&self, provider: &str) -> Option<&str> {
        self.states.get(provider)?.api_key.as_deref()
    }

    pub fn base_url(&self, provider: &str) -> Option<&str> {
        self.states.get(provider).map(|s| s.base_url.as_str())
    }

    pub fn enabled_count(&self) -> usize {
        self.states.keys().filter(|p| self.is_enabled(p)).count()
    }

    pub fn availability(&self) -> Vec<ProviderStatus> {
        self.states
            .keys()
            .map(|name| ProviderStatus {
                name: name.clone(),
                available: self.is_enabled(name),
                reason: self
                    .unavailable_reason(name)
                    .unwrap_or("ok")
                    .to_string(),
            })
            .collect()
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_ref_splits_on_first_slash() {
        let m = ModelRef::parse("openai/gpt-4o").unwrap();
        assert_eq!(m.provider, "openai");
        assert_eq!(m.name, "gpt-4o");

        let nested = ModelRef::parse("openrouter/meta/llama-3-70b").unwrap();
        assert_eq!(nested.provider, "openrouter");
        assert_eq!(nested.name, "meta/llama-3-70b");
    }

    #[test]
    fn model_ref_rejects_missing_segments() {
        assert!(ModelRef::parse("gpt-4o").is_err());
        assert!(ModelRef::parse("/gpt-4o").is_err());
        assert!(ModelRef::parse("openai/").is_err());
        assert!(ModelRef::parse("").is_err());
    }

    #[test]
    fn gemini_prefix_maps_to_google() {
        let m = ModelRef::parse("gemini/gemini-1.5-pro").unwrap();
        assert_eq!(m.provider, "google");
    }

    #[test]
    fn enabled_requires_key_and_no_disable_flag() {
        let registry = ProviderRegistry::with_states(&[
            ("openai", Some("sk-test"), false),
            ("anthropic", None, false),
            ("google", Some("key"), true),
        ]);
        assert!(registry.is_enabled("openai"));
        assert!(!registry.is_enabled("anthropic"));
        assert!(!registry.is_enabled("google"));
        assert!(!registry.is_enabled("nonexistent"));
    }

    #[test]
    fn unavailable_reasons() {
        let registry = ProviderRegistry::with_states(&[
            ("openai", Some("sk-test"), false),
            ("anthropic", None, false),
            ("google", Some("key"), true),
        ]);
        assert_eq!(registry.unavailable_reason("openai"), None);
        assert_eq!(
            registry.unavailable_reason("anthropic"),
            Some("missing_credential")
        );
        assert_eq!(
            registry.unavailable_reason("google"),
            Some("provider_disabled")
        );
        assert_eq!(
            registry.unavailable_reason("mystery"),
            Some("unknown_provider")
        );
    }

    #[test]
    fn availability_report() {
        let registry =
            ProviderRegistry::with_states(&[("openai", Some("k"), false), ("anthropic", None, false)]);
        let statuses = registry.availability();
        assert_eq!(statuses.len(), 2);
        let openai = statuses.iter().find(|s| s.name == "openai").unwrap();
        assert!(openai.available);
        assert_eq!(openai.reason, "ok");
        assert_eq!(registry.enabled_count(), 1);
    }

    #[test]
    fn truthy_values() {
        assert!(is_truthy("1"));
        assert!(is_truthy("TRUE"));
        assert!(is_truthy("yes"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));
    }
}
