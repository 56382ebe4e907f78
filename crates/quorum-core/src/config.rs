use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::providers::ModelRef;

/// Errors raised while loading or validating configuration.
/// Surfaced at startup; never recovered silently.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("duplicate agent: {0}")]
    DuplicateAgent(String),

    #[error("critic '{0}' has no agent definition")]
    UnknownCritic(String),

    #[error("invalid model reference '{0}' (expected provider/model)")]
    InvalidModelRef(String),

    #[error("invalid critic cardinality: {0}")]
    InvalidCardinality(String),

    #[error("invalid issue pattern '{pattern}': {detail}")]
    InvalidPattern { pattern: String, detail: String },

    #[error("{0}")]
    Invalid(String),
}

/// Retrieval strategy for the knowledge slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStrategy {
    Semantic,
    Hybrid,
    Keywords,
}

impl Default for MemoryStrategy {
    fn default() -> Self {
        Self::Semantic
    }
}

/// Per-agent memory retrieval settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub strategy: MemoryStrategy,
    pub session_limit: u32,
    pub min_relevance: f64,
    pub time_decay_hours: f64,
    pub max_context_tokens: u32,
    pub session_enabled: bool,
    pub knowledge_enabled: bool,
    /// Restrict knowledge candidates to records produced by the same agent.
    pub same_agent_only: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            strategy: MemoryStrategy::default(),
            session_limit: 5,
            min_relevance: 0.15,
            time_decay_hours: 168.0,
            max_context_tokens: 600,
            session_enabled: true,
            knowledge_enabled: true,
            same_agent_only: false,
        }
    }
}

/// One named agent role: fixed system prompt, model, sampling settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub model: String,
    pub system_prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default)]
    pub memory_enabled: bool,
    #[serde(default)]
    pub memory: MemoryConfig,
}

fn default_temperature() -> f64 {
    0.2
}

fn default_max_tokens() -> u32 {
    1500
}

/// A critic registration: the agent acting as critic, its consensus weight
/// and the keywords that make it relevant to a prompt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CriticConfig {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub keywords: Vec<String>,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticsConfig {
    pub members: Vec<CriticConfig>,
    pub dynamic_selection: bool,
    /// Re-run critic selection on every refinement iteration. When false the
    /// initial selection is pinned for the whole chain.
    pub reselect_each_iteration: bool,
    pub min_critics: usize,
    pub max_critics: usize,
    pub fallback_critics: Vec<String>,
}

impl Default for CriticsConfig {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            dynamic_selection: true,
            reselect_each_iteration: true,
            min_critics: 1,
            max_critics: 3,
            fallback_critics: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    pub enabled: bool,
    pub max_iterations: u32,
    pub critical_keywords: Vec<String>,
    /// Regex patterns that mark a review block as a critical issue.
    pub issue_patterns: Vec<String>,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: 3,
            critical_keywords: vec![
                "critical".into(),
                "security".into(),
                "vulnerability".into(),
                "must fix".into(),
            ],
            issue_patterns: vec![r"(?i)\[SECURITY\]".into(), r"(?i)\bCVE-\d{4}-\d+\b".into()],
        }
    }
}

/// Thresholds are character lengths of the prior stage output; at or above
/// the threshold the output is compressed before being passed downstream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub model: String,
    pub target_tokens: u32,
    pub standard_threshold: usize,
    pub memory_threshold: usize,
    pub closer_threshold: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o-mini".into(),
            target_tokens: 500,
            standard_threshold: 1200,
            memory_threshold: 800,
            closer_threshold: 1500,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub call_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 4000,
            call_timeout_secs: 120,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub db_path: PathBuf,
    pub conversation_log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/memory/conversations.db"),
            conversation_log_dir: PathBuf::from("data/conversations"),
        }
    }
}

/// Process-wide configuration. Loaded once at startup, immutable afterwards.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub agents: Vec<AgentConfig>,
    pub critics: CriticsConfig,
    pub refinement: RefinementConfig,
    pub compression: CompressionConfig,
    pub retry: RetryConfig,
    pub paths: PathsConfig,
}

impl OrchestratorConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn agent(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn require_agent(&self, name: &str) -> Result<&AgentConfig, ConfigError> {
        self.agent(name)
            .ok_or_else(|| ConfigError::UnknownAgent(name.to_string()))
    }

    /// Startup validation: every reference must resolve, every model string
    /// must parse, cardinality bounds must hold, issue patterns must compile.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.name.as_str()) {
                return Err(ConfigError::DuplicateAgent(agent.name.clone()));
            }
            ModelRef::parse(&agent.model)?;
            for fallback in &agent.fallback_models {
                ModelRef::parse(fallback)?;
            }
            if agent.max_tokens == 0 {
                return Err(ConfigError::Invalid(format!(
                    "agent '{}': max_tokens must be > 0",
                    agent.name
                )));
            }
            if agent.temperature < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "agent '{}': temperature must be >= 0",
                    agent.name
                )));
            }
        }

        for critic in &self.critics.members {
            if self.agent(&critic.name).is_none() {
                return Err(ConfigError::UnknownCritic(critic.name.clone()));
            }
            if critic.weight <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "critic '{}': weight must be > 0",
                    critic.name
                )));
            }
        }
        for name in &self.critics.fallback_critics {
            if !self.critics.members.iter().any(|c| &c.name == name) {
                return Err(ConfigError::UnknownCritic(name.clone()));
            }
        }

        if !self.critics.members.is_empty() {
            let n = self.critics.members.len();
            let (min, max) = (self.critics.min_critics, self.critics.max_critics);
            if min < 1 || min > max || max > n {
                return Err(ConfigError::InvalidCardinality(format!(
                    "require 1 <= min ({min}) <= max ({max}) <= critics ({n})"
                )));
            }
        }

        if self.refinement.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "refinement.max_iterations must be >= 1".into(),
            ));
        }
        for pattern in &self.refinement.issue_patterns {
            regex::Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                detail: e.to_string(),
            })?;
        }

        ModelRef::parse(&self.compression.model)?;

        Ok(())
    }
}
