pub mod config;
pub mod pricing;
pub mod providers;
pub mod result;
pub mod tokens;

pub use config::{
    AgentConfig, CompressionConfig, ConfigError, CriticConfig, CriticsConfig, MemoryConfig,
    MemoryStrategy, OrchestratorConfig, PathsConfig, RefinementConfig, RetryConfig,
};
pub use providers::{ModelRef, ProviderRegistry, ProviderStatus};
pub use result::RunResult;
pub use tokens::Tokenizer;
