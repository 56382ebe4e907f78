pub mod chain;
pub mod compress;
pub mod consensus;
pub mod context;
pub mod critics;
pub mod error;
pub mod refine;
pub mod session;

pub use chain::ChainRuntime;
pub use compress::{AgentClass, CompressionSummary, Compressor};
pub use consensus::merge_consensus;
pub use context::{ContextAggregator, ContextTelemetry};
pub use critics::{select_critics, SelectedCritic};
pub use error::ChainError;
pub use refine::{ConvergenceReason, IssueDetector};
pub use session::{SessionManager, SessionSource};
