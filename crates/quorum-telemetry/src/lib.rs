pub mod convlog;
pub mod mask;

pub use convlog::{ConversationLogger, Metrics};
pub use mask::mask_sensitive;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber. Call once at startup; RUST_LOG
/// overrides the configured default level.
pub fn init_logging(default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true);

    // Ignore the error when a subscriber is already installed (tests).
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}
