pub mod connector;
pub mod errors;
pub mod http;
pub mod mock;
pub mod provider;

pub use connector::{Connector, LlmResponse};
pub use errors::{CandidateFailure, LlmError};
pub use http::HttpChatProvider;
pub use mock::{mock_mode_enabled, MockChatProvider, ScriptedProvider};
pub use provider::{ChatCompletion, ChatProvider, ChatRequest};
