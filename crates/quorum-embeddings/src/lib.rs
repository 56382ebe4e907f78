pub mod codec;
pub mod errors;
pub mod http;
pub mod service;

pub use codec::{cosine, decode_blob, encode_blob};
pub use errors::EmbeddingError;
pub use http::HttpEmbedder;
pub use service::{EmbeddingService, HashEmbedder};
