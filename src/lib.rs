//! Model artifact acquisition and caching.
//!
//! Large model files are served from an in-process map, then a durable
//! on-disk store, and only then downloaded by racing every candidate mirror.
//! Concurrent requests for the same artifact share a single download.
//! [`server::handler::InterceptionProxy`] applies the same cache-first policy
//! to raw HTTP traffic for callers that bypass [`ArtifactCache`].

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod server;
pub mod source;

pub use config::{CacheConfig, InterceptConfig};
pub use engine::loader::{EngineBinding, ModelLoader, ModelSource, SessionOptions};
pub use engine::orchestrator::ArtifactCache;
pub use error::{LoadError, SourceFailure};
pub use server::handler::InterceptionProxy;
pub use source::traits::ArtifactSource;
