//! Generation orchestration for the media gateway
//!
//! Turns a `(model, prompt, images)` request into a stream of progress
//! events ending in one result, using the credential pool for selection,
//! freshness, concurrency and health accounting.

pub mod cache;
pub mod error;
pub mod events;
pub mod models;
pub mod orchestrator;

pub use cache::{FileMediaCache, MediaCache};
pub use error::{CacheError, ErrorPayload, GenerationError, Result};
pub use events::{Availability, GenerationEvent, GenerationOutput};
pub use models::{ModelConfig, VideoMode};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
