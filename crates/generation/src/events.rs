//! Values streamed back to the caller

use serde::Serialize;
use store::MediaKind;

use crate::error::GenerationError;

/// One event on a generation stream. Every stream ends with exactly one
/// `Finished`.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    Progress(String),
    Finished(Result<GenerationOutput, GenerationError>),
}

/// Produced media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    pub kind: MediaKind,
    /// Cached URL when caching succeeded, otherwise the backend URL
    pub url: String,
    pub upstream_url: String,
}

impl GenerationOutput {
    /// Markup embedding the media in a chat message.
    pub fn content(&self) -> String {
        match self.kind {
            MediaKind::Image => format!("![Generated Image]({})", self.url),
            MediaKind::Video => format!(
                "<video src='{}' controls style='max-width:100%'></video>",
                self.url
            ),
        }
    }
}

/// Dry-run judgment for non-streaming callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub available: bool,
    pub reason: String,
}
