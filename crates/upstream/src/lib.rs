//! Generative-media backend client
//!
//! Defines the `UpstreamClient` and `ChallengeProvider` traits the pool and
//! orchestrator talk to, the typed requests and responses that cross that
//! boundary, and `HttpUpstreamClient`, the reqwest implementation.
//!
//! Call sequence for one credential:
//! 1. `exchange_credential` turns the session token into an access token
//! 2. `query_credit_balance` reads credits and paygate tier
//! 3. `create_workspace` makes a project when the credential has none
//! 4. `upload_asset` turns reference image bytes into media ids
//! 5. `submit_image` returns URLs directly; `submit_video` returns a handle
//! 6. `poll_operation` is called until the handle reaches a terminal status

pub mod constants;
pub mod error;
pub mod http;
pub mod types;

pub use error::{ChallengeError, Result, UpstreamError};
pub use http::HttpUpstreamClient;
pub use types::{
    CreditBalance, ImageRequest, ImageResult, OperationHandle, OperationStatus, SessionExchange,
    VideoInput, VideoRequest,
};

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by the trait methods so both traits stay
/// dyn-compatible (`Arc<dyn UpstreamClient>`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Backend operations needed by the credential pool and the orchestrator.
pub trait UpstreamClient: Send + Sync {
    /// Exchange a long-lived session token for a short-lived access token
    /// and the identity profile behind it.
    fn exchange_credential<'a>(
        &'a self,
        long_lived_secret: &'a str,
    ) -> BoxFuture<'a, Result<SessionExchange>>;

    fn query_credit_balance<'a>(
        &'a self,
        short_lived_secret: &'a str,
    ) -> BoxFuture<'a, Result<CreditBalance>>;

    /// Create a workspace (project) and return its id.
    fn create_workspace<'a>(
        &'a self,
        long_lived_secret: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<String>>;

    /// Upload a reference image and return the asset handle.
    fn upload_asset<'a>(
        &'a self,
        short_lived_secret: &'a str,
        bytes: &'a [u8],
        aspect_ratio: &'a str,
    ) -> BoxFuture<'a, Result<String>>;

    fn submit_image<'a>(
        &'a self,
        short_lived_secret: &'a str,
        request: &'a ImageRequest,
    ) -> BoxFuture<'a, Result<ImageResult>>;

    fn submit_video<'a>(
        &'a self,
        short_lived_secret: &'a str,
        request: &'a VideoRequest,
    ) -> BoxFuture<'a, Result<OperationHandle>>;

    fn poll_operation<'a>(
        &'a self,
        short_lived_secret: &'a str,
        handle: &'a OperationHandle,
    ) -> BoxFuture<'a, Result<OperationStatus>>;
}

/// Source of anti-automation challenge tokens for a workspace context.
pub trait ChallengeProvider: Send + Sync {
    fn produce_token<'a>(
        &'a self,
        context_id: &'a str,
    ) -> BoxFuture<'a, std::result::Result<String, ChallengeError>>;
}
