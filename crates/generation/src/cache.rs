//! Local media cache
//!
//! Downloads finished media into a directory and hands back a URL on this
//! service's public base, so callers are not tied to short-lived backend
//! links.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use store::MediaKind;
use tracing::debug;
use upstream::BoxFuture;

use crate::error::CacheError;

/// Stores generated media and returns the URL it is served from.
pub trait MediaCache: Send + Sync {
    fn enabled(&self) -> bool;

    fn store<'a>(&'a self, url: &'a str, kind: MediaKind) -> BoxFuture<'a, Result<String, CacheError>>;
}

/// Cache writing `<uuid>.jpg` / `<uuid>.mp4` files served under
/// `<base_url>/tmp/`.
pub struct FileMediaCache {
    client: reqwest::Client,
    dir: PathBuf,
    base_url: String,
    enabled: AtomicBool,
}

impl FileMediaCache {
    pub fn new(client: reqwest::Client, dir: PathBuf, base_url: &str, enabled: bool) -> Self {
        Self {
            client,
            dir,
            base_url: base_url.trim_end_matches('/').to_string(),
            enabled: AtomicBool::new(enabled),
        }
    }

    /// Toggle caching at runtime.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    async fn download(&self, url: &str, kind: MediaKind) -> Result<String, CacheError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CacheError::Download(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::Download(format!("HTTP {}", status.as_u16())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CacheError::Download(e.to_string()))?;

        let extension = match kind {
            MediaKind::Image => "jpg",
            MediaKind::Video => "mp4",
        };
        let filename = format!("{}.{extension}", uuid::Uuid::new_v4());
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.dir.join(&filename), &bytes).await?;
        debug!(file = %filename, size = bytes.len(), "media cached");

        Ok(format!("{}/tmp/{filename}", self.base_url))
    }
}

impl MediaCache for FileMediaCache {
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn store<'a>(&'a self, url: &'a str, kind: MediaKind) -> BoxFuture<'a, Result<String, CacheError>> {
        Box::pin(self.download(url, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use tokio::net::TcpListener;

    async fn media_server() -> String {
        async fn handler(uri: axum::http::Uri) -> axum::response::Response {
            match uri.path() {
                "/video" => (StatusCode::OK, b"mp4-bytes".to_vec()).into_response(),
                _ => StatusCode::NOT_FOUND.into_response(),
            }
        }
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().fallback(handler))
                .await
                .unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn stores_file_under_uuid_and_returns_public_url() {
        let base = media_server().await;
        let dir = tempfile::tempdir().unwrap();
        let cache = FileMediaCache::new(
            reqwest::Client::new(),
            dir.path().join("tmp"),
            "https://media.example.com/",
            true,
        );

        let url = cache.store(&format!("{base}/video"), MediaKind::Video).await.unwrap();
        let name = url.strip_prefix("https://media.example.com/tmp/").unwrap();
        assert!(name.ends_with(".mp4"), "got: {url}");

        let written = std::fs::read(dir.path().join("tmp").join(name)).unwrap();
        assert_eq!(written, b"mp4-bytes");
    }

    #[tokio::test]
    async fn failed_download_is_error() {
        let base = media_server().await;
        let dir = tempfile::tempdir().unwrap();
        let cache = FileMediaCache::new(reqwest::Client::new(), dir.path().to_path_buf(), "http://h", true);

        let err = cache.store(&format!("{base}/missing"), MediaKind::Image).await.unwrap_err();
        assert!(matches!(err, CacheError::Download(_)), "got: {err:?}");
    }

    #[test]
    fn caching_toggles_at_runtime() {
        let cache = FileMediaCache::new(reqwest::Client::new(), PathBuf::from("tmp"), "http://h", false);
        assert!(!cache.enabled());
        cache.set_enabled(true);
        assert!(cache.enabled());
    }
}
