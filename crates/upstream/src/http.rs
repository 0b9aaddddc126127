//! reqwest implementation of `UpstreamClient`
//!
//! Labs endpoints authenticate with the session cookie, API endpoints with a
//! Bearer access token. Every response body is decoded into a private wire
//! struct before it leaves this module.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use rand::RngExt;
use reqwest::header::{AUTHORIZATION, COOKIE, USER_AGENT as USER_AGENT_HEADER};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::constants::{
    SEED_RANGE, SESSION_COOKIE, STATUS_ERROR_PREFIX, STATUS_SUCCESSFUL, TOOL_NAME,
    UPLOAD_TOOL_NAME, USER_AGENT,
};
use crate::error::{Result, UpstreamError};
use crate::types::{
    CreditBalance, ImageRequest, ImageResult, OperationHandle, OperationStatus, SessionExchange,
    VideoInput, VideoRequest,
};
use crate::{BoxFuture, UpstreamClient};

/// HTTP client for the labs and API hosts.
#[derive(Clone)]
pub struct HttpUpstreamClient {
    client: reqwest::Client,
    labs_base_url: String,
    api_base_url: String,
}

impl HttpUpstreamClient {
    /// `client` should already carry the timeout and any outbound proxy.
    pub fn new(
        client: reqwest::Client,
        labs_base_url: impl Into<String>,
        api_base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            labs_base_url: labs_base_url.into().trim_end_matches('/').to_string(),
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Send a request and decode the JSON body.
    ///
    /// 429 maps to `RateLimited`, any other status >= 400 to `Status`.
    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .header(USER_AGENT_HEADER, USER_AGENT)
            .send()
            .await
            .map_err(|e| UpstreamError::Http(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| UpstreamError::Http(format!("reading response body: {e}")))?;

        if status == 429 {
            return Err(UpstreamError::RateLimited(body));
        }
        if status >= 400 {
            return Err(UpstreamError::Status { status, body });
        }

        serde_json::from_str(&body).map_err(|e| UpstreamError::Decode(e.to_string()))
    }

    fn with_session(&self, request: reqwest::RequestBuilder, secret: &str) -> reqwest::RequestBuilder {
        request.header(COOKIE, format!("{SESSION_COOKIE}={secret}"))
    }

    fn with_bearer(&self, request: reqwest::RequestBuilder, secret: &str) -> reqwest::RequestBuilder {
        request.header(AUTHORIZATION, format!("Bearer {secret}"))
    }

    async fn exchange(&self, long_lived_secret: &str) -> Result<SessionExchange> {
        let url = format!("{}/auth/session", self.labs_base_url);
        let request = self.with_session(self.client.get(url), long_lived_secret);
        let session: SessionResponse = self.send(request).await.map_err(|e| match e {
            UpstreamError::Status {
                status: status @ (401 | 403),
                body,
            } => UpstreamError::AuthExchange(format!("session token rejected ({status}): {body}")),
            other => UpstreamError::AuthExchange(other.to_string()),
        })?;
        session.into_exchange()
    }

    async fn credits(&self, short_lived_secret: &str) -> Result<CreditBalance> {
        let url = format!("{}/credits", self.api_base_url);
        let request = self.with_bearer(self.client.get(url), short_lived_secret);
        let credits: CreditsResponse = self.send(request).await?;
        Ok(CreditBalance {
            credits: credits.credits as i64,
            tier: credits.user_paygate_tier.filter(|t| !t.is_empty()),
        })
    }

    async fn create_project(&self, long_lived_secret: &str, name: &str) -> Result<String> {
        let url = format!("{}/trpc/project.createProject", self.labs_base_url);
        let body = json!({
            "json": {
                "projectTitle": name,
                "toolName": TOOL_NAME,
            }
        });
        let request = self.with_session(self.client.post(url).json(&body), long_lived_secret);
        let response: CreateProjectResponse = self.send(request).await?;
        Ok(response.result.data.json.result.project_id)
    }

    async fn upload(&self, short_lived_secret: &str, bytes: &[u8], aspect_ratio: &str) -> Result<String> {
        let url = format!("{}:uploadUserImage", self.api_base_url);
        let body = json!({
            "imageInput": {
                "rawImageBytes": STANDARD.encode(bytes),
                "mimeType": "image/jpeg",
                "isUserUploaded": true,
                "aspectRatio": image_aspect_ratio(aspect_ratio),
            },
            "clientContext": {
                "sessionId": session_id(),
                "tool": UPLOAD_TOOL_NAME,
            }
        });
        let request = self.with_bearer(self.client.post(url).json(&body), short_lived_secret);
        let response: UploadResponse = self.send(request).await?;
        Ok(response.media_generation_id.media_generation_id)
    }

    async fn generate_image(&self, short_lived_secret: &str, req: &ImageRequest) -> Result<ImageResult> {
        let url = format!(
            "{}/projects/{}/flowMedia:batchGenerateImages",
            self.api_base_url, req.workspace_id
        );
        let session = session_id();
        let token = req.challenge_token.clone().unwrap_or_default();
        let inputs: Vec<Value> = req
            .reference_assets
            .iter()
            .map(|asset| json!({ "name": asset, "imageInputType": "IMAGE_INPUT_TYPE_REFERENCE" }))
            .collect();
        let body = json!({
            "clientContext": { "recaptchaToken": token, "sessionId": session },
            "requests": [{
                "clientContext": {
                    "recaptchaToken": token,
                    "projectId": req.workspace_id,
                    "sessionId": session,
                    "tool": TOOL_NAME,
                },
                "seed": seed(),
                "imageModelName": req.model_name,
                "imageAspectRatio": req.aspect_ratio,
                "prompt": req.prompt,
                "imageInputs": inputs,
            }]
        });
        let request = self.with_bearer(self.client.post(url).json(&body), short_lived_secret);
        let response: ImageResponse = self.send(request).await?;
        Ok(ImageResult {
            result_urls: response
                .media
                .into_iter()
                .filter_map(|m| m.image?.generated_image?.fife_url)
                .collect(),
        })
    }

    async fn generate_video(&self, short_lived_secret: &str, req: &VideoRequest) -> Result<OperationHandle> {
        let (endpoint, mut entry) = match &req.input {
            VideoInput::Text => ("batchAsyncGenerateVideoText", json!({})),
            VideoInput::StartEnd { start, end } => {
                let mut entry = json!({ "startImage": { "mediaId": start } });
                if let Some(end) = end {
                    entry["endImage"] = json!({ "mediaId": end });
                }
                ("batchAsyncGenerateVideoStartAndEndImage", entry)
            }
            VideoInput::References(assets) => {
                let refs: Vec<Value> = assets
                    .iter()
                    .map(|a| json!({ "imageUsageType": "IMAGE_USAGE_TYPE_ASSET", "mediaId": a }))
                    .collect();
                ("batchAsyncGenerateVideoReferenceImages", json!({ "referenceImages": refs }))
            }
        };
        entry["aspectRatio"] = json!(req.aspect_ratio);
        entry["seed"] = json!(seed());
        entry["textInput"] = json!({ "prompt": req.prompt });
        entry["videoModelKey"] = json!(req.model_key);
        entry["metadata"] = json!({ "sceneId": uuid::Uuid::new_v4().to_string() });

        let url = format!("{}/video:{endpoint}", self.api_base_url);
        let body = json!({
            "clientContext": {
                "recaptchaToken": req.challenge_token.clone().unwrap_or_default(),
                "sessionId": session_id(),
                "projectId": req.workspace_id,
                "tool": TOOL_NAME,
                "userPaygateTier": req.paygate_tier,
            },
            "requests": [entry],
        });
        debug!(endpoint, model = %req.model_key, "submitting video generation");
        let request = self.with_bearer(self.client.post(url).json(&body), short_lived_secret);
        let response: OperationsResponse = self.send(request).await?;
        let entry = response
            .operations
            .into_iter()
            .next()
            .ok_or_else(|| UpstreamError::Decode("No operations in response".into()))?;
        Ok(OperationHandle {
            name: entry.operation.name,
            scene_id: entry.scene_id,
            status: entry.status,
        })
    }

    async fn check_status(&self, short_lived_secret: &str, handle: &OperationHandle) -> Result<OperationStatus> {
        let url = format!("{}/video:batchCheckAsyncVideoGenerationStatus", self.api_base_url);
        let mut operation = json!({ "operation": { "name": handle.name } });
        if let Some(scene_id) = &handle.scene_id {
            operation["sceneId"] = json!(scene_id);
        }
        if let Some(status) = &handle.status {
            operation["status"] = json!(status);
        }
        let body = json!({ "operations": [operation] });
        let request = self.with_bearer(self.client.post(url).json(&body), short_lived_secret);
        let response: OperationsResponse = self.send(request).await?;
        match response.operations.into_iter().next() {
            Some(entry) => interpret_operation(entry),
            None => Ok(OperationStatus::Pending),
        }
    }
}

impl UpstreamClient for HttpUpstreamClient {
    fn exchange_credential<'a>(&'a self, long_lived_secret: &'a str) -> BoxFuture<'a, Result<SessionExchange>> {
        Box::pin(self.exchange(long_lived_secret))
    }

    fn query_credit_balance<'a>(&'a self, short_lived_secret: &'a str) -> BoxFuture<'a, Result<CreditBalance>> {
        Box::pin(self.credits(short_lived_secret))
    }

    fn create_workspace<'a>(&'a self, long_lived_secret: &'a str, name: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.create_project(long_lived_secret, name))
    }

    fn upload_asset<'a>(
        &'a self,
        short_lived_secret: &'a str,
        bytes: &'a [u8],
        aspect_ratio: &'a str,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.upload(short_lived_secret, bytes, aspect_ratio))
    }

    fn submit_image<'a>(
        &'a self,
        short_lived_secret: &'a str,
        request: &'a ImageRequest,
    ) -> BoxFuture<'a, Result<ImageResult>> {
        Box::pin(self.generate_image(short_lived_secret, request))
    }

    fn submit_video<'a>(
        &'a self,
        short_lived_secret: &'a str,
        request: &'a VideoRequest,
    ) -> BoxFuture<'a, Result<OperationHandle>> {
        Box::pin(self.generate_video(short_lived_secret, request))
    }

    fn poll_operation<'a>(
        &'a self,
        short_lived_secret: &'a str,
        handle: &'a OperationHandle,
    ) -> BoxFuture<'a, Result<OperationStatus>> {
        Box::pin(self.check_status(short_lived_secret, handle))
    }
}

/// Client session id: `;` followed by the current unix millis.
fn session_id() -> String {
    format!(";{}", Utc::now().timestamp_millis())
}

fn seed() -> u32 {
    rand::rng().random_range(0..SEED_RANGE)
}

/// Uploads only accept image aspect ratios; video ones map across by suffix.
fn image_aspect_ratio(aspect_ratio: &str) -> String {
    match aspect_ratio.strip_prefix("VIDEO_") {
        Some(rest) => format!("IMAGE_{rest}"),
        None => aspect_ratio.to_string(),
    }
}

fn interpret_operation(entry: OperationEntry) -> Result<OperationStatus> {
    let status = entry.status.unwrap_or_default();
    if status == STATUS_SUCCESSFUL {
        let url = entry
            .operation
            .metadata
            .and_then(|m| m.video)
            .and_then(|v| v.fife_url)
            .ok_or_else(|| UpstreamError::Decode("successful operation has no video url".into()))?;
        return Ok(OperationStatus::Succeeded { result_url: url });
    }
    if status.starts_with(STATUS_ERROR_PREFIX) {
        return Ok(OperationStatus::Failed { status });
    }
    Ok(OperationStatus::Pending)
}

// --- wire types ---

#[derive(Debug, Deserialize)]
struct SessionResponse {
    access_token: Option<String>,
    expires: Option<String>,
    #[serde(default)]
    user: SessionUser,
}

#[derive(Debug, Default, Deserialize)]
struct SessionUser {
    #[serde(default)]
    email: String,
    #[serde(default)]
    name: String,
}

impl SessionResponse {
    fn into_exchange(self) -> Result<SessionExchange> {
        let token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| UpstreamError::AuthExchange("session response has no access_token".into()))?;
        let expires_at = self
            .expires
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Ok(SessionExchange {
            short_lived_secret: token,
            expires_at,
            email: self.user.email,
            name: self.user.name,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreditsResponse {
    #[serde(default)]
    credits: f64,
    user_paygate_tier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateProjectResponse {
    result: TrpcResult,
}

#[derive(Debug, Deserialize)]
struct TrpcResult {
    data: TrpcData,
}

#[derive(Debug, Deserialize)]
struct TrpcData {
    json: TrpcJson,
}

#[derive(Debug, Deserialize)]
struct TrpcJson {
    result: ProjectResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectResult {
    project_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    media_generation_id: MediaGenerationId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaGenerationId {
    media_generation_id: String,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    media: Vec<MediaItem>,
}

#[derive(Debug, Deserialize)]
struct MediaItem {
    image: Option<ImageEnvelope>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageEnvelope {
    generated_image: Option<GeneratedMedia>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeneratedMedia {
    fife_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationsResponse {
    #[serde(default)]
    operations: Vec<OperationEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationEntry {
    operation: OperationBody,
    scene_id: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationBody {
    name: String,
    metadata: Option<OperationMetadata>,
}

#[derive(Debug, Deserialize)]
struct OperationMetadata {
    video: Option<GeneratedMedia>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::response::{IntoResponse, Response};
    use tokio::net::TcpListener;

    fn header(headers: &HeaderMap, name: &str) -> String {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    /// Fake backend dispatching on the request path.
    async fn mock_backend(uri: Uri, headers: HeaderMap, bytes: Bytes) -> Response {
        let path = uri.path().to_string();
        let cookie = header(&headers, "cookie");
        let bearer = header(&headers, "authorization");
        let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        let (status, out) = match path.as_str() {
            "/labs/auth/session" if cookie == format!("{SESSION_COOKIE}=st-good") => (
                StatusCode::OK,
                json!({
                    "access_token": "at-fresh",
                    "expires": "2030-01-01T00:00:00Z",
                    "user": { "email": "a@example.com", "name": "Alice" }
                }),
            ),
            "/labs/auth/session" => (StatusCode::UNAUTHORIZED, json!({ "error": "bad session" })),
            "/labs/trpc/project.createProject" => {
                assert_eq!(body["json"]["toolName"], TOOL_NAME);
                (
                    StatusCode::OK,
                    json!({ "result": { "data": { "json": { "result": { "projectId": "ws-new" } } } } }),
                )
            }
            "/v1/credits" => (
                StatusCode::OK,
                json!({ "credits": 1250.0, "userPaygateTier": "PAYGATE_TIER_TWO" }),
            ),
            "/v1:uploadUserImage" => {
                assert_eq!(body["imageInput"]["aspectRatio"], "IMAGE_ASPECT_RATIO_LANDSCAPE");
                (
                    StatusCode::OK,
                    json!({ "mediaGenerationId": { "mediaGenerationId": "asset-1" } }),
                )
            }
            "/v1/projects/ws-1/flowMedia:batchGenerateImages" => {
                if body["requests"][0]["prompt"] == "rate-limit-me" {
                    (StatusCode::TOO_MANY_REQUESTS, json!({ "error": "quota" }))
                } else {
                    (
                        StatusCode::OK,
                        json!({ "media": [{ "image": { "generatedImage": { "fifeUrl": "https://cdn/img.jpg" } } }] }),
                    )
                }
            }
            "/v1/video:batchAsyncGenerateVideoStartAndEndImage" => {
                assert_eq!(body["requests"][0]["startImage"]["mediaId"], "a1");
                assert!(body["requests"][0].get("endImage").is_none());
                assert_eq!(body["clientContext"]["userPaygateTier"], "PAYGATE_TIER_ONE");
                (
                    StatusCode::OK,
                    json!({ "operations": [{ "operation": { "name": "op-1" }, "sceneId": "s-1", "status": "MEDIA_GENERATION_STATUS_PENDING" }] }),
                )
            }
            "/v1/video:batchCheckAsyncVideoGenerationStatus" => {
                assert_eq!(body["operations"][0]["operation"]["name"], "op-1");
                (
                    StatusCode::OK,
                    json!({ "operations": [{
                        "operation": { "name": "op-1", "metadata": { "video": { "fifeUrl": "https://cdn/v.mp4" } } },
                        "status": STATUS_SUCCESSFUL
                    }] }),
                )
            }
            _ => (StatusCode::NOT_FOUND, json!({ "error": "no route", "bearer": bearer })),
        };
        (status, axum::Json(out)).into_response()
    }

    async fn start_backend() -> HttpUpstreamClient {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(mock_backend);
            axum::serve(listener, app).await.unwrap();
        });
        HttpUpstreamClient::new(
            reqwest::Client::new(),
            format!("http://{addr}/labs"),
            format!("http://{addr}/v1/"),
        )
    }

    #[tokio::test]
    async fn exchange_returns_token_expiry_and_profile() {
        let client = start_backend().await;
        let exchange = client.exchange_credential("st-good").await.unwrap();
        assert_eq!(exchange.short_lived_secret, "at-fresh");
        assert_eq!(exchange.email, "a@example.com");
        assert_eq!(exchange.name, "Alice");
        assert_eq!(
            exchange.expires_at.unwrap().to_rfc3339(),
            "2030-01-01T00:00:00+00:00"
        );
    }

    #[tokio::test]
    async fn exchange_rejection_is_auth_error() {
        let client = start_backend().await;
        let err = client.exchange_credential("st-bad").await.unwrap_err();
        assert!(matches!(err, UpstreamError::AuthExchange(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn credits_and_workspace_are_decoded() {
        let client = start_backend().await;
        let balance = client.query_credit_balance("at").await.unwrap();
        assert_eq!(balance.credits, 1250);
        assert_eq!(balance.tier.as_deref(), Some("PAYGATE_TIER_TWO"));

        let ws = client.create_workspace("st-good", "Mar 01 - 10:00").await.unwrap();
        assert_eq!(ws, "ws-new");
    }

    #[tokio::test]
    async fn upload_maps_video_aspect_ratio() {
        let client = start_backend().await;
        let asset = client
            .upload_asset("at", b"\xff\xd8jpeg", "VIDEO_ASPECT_RATIO_LANDSCAPE")
            .await
            .unwrap();
        assert_eq!(asset, "asset-1");
    }

    #[tokio::test]
    async fn image_submission_returns_urls_and_429_is_rate_limited() {
        let client = start_backend().await;
        let mut request = ImageRequest {
            workspace_id: "ws-1".into(),
            prompt: "a cat".into(),
            model_name: "GEM_PIX".into(),
            aspect_ratio: "IMAGE_ASPECT_RATIO_LANDSCAPE".into(),
            reference_assets: vec!["asset-1".into()],
            challenge_token: None,
        };
        let result = client.submit_image("at", &request).await.unwrap();
        assert_eq!(result.result_urls, vec!["https://cdn/img.jpg".to_string()]);

        request.prompt = "rate-limit-me".into();
        let err = client.submit_image("at", &request).await.unwrap_err();
        assert!(matches!(err, UpstreamError::RateLimited(_)), "got: {err:?}");
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn video_submission_then_poll_succeeds() {
        let client = start_backend().await;
        let request = VideoRequest {
            workspace_id: "ws-1".into(),
            prompt: "waves".into(),
            model_key: "veo_3_1_i2v_s_fast_fl".into(),
            aspect_ratio: "VIDEO_ASPECT_RATIO_LANDSCAPE".into(),
            paygate_tier: "PAYGATE_TIER_ONE".into(),
            input: VideoInput::StartEnd {
                start: "a1".into(),
                end: None,
            },
            challenge_token: Some("tok".into()),
        };
        let handle = client.submit_video("at", &request).await.unwrap();
        assert_eq!(handle.name, "op-1");
        assert_eq!(handle.scene_id.as_deref(), Some("s-1"));

        let status = client.poll_operation("at", &handle).await.unwrap();
        assert_eq!(
            status,
            OperationStatus::Succeeded {
                result_url: "https://cdn/v.mp4".into()
            }
        );
    }

    #[tokio::test]
    async fn connection_failure_is_http_error() {
        let client = HttpUpstreamClient::new(reqwest::Client::new(), "http://127.0.0.1:1", "http://127.0.0.1:1");
        let err = client.query_credit_balance("at").await.unwrap_err();
        assert!(matches!(err, UpstreamError::Http(_)), "got: {err:?}");
    }

    #[test]
    fn interpret_error_status_is_failed() {
        let entry: OperationEntry = serde_json::from_value(json!({
            "operation": { "name": "op" },
            "status": "MEDIA_GENERATION_STATUS_ERROR_UNSAFE"
        }))
        .unwrap();
        assert_eq!(
            interpret_operation(entry).unwrap(),
            OperationStatus::Failed {
                status: "MEDIA_GENERATION_STATUS_ERROR_UNSAFE".into()
            }
        );
    }

    #[test]
    fn interpret_unknown_status_is_pending() {
        let entry: OperationEntry = serde_json::from_value(json!({
            "operation": { "name": "op" },
            "status": "MEDIA_GENERATION_STATUS_ACTIVE"
        }))
        .unwrap();
        assert_eq!(interpret_operation(entry).unwrap(), OperationStatus::Pending);
    }

    #[test]
    fn session_without_expiry_has_unknown_expiry() {
        let session: SessionResponse =
            serde_json::from_value(json!({ "access_token": "at", "user": { "email": "e" } })).unwrap();
        let exchange = session.into_exchange().unwrap();
        assert!(exchange.expires_at.is_none());
    }

    #[test]
    fn image_aspect_ratio_passthrough() {
        assert_eq!(image_aspect_ratio("IMAGE_ASPECT_RATIO_PORTRAIT"), "IMAGE_ASPECT_RATIO_PORTRAIT");
        assert_eq!(image_aspect_ratio("VIDEO_ASPECT_RATIO_PORTRAIT"), "IMAGE_ASPECT_RATIO_PORTRAIT");
    }

    #[test]
    fn session_id_has_leading_semicolon() {
        let id = session_id();
        assert!(id.starts_with(';'));
        assert!(id[1..].parse::<i64>().is_ok());
    }
}
