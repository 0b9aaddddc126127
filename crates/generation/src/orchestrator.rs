//! Generation run
//!
//! One run walks a fixed sequence and stops at the first failure:
//! 1. validate the model and image count
//! 2. select a credential (advisory)
//! 3. refresh its access token if needed
//! 4. make sure it has a workspace
//! 5. take a concurrency slot, upload references, submit
//! 6. (video) poll until a terminal status or the attempt budget runs out
//! 7. cache the media if caching is on
//!
//! After selection, the outcome updates credential health exactly once:
//! success records usage then success, a rate limit bans, any other backend
//! failure records an error. Validation and capacity failures leave the
//! credential untouched.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pool::{CredentialPool, Scheduler};
use store::{Credential, GenerationTask, MediaKind, TaskStatus};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use upstream::constants::DEFAULT_PAYGATE_TIER;
use upstream::{ChallengeProvider, ImageRequest, OperationHandle, OperationStatus, VideoInput, VideoRequest};

use crate::cache::MediaCache;
use crate::error::{GenerationError, Penalty, Result};
use crate::events::{Availability, GenerationEvent, GenerationOutput};
use crate::models::{self, ModelConfig, VideoMode};

const EVENT_BUFFER: usize = 32;

/// Emit a progress line every this many poll attempts.
const PROGRESS_EVERY: u32 = 7;

/// Progress reported while polling never reaches 100 before completion.
const MAX_POLL_PROGRESS: u32 = 95;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            max_poll_attempts: 500,
        }
    }
}

/// Sending half of a run's event stream. A caller that went away does not
/// stop the run.
struct EventSink(mpsc::Sender<GenerationEvent>);

impl EventSink {
    async fn progress(&self, message: impl Into<String>) {
        self.send(GenerationEvent::Progress(message.into())).await;
    }

    async fn send(&self, event: GenerationEvent) {
        if self.0.send(event).await.is_err() {
            debug!("event receiver dropped, continuing run");
        }
    }
}

pub struct Orchestrator {
    pool: Arc<CredentialPool>,
    scheduler: Scheduler,
    challenge: Option<Arc<dyn ChallengeProvider>>,
    cache: Option<Arc<dyn MediaCache>>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(pool: Arc<CredentialPool>, settings: OrchestratorSettings) -> Self {
        Self {
            scheduler: Scheduler::new(Arc::clone(&pool)),
            pool,
            challenge: None,
            cache: None,
            settings,
        }
    }

    pub fn with_challenge_provider(mut self, provider: Arc<dyn ChallengeProvider>) -> Self {
        self.challenge = Some(provider);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn MediaCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Dry run for non-streaming callers: is there a credential that could
    /// serve this model right now?
    pub async fn check_availability(&self, model: &str) -> Availability {
        let Some(config) = models::lookup(model) else {
            return Availability {
                available: false,
                reason: format!("Unsupported model: {model}"),
            };
        };
        let kind = config.kind.label();
        match self.scheduler.select(config.kind, model).await {
            Some(_) => Availability {
                available: true,
                reason: format!(
                    "Credentials available for {kind} generation. Enable streaming to use generation."
                ),
            },
            None => Availability {
                available: false,
                reason: format!("No credentials available for {kind} generation"),
            },
        }
    }

    /// Start a generation run and return its event stream.
    ///
    /// The stream yields progress lines and always ends with one
    /// `Finished` event.
    pub fn run_generation(
        self: &Arc<Self>,
        model: &str,
        prompt: &str,
        images: Vec<Vec<u8>>,
    ) -> mpsc::Receiver<GenerationEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = Arc::clone(self);
        let model = model.to_string();
        let prompt = prompt.to_string();

        tokio::spawn(async move {
            let sink = EventSink(tx);
            let started = Instant::now();
            let kind = models::lookup(&model)
                .map(|m| m.kind.label())
                .unwrap_or("unknown");
            info!(model = %model, kind, images = images.len(), "generation started");

            let result = this.run(&model, &prompt, images, &sink).await;

            let elapsed = started.elapsed().as_secs_f64();
            let outcome = match &result {
                Ok(output) => {
                    info!(model = %model, url = %output.url, elapsed_secs = elapsed, "generation completed");
                    "success"
                }
                Err(e) => {
                    warn!(model = %model, outcome = e.label(), error = %e, "generation failed");
                    e.label()
                }
            };
            metrics::counter!("generation_requests_total", "kind" => kind, "outcome" => outcome)
                .increment(1);
            metrics::histogram!("generation_duration_seconds", "kind" => kind).record(elapsed);

            sink.send(GenerationEvent::Finished(result)).await;
        });

        rx
    }

    async fn run(
        &self,
        model: &str,
        prompt: &str,
        images: Vec<Vec<u8>>,
        sink: &EventSink,
    ) -> Result<GenerationOutput> {
        let config = validate(model, images.len())?;
        let kind = config.kind;
        sink.progress(format!("{} generation task started", title(kind))).await;

        let credential = self
            .scheduler
            .select(kind, model)
            .await
            .ok_or_else(|| GenerationError::NoCredentialAvailable(no_credential_message(kind)))?;
        let id = credential.id;

        let result = self.dispatch(config, id, prompt, images, sink).await;
        self.settle(id, kind, &result).await;
        result
    }

    /// Apply the single health update owed for this run.
    async fn settle(&self, id: u64, kind: MediaKind, result: &Result<GenerationOutput>) {
        match result {
            Ok(_) => {
                if let Err(e) = self.pool.record_usage(id, kind).await {
                    warn!(credential_id = id, error = %e, "failed to record usage");
                }
                if let Err(e) = self.pool.record_success(id).await {
                    warn!(credential_id = id, error = %e, "failed to record success");
                }
            }
            Err(err) => match err.penalty() {
                Penalty::RateLimitBan => {
                    warn!(credential_id = id, "backend rate limited credential");
                    if let Err(e) = self.pool.ban_for_rate_limit(id).await {
                        warn!(credential_id = id, error = %e, "failed to ban credential");
                    }
                }
                Penalty::RecordError => {
                    if let Err(e) = self.pool.record_error(id).await {
                        warn!(credential_id = id, error = %e, "failed to record error");
                    }
                }
                Penalty::None => {}
            },
        }
    }

    async fn dispatch(
        &self,
        config: &'static ModelConfig,
        id: u64,
        prompt: &str,
        images: Vec<Vec<u8>>,
        sink: &EventSink,
    ) -> Result<GenerationOutput> {
        sink.progress("Initializing generation environment...").await;
        let credential = self.pool.ensure_fresh_secret(id).await.map_err(|e| {
            warn!(credential_id = id, error = %e, "credential refresh failed");
            GenerationError::AuthExchange("Credential invalid or refresh failed".into())
        })?;

        let workspace_id = self
            .pool
            .ensure_project_exists(id)
            .await
            .map_err(|e| match e {
                pool::Error::Upstream(ref err) => {
                    GenerationError::from_upstream("Failed to ensure project", err)
                }
                other => {
                    GenerationError::from_failure_text(format!("Failed to ensure project: {other}"))
                }
            })?;
        debug!(credential_id = id, workspace_id = %workspace_id, "workspace ready");

        let kind = config.kind;
        let Some(_slot) = self.pool.slots().try_acquire(kind, id) else {
            return Err(GenerationError::ConcurrencyExhausted(format!(
                "{} concurrency limit reached",
                title(kind)
            )));
        };

        let token = credential.short_lived().unwrap_or_default();
        match kind {
            MediaKind::Image => {
                let upstream_url = self
                    .generate_image(config, token, &workspace_id, prompt, &images, sink)
                    .await?;
                let url = self.cache_media(&upstream_url, kind, sink).await;
                Ok(GenerationOutput {
                    kind,
                    url,
                    upstream_url,
                })
            }
            MediaKind::Video => {
                let (operation, upstream_url) = self
                    .generate_video(config, &credential, token, &workspace_id, prompt, images, sink)
                    .await?;
                let url = self.cache_media(&upstream_url, kind, sink).await;
                self.complete_task(&operation, &url).await;
                Ok(GenerationOutput {
                    kind,
                    url,
                    upstream_url,
                })
            }
        }
    }

    async fn challenge_token(&self, workspace_id: &str) -> Option<String> {
        let provider = self.challenge.as_ref()?;
        match provider.produce_token(workspace_id).await {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(workspace_id, error = %e, "submitting without challenge token");
                None
            }
        }
    }

    async fn upload(
        &self,
        token: &str,
        bytes: &[u8],
        config: &ModelConfig,
        context: &str,
    ) -> Result<String> {
        self.pool
            .upstream()
            .upload_asset(token, bytes, config.aspect_ratio)
            .await
            .map_err(|e| GenerationError::from_upstream(context, &e))
    }

    async fn generate_image(
        &self,
        config: &ModelConfig,
        token: &str,
        workspace_id: &str,
        prompt: &str,
        images: &[Vec<u8>],
        sink: &EventSink,
    ) -> Result<String> {
        let mut reference_assets = Vec::with_capacity(images.len());
        if !images.is_empty() {
            sink.progress(format!("Uploading {} reference image(s)...", images.len()))
                .await;
            for (i, bytes) in images.iter().enumerate() {
                let asset = self
                    .upload(token, bytes, config, &format!("Failed to upload image {}", i + 1))
                    .await?;
                reference_assets.push(asset);
                sink.progress(format!("Uploaded image {}/{}", i + 1, images.len()))
                    .await;
            }
        }

        sink.progress("Generating image...").await;
        let request = ImageRequest {
            workspace_id: workspace_id.to_string(),
            prompt: prompt.to_string(),
            model_name: config.upstream_model.to_string(),
            aspect_ratio: config.aspect_ratio.to_string(),
            reference_assets,
            challenge_token: self.challenge_token(workspace_id).await,
        };
        let result = self
            .pool
            .upstream()
            .submit_image(token, &request)
            .await
            .map_err(|e| GenerationError::from_upstream("Generation failed", &e))?;

        result
            .result_urls
            .into_iter()
            .next()
            .ok_or_else(|| GenerationError::from_failure_text("Empty generation result".into()))
    }

    /// Submit a video and poll it to completion. Returns the operation name
    /// and the backend URL.
    #[allow(clippy::too_many_arguments)]
    async fn generate_video(
        &self,
        config: &ModelConfig,
        credential: &Credential,
        token: &str,
        workspace_id: &str,
        prompt: &str,
        mut images: Vec<Vec<u8>>,
        sink: &EventSink,
    ) -> Result<(String, String)> {
        let mode = config.video_mode.unwrap_or(VideoMode::TextToVideo);
        if mode == VideoMode::TextToVideo && !images.is_empty() {
            warn!(model = config.name, dropped = images.len(), "text-to-video model ignores images");
            sink.progress("Text-to-video model does not accept images, ignoring them")
                .await;
            images.clear();
        }

        let input = match mode {
            VideoMode::TextToVideo => VideoInput::Text,
            VideoMode::ImageToVideo => {
                let mut frames = images.iter();
                let Some(first) = frames.next() else {
                    return Err(GenerationError::Validation(bounds_message(config, 0)));
                };
                let last = frames.next();
                sink.progress(if last.is_some() {
                    "Uploading start and end frames..."
                } else {
                    "Uploading start frame..."
                })
                .await;
                let start = self
                    .upload(token, first, config, "Failed to upload start frame")
                    .await?;
                let end = match last {
                    Some(bytes) => Some(
                        self.upload(token, bytes, config, "Failed to upload end frame")
                            .await?,
                    ),
                    None => None,
                };
                VideoInput::StartEnd { start, end }
            }
            VideoMode::ReferenceToVideo if images.is_empty() => VideoInput::Text,
            VideoMode::ReferenceToVideo => {
                sink.progress(format!("Uploading {} reference images...", images.len()))
                    .await;
                let mut assets = Vec::with_capacity(images.len());
                for (i, bytes) in images.iter().enumerate() {
                    let context = format!("Failed to upload reference image {}", i + 1);
                    assets.push(self.upload(token, bytes, config, &context).await?);
                }
                VideoInput::References(assets)
            }
        };

        sink.progress("Submitting video generation task...").await;
        let paygate_tier = credential
            .paygate_tier
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_PAYGATE_TIER.to_string());
        let request = VideoRequest {
            workspace_id: workspace_id.to_string(),
            prompt: prompt.to_string(),
            model_key: config.upstream_model.to_string(),
            aspect_ratio: config.aspect_ratio.to_string(),
            paygate_tier,
            input,
            challenge_token: self.challenge_token(workspace_id).await,
        };
        let handle = self
            .pool
            .upstream()
            .submit_video(token, &request)
            .await
            .map_err(|e| GenerationError::from_upstream("Video generation failed", &e))?;
        info!(credential_id = credential.id, operation = %handle.name, mode = mode.label(), "video submitted");

        let task = GenerationTask {
            operation_name: handle.name.clone(),
            credential_id: credential.id,
            model: config.upstream_model.to_string(),
            prompt: prompt.to_string(),
            status: TaskStatus::Processing,
            progress: 0,
            result_urls: Vec::new(),
            error_message: None,
            scene_id: handle.scene_id.clone(),
            created_at: self.pool.clock().now(),
            completed_at: None,
        };
        if let Err(e) = self.pool.store().insert_task(task).await {
            warn!(operation = %handle.name, error = %e, "failed to persist task");
        }

        sink.progress("Video generating...").await;
        let url = self.poll(token, &handle, sink).await?;
        Ok((handle.name, url))
    }

    /// Probe the operation at a fixed interval until it finishes or the
    /// attempt budget is spent. Probe failures consume an attempt.
    async fn poll(&self, token: &str, handle: &OperationHandle, sink: &EventSink) -> Result<String> {
        let max_attempts = self.settings.max_poll_attempts;

        for attempt in 0..max_attempts {
            tokio::time::sleep(self.settings.poll_interval).await;

            let status = match self.pool.upstream().poll_operation(token, handle).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(operation = %handle.name, attempt, error = %e, "poll failed");
                    continue;
                }
            };

            if attempt % PROGRESS_EVERY == 0 {
                let progress = poll_progress(attempt, max_attempts);
                sink.progress(format!("Progress: {progress}%")).await;
                self.update_task(&handle.name, |t| t.progress = progress as u8)
                    .await;
            }

            match status {
                OperationStatus::Pending => {}
                OperationStatus::Succeeded { result_url } => return Ok(result_url),
                OperationStatus::Failed { status } => {
                    let message = format!("Video generation failed: {status}");
                    self.fail_task(&handle.name, &message).await;
                    return Err(GenerationError::from_failure_text(message));
                }
            }
        }

        let message = format!("Video generation timeout (polled {max_attempts} times)");
        self.fail_task(&handle.name, &message).await;
        Err(GenerationError::Timeout(message))
    }

    async fn cache_media(&self, url: &str, kind: MediaKind, sink: &EventSink) -> String {
        let Some(cache) = self.cache.as_ref().filter(|c| c.enabled()) else {
            return url.to_string();
        };
        sink.progress(format!("Caching {}...", kind.label())).await;
        match cache.store(url, kind).await {
            Ok(local) => {
                sink.progress(format!("{} cached", title(kind))).await;
                local
            }
            Err(e) => {
                warn!(error = %e, "media cache failed, returning backend url");
                sink.progress(format!("Cache failed: {e}")).await;
                url.to_string()
            }
        }
    }

    async fn update_task<F>(&self, operation: &str, f: F)
    where
        F: FnOnce(&mut GenerationTask),
    {
        if let Err(e) = self.pool.store().update_task(operation, f).await {
            warn!(operation, error = %e, "failed to update task");
        }
    }

    async fn complete_task(&self, operation: &str, url: &str) {
        let now = self.pool.clock().now();
        let url = url.to_string();
        self.update_task(operation, move |t| t.complete(url, now)).await;
    }

    async fn fail_task(&self, operation: &str, message: &str) {
        let now = self.pool.clock().now();
        let message = message.to_string();
        self.update_task(operation, move |t| t.fail(message, now)).await;
    }
}

/// Model lookup plus image-count bounds.
fn validate(model: &str, image_count: usize) -> Result<&'static ModelConfig> {
    let config = models::lookup(model)
        .ok_or_else(|| GenerationError::Validation(format!("Unsupported model: {model}")))?;
    if !config.accepts_image_count(image_count) {
        return Err(GenerationError::Validation(bounds_message(config, image_count)));
    }
    Ok(config)
}

fn bounds_message(config: &ModelConfig, count: usize) -> String {
    let mode = config.video_mode.map(|m| m.label()).unwrap_or("image");
    match config.max_images {
        Some(max) => format!(
            "{} model requires {}-{} images, got {count}",
            mode.to_uppercase(),
            config.min_images,
            max
        ),
        None => format!(
            "{} model requires at least {} images, got {count}",
            mode.to_uppercase(),
            config.min_images
        ),
    }
}

fn poll_progress(attempt: u32, max_attempts: u32) -> u32 {
    let percent = (u64::from(attempt) * 100 / u64::from(max_attempts.max(1))) as u32;
    percent.min(MAX_POLL_PROGRESS)
}

fn title(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "Image",
        MediaKind::Video => "Video",
    }
}

fn no_credential_message(kind: MediaKind) -> String {
    match kind {
        MediaKind::Image => "No credentials available for image generation. All credentials are disabled, rate limited or expired.".into(),
        MediaKind::Video => "No credentials available for video generation. All credentials are disabled, rate limited, out of credits or expired.".into(),
    }
}
