//! Static model table
//!
//! Maps the public model name a caller asks for to the backend model,
//! aspect ratio and (for video) the conditioning mode and image bounds.

use store::MediaKind;

/// How a video model is conditioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoMode {
    /// Prompt only; supplied images are dropped
    TextToVideo,
    /// First frame, optionally last frame
    ImageToVideo,
    /// Any number of reference images
    ReferenceToVideo,
}

impl VideoMode {
    pub fn label(&self) -> &'static str {
        match self {
            VideoMode::TextToVideo => "t2v",
            VideoMode::ImageToVideo => "i2v",
            VideoMode::ReferenceToVideo => "r2v",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelConfig {
    /// Public model name
    pub name: &'static str,
    pub kind: MediaKind,
    /// `None` for image models
    pub video_mode: Option<VideoMode>,
    /// Backend model name (image) or model key (video)
    pub upstream_model: &'static str,
    pub aspect_ratio: &'static str,
    pub min_images: usize,
    /// `None` means no upper bound
    pub max_images: Option<usize>,
}

impl ModelConfig {
    /// Whether `count` images satisfy the model's bounds.
    ///
    /// Text-to-video and image models accept any count: the former drops
    /// them, the latter uses them as references.
    pub fn accepts_image_count(&self, count: usize) -> bool {
        match self.video_mode {
            Some(VideoMode::ImageToVideo) | Some(VideoMode::ReferenceToVideo) => {
                count >= self.min_images && self.max_images.is_none_or(|max| count <= max)
            }
            _ => true,
        }
    }
}

const IMAGE_LANDSCAPE: &str = "IMAGE_ASPECT_RATIO_LANDSCAPE";
const IMAGE_PORTRAIT: &str = "IMAGE_ASPECT_RATIO_PORTRAIT";
const VIDEO_LANDSCAPE: &str = "VIDEO_ASPECT_RATIO_LANDSCAPE";
const VIDEO_PORTRAIT: &str = "VIDEO_ASPECT_RATIO_PORTRAIT";

const fn image(name: &'static str, upstream_model: &'static str, aspect_ratio: &'static str) -> ModelConfig {
    ModelConfig {
        name,
        kind: MediaKind::Image,
        video_mode: None,
        upstream_model,
        aspect_ratio,
        min_images: 0,
        max_images: None,
    }
}

const fn video(
    name: &'static str,
    mode: VideoMode,
    upstream_model: &'static str,
    aspect_ratio: &'static str,
) -> ModelConfig {
    let (min_images, max_images) = match mode {
        VideoMode::TextToVideo => (0, Some(0)),
        VideoMode::ImageToVideo => (1, Some(2)),
        VideoMode::ReferenceToVideo => (0, None),
    };
    ModelConfig {
        name,
        kind: MediaKind::Video,
        video_mode: Some(mode),
        upstream_model,
        aspect_ratio,
        min_images,
        max_images,
    }
}

use VideoMode::{ImageToVideo, ReferenceToVideo, TextToVideo};

static MODELS: [ModelConfig; 20] = [
    image("gemini-2.5-flash-image-landscape", "GEM_PIX", IMAGE_LANDSCAPE),
    image("gemini-2.5-flash-image-portrait", "GEM_PIX", IMAGE_PORTRAIT),
    image("gemini-3.0-pro-image-landscape", "GEM_PIX_2", IMAGE_LANDSCAPE),
    image("gemini-3.0-pro-image-portrait", "GEM_PIX_2", IMAGE_PORTRAIT),
    image("imagen-4.0-generate-preview-landscape", "IMAGEN_3_5", IMAGE_LANDSCAPE),
    image("imagen-4.0-generate-preview-portrait", "IMAGEN_3_5", IMAGE_PORTRAIT),
    video("veo_3_1_t2v_fast_portrait", TextToVideo, "veo_3_1_t2v_fast_portrait", VIDEO_PORTRAIT),
    video("veo_3_1_t2v_fast_landscape", TextToVideo, "veo_3_1_t2v_fast", VIDEO_LANDSCAPE),
    video("veo_2_1_fast_d_15_t2v_portrait", TextToVideo, "veo_2_1_fast_d_15_t2v", VIDEO_PORTRAIT),
    video("veo_2_1_fast_d_15_t2v_landscape", TextToVideo, "veo_2_1_fast_d_15_t2v", VIDEO_LANDSCAPE),
    video("veo_2_0_t2v_portrait", TextToVideo, "veo_2_0_t2v", VIDEO_PORTRAIT),
    video("veo_2_0_t2v_landscape", TextToVideo, "veo_2_0_t2v", VIDEO_LANDSCAPE),
    video("veo_3_1_i2v_s_fast_fl_portrait", ImageToVideo, "veo_3_1_i2v_s_fast_fl", VIDEO_PORTRAIT),
    video("veo_3_1_i2v_s_fast_fl_landscape", ImageToVideo, "veo_3_1_i2v_s_fast_fl", VIDEO_LANDSCAPE),
    video("veo_2_1_fast_d_15_i2v_portrait", ImageToVideo, "veo_2_1_fast_d_15_i2v", VIDEO_PORTRAIT),
    video("veo_2_1_fast_d_15_i2v_landscape", ImageToVideo, "veo_2_1_fast_d_15_i2v", VIDEO_LANDSCAPE),
    video("veo_2_0_i2v_portrait", ImageToVideo, "veo_2_0_i2v", VIDEO_PORTRAIT),
    video("veo_2_0_i2v_landscape", ImageToVideo, "veo_2_0_i2v", VIDEO_LANDSCAPE),
    video("veo_3_0_r2v_fast_portrait", ReferenceToVideo, "veo_3_0_r2v_fast", VIDEO_PORTRAIT),
    video("veo_3_0_r2v_fast_landscape", ReferenceToVideo, "veo_3_0_r2v_fast", VIDEO_LANDSCAPE),
];

pub fn lookup(name: &str) -> Option<&'static ModelConfig> {
    MODELS.iter().find(|m| m.name == name)
}

pub fn all() -> &'static [ModelConfig] {
    &MODELS
}
