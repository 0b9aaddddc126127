//! Backend endpoints and fixed protocol values

pub const DEFAULT_LABS_BASE_URL: &str = "https://labs.google/fx/api";

pub const DEFAULT_API_BASE_URL: &str = "https://aisandbox-pa.googleapis.com/v1";

/// Cookie carrying the long-lived session token on labs endpoints
pub const SESSION_COOKIE: &str = "__Secure-next-auth.session-token";

/// Tool name sent in client contexts and stored on workspace records
pub const TOOL_NAME: &str = "PINHOLE";

/// Tool name used for asset uploads
pub const UPLOAD_TOOL_NAME: &str = "ASSET_MANAGER";

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

pub const STATUS_SUCCESSFUL: &str = "MEDIA_GENERATION_STATUS_SUCCESSFUL";

/// Any status starting with this prefix is terminal failure
pub const STATUS_ERROR_PREFIX: &str = "MEDIA_GENERATION_STATUS_ERROR";

/// Upper bound (exclusive) for the random generation seed
pub const SEED_RANGE: u32 = 99_999;

/// Paygate tier sent with video submissions when the credit query gave none
pub const DEFAULT_PAYGATE_TIER: &str = "PAYGATE_TIER_ONE";
