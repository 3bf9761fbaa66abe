pub const USER_AGENT: &str = concat!("tideway/", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_OPUS_MODEL: &str = "claude-opus-4-5-20251101";
pub const DEFAULT_SONNET_MODEL: &str = "claude-sonnet-4-5-20250929";

pub const DEFAULT_UPSTREAM_BASE_URL: &str = "http://127.0.0.1:8317";

/// Marker a client can embed in a user message to pin the request to Opus.
pub const FORCE_OPUS_MARKER: &str = "[FORCE_OPUS]";
/// Header carrying the same whitelist intent.
pub const FORCE_MODEL_HEADER: &str = "x-force-model";

pub const ANTHROPIC_VERSION_HEADER: &str = "anthropic-version";

pub const SUMMARY_USER_PREFIX: &str = "[Earlier conversation summary]";
pub const SUMMARY_USER_SUFFIX: &str = "[Continuing from recent messages...]";
pub const SUMMARY_ACK: &str = "I understand the context. Let's continue.";

pub const CONTINUE_PROMPT: &str =
    "Your previous response was truncated. Continue EXACTLY from where you stopped. \
     Do not repeat any content and do not add preambles.";
