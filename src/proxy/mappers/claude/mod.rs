pub mod models;
pub mod request;
pub mod response;
pub mod streaming;

pub use models::{ClaudeRequest, ThinkingConfig};
pub use request::to_normalized;
pub use response::render_response;
pub use streaming::ClaudeStreamEmitter;
