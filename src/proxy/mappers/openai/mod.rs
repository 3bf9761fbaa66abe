pub mod ingest;
pub mod models;
pub mod request;
pub mod response;
pub mod streaming;

pub use ingest::SseChunkParser;
pub use models::{OpenAIMessage, OpenAIRequest, ToolCall, ToolFunction};
pub use request::{build_upstream_body, to_normalized};
pub use response::{parse_upstream_response, render_response};
pub use streaming::OpenAIStreamEmitter;
