pub mod client;

pub use client::{is_length_error, UpstreamClient};
