mod router_props;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use tokio::net::TcpListener;

use crate::config::AppConfig;

/// One scripted answer from the fake gateway.
#[derive(Clone)]
pub enum UpstreamStep {
    Json(Value),
    Sse(Vec<String>),
    Error(u16, String),
}

#[derive(Clone, Default)]
pub struct MockUpstream {
    steps: Arc<Mutex<VecDeque<UpstreamStep>>>,
    pub requests: Arc<Mutex<Vec<Value>>>,
}

impl MockUpstream {
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> Value {
        self.requests.lock().unwrap()[index].clone()
    }
}

async fn mock_handler(State(state): State<MockUpstream>, Json(body): Json<Value>) -> Response {
    state.requests.lock().unwrap().push(body);
    let step = state.steps.lock().unwrap().pop_front();
    match step {
        Some(UpstreamStep::Json(value)) => Json(value).into_response(),
        Some(UpstreamStep::Sse(lines)) => {
            let mut payload = String::new();
            for line in lines {
                payload.push_str(&line);
                payload.push_str("\n\n");
            }
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::from(payload))
                .unwrap()
        }
        Some(UpstreamStep::Error(status, message)) => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message,
        )
            .into_response(),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "mock upstream exhausted".to_string(),
        )
            .into_response(),
    }
}

/// Boots a scripted gateway on an ephemeral port.
pub async fn spawn_mock_upstream(steps: Vec<UpstreamStep>) -> (String, MockUpstream) {
    let mock = MockUpstream {
        steps: Arc::new(Mutex::new(steps.into())),
        requests: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/v1/chat/completions", post(mock_handler))
        .with_state(mock.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve mock");
    });
    (format!("http://{}", addr), mock)
}

/// Deterministic proxy configuration for scenario tests: probabilities are
/// pinned, background summarization is off unless a test opts in.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.model_routing.first_turn_opus_probability = 1.0;
    config.model_routing.execution_phase_sonnet_probability = 1.0;
    config.model_routing.base_opus_probability = 0.0;
    config.async_summary.enabled = false;
    config.upstream.max_attempts = 1;
    config
}

/// A canned OpenAI-dialect completion body.
pub fn completion_json(text: &str, finish_reason: &str) -> Value {
    serde_json::json!({
        "id": "chatcmpl-mock",
        "model": "mock-model",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": finish_reason
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
    })
}

pub fn sse_text_segment(text: &str, finish_reason: &str) -> Vec<String> {
    vec![
        format!(
            "data: {}",
            serde_json::json!({
                "id": "chatcmpl-mock",
                "model": "mock-model",
                "choices": [{"index": 0, "delta": {"role": "assistant", "content": text}}]
            })
        ),
        format!(
            "data: {}",
            serde_json::json!({
                "choices": [{"index": 0, "delta": {}, "finish_reason": finish_reason}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 20}
            })
        ),
        "data: [DONE]".to_string(),
    ]
}
