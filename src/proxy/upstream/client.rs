use bytes::Bytes;
use futures::Stream;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::pin::Pin;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::config::{HttpPoolConfig, UpstreamConfig};
use crate::error::{AppError, AppResult};

/// Recognizes the length-limit error family across upstream phrasings.
/// These are never retried by the client itself; the history engine owns
/// recovery for them.
pub fn is_length_error(status: u16, error_text: &str) -> bool {
    if !(400..500).contains(&status) {
        return false;
    }
    if error_text.is_empty() {
        return false;
    }
    if error_text.contains("context_length_exceeded") || error_text.contains("Input is too long") {
        return true;
    }
    let lowered = error_text.to_lowercase();
    if lowered.contains("maximum context length") {
        return true;
    }
    if lowered.contains("too long")
        && (lowered.contains("input")
            || lowered.contains("content")
            || lowered.contains("message")
            || lowered.contains("context")
            || lowered.contains("prompt"))
    {
        return true;
    }
    if lowered.contains("token") && (lowered.contains("limit") || lowered.contains("exceed")) {
        return true;
    }
    false
}

fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub struct UpstreamClient {
    client: Client,
    base_url: String,
    api_key: String,
    max_attempts: usize,
    retry_base_ms: u64,
    retry_max_ms: u64,
}

impl UpstreamClient {
    pub fn new(upstream: &UpstreamConfig, pool: &HttpPoolConfig, request_timeout: u64) -> Self {
        // HTTP/1.1 only: multiplexing every request over one HTTP/2
        // connection makes the upstream co-mingle unrelated sessions.
        let client = Client::builder()
            .http1_only()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(pool.max_keepalive)
            .pool_idle_timeout(Duration::from_secs(pool.keepalive_expiry))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(request_timeout))
            .user_agent(crate::constants::USER_AGENT)
            .build()
            .expect("Failed to create upstream HTTP client");

        Self {
            client,
            base_url: upstream.base_url.trim_end_matches('/').to_string(),
            api_key: upstream.api_key.clone(),
            max_attempts: upstream.max_attempts.max(1),
            retry_base_ms: upstream.retry_base_ms,
            retry_max_ms: upstream.retry_max_ms,
        }
    }

    #[cfg(test)]
    pub fn new_for_test(base_url: &str) -> Self {
        Self::new(
            &UpstreamConfig {
                base_url: base_url.to_string(),
                api_key: "test-key".to_string(),
                max_attempts: 3,
                retry_base_ms: 1,
                retry_max_ms: 5,
            },
            &HttpPoolConfig::default(),
            30,
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    async fn send(
        &self,
        body: &Value,
        bearer_override: Option<&str>,
        trace_id: &str,
    ) -> AppResult<Response> {
        let url = self.endpoint();
        let mut last_error: Option<AppError> = None;

        for attempt in 0..self.max_attempts {
            let mut builder = self
                .client
                .post(&url)
                .header("content-type", "application/json");
            let token = bearer_override.unwrap_or(self.api_key.as_str());
            if !token.is_empty() {
                builder = builder.bearer_auth(token);
            }

            match builder.json(body).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        if attempt > 0 {
                            info!(
                                "[{}] Upstream request succeeded after {} retries",
                                trace_id, attempt
                            );
                        }
                        return Ok(resp);
                    }

                    let text = resp.text().await.unwrap_or_default();
                    let error = AppError::upstream(status.as_u16(), text);
                    if error.is_length_error() {
                        debug!(
                            "[{}] Upstream length error ({}), not retrying here",
                            trace_id, status
                        );
                        return Err(error);
                    }
                    if should_retry_status(status) && attempt + 1 < self.max_attempts {
                        let delay = self.backoff_delay(attempt);
                        warn!(
                            "[{}] Upstream returned {}, retrying in {:?} (attempt {}/{})",
                            trace_id,
                            status,
                            delay,
                            attempt + 1,
                            self.max_attempts
                        );
                        last_error = Some(error);
                        sleep(delay).await;
                        continue;
                    }
                    return Err(error);
                }
                Err(e) => {
                    let retryable = e.is_connect() || e.is_timeout();
                    if retryable && attempt + 1 < self.max_attempts {
                        let delay = self.backoff_delay(attempt);
                        warn!(
                            "[{}] Upstream connection failed ({}), retrying in {:?} (attempt {}/{})",
                            trace_id,
                            e,
                            delay,
                            attempt + 1,
                            self.max_attempts
                        );
                        last_error = Some(AppError::Network(e));
                        sleep(delay).await;
                        continue;
                    }
                    return Err(AppError::Network(e));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| AppError::Upstream {
                status: 502,
                message: "all upstream attempts failed".to_string(),
            }))
    }

    fn backoff_delay(&self, attempt: usize) -> Duration {
        let ms = (self.retry_base_ms * 2_u64.pow(attempt as u32)).min(self.retry_max_ms);
        Duration::from_millis(ms)
    }

    /// Non-streaming completion call. Returns the parsed response body.
    pub async fn chat(
        &self,
        body: Value,
        bearer_override: Option<&str>,
        trace_id: &str,
    ) -> AppResult<Value> {
        let resp = self.send(&body, bearer_override, trace_id).await?;
        resp.json::<Value>()
            .await
            .map_err(|e| AppError::StreamFormat(format!("invalid upstream JSON: {}", e)))
    }

    /// Streaming completion call. Returns the raw upstream byte stream; the
    /// re-emitter owns SSE framing from here.
    pub async fn chat_stream(
        &self,
        mut body: Value,
        bearer_override: Option<&str>,
        trace_id: &str,
    ) -> AppResult<Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>> {
        if let Some(obj) = body.as_object_mut() {
            obj.insert("stream".to_string(), Value::Bool(true));
        }
        let resp = self.send(&body, bearer_override, trace_id).await?;
        Ok(Box::pin(resp.bytes_stream()))
    }
}
