use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::StreamExt;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ContinuationConfig, HistoryConfig, ToolsConfig};
use crate::error::{AppError, AppResult};
use crate::proxy::chat::{
    estimate_request_tokens, normalize_request, ChatRequest, ChatResponse, ContentBlock,
    NormalizedEvent, StopReason, Usage,
};
use crate::proxy::continuation::{detect_truncation, ContinuationState, TruncationCheck};
use crate::proxy::handlers::errors::error_response;
use crate::proxy::history::{HistoryManager, SummaryFn};
use crate::proxy::mappers::claude::ClaudeStreamEmitter;
use crate::proxy::mappers::openai::{
    build_upstream_body, parse_upstream_response, OpenAIStreamEmitter, SseChunkParser,
};
use crate::proxy::mappers::{claude, openai, Dialect, InlineToolFilter};
use crate::proxy::router::RoutingDecision;
use crate::proxy::session::SessionManager;
use crate::proxy::state::AppState;
use crate::proxy::toolcalls;
use crate::proxy::upstream::UpstreamClient;

/// Everything the pipeline needs to know about the inbound HTTP request
/// beyond the body itself.
pub struct RequestContext {
    pub dialect: Dialect,
    pub trace_id: String,
    pub force_model_header: Option<String>,
    pub client_bearer: Option<String>,
    pub anthropic_version: Option<String>,
}

pub fn generate_trace_id() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// Summaries ride the cheap tier; a summarization round-trip must never
/// burn Opus capacity.
fn make_summary_fn(
    upstream: Arc<UpstreamClient>,
    model: String,
    bearer: Option<String>,
    trace_id: String,
) -> SummaryFn {
    Arc::new(move |prompt| {
        let upstream = upstream.clone();
        let model = model.clone();
        let bearer = bearer.clone();
        let trace_id = trace_id.clone();
        Box::pin(async move {
            let body = json!({
                "model": model,
                "messages": [{"role": "user", "content": prompt}],
                "max_tokens": 1024,
                "stream": false,
            });
            let raw = upstream.chat(body, bearer.as_deref(), &trace_id).await?;
            let parsed = parse_upstream_response(raw)?;
            let text: String = parsed
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            if text.trim().is_empty() {
                Err(AppError::Summarization("upstream returned an empty summary".to_string()))
            } else {
                Ok(text)
            }
        })
    })
}

enum EventEmitter {
    Claude(ClaudeStreamEmitter),
    OpenAi(OpenAIStreamEmitter),
}

impl EventEmitter {
    fn new(dialect: Dialect, trace_id: &str, model: &str, chars_per_token: f64) -> Self {
        match dialect {
            Dialect::AnthropicMessages => EventEmitter::Claude(ClaudeStreamEmitter::new(
                format!("msg_{}", trace_id),
                model.to_string(),
                chars_per_token,
            )),
            Dialect::OpenAiChat => EventEmitter::OpenAi(OpenAIStreamEmitter::new(
                format!("chatcmpl-{}", trace_id),
                model.to_string(),
                chars_per_token,
            )),
        }
    }

    fn handle(&mut self, event: &NormalizedEvent) -> Vec<Bytes> {
        match self {
            EventEmitter::Claude(e) => e.handle(event),
            EventEmitter::OpenAi(e) => e.handle(event),
        }
    }

    fn finish(&mut self, stop_reason: StopReason, usage: Option<Usage>) -> Vec<Bytes> {
        match self {
            EventEmitter::Claude(e) => e.finish(stop_reason, usage),
            EventEmitter::OpenAi(e) => e.finish(stop_reason, usage),
        }
    }

    fn error(&mut self, message: &str) -> Vec<Bytes> {
        match self {
            EventEmitter::Claude(e) => e.error(message),
            EventEmitter::OpenAi(e) => e.error(message),
        }
    }

    fn begin_continuation_segment(&mut self) {
        match self {
            EventEmitter::Claude(e) => e.begin_continuation_segment(),
            EventEmitter::OpenAi(e) => e.begin_continuation_segment(),
        }
    }

    fn set_input_tokens_estimate(&mut self, tokens: u32) {
        if let EventEmitter::Claude(e) = self {
            e.set_input_tokens_estimate(tokens);
        }
    }
}

struct Pipeline {
    state: AppState,
    ctx: RequestContext,
    request: ChatRequest,
    manager: HistoryManager,
    summary_fn: SummaryFn,
    decision: RoutingDecision,
    history_info: Option<String>,
    // per-request snapshots of the hot-reloadable config sections
    history_config: HistoryConfig,
    tools_config: ToolsConfig,
    continuation_config: ContinuationConfig,
}

/// Single entry point per chat request: normalize, shape history, route,
/// call upstream, re-emit, continue if truncated, answer in-dialect.
pub async fn execute(state: AppState, mut request: ChatRequest, ctx: RequestContext) -> Response {
    let config = state.config.clone();
    let history_config = state.history_config.read().await.clone();
    let tools_config = state.tools_config.read().await.clone();
    let continuation_config = state.continuation_config.read().await.clone();

    if let Err(e) = normalize_request(&mut request, history_config.merge_consecutive) {
        warn!("[{}] Request rejected during normalization: {}", ctx.trace_id, e);
        return error_response(ctx.dialect, &e, &ctx.trace_id);
    }
    toolcalls::clamp_tool_specs(
        &mut request.tools,
        tools_config.tool_desc_max_chars,
        tools_config.tool_param_desc_max_chars,
    );

    let session_key = SessionManager::extract_session_id(&request.messages);
    let summary_fn = make_summary_fn(
        state.upstream.clone(),
        config.model_routing.sonnet_model.clone(),
        effective_bearer(&config, &ctx),
        ctx.trace_id.clone(),
    );

    let mut manager = HistoryManager::new(history_config.clone(), state.summary_cache.clone())
        .with_session_key(session_key.clone());
    if config.async_summary.enabled {
        manager = manager.with_background(state.background.clone());
    }

    let shaped = manager
        .pre_process_async(request.messages.clone(), "", Some(summary_fn.clone()))
        .await;
    let history_info = if manager.was_truncated() {
        info!("[{}] History reshaped: {}", ctx.trace_id, manager.truncate_info());
        Some(manager.truncate_info().to_string())
    } else {
        None
    };
    request.messages = shaped;

    let decision = state
        .router
        .route(&request, ctx.force_model_header.as_deref());
    debug!(
        "[{}] Routed to {} ({}, priority {})",
        ctx.trace_id, decision.model, decision.reason, decision.priority
    );

    let pipeline = Pipeline {
        state,
        ctx,
        request,
        manager,
        summary_fn,
        decision,
        history_info,
        history_config,
        tools_config,
        continuation_config,
    };

    if pipeline.request.stream {
        pipeline.run_streaming().await
    } else {
        pipeline.run_buffered().await
    }
}

fn effective_bearer(config: &AppConfig, ctx: &RequestContext) -> Option<String> {
    if config.upstream.api_key.is_empty() {
        ctx.client_bearer.clone()
    } else {
        None
    }
}

impl Pipeline {
    fn native_tools(&self) -> bool {
        self.tools_config.native_enabled
    }

    fn legacy_extraction_enabled(&self) -> bool {
        !self.native_tools() || self.tools_config.native_fallback_enabled
    }

    fn bearer(&self) -> Option<String> {
        effective_bearer(&self.state.config, &self.ctx)
    }

    fn base_headers(&self, continuation_segments: Option<usize>, length_retries: usize) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut put = |name: &'static str, value: String| {
            if let Ok(v) = HeaderValue::from_str(&value) {
                headers.insert(name, v);
            }
        };
        put("x-request-id", self.ctx.trace_id.clone());
        put("x-routed-model", self.decision.model.clone());
        put("x-routing-reason", self.decision.reason.clone());
        if let Some(info) = &self.history_info {
            put("x-history-truncated", "true".to_string());
            put("x-history-info", info.clone());
        }
        if length_retries > 0 {
            put("x-length-retries", length_retries.to_string());
        }
        if let Some(segments) = continuation_segments {
            if segments > 1 {
                put("x-continuation-segments", segments.to_string());
            }
        }
        if let Some(version) = &self.ctx.anthropic_version {
            if let Ok(v) = HeaderValue::from_str(version) {
                headers.insert(crate::constants::ANTHROPIC_VERSION_HEADER, v);
            }
        }
        headers
    }

    /// Runs one upstream call, shrinking the history and retrying while the
    /// upstream reports a length error. Returns the final body plus how many
    /// length retries were spent.
    async fn call_with_length_retry(&mut self) -> AppResult<(serde_json::Value, usize)> {
        let mut retry_count = 0;
        loop {
            let body = build_upstream_body(&self.request, &self.decision.model, self.native_tools());
            match self
                .state
                .upstream
                .chat(body, self.bearer().as_deref(), &self.ctx.trace_id)
                .await
            {
                Ok(value) => return Ok((value, retry_count)),
                Err(e) if e.is_length_error() => {
                    let (shrunk, should_retry) = self
                        .manager
                        .handle_length_error(
                            self.request.messages.clone(),
                            retry_count,
                            Some(self.summary_fn.clone()),
                        )
                        .await;
                    if !should_retry {
                        return Err(e);
                    }
                    retry_count += 1;
                    warn!(
                        "[{}] Upstream length error, retry {} with {} messages",
                        self.ctx.trace_id,
                        retry_count,
                        shrunk.len()
                    );
                    self.request.messages = shrunk;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Structured tool calls win over inline markers; inline units are parsed
    /// out of the text either way so clients never see marker syntax.
    fn apply_legacy_extraction(&self, response: &mut ChatResponse) {
        if !self.legacy_extraction_enabled() {
            return;
        }
        let has_structured = response
            .content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }));
        let mut rebuilt: Vec<ContentBlock> = Vec::new();
        let mut extracted_any = false;

        for block in response.content.drain(..) {
            match block {
                ContentBlock::Text { text } if toolcalls::has_tool_call_marker(&text) => {
                    let extracted = toolcalls::extract_blocks(&text);
                    if !extracted.prefix_text.trim().is_empty() {
                        rebuilt.push(ContentBlock::Text {
                            text: extracted.prefix_text,
                        });
                    }
                    if has_structured {
                        if !extracted.calls.is_empty() {
                            warn!(
                                "[{}] [W-TOOLCALL-DUPLICATE] dropping_{}_inline_calls_in_structured_response",
                                self.ctx.trace_id,
                                extracted.calls.len()
                            );
                        }
                    } else {
                        for call in extracted.calls {
                            extracted_any = true;
                            rebuilt.push(call.into_block());
                        }
                    }
                    if !extracted.suffix_text.trim().is_empty() {
                        rebuilt.push(ContentBlock::Text {
                            text: extracted.suffix_text,
                        });
                    }
                }
                other => rebuilt.push(other),
            }
        }
        response.content = rebuilt;
        if extracted_any && response.stop_reason == StopReason::EndTurn {
            response.stop_reason = StopReason::ToolUse;
        }
    }

    fn render_final(&self, response: &ChatResponse, headers: HeaderMap) -> Response {
        let body = match self.ctx.dialect {
            Dialect::AnthropicMessages => claude::render_response(response),
            Dialect::OpenAiChat => openai::render_response(response),
        };
        let mut http = (StatusCode::OK, Json(body)).into_response();
        http.headers_mut().extend(headers);
        http
    }

    // ==================== buffered (non-streaming) ====================

    async fn run_buffered(mut self) -> Response {
        let mut continuation = ContinuationState::new(self.continuation_config.clone());
        let base_request = self.request.clone();

        let (raw, length_retries) = match self.call_with_length_retry().await {
            Ok(result) => result,
            Err(e) => {
                warn!("[{}] Upstream call failed: {}", self.ctx.trace_id, e);
                return error_response(self.ctx.dialect, &e, &self.ctx.trace_id);
            }
        };
        let mut response = match parse_upstream_response(raw) {
            Ok(r) => r,
            Err(e) => return error_response(self.ctx.dialect, &e, &self.ctx.trace_id),
        };
        self.apply_legacy_extraction(&mut response);

        let mut usage = response.usage;
        let mut final_tool_blocks: Vec<ContentBlock> = response
            .content
            .iter()
            .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
            .cloned()
            .collect();
        continuation.record_segment(&collect_text(&response.content));
        let mut check = detect_truncation(continuation.accumulated_text(), response.stop_reason);
        let mut final_stop = response.stop_reason;

        while continuation.should_resume(check) {
            let resume = continuation.build_resume_request(&base_request);
            self.decision = self
                .state
                .router
                .route(&resume, self.ctx.force_model_header.as_deref());
            self.request = resume;

            let raw = match self.call_with_length_retry().await {
                Ok((value, _)) => value,
                Err(e) => {
                    warn!(
                        "[{}] Continuation segment failed, finalizing with accumulated text: {}",
                        self.ctx.trace_id, e
                    );
                    final_stop = StopReason::MaxTokens;
                    check = TruncationCheck::none();
                    break;
                }
            };
            let mut segment = match parse_upstream_response(raw) {
                Ok(r) => r,
                Err(e) => {
                    warn!("[{}] Continuation parse failed: {}", self.ctx.trace_id, e);
                    final_stop = StopReason::MaxTokens;
                    check = TruncationCheck::none();
                    break;
                }
            };
            self.apply_legacy_extraction(&mut segment);
            continuation.record_segment(&collect_text(&segment.content));
            usage.input_tokens += segment.usage.input_tokens;
            usage.output_tokens += segment.usage.output_tokens;
            final_tool_blocks = segment
                .content
                .iter()
                .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
                .cloned()
                .collect();
            final_stop = segment.stop_reason;
            check = detect_truncation(continuation.accumulated_text(), segment.stop_reason);
        }

        if check.truncated {
            // resume preconditions failed, surface what we have
            final_stop = StopReason::MaxTokens;
        }

        let mut content: Vec<ContentBlock> = Vec::new();
        if !continuation.accumulated_text().is_empty() {
            content.push(ContentBlock::Text {
                text: continuation.accumulated_text().to_string(),
            });
        }
        content.extend(final_tool_blocks);

        let final_response = ChatResponse {
            id: response.id.clone(),
            model: self.decision.model.clone(),
            content,
            stop_reason: final_stop,
            usage,
        };
        let headers = self.base_headers(Some(continuation.segments()), length_retries);
        self.render_final(&final_response, headers)
    }

    // ==================== streaming ====================

    async fn run_streaming(mut self) -> Response {
        use async_stream::stream;

        let chars_per_token = self.history_config.chars_per_token;
        let mut emitter = EventEmitter::new(
            self.ctx.dialect,
            &self.ctx.trace_id,
            &self.decision.model,
            chars_per_token,
        );
        emitter.set_input_tokens_estimate(estimate_request_tokens(&self.request, chars_per_token));
        let headers = self.base_headers(None, 0);
        let use_filter = self.legacy_extraction_enabled();

        let sse = stream! {
            let mut continuation =
                ContinuationState::new(self.continuation_config.clone());
            let base_request = self.request.clone();
            let mut length_retry_count = 0usize;

            'segments: loop {
                let body = build_upstream_body(
                    &self.request,
                    &self.decision.model,
                    self.tools_config.native_enabled,
                );
                let bearer = self.bearer();
                let mut byte_stream = match self
                    .state
                    .upstream
                    .chat_stream(body, bearer.as_deref(), &self.ctx.trace_id)
                    .await
                {
                    Ok(s) => s,
                    Err(e) if e.is_length_error() && continuation.segments() == 0 => {
                        let (shrunk, should_retry) = self
                            .manager
                            .handle_length_error(
                                self.request.messages.clone(),
                                length_retry_count,
                                Some(self.summary_fn.clone()),
                            )
                            .await;
                        if should_retry {
                            length_retry_count += 1;
                            warn!(
                                "[{}] Length error on stream open, retry {} with {} messages",
                                self.ctx.trace_id,
                                length_retry_count,
                                shrunk.len()
                            );
                            self.request.messages = shrunk;
                            continue 'segments;
                        }
                        for chunk in emitter.error(&e.to_string()) {
                            yield Ok::<Bytes, std::convert::Infallible>(chunk);
                        }
                        break 'segments;
                    }
                    Err(e) => {
                        if continuation.segments() > 0 {
                            warn!(
                                "[{}] Continuation segment failed, finalizing: {}",
                                self.ctx.trace_id, e
                            );
                            for chunk in emitter.finish(StopReason::MaxTokens, None) {
                                yield Ok(chunk);
                            }
                        } else {
                            for chunk in emitter.error(&e.to_string()) {
                                yield Ok(chunk);
                            }
                        }
                        break 'segments;
                    }
                };

                let mut parser = SseChunkParser::new();
                let mut filter = use_filter.then(InlineToolFilter::new);
                let mut segment_text = String::new();
                let mut finish: Option<(StopReason, Option<Usage>)> = None;

                'chunks: while let Some(chunk) = byte_stream.next().await {
                    let bytes = match chunk {
                        Ok(b) => b,
                        Err(e) => {
                            warn!(
                                "[{}] [W-STREAM-READ] upstream_chunk_error: {}",
                                self.ctx.trace_id, e
                            );
                            break 'chunks;
                        }
                    };
                    for event in parser.push(&bytes) {
                        if let NormalizedEvent::Finish { stop_reason, usage } = event {
                            finish = Some((stop_reason, usage));
                            continue;
                        }
                        let routed = match filter.as_mut() {
                            Some(f) => f.push(event),
                            None => vec![event],
                        };
                        for event in routed {
                            if let NormalizedEvent::TextDelta(text) = &event {
                                segment_text.push_str(text);
                            }
                            for chunk in emitter.handle(&event) {
                                yield Ok(chunk);
                            }
                        }
                    }
                    if finish.is_some() {
                        break 'chunks;
                    }
                }

                if finish.is_none() {
                    for event in parser.close() {
                        if let NormalizedEvent::Finish { stop_reason, usage } = event {
                            finish = Some((stop_reason, usage));
                        }
                    }
                }
                if let Some(f) = filter.as_mut() {
                    for event in f.flush() {
                        if let NormalizedEvent::TextDelta(text) = &event {
                            segment_text.push_str(text);
                        }
                        for chunk in emitter.handle(&event) {
                            yield Ok(chunk);
                        }
                    }
                }

                let (stop_reason, usage) =
                    finish.unwrap_or((StopReason::EndTurn, None));
                continuation.record_segment(&segment_text);
                let check =
                    detect_truncation(continuation.accumulated_text(), stop_reason);

                if continuation.should_resume(check) {
                    info!(
                        "[{}] Truncated segment ({}), resuming: attempt {}, {} chars so far",
                        self.ctx.trace_id,
                        check.reason,
                        continuation.segments() + 1,
                        continuation.accumulated_text().len()
                    );
                    let resume = continuation.build_resume_request(&base_request);
                    self.decision = self
                        .state
                        .router
                        .route(&resume, self.ctx.force_model_header.as_deref());
                    self.request = resume;
                    emitter.begin_continuation_segment();
                    continue 'segments;
                }

                let final_stop = if check.truncated {
                    StopReason::MaxTokens
                } else {
                    stop_reason
                };
                if continuation.segments() > 1 {
                    info!(
                        "[{}] Continuation complete: {} segments, {} chars",
                        self.ctx.trace_id,
                        continuation.segments(),
                        continuation.accumulated_text().len()
                    );
                }
                for chunk in emitter.finish(final_stop, usage) {
                    yield Ok(chunk);
                }
                break 'segments;
            }
        };

        let mut response = Response::new(Body::from_stream(sse));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        response.headers_mut().extend(headers);
        response
    }
}

fn collect_text(content: &[ContentBlock]) -> String {
    content
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}
