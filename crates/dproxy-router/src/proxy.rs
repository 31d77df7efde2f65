//! HTTP entry: probe gate, body cap, the OpenAI-compatibility facade, and
//! the host-in-path dynamic forwarder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, header};
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use dproxy_core::auth::{self, AuthScheme};
use dproxy_core::error::ProxyError;
use dproxy_core::probe::ProbeFilter;
use dproxy_core::queue::RecordQueue;
use dproxy_core::record::{ExchangeContext, WireShape, reply_from_response};
use dproxy_core::registry::UpstreamRegistry;
use dproxy_core::upstream::{
    UpstreamBody, UpstreamClient, UpstreamRequest, UpstreamResponse, build_url,
};
use dproxy_protocol::gemini::generate_content::GenerateContentResponse;
use dproxy_protocol::openai::chat::ChatCompletionRequestBody;
use dproxy_transform::gemini_to_openai::transform_response;
use dproxy_transform::openai_to_gemini::transform_request;

use crate::relay::{
    enqueue_record, error_response, parse_json_or_string, passthrough_response, record_buffered,
    relay_stream, relay_transcoded_stream, upstream_error,
};

pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

pub struct GatewayState {
    pub registry: UpstreamRegistry,
    pub probe: ProbeFilter,
    pub client: UpstreamClient,
    pub queue: Arc<RecordQueue>,
}

pub fn proxy_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(openai_passthrough))
        .route("/v1/embeddings", post(openai_passthrough))
        .route("/{host}/{*path}", any(dynamic_proxy))
        .layer(middleware::from_fn_with_state(state.clone(), probe_gate))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn health() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

/// Runs before dispatch: junk traffic answers a terse 403 (counter only, no
/// log line), oversized bodies answer 413 before any upstream I/O.
async fn probe_gate(
    State(state): State<Arc<GatewayState>>,
    req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok());

    if state
        .probe
        .matches(req.method(), req.uri().path(), user_agent, peer)
    {
        state.probe.record_rejection();
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    if let Some(length) = content_length(req.headers())
        && length > MAX_BODY_BYTES as u64
    {
        return error_response(&ProxyError::payload_too_large(
            "request body exceeds the 8 MiB limit",
        ));
    }

    next.run(req).await
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

/// `/{host}/{path...}`: the first segment names a registered upstream, the
/// rest is the upstream path.
async fn dynamic_proxy(
    State(state): State<Arc<GatewayState>>,
    Path((host, path)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(descriptor) = state.registry.lookup(&host) else {
        // policy rejection, same minimal shape as the probe gate
        return (StatusCode::FORBIDDEN, "upstream not allowed").into_response();
    };
    let path = format!("/{}", path.trim_start_matches('/'));

    let needs_body = matches!(method, Method::POST | Method::PUT | Method::PATCH);
    if needs_body && body.is_empty() {
        return error_response(&ProxyError::bad_request("missing request body"));
    }
    let raw_request = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(err) => {
                return error_response(&ProxyError::bad_request(format!(
                    "invalid request body: {err}"
                )));
            }
        }
    };

    let scheme = descriptor.auth_for_path(&path);
    let is_stream = raw_request
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || path.contains("streamGenerateContent");
    let model = extract_model(&raw_request, &path, scheme);

    let translated = match auth::translate(&headers, scheme, uri.query()) {
        Ok(translated) => translated,
        Err(err) => return error_response(&err),
    };
    let url = build_url(
        descriptor.scheme(),
        &descriptor.host,
        &path,
        uri.query(),
        translated.query_key.as_deref(),
    );

    let trace_id = Uuid::now_v7().to_string();
    log_request(
        &state, &trace_id, &method, &descriptor.host, &path, user_agent(&headers), is_stream,
        &model,
    );

    let ctx = ExchangeContext {
        provider: descriptor.host.clone(),
        auth_scheme: scheme,
        model,
    };
    let request = UpstreamRequest {
        method,
        url,
        headers: translated.headers,
        body: if body.is_empty() { None } else { Some(body) },
        is_stream,
    };
    forward_passthrough(
        &state,
        trace_id,
        ctx,
        WireShape::from_scheme(scheme),
        raw_request,
        request,
    )
    .await
}

/// `/v1/chat/completions`: Gemini models are transcoded to `generateContent`
/// against the Google upstream; everything else goes verbatim to the
/// configured default upstream.
async fn chat_completions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if body.is_empty() {
        return error_response(&ProxyError::bad_request("missing request body"));
    }
    let parsed: ChatCompletionRequestBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            return error_response(&ProxyError::bad_request(format!(
                "invalid request body: {err}"
            )));
        }
    };
    let raw_request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    if is_gemini_model(&parsed.model) {
        return gemini_facade(state, headers, parsed, raw_request).await;
    }

    let Some(descriptor) = state.registry.default_upstream() else {
        return error_response(&ProxyError::bad_request(
            "no default upstream configured for this model",
        ));
    };
    let scheme = descriptor.auth_for_path("/v1/chat/completions");
    let translated = match auth::translate(&headers, scheme, None) {
        Ok(translated) => translated,
        Err(err) => return error_response(&err),
    };
    let url = build_url(
        descriptor.scheme(),
        &descriptor.host,
        "/v1/chat/completions",
        None,
        translated.query_key.as_deref(),
    );

    let is_stream = parsed.is_stream();
    let trace_id = Uuid::now_v7().to_string();
    log_request(
        &state,
        &trace_id,
        &Method::POST,
        &descriptor.host,
        "/v1/chat/completions",
        user_agent(&headers),
        is_stream,
        &parsed.model,
    );

    let ctx = ExchangeContext {
        provider: descriptor.host.clone(),
        auth_scheme: scheme,
        model: parsed.model.clone(),
    };
    let request = UpstreamRequest {
        method: Method::POST,
        url,
        headers: translated.headers,
        body: Some(body),
        is_stream,
    };
    forward_passthrough(
        &state,
        trace_id,
        ctx,
        WireShape::from_scheme(scheme),
        raw_request,
        request,
    )
    .await
}

/// `/v1/embeddings` and `/v1/completions`: verbatim forward to the default
/// upstream; the recorder stores these raw-only.
async fn openai_passthrough(
    State(state): State<Arc<GatewayState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if body.is_empty() {
        return error_response(&ProxyError::bad_request("missing request body"));
    }
    let raw_request: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return error_response(&ProxyError::bad_request(format!(
                "invalid request body: {err}"
            )));
        }
    };
    let model = raw_request
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    if is_gemini_model(&model) {
        return error_response(&ProxyError::bad_request(format!(
            "model {model} is not supported on {}",
            uri.path()
        )));
    }

    let Some(descriptor) = state.registry.default_upstream() else {
        return error_response(&ProxyError::bad_request(
            "no default upstream configured for this model",
        ));
    };
    let scheme = descriptor.auth_for_path(uri.path());
    let translated = match auth::translate(&headers, scheme, None) {
        Ok(translated) => translated,
        Err(err) => return error_response(&err),
    };
    let url = build_url(
        descriptor.scheme(),
        &descriptor.host,
        uri.path(),
        None,
        translated.query_key.as_deref(),
    );

    let trace_id = Uuid::now_v7().to_string();
    log_request(
        &state,
        &trace_id,
        &Method::POST,
        &descriptor.host,
        uri.path(),
        user_agent(&headers),
        false,
        &model,
    );

    let ctx = ExchangeContext {
        provider: descriptor.host.clone(),
        auth_scheme: scheme,
        model,
    };
    let request = UpstreamRequest {
        method: Method::POST,
        url,
        headers: translated.headers,
        body: Some(body),
        is_stream: false,
    };
    forward_passthrough(
        &state,
        trace_id,
        ctx,
        WireShape::from_scheme(scheme),
        raw_request,
        request,
    )
    .await
}

async fn gemini_facade(
    state: Arc<GatewayState>,
    headers: HeaderMap,
    parsed: ChatCompletionRequestBody,
    raw_request: Value,
) -> Response {
    let Some(google) = state.registry.google_upstream() else {
        return error_response(&ProxyError::bad_request("no google upstream registered"));
    };
    let translated = match auth::translate(&headers, AuthScheme::Google, None) {
        Ok(translated) => translated,
        Err(err) => return error_response(&err),
    };

    let transcoded = transform_request(&parsed);
    let body = match serde_json::to_vec(&transcoded.body) {
        Ok(body) => body,
        Err(err) => return error_response(&ProxyError::internal(err.to_string())),
    };
    let url = build_url(
        google.scheme(),
        &google.host,
        &transcoded.path,
        None,
        translated.query_key.as_deref(),
    );

    let is_stream = parsed.is_stream();
    let model = parsed.model.clone();
    let trace_id = Uuid::now_v7().to_string();
    log_request(
        &state,
        &trace_id,
        &Method::POST,
        &google.host,
        &transcoded.path,
        user_agent(&headers),
        is_stream,
        &model,
    );

    let ctx = ExchangeContext {
        provider: google.host.clone(),
        auth_scheme: AuthScheme::Google,
        model: model.clone(),
    };
    let request = UpstreamRequest {
        method: Method::POST,
        url,
        headers: translated.headers,
        body: Some(Bytes::from(body)),
        is_stream,
    };

    let started = Instant::now();
    match state.client.send(request).await {
        Err(err) => {
            warn!(
                event = "upstream_failed",
                trace_id = %trace_id,
                provider = %ctx.provider,
                error = %err
            );
            let proxy_err = upstream_error(&err);
            enqueue_record(
                &state.queue,
                &ctx,
                raw_request,
                proxy_err.body_json(),
                None,
                false,
            );
            error_response(&proxy_err)
        }
        Ok(UpstreamResponse {
            status,
            headers: resp_headers,
            body,
        }) => {
            let success = (200..300).contains(&status);
            info!(
                event = "upstream_responded",
                trace_id = %trace_id,
                provider = %ctx.provider,
                status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                transcoded = true
            );
            match body {
                UpstreamBody::Bytes(bytes) => {
                    if !success {
                        record_buffered(
                            &state.queue,
                            &ctx,
                            WireShape::Gemini,
                            raw_request,
                            false,
                            &bytes,
                        );
                        return passthrough_response(status, &resp_headers, bytes);
                    }
                    let upstream: GenerateContentResponse = match serde_json::from_slice(&bytes) {
                        Ok(upstream) => upstream,
                        Err(err) => {
                            record_buffered(
                                &state.queue,
                                &ctx,
                                WireShape::Gemini,
                                raw_request,
                                false,
                                &bytes,
                            );
                            return error_response(&ProxyError::bad_gateway(format!(
                                "invalid upstream response: {err}"
                            )));
                        }
                    };
                    let envelope = transform_response(&model, &upstream);
                    let raw_response = parse_json_or_string(&bytes);
                    let reply = reply_from_response(WireShape::Gemini, &raw_response);
                    enqueue_record(
                        &state.queue,
                        &ctx,
                        raw_request,
                        raw_response,
                        Some(&reply),
                        false,
                    );
                    (
                        StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
                        Json(envelope),
                    )
                        .into_response()
                }
                UpstreamBody::Stream(rx) => relay_transcoded_stream(
                    state.queue.clone(),
                    ctx,
                    raw_request,
                    model,
                    status,
                    rx,
                ),
            }
        }
    }
}

/// Forward without body rewriting: mirror status, headers, and bytes; tee
/// streams into the recorder.
async fn forward_passthrough(
    state: &Arc<GatewayState>,
    trace_id: String,
    ctx: ExchangeContext,
    wire: WireShape,
    raw_request: Value,
    request: UpstreamRequest,
) -> Response {
    let started = Instant::now();
    match state.client.send(request).await {
        Err(err) => {
            warn!(
                event = "upstream_failed",
                trace_id = %trace_id,
                provider = %ctx.provider,
                error = %err
            );
            let proxy_err = upstream_error(&err);
            enqueue_record(
                &state.queue,
                &ctx,
                raw_request,
                proxy_err.body_json(),
                None,
                false,
            );
            error_response(&proxy_err)
        }
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        }) => {
            let success = (200..300).contains(&status);
            info!(
                event = "upstream_responded",
                trace_id = %trace_id,
                provider = %ctx.provider,
                status,
                elapsed_ms = started.elapsed().as_millis() as u64
            );
            match body {
                UpstreamBody::Bytes(bytes) => {
                    record_buffered(&state.queue, &ctx, wire, raw_request, success, &bytes);
                    passthrough_response(status, &headers, bytes)
                }
                UpstreamBody::Stream(rx) => relay_stream(
                    state.queue.clone(),
                    ctx,
                    wire,
                    raw_request,
                    status,
                    headers,
                    rx,
                ),
            }
        }
    }
}

fn is_gemini_model(model: &str) -> bool {
    model.starts_with("gemini-")
}

fn user_agent(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
}

/// Model id for the record: Google requests carry it in the path, everyone
/// else in the body.
fn extract_model(body: &Value, path: &str, scheme: AuthScheme) -> String {
    if scheme == AuthScheme::Google
        && let Some(idx) = path.find("/v1beta/models/")
    {
        let rest = &path[idx + "/v1beta/models/".len()..];
        let model = rest.split([':', '?', '/']).next().unwrap_or("");
        if !model.is_empty() {
            return model.to_string();
        }
    }
    body.get("model")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

#[allow(clippy::too_many_arguments)]
fn log_request(
    state: &GatewayState,
    trace_id: &str,
    method: &Method,
    provider: &str,
    path: &str,
    user_agent: Option<&str>,
    is_stream: bool,
    model: &str,
) {
    let line = format!("{method} {path} {}", user_agent.unwrap_or(""));
    if state.probe.suppresses_log(&line) {
        return;
    }
    info!(
        event = "request_received",
        trace_id = %trace_id,
        provider = %provider,
        method = %method,
        path = %path,
        model = %model,
        is_stream
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use dproxy_core::config::GatewayConfig;
    use dproxy_core::probe::{LogFilterConfig, ProbeRules};
    use dproxy_core::upstream::UpstreamClientConfig;
    use tower::ServiceExt;

    fn test_state() -> Arc<GatewayState> {
        Arc::new(GatewayState {
            registry: UpstreamRegistry::from_config(&GatewayConfig::default()),
            probe: ProbeFilter::new(ProbeRules::default(), &LogFilterConfig::default()),
            client: UpstreamClient::new(UpstreamClientConfig::default()).unwrap(),
            queue: Arc::new(RecordQueue::new(100)),
        })
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let app = proxy_router(test_state());
        let resp = app
            .oneshot(
                http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn probe_user_agent_is_rejected_without_record() {
        let state = test_state();
        let app = proxy_router(state.clone());
        let resp = app
            .oneshot(
                http::Request::builder()
                    .uri("/health")
                    .header("user-agent", "CensysInspect/1.2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(state.probe.rejected_count(), 1);
        assert!(state.queue.is_empty());
    }

    #[tokio::test]
    async fn root_path_is_rejected() {
        let app = proxy_router(test_state());
        let resp = app
            .oneshot(http::Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_host_is_rejected_before_any_upstream_io() {
        let state = test_state();
        let app = proxy_router(state.clone());
        let resp = app
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/evil.example.com/v1/chat/completions")
                    .header("authorization", "Bearer sk-X")
                    .body(Body::from(
                        r#"{"model":"x","messages":[{"role":"user","content":"hi"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"upstream not allowed");
        assert!(state.queue.is_empty());
    }

    #[tokio::test]
    async fn oversized_content_length_is_rejected_early() {
        let app = proxy_router(test_state());
        let resp = app
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/api.openai.com/v1/chat/completions")
                    .header("content-length", (MAX_BODY_BYTES + 1).to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn facade_without_default_upstream_is_a_client_error() {
        let app = proxy_router(test_state());
        let resp = app
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("authorization", "Bearer sk-X")
                    .body(Body::from(
                        r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn facade_post_without_body_is_a_client_error() {
        let app = proxy_router(test_state());
        let resp = app
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn gemini_models_are_refused_on_embeddings_entry() {
        let app = proxy_router(test_state());
        let resp = app
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/v1/embeddings")
                    .header("authorization", "Bearer sk-X")
                    .body(Body::from(r#"{"model":"gemini-embedding-001","input":"x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn dynamic_post_requires_credentials() {
        let app = proxy_router(test_state());
        let resp = app
            .oneshot(
                http::Request::builder()
                    .method("POST")
                    .uri("/api.openai.com/v1/chat/completions")
                    .body(Body::from(
                        r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn model_extraction_prefers_google_path() {
        let body = json!({"model": "ignored"});
        assert_eq!(
            extract_model(
                &body,
                "/v1beta/models/gemini-2.5-pro:streamGenerateContent",
                AuthScheme::Google,
            ),
            "gemini-2.5-pro"
        );
        assert_eq!(
            extract_model(&body, "/v1/chat/completions", AuthScheme::OpenAI),
            "ignored"
        );
        assert_eq!(
            extract_model(&Value::Null, "/v1/chat/completions", AuthScheme::OpenAI),
            "unknown"
        );
    }

    #[test]
    fn gemini_model_pattern() {
        assert!(is_gemini_model("gemini-2.0-flash-exp"));
        assert!(!is_gemini_model("gpt-4o"));
        assert!(!is_gemini_model("deepseek-chat"));
    }
}
