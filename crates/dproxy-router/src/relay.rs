//! Response plumbing shared by the facade and dynamic handlers: mirroring
//! upstream bodies, the SSE tee that feeds the recorder, and the
//! Gemini→OpenAI stream bridge.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode, header};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use dproxy_core::error::ProxyError;
use dproxy_core::queue::RecordQueue;
use dproxy_core::record::{
    DEFAULT_CAPTURE_CAP, ExchangeContext, Reply, StreamCapture, WireShape, canonicalize,
    reply_from_response,
};
use dproxy_core::upstream::UpstreamError;
use dproxy_protocol::gemini::generate_content::GenerateContentResponse;
use dproxy_protocol::sse::{FrameParser, SseFrame, done_frame};
use dproxy_transform::gemini_to_openai::StreamState;

pub(crate) fn error_response(err: &ProxyError) -> Response {
    let body = err.body_json().to_string();
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = err.status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

pub(crate) fn upstream_error(err: &UpstreamError) -> ProxyError {
    match err {
        UpstreamError::Timeout(message) => ProxyError::gateway_timeout(message.clone()),
        UpstreamError::Transport(message) => ProxyError::bad_gateway(message.clone()),
    }
}

fn is_hop_by_hop_or_framing(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}

fn response_builder(status: u16, headers: &[(String, String)], sse: bool) -> http::response::Builder {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    if let Some(map) = builder.headers_mut() {
        for (name, value) in headers {
            if is_hop_by_hop_or_framing(name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        if sse {
            map.entry(header::CONTENT_TYPE)
                .or_insert(HeaderValue::from_static("text/event-stream"));
            map.entry(header::CACHE_CONTROL)
                .or_insert(HeaderValue::from_static("no-cache"));
            map.entry(HeaderName::from_static("x-accel-buffering"))
                .or_insert(HeaderValue::from_static("no"));
        }
    }
    builder
}

/// Mirror a complete upstream body to the client.
pub(crate) fn passthrough_response(
    status: u16,
    headers: &[(String, String)],
    body: Bytes,
) -> Response {
    response_builder(status, headers, false)
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            (StatusCode::INTERNAL_SERVER_ERROR, "response build failed").into_response()
        })
}

pub(crate) fn parse_json_or_string(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

pub(crate) fn enqueue_record(
    queue: &RecordQueue,
    ctx: &ExchangeContext,
    raw_request: Value,
    raw_response: Value,
    reply: Option<&Reply>,
    truncated: bool,
) {
    queue.push(canonicalize(ctx, raw_request, raw_response, reply, truncated));
}

/// Record a completed non-streaming exchange. Error bodies are recorded
/// raw-only so upstream failures stay auditable.
pub(crate) fn record_buffered(
    queue: &RecordQueue,
    ctx: &ExchangeContext,
    wire: WireShape,
    raw_request: Value,
    success: bool,
    body: &[u8],
) {
    let truncated = body.len() > DEFAULT_CAPTURE_CAP;
    let capped = if truncated {
        &body[..DEFAULT_CAPTURE_CAP]
    } else {
        body
    };
    let raw_response = parse_json_or_string(capped);
    let reply = if success {
        Some(reply_from_response(wire, &raw_response))
    } else {
        None
    };
    enqueue_record(queue, ctx, raw_request, raw_response, reply.as_ref(), truncated);
}

/// Relay an upstream SSE body to the client byte-for-byte while teeing a
/// capped copy into the recorder. The capture is only enqueued when the
/// upstream stream ended normally and reached its terminal marker; a client
/// disconnect cancels the upstream read and discards it.
pub(crate) fn relay_stream(
    queue: Arc<RecordQueue>,
    ctx: ExchangeContext,
    wire: WireShape,
    raw_request: Value,
    status: u16,
    headers: Vec<(String, String)>,
    mut upstream_rx: mpsc::Receiver<Bytes>,
) -> Response {
    let (tx, out_rx) = mpsc::channel::<Bytes>(32);

    tokio::spawn(async move {
        let mut capture = StreamCapture::new(wire, DEFAULT_CAPTURE_CAP);
        while let Some(chunk) = upstream_rx.recv().await {
            capture.push_chunk(&chunk);
            if tx.send(chunk).await.is_err() {
                debug!(event = "client_disconnected", provider = %ctx.provider);
                return;
            }
        }

        let (reply, raw, truncated, complete) = capture.finish();
        if !complete {
            debug!(event = "stream_capture_incomplete", provider = %ctx.provider);
            return;
        }
        enqueue_record(
            &queue,
            &ctx,
            raw_request,
            Value::String(raw),
            Some(&reply),
            truncated,
        );
    });

    stream_response(status, headers, out_rx)
}

/// Bridge a Gemini SSE stream into OpenAI `chat.completion.chunk` frames,
/// appending `data: [DONE]` after the upstream closes. The original Gemini
/// frames feed the recorder.
pub(crate) fn relay_transcoded_stream(
    queue: Arc<RecordQueue>,
    ctx: ExchangeContext,
    raw_request: Value,
    model: String,
    status: u16,
    mut upstream_rx: mpsc::Receiver<Bytes>,
) -> Response {
    let (tx, out_rx) = mpsc::channel::<Bytes>(32);

    tokio::spawn(async move {
        let mut parser = FrameParser::new();
        let mut state = StreamState::new(&model);
        let mut capture = StreamCapture::new(WireShape::Gemini, DEFAULT_CAPTURE_CAP);
        let mut client_gone = false;

        while let Some(chunk) = upstream_rx.recv().await {
            capture.push_chunk(&chunk);
            if client_gone {
                continue;
            }
            for frame in parser.push_bytes(&chunk) {
                if !forward_transcoded_frame(&tx, &mut state, &frame).await {
                    client_gone = true;
                    break;
                }
            }
        }

        if !client_gone {
            for frame in parser.finish() {
                if !forward_transcoded_frame(&tx, &mut state, &frame).await {
                    client_gone = true;
                    break;
                }
            }
        }
        if client_gone {
            debug!(event = "client_disconnected", provider = %ctx.provider);
            return;
        }
        let _ = tx.send(done_frame()).await;

        let (reply, raw, truncated, complete) = capture.finish();
        if !complete {
            debug!(event = "stream_capture_incomplete", provider = %ctx.provider);
            return;
        }
        enqueue_record(
            &queue,
            &ctx,
            raw_request,
            Value::String(raw),
            Some(&reply),
            truncated,
        );
    });

    stream_response(status, Vec::new(), out_rx)
}

async fn forward_transcoded_frame(
    tx: &mpsc::Sender<Bytes>,
    state: &mut StreamState,
    frame: &SseFrame,
) -> bool {
    if frame.is_done() {
        return true;
    }
    let Ok(upstream) = serde_json::from_str::<GenerateContentResponse>(&frame.data) else {
        return true;
    };
    let chunk = state.transform_frame(&upstream);
    let Ok(encoded) = serde_json::to_string(&chunk) else {
        return true;
    };
    tx.send(SseFrame::new(encoded).encode()).await.is_ok()
}

fn stream_response(
    status: u16,
    headers: Vec<(String, String)>,
    rx: mpsc::Receiver<Bytes>,
) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    response_builder(status, &headers, true)
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| {
            (StatusCode::INTERNAL_SERVER_ERROR, "response build failed").into_response()
        })
}
