use crate::app::AppState;
use crate::config::AdmissionPolicy;
use crate::credit::Admission;
use crate::error::{AppError, AppResult};
use crate::providers::{self, ProviderDialect};
use crate::usage::{self, TokenUsage, UsageAccumulator};
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub async fn health() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

/// The forwarder: admission check, upstream relay (buffered or streamed),
/// usage extraction, settlement. One invocation per inbound request.
pub async fn proxy(State(state): State<AppState>, req: Request) -> AppResult<Response> {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let dialect = providers::detect_dialect(parts.uri.path(), state.settings.default_dialect);
    metrics::counter!("tollgate_requests_total", "dialect" => dialect.as_str()).increment(1);

    let body_bytes = axum::body::to_bytes(body, state.settings.max_request_bytes)
        .await
        .map_err(|err| {
            tracing::error!("request body read failed: {err}");
            AppError::proxy("Credit proxy error")
        })?;

    let admission = match state.guard.check_admission().await {
        Ok(admission) => Some(admission),
        Err(err) => match state.settings.admission_policy {
            AdmissionPolicy::FailOpen => {
                tracing::warn!("ledger unavailable, admitting per fail-open policy: {err}");
                None
            }
            AdmissionPolicy::FailClosed => {
                tracing::error!("ledger unavailable, rejecting per fail-closed policy: {err}");
                return Err(AppError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "ledger_unavailable",
                    "credit ledger unreachable",
                )
                .with_type("proxy_error"));
            }
        },
    };
    if let Some(Admission {
        admitted: false,
        remaining_cents,
    }) = admission
    {
        tracing::info!(
            user_id = %state.settings.user_id,
            remaining_cents,
            "credit exhausted, blocking request"
        );
        metrics::counter!("tollgate_requests_rejected_total").increment(1);
        return Ok(credit_exceeded_response(dialect));
    }
    let remaining_before = admission.map(|a| a.remaining_cents);

    let streaming = providers::is_streaming_request(&body_bytes);
    let upstream_url = format!(
        "{}{}",
        state.settings.upstreams.resolve(dialect).trim_end_matches('/'),
        path_and_query
    );
    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::POST);
    let upstream_resp = state
        .http
        .request(method, &upstream_url)
        .headers(forward_headers(&parts.headers))
        .body(body_bytes.to_vec())
        .send()
        .await
        .map_err(|err| {
            metrics::counter!("tollgate_upstream_errors_total").increment(1);
            tracing::error!(upstream = %upstream_url, "upstream request failed: {err}");
            AppError::proxy("Credit proxy error")
        })?;

    if streaming {
        Ok(relay_streaming(state, dialect, remaining_before, upstream_resp))
    } else {
        relay_buffered(state, dialect, remaining_before, upstream_resp).await
    }
}

/// Buffered mode: wait for the complete upstream response, extract usage
/// from the document, settle, then deliver.
async fn relay_buffered(
    state: AppState,
    dialect: ProviderDialect,
    remaining_before: Option<i64>,
    upstream_resp: reqwest::Response,
) -> AppResult<Response> {
    let status = upstream_resp.status();
    let headers = upstream_resp.headers().clone();
    let resp_bytes = upstream_resp.bytes().await.map_err(|err| {
        metrics::counter!("tollgate_upstream_errors_total").increment(1);
        tracing::error!("upstream body read failed: {err}");
        AppError::proxy("Credit proxy error")
    })?;

    if status.is_success() {
        let observed = serde_json::from_slice::<Value>(&resp_bytes)
            .map(|doc| usage::extract_from_document(dialect, &doc))
            .unwrap_or_default();
        settle_and_log(&state, observed, remaining_before, false).await;
    }

    Ok(relay_response(status, &headers, Body::from(resp_bytes)))
}

/// Streaming mode: every upstream chunk is written to the caller the moment
/// it arrives, and concurrently fed through an SSE decoder that reassembles
/// events split across chunk boundaries. Settlement runs once the upstream
/// stream ends; a caller disconnect aborts the upstream pull and skips it.
fn relay_streaming(
    state: AppState,
    dialect: ProviderDialect,
    remaining_before: Option<i64>,
    upstream_resp: reqwest::Response,
) -> Response {
    let status = upstream_resp.status();
    let resp_headers = upstream_resp.headers().clone();
    let billable = status.is_success();

    let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    let (event_tx, event_rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(32);

    let extractor = tokio::spawn(async move {
        let mut acc = UsageAccumulator::default();
        let mut done = false;
        // Keep draining past the sentinel so the relay side never blocks on
        // a full channel; extraction just stops.
        let mut events = ReceiverStream::new(event_rx).eventsource();
        while let Some(event) = events.next().await {
            let Ok(event) = event else { continue };
            if done {
                continue;
            }
            if event.data.trim() == "[DONE]" {
                done = true;
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(&event.data) {
                usage::extract_from_event(dialect, &mut acc, &value);
            }
        }
        acc.finish()
    });

    tokio::spawn(async move {
        let mut upstream = upstream_resp.bytes_stream();
        let mut delivered = true;
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    let _ = event_tx.send(Ok(bytes.clone())).await;
                    if body_tx.send(Ok(bytes)).await.is_err() {
                        // Caller went away; stop pulling from upstream.
                        delivered = false;
                        break;
                    }
                }
                Err(err) => {
                    metrics::counter!("tollgate_upstream_errors_total").increment(1);
                    tracing::error!("upstream stream error: {err}");
                    delivered = false;
                    let _ = body_tx.send(Err(std::io::Error::other(err))).await;
                    break;
                }
            }
        }
        drop(event_tx);
        drop(body_tx);

        if !(billable && delivered) {
            extractor.abort();
            return;
        }
        if let Ok(observed) = extractor.await {
            settle_and_log(&state, observed, remaining_before, true).await;
        }
    });

    relay_response(
        status,
        &resp_headers,
        Body::from_stream(ReceiverStream::new(body_rx)),
    )
}

async fn settle_and_log(
    state: &AppState,
    observed: TokenUsage,
    remaining_before: Option<i64>,
    streamed: bool,
) {
    if observed.is_zero() {
        return;
    }
    let model = state.settings.model.as_str();
    match state.guard.settle(model, observed).await {
        Ok(cost_cents) => {
            metrics::counter!("tollgate_settled_requests_total").increment(1);
            metrics::counter!("tollgate_settled_cost_cents_total")
                .increment(cost_cents.max(0) as u64);
            tracing::info!(
                tokens_in = observed.tokens_in,
                tokens_out = observed.tokens_out,
                cost_cents,
                remaining_cents = ?remaining_before.map(|r| r - cost_cents),
                streamed,
                model,
                "usage settled"
            );
        }
        Err(err) => {
            tracing::warn!("settlement failed: {err}");
        }
    }
}

fn credit_exceeded_response(dialect: ProviderDialect) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        axum::Json(providers::credit_exceeded_body(dialect)),
    )
        .into_response()
}

const SKIPPED_REQUEST_HEADERS: [&str; 2] = ["host", "content-length"];

fn forward_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut forwarded = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(rname), Ok(rvalue)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            forwarded.insert(rname, rvalue);
        }
    }
    forwarded
}

const SKIPPED_RESPONSE_HEADERS: [&str; 3] = ["transfer-encoding", "content-length", "connection"];

fn relay_response(
    status: reqwest::StatusCode,
    headers: &reqwest::header::HeaderMap,
    body: Body,
) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK));
    for (name, value) in headers.iter() {
        if SKIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(hname), Ok(hvalue)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(hname, hvalue);
        }
    }
    builder
        .body(body)
        .map(|resp| resp.into_response())
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}
