use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use futures_util::StreamExt;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tower::ServiceExt;

use tollgate::app::{AppState, build_app, load_state_with_store};
use tollgate::config::{AdmissionPolicy, ProxySettings};
use tollgate::ledger::{CreditBalance, LedgerError, LedgerStore, MemoryLedger, UsageRecord};
use tollgate::providers::{ProviderDialect, UpstreamMap};

struct TestContext {
    router: Router,
    ledger: MemoryLedger,
    upstream_hits: Arc<AtomicUsize>,
}

fn anthropic_stream_payload() -> String {
    [
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":120,\"output_tokens\":1}}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hello\"}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":340}}\n\n",
        "data: [DONE]\n\n",
    ]
    .concat()
}

/// Deliberately tiny chunks so SSE lines split mid-token across network
/// frames; the proxy's extraction must not depend on chunk alignment.
fn split_into_chunks(payload: &str, size: usize) -> Vec<Bytes> {
    payload
        .as_bytes()
        .chunks(size)
        .map(Bytes::copy_from_slice)
        .collect()
}

async fn mock_messages(
    State(hits): State<Arc<AtomicUsize>>,
    Json(body): Json<Value>,
) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);
    if body.get("stream").and_then(Value::as_bool) == Some(true) {
        let chunks = split_into_chunks(&anthropic_stream_payload(), 7);
        // Yield between chunks so each one is flushed as its own frame
        // instead of being coalesced into a single write.
        let stream = futures_util::stream::iter(
            chunks.into_iter().map(Ok::<_, std::convert::Infallible>),
        )
        .then(|chunk| async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            chunk
        });
        return Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/event-stream")
            .body(Body::from_stream(stream))
            .unwrap();
    }
    Json(json!({
        "id": "msg_1",
        "type": "message",
        "role": "assistant",
        "usage": {"input_tokens": 2000, "output_tokens": 200}
    }))
    .into_response()
}

async fn mock_chat(State(hits): State<Arc<AtomicUsize>>, Json(_body): Json<Value>) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "id": "chatcmpl_1",
        "object": "chat.completion",
        "usage": {"prompt_tokens": 55, "completion_tokens": 12}
    }))
    .into_response()
}

async fn start_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/v1/messages", post(mock_messages))
        .route("/v1/chat/completions", post(mock_chat))
        .with_state(hits.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

fn test_settings(upstream: Option<SocketAddr>) -> ProxySettings {
    let base = upstream
        .map(|addr| format!("http://{addr}"))
        // A port nothing listens on, for upstream-failure tests.
        .unwrap_or_else(|| "http://127.0.0.1:9".to_string());
    ProxySettings {
        listen: "127.0.0.1:0".to_string(),
        metrics_path: "/metrics".to_string(),
        ledger_url: "http://127.0.0.1:9".to_string(),
        ledger_key: "test-key".to_string(),
        user_id: "user-1".to_string(),
        instance_id: "inst-1".to_string(),
        model: "anthropic/claude-opus-4-6".to_string(),
        default_dialect: ProviderDialect::Anthropic,
        admission_policy: AdmissionPolicy::FailOpen,
        default_cap_cents: 1500,
        ledger_timeout_ms: 1_000,
        max_request_bytes: 1 << 20,
        upstreams: UpstreamMap::new(Some(base.clone()), Some(base.clone()), Some(base)),
    }
}

async fn context_with_total(total_cost_cents: i64) -> TestContext {
    let (addr, upstream_hits) = start_upstream().await;
    let ledger = MemoryLedger::default();
    let mut balance = CreditBalance::open("user-1", 1500);
    balance.total_cost_cents = total_cost_cents;
    ledger.seed_balance(balance).await;
    let state = load_state_with_store(test_settings(Some(addr)), Arc::new(ledger.clone())).unwrap();
    TestContext {
        router: build_app(state),
        ledger,
        upstream_hits,
    }
}

fn state_with_ledger(
    settings: ProxySettings,
    ledger: Arc<dyn LedgerStore>,
) -> AppState {
    load_state_with_store(settings, ledger).unwrap()
}

fn post_json(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn wait_for_usage(ledger: &MemoryLedger) -> Vec<UsageRecord> {
    for _ in 0..100 {
        let records = ledger.usage_records().await;
        if !records.is_empty() {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    ledger.usage_records().await
}

#[tokio::test]
async fn health_endpoint_carries_no_billing() {
    let ctx = context_with_total(1500).await;
    let response = ctx
        .router
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"ok");
    assert_eq!(ctx.upstream_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn exhausted_credit_blocks_without_contacting_upstream() {
    let ctx = context_with_total(1500).await;

    let response = ctx
        .router
        .clone()
        .oneshot(post_json(
            "/v1/messages",
            json!({"model": "claude", "max_tokens": 16, "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(
        body.get("error")
            .and_then(|e| e.get("type"))
            .and_then(Value::as_str),
        Some("rate_limit_error")
    );

    let response = ctx
        .router
        .clone()
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"model": "gpt", "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(
        body.get("error")
            .and_then(|e| e.get("code"))
            .and_then(Value::as_str),
        Some("credit_exceeded")
    );

    assert_eq!(ctx.upstream_hits.load(Ordering::SeqCst), 0);
    assert!(ctx.ledger.usage_records().await.is_empty());
}

#[tokio::test]
async fn buffered_response_is_relayed_and_settled() {
    let ctx = context_with_total(1490).await;

    let response = ctx
        .router
        .clone()
        .oneshot(post_json(
            "/v1/messages",
            json!({"model": "claude", "max_tokens": 16, "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body.get("id").and_then(Value::as_str), Some("msg_1"));

    // 2000 in + 200 out on opus pricing is 4.5 cents, billed as 5.
    let balance = ctx.ledger.balance("user-1").await.unwrap();
    assert_eq!(balance.total_cost_cents, 1495);
    let records = ctx.ledger.usage_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tokens_in, 2000);
    assert_eq!(records[0].tokens_out, 200);
    assert_eq!(records[0].cost_cents, 5);
    assert_eq!(records[0].model, "anthropic/claude-opus-4-6");
    assert_eq!(ctx.upstream_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn streamed_bytes_are_relayed_verbatim_and_settled_from_events() {
    let ctx = context_with_total(0).await;

    let response = ctx
        .router
        .clone()
        .oneshot(post_json(
            "/v1/messages",
            json!({"model": "claude", "max_tokens": 16, "stream": true, "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], anthropic_stream_payload().as_bytes());

    // Settlement runs after the stream closes; the counts must match the
    // reassembled events even though every line was split across chunks.
    let records = wait_for_usage(&ctx.ledger).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tokens_in, 120);
    assert_eq!(records[0].tokens_out, 340);
    // 120 * 1500/1M + 340 * 7500/1M = 2.73 cents, billed as 3.
    assert_eq!(records[0].cost_cents, 3);
    assert_eq!(
        ctx.ledger.balance("user-1").await.unwrap().total_cost_cents,
        3
    );
}

#[tokio::test]
async fn first_request_creates_balance_with_default_cap() {
    let (addr, _hits) = start_upstream().await;
    let ledger = MemoryLedger::default();
    let state = state_with_ledger(test_settings(Some(addr)), Arc::new(ledger.clone()));
    let router = build_app(state);

    let response = router
        .oneshot(post_json(
            "/v1/messages",
            json!({"model": "claude", "max_tokens": 16, "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let balance = ledger.balance("user-1").await.unwrap();
    assert_eq!(balance.cap_cents, 1500);
    assert_eq!(balance.total_cost_cents, 5);
}

#[tokio::test]
async fn upstream_refusal_yields_proxy_error_and_no_usage() {
    let ledger = MemoryLedger::default();
    ledger.seed_balance(CreditBalance::open("user-1", 1500)).await;
    let state = state_with_ledger(test_settings(None), Arc::new(ledger.clone()));
    let router = build_app(state);

    let response = router
        .oneshot(post_json(
            "/v1/messages",
            json!({"model": "claude", "max_tokens": 16, "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(
        body.get("error")
            .and_then(|e| e.get("type"))
            .and_then(Value::as_str),
        Some("proxy_error")
    );
    assert!(ledger.usage_records().await.is_empty());
    assert_eq!(
        ledger.balance("user-1").await.unwrap().total_cost_cents,
        0
    );
}

#[derive(Clone)]
struct FailingLedger;

#[async_trait::async_trait]
impl LedgerStore for FailingLedger {
    async fn fetch_balance(&self, _user_id: &str) -> Result<Option<CreditBalance>, LedgerError> {
        Err(LedgerError::Transport("connection refused".to_string()))
    }

    async fn create_balance(&self, _balance: &CreditBalance) -> Result<(), LedgerError> {
        Err(LedgerError::Transport("connection refused".to_string()))
    }

    async fn add_cost(&self, _user_id: &str, _cost_cents: i64) -> Result<(), LedgerError> {
        Err(LedgerError::Transport("connection refused".to_string()))
    }

    async fn append_usage(&self, _record: &UsageRecord) -> Result<(), LedgerError> {
        Err(LedgerError::Transport("connection refused".to_string()))
    }
}

#[tokio::test]
async fn ledger_outage_honors_fail_open_policy() {
    let (addr, hits) = start_upstream().await;
    let state = state_with_ledger(test_settings(Some(addr)), Arc::new(FailingLedger));
    let router = build_app(state);

    let response = router
        .oneshot(post_json(
            "/v1/messages",
            json!({"model": "claude", "max_tokens": 16, "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn ledger_outage_honors_fail_closed_policy() {
    let (addr, hits) = start_upstream().await;
    let mut settings = test_settings(Some(addr));
    settings.admission_policy = AdmissionPolicy::FailClosed;
    let state = state_with_ledger(settings, Arc::new(FailingLedger));
    let router = build_app(state);

    let response = router
        .oneshot(post_json(
            "/v1/messages",
            json!({"model": "claude", "max_tokens": 16, "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(
        body.get("error")
            .and_then(|e| e.get("code"))
            .and_then(Value::as_str),
        Some("ledger_unavailable")
    );
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}
