use crate::config::ProxySettings;
use crate::credit::CreditGuard;
use crate::error::{AppError, AppResult};
use crate::ledger::{LedgerStore, RestLedger};
use crate::pricing::PricingTable;
use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<ProxySettings>,
    pub http: reqwest::Client,
    pub guard: CreditGuard,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

pub fn load_state() -> AppResult<AppState> {
    let settings = ProxySettings::from_env();
    let http = http_client()?;
    let ledger: Arc<dyn LedgerStore> = Arc::new(RestLedger::new(
        http.clone(),
        settings.ledger_url.clone(),
        settings.ledger_key.clone(),
        settings.ledger_timeout_ms,
    ));
    load_state_with_store(settings, ledger)
}

/// Assemble state around an arbitrary ledger implementation. Tests inject a
/// `MemoryLedger` here; production wires up the REST store.
pub fn load_state_with_store(
    settings: ProxySettings,
    ledger: Arc<dyn LedgerStore>,
) -> AppResult<AppState> {
    let http = http_client()?;
    let metrics = init_metrics()?;
    let pricing = Arc::new(PricingTable::builtin());
    let guard = CreditGuard::new(
        ledger,
        pricing,
        settings.user_id.clone(),
        settings.instance_id.clone(),
        settings.default_cap_cents,
    );
    Ok(AppState {
        settings: Arc::new(settings),
        http,
        guard,
        metrics,
    })
}

fn http_client() -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent("tollgate/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.settings.metrics_path.clone();
    Router::new()
        .route("/health", get(crate::handlers::health))
        .route(&metrics_path, get(crate::handlers::metrics))
        .fallback(crate::handlers::proxy)
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
