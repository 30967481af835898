//! HTTP surface
//!
//! `/healthz` answers 200 whenever the process serves; `/readyz` answers 200
//! only while the bus, the registry and every enabled worker service report
//! healthy. Metrics render on a separate bind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use loqa_pipeline::llm::LlmService;
use loqa_pipeline::router::RouterService;
use loqa_pipeline::stt::SttService;
use loqa_pipeline::tts::TtsService;
use loqa_registry::Registry;
use loqa_skills::SkillHost;

/// Handles the readiness check reaches into.
#[derive(Clone, Default)]
pub struct AppState {
    pub ready: Arc<AtomicBool>,
    pub bus: Option<loqa_bus::BusClient>,
    pub registry: Option<Arc<Registry>>,
    pub skills: Option<Arc<SkillHost>>,
    pub stt: Option<Arc<SttService>>,
    pub llm: Option<Arc<LlmService>>,
    pub tts: Option<Arc<TtsService>>,
    pub router: Option<Arc<RouterService>>,
}

impl AppState {
    fn all_healthy(&self) -> bool {
        if !self.ready.load(Ordering::Acquire) {
            return false;
        }
        let bus_ok = self.bus.as_ref().map(|b| b.healthy()).unwrap_or(false);
        let registry_ok = self
            .registry
            .as_ref()
            .map(|r| r.healthy())
            .unwrap_or(true);
        let skills_ok = self.skills.as_ref().map(|s| s.healthy()).unwrap_or(true);
        let stt_ok = self.stt.as_ref().map(|s| s.healthy()).unwrap_or(true);
        let llm_ok = self.llm.as_ref().map(|s| s.healthy()).unwrap_or(true);
        let tts_ok = self.tts.as_ref().map(|s| s.healthy()).unwrap_or(true);
        let router_ok = self.router.as_ref().map(|s| s.healthy()).unwrap_or(true);
        bus_ok && registry_ok && skills_ok && stt_ok && llm_ok && tts_ok && router_ok
    }
}

/// Build the liveness/readiness router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/readyz", get(handle_ready))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build the metrics router for the dedicated Prometheus bind.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move {
                (
                    StatusCode::OK,
                    [(
                        header::CONTENT_TYPE,
                        "text/plain; version=0.0.4; charset=utf-8",
                    )],
                    handle.render(),
                )
            }
        }),
    )
}

async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn handle_ready(State(state): State<AppState>) -> impl IntoResponse {
    if state.all_healthy() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_not_ready() {
        // No bus connection yet: readiness must refuse.
        let state = AppState::default();
        assert!(!state.all_healthy());
    }

    #[test]
    fn test_router_creation() {
        let _ = create_router(AppState::default());
    }
}
