//! Runtime supervisor
//!
//! Builds the component graph in dependency order, serves the HTTP surface,
//! and tears everything down in reverse order under a single shutdown
//! deadline once the shutdown future resolves.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use loqa_bus::{BusClient, Publisher};
use loqa_config::Settings;
use loqa_pipeline::llm::{ExecGenerator, Generator, LlmService, MockGenerator, OllamaGenerator};
use loqa_pipeline::router::RouterService;
use loqa_pipeline::stt::{ExecRecognizer, MockRecognizer, Recognizer, SttService};
use loqa_pipeline::tts::{ExecSynthesizer, MockSynthesizer, Synthesizer, TtsService};
use loqa_registry::Registry;
use loqa_skills::SkillHost;
use loqa_store::EventStore;
use tokio::sync::watch;

use crate::http::{create_router, metrics_router, AppState};
use crate::{init_metrics, RuntimeError};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Owns the process lifecycle from construction to orderly shutdown.
pub struct Supervisor {
    cfg: Settings,
}

impl Supervisor {
    pub fn new(cfg: Settings) -> Self {
        Self { cfg }
    }

    /// Run until the shutdown future resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) -> Result<(), RuntimeError> {
        let cfg = self.cfg;
        let metrics_handle = init_metrics();

        let bus = BusClient::connect(&cfg.bus).await?;
        let registry = Registry::start(cfg.node.clone(), bus.clone()).await?;
        let store = EventStore::open(cfg.event_store.clone()).await?;
        let skills = SkillHost::start(cfg.skills.clone(), &bus, store.clone()).await?;

        let publisher: Arc<dyn Publisher> = Arc::new(bus.clone());

        let stt = SttService::new(cfg.stt.clone(), Arc::clone(&publisher), build_recognizer(&cfg)?);
        stt.start(&bus).await?;
        let llm = LlmService::new(cfg.llm.clone(), Arc::clone(&publisher), build_generator(&cfg)?);
        llm.start(&bus).await?;
        let tts = TtsService::new(cfg.tts.clone(), Arc::clone(&publisher), build_synthesizer(&cfg)?);
        tts.start(&bus).await?;
        let router = RouterService::new(cfg.router.clone(), Arc::clone(&publisher));
        router.start(&bus).await?;

        let state = AppState {
            bus: Some(bus.clone()),
            registry: Some(Arc::clone(&registry)),
            skills: skills.clone(),
            stt: Some(Arc::clone(&stt)),
            llm: Some(Arc::clone(&llm)),
            tts: Some(Arc::clone(&tts)),
            router: Some(Arc::clone(&router)),
            ..AppState::default()
        };

        let (stop_http, _) = watch::channel(false);

        let addr = format!("{}:{}", cfg.http.bind, cfg.http.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "http surface listening");
        let mut http_stop = stop_http.subscribe();
        let router_state = state.clone();
        let http_task = tokio::spawn(async move {
            axum::serve(listener, create_router(router_state))
                .with_graceful_shutdown(async move {
                    let _ = http_stop.changed().await;
                })
                .await
        });

        let metrics_addr = cfg.telemetry.prometheus_bind.clone();
        let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr).await?;
        tracing::info!(addr = %metrics_addr, "metrics endpoint ready");
        let mut metrics_stop = stop_http.subscribe();
        let metrics_task = tokio::spawn(async move {
            axum::serve(metrics_listener, metrics_router(metrics_handle))
                .with_graceful_shutdown(async move {
                    let _ = metrics_stop.changed().await;
                })
                .await
        });

        state.ready.store(true, Ordering::Release);
        tracing::info!(runtime = %cfg.runtime_name, "runtime started");

        shutdown.await;
        tracing::info!("runtime stopping");
        state.ready.store(false, Ordering::Release);

        let teardown = async {
            let _ = stop_http.send(true);
            if let Ok(Err(error)) = http_task.await {
                tracing::warn!(%error, "http server shutdown error");
            }
            if let Ok(Err(error)) = metrics_task.await {
                tracing::warn!(%error, "metrics server shutdown error");
            }
            router.close().await;
            tts.close().await;
            llm.close().await;
            stt.close().await;
            if let Some(skills) = &skills {
                skills.close().await;
            }
            registry.close().await;
            bus.close().await;
        };
        if tokio::time::timeout(SHUTDOWN_DEADLINE, teardown).await.is_err() {
            tracing::warn!(
                deadline_secs = SHUTDOWN_DEADLINE.as_secs(),
                "shutdown deadline exceeded"
            );
        }

        Ok(())
    }
}

fn build_recognizer(cfg: &Settings) -> Result<Arc<dyn Recognizer>, RuntimeError> {
    Ok(match cfg.stt.mode.as_str() {
        "exec" if cfg.stt.enabled => Arc::new(ExecRecognizer::new(cfg.stt.clone())?),
        _ => Arc::new(MockRecognizer),
    })
}

fn build_generator(cfg: &Settings) -> Result<Arc<dyn Generator>, RuntimeError> {
    Ok(match cfg.llm.mode.as_str() {
        "ollama" if cfg.llm.enabled => Arc::new(OllamaGenerator::new(
            cfg.llm.endpoint.clone(),
            cfg.llm.model_fast.clone(),
            cfg.llm.model_balanced.clone(),
        )),
        "exec" if cfg.llm.enabled => Arc::new(ExecGenerator::new(
            cfg.llm.command.as_deref().unwrap_or_default(),
        )?),
        _ => Arc::new(MockGenerator),
    })
}

fn build_synthesizer(cfg: &Settings) -> Result<Arc<dyn Synthesizer>, RuntimeError> {
    Ok(match cfg.tts.mode.as_str() {
        "exec" if cfg.tts.enabled => Arc::new(ExecSynthesizer::new(
            cfg.tts.command.as_deref().unwrap_or_default(),
            cfg.tts.sample_rate,
            cfg.tts.channels,
        )?),
        _ => Arc::new(MockSynthesizer::new(cfg.tts.sample_rate, cfg.tts.channels)),
    })
}
