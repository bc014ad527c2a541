pub mod handlers;
mod router;

pub use router::build_api_router;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ServerConfig;
use crate::core::agent::Agent;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::orchestrator::StreamOrchestrator;
use crate::core::resolver::ContinuationResolver;
use crate::core::store::RunStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RunStore>,
    pub resolver: Arc<ContinuationResolver>,
    pub orchestrator: StreamOrchestrator,
    pub model: String,
    pub cors_origins: Vec<String>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn RunStore>,
        agent: Arc<dyn Agent>,
        model: impl Into<String>,
        cors_origins: Vec<String>,
    ) -> Self {
        let model = model.into();
        Self {
            resolver: Arc::new(ContinuationResolver::new(store.clone())),
            orchestrator: StreamOrchestrator::new(store.clone(), agent, model.clone()),
            store,
            model,
            cors_origins,
        }
    }
}

/// Serves the chat API until shut down. Open streams are left to finish
/// their phase; new connections stop being accepted.
pub struct ApiServer {
    state: AppState,
    host: String,
    port: u16,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn new(state: AppState, server: &ServerConfig) -> Self {
        Self {
            state,
            host: server.host.clone(),
            port: server.port,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API Server Interface initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        let app = router::build_api_router(self.state.clone());
        let cancel = self.cancel.clone();

        info!("API Server running at http://{addr}");
        self.handle = Some(tokio::spawn(async move {
            let serving = axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await });
            if let Err(e) = serving.await {
                tracing::error!("API Server crashed: {}", e);
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server Interface shutting down...");
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await.ok();
        }
        Ok(())
    }
}
