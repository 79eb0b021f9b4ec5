//! API Server
//!
//! HTTP surface plus the background scheduler task.

use super::{
    handlers::AppState,
    middleware::{create_cors_layer, request_id_middleware},
    routes::create_router,
};
use crate::{config::ApiConfig, engine::DrawEngine, scheduler::SchedulerWorker};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};

pub struct ApiServer {
    config: ApiConfig,
    engine: Arc<DrawEngine>,
    version: String,
}

impl ApiServer {
    pub fn new(engine: Arc<DrawEngine>) -> Self {
        Self {
            config: engine.config().api.clone(),
            engine,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Serve until Ctrl+C, SIGTERM or a fatal engine failure
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let app = self.create_app();
        let addr = self.get_socket_addr()?;

        let worker = if self.engine.config().scheduler.enabled {
            let interval = self.engine.config().tick_interval();
            info!(interval_ms = interval.as_millis() as u64, "Starting scheduler worker");
            Some(SchedulerWorker::spawn(self.engine.scheduler().clone(), interval))
        } else {
            warn!("Scheduler disabled; rounds advance only through explicit calls");
            None
        };

        info!("Starting certified draw API on http://{}", addr);
        self.log_server_info();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let fatal = self.engine.fatal().clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown_signal() => {}
                    reason = fatal.tripped() => {
                        error!(%reason, "Shutting down after fatal engine failure");
                    }
                }
            })
            .await?;

        if let Some(worker) = worker {
            worker.stop();
        }
        if let Some(reason) = self.engine.fatal().reason() {
            return Err(format!("engine halted: {}", reason).into());
        }
        info!("API server stopped gracefully");
        Ok(())
    }

    /// Router with the full middleware stack
    pub fn create_app(&self) -> axum::Router {
        let state = Arc::new(AppState {
            engine: self.engine.clone(),
            version: self.version.clone(),
        });

        create_router(state)
            .layer(axum::middleware::from_fn(request_id_middleware))
            .layer(create_cors_layer(self.config.allowed_origins.clone()))
            .layer(TimeoutLayer::new(Duration::from_secs(self.config.request_timeout_secs)))
            .layer(TraceLayer::new_for_http())
    }

    fn get_socket_addr(&self) -> Result<SocketAddr, Box<dyn std::error::Error>> {
        Ok(SocketAddr::from((
            self.config.host.parse::<std::net::IpAddr>()?,
            self.config.port,
        )))
    }

    fn log_server_info(&self) {
        let config = self.engine.config();
        info!("   Version: {}", self.version);
        info!("   Protocol: {}", config.protocol.protocol_version);
        info!("   Variant: {:?}", config.game.variant);
        info!("   CORS: {:?}", self.config.allowed_origins);
        info!("   Request timeout: {}s", self.config.request_timeout_secs);
        info!("   GET  /audit  /stats  /verify  /round/current  /scheduler");
        info!("   POST /round/{{start,call,end,reset}}  /cards  /cards/:id/shield  /scheduler/tick");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
