use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use planweave::{
    config::EngineConfig,
    gateway::GeminiGateway,
    registry::HttpToolDispatcher,
    server,
    service::{LoggingMetadataHook, WorkflowService},
    runtime::WorkflowGraph,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env()?;
    let checkpointer = config.build_checkpointer().await;

    let dispatcher = Arc::new(HttpToolDispatcher::new(&config.tool_server_url));
    let gateway = Arc::new(GeminiGateway::new(
        &config.gemini_api_key,
        &config.gemini_model,
        config.llm_timeout,
        dispatcher,
    )?);
    let graph = Arc::new(WorkflowGraph::new(
        gateway,
        checkpointer,
        config.step_timeout,
    ));
    let service = Arc::new(WorkflowService::new(
        graph,
        config.default_tokens(),
        Arc::new(LoggingMetadataHook),
    ));

    let router = server::router(service);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "serving workflow engine");
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining connections");
        })
        .await?;

    Ok(())
}
