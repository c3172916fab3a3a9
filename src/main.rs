use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use lora_hotswap::config::{Cli, Config};
use lora_hotswap::inference::engine::InferenceEngine;
use lora_hotswap::inference::llama_ffi::LlamaModel;
use lora_hotswap::metrics::Metrics;
use lora_hotswap::server::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "lora_hotswap=debug,tower_http=debug"
    } else {
        "lora_hotswap=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("lora-hotswap v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);
    config.validate()?;
    let config = Arc::new(config);

    info!(
        model = %config.model.model_path.display(),
        context_size = config.model.context_size,
        graph_node_budget = config.model.graph_node_budget,
        preload = config.adapters.preload.len(),
        personas = config.personas.len(),
        "Configuration loaded"
    );

    // Load the base model once; adapters attach to it for the process lifetime.
    let model = LlamaModel::load(&config.model.model_path, config.model_params())
        .with_context(|| format!("loading model {}", config.model.model_path.display()))?;
    info!(
        architecture = model.architecture,
        n_layers = model.n_layers,
        n_embd = model.n_embd,
        n_ctx_train = model.n_ctx_train,
        "Model loaded"
    );

    let metrics = Metrics::new().context("registering metrics")?;
    let engine = InferenceEngine::new(Arc::new(model), config.clone(), metrics)
        .context("creating inference context")?;

    // Startup adapters. A bad preset is fatal.
    match engine.preload(&config.adapters.preload).await {
        Ok(loaded) => {
            for adapter in &loaded {
                info!(
                    adapter = adapter.name,
                    scale = adapter.scale,
                    rank = adapter.rank,
                    "Preloaded adapter"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Adapter preload failed");
            return Err(e.into());
        }
    }

    // Build the HTTP router.
    let state = Arc::new(AppState::new(engine));
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
