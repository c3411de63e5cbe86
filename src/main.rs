use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod model;
mod predictor;
mod routes;

use crate::config::AppConfig;
use crate::predictor::Predictor;
use crate::routes::PredictService;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!(
        model = %config.model.path,
        tags = ?config.model.tags,
        max_concurrent = config.inference.max_concurrent,
        "Configuration loaded"
    );

    // no model, no traffic: a load failure ends the process here
    let model = model::load(&config.model).context("Failed to load model")?;
    info!(
        input = %model.contract().input_node,
        output = %model.contract().output_node,
        slot = model.contract().output_slot,
        "Model loaded"
    );
    let predictor = Predictor::new(Arc::new(model));
    let service = PredictService::new(Arc::new(predictor), config.inference.max_concurrent);

    let (addr, server) = warp::serve(routes::routes(service))
        .try_bind_ephemeral(config.server.socket_addr())
        .with_context(|| format!("Failed to bind {}", config.server.socket_addr()))?;

    info!(%addr, "listening on port {}", addr.port());
    server.await;

    Ok(())
}
