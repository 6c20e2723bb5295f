use tokio::signal;

use portcullis::config::GatewayConfig;
use portcullis::core::gateway::{ApiGateway, AppState};
use portcullis::error::GatewayError;
use portcullis::middleware::logging::init_tracing;

#[tokio::main]
async fn main() -> Result<(), GatewayError> {
    init_tracing("info");

    let config = GatewayConfig::from_env();
    if config.jwt.secret == "insecure-dev-secret" && config.server.is_production() {
        tracing::warn!("JWT_SECRET is unset in production");
    }

    let state = AppState::new(config);
    state.seed_defaults().await?;

    let gateway = ApiGateway::new(state);
    let addr = gateway.start().await?;
    tracing::info!(%addr, "gateway started");

    signal::ctrl_c()
        .await
        .map_err(|e| GatewayError::InternalError(format!("failed to listen for ctrl-c: {}", e)))?;
    tracing::info!("shutdown requested");

    gateway.stop().await?;
    Ok(())
}
