use std::sync::Arc;

use anyhow::Context;

use parley_api::app::{build_app, services::build_services};
use parley_auth::Hs256JwtValidator;
use parley_infra::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    parley_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;
    let services = Arc::new(
        build_services(&settings)
            .await
            .context("failed to wire services")?,
    );
    let jwt = Arc::new(Hs256JwtValidator::new(settings.jwt_secret.as_bytes()));

    let app = build_app(services.clone(), jwt);

    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    services.shutdown().await;
    tracing::info!("api stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
