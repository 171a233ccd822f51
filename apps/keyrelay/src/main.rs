use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let boot = keyrelay_core::bootstrap_from_env().await?;
    let global = boot.state.global.load();
    let bind = format!("{}:{}", global.host, global.port);

    let core = keyrelay_core::Core::new(boot.state.clone());
    let app = core.router();

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(event = "listening", addr = %bind);
    axum::serve(listener, app).await?;
    Ok(())
}
