use p2c_engine::{Config, Manager, Notifier, api, init_logger};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let config = Config::from_env();
    init_logger(&config.log_level);

    tracing::info!(
        addr = %config.addr,
        base_url = %config.base_url,
        "p2c-engine starting"
    );
    if config.bot_token.is_empty() {
        tracing::warn!("no bot token configured, operator notifications disabled");
    }

    let notifier = Arc::new(Notifier::new(&config.bot_token));
    let manager = Arc::new(Manager::new(
        config.base_url.clone(),
        notifier,
        config.poll_interval,
    ));
    let app = api::router(Arc::clone(&manager));

    let addr = config
        .listen_addr()
        .expect("invalid ENGINE_ADDR listen address");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("bind control-plane listener");
    tracing::info!(%addr, "control plane listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, stopping");
        })
        .await
    {
        tracing::error!(error = %e, "control plane server failed");
    }

    manager.stop_all().await;
    tracing::info!("p2c-engine stopped");
}
