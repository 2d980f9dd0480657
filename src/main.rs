use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use courier::config::Config;
use courier::dns::HickoryResolver;
use courier::transport::{MailTransport, RecordingTransport, SmtpRelayTransport};
use courier::Engine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(&config.log_level)
        }))
        .init();

    tracing::info!("Starting Courier");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Migrations applied");

    let resolver = Arc::new(HickoryResolver::new(config.verification.dns_timeout)?);

    let transport: Arc<dyn MailTransport> = match &config.smtp {
        Some(smtp) => {
            let relay = SmtpRelayTransport::new(smtp, config.delivery.send_timeout)?;
            tracing::info!("SMTP relay configured ({}:{})", smtp.host, smtp.port);
            Arc::new(relay)
        }
        None => {
            tracing::warn!("COURIER_SMTP_HOST not set, messages are kept in memory only");
            Arc::new(RecordingTransport::new())
        }
    };

    let engine = Engine::init(pool, config, resolver, transport);
    engine.start();

    shutdown_signal().await;
    engine.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining scheduler");
}
