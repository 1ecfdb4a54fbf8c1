use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use parallel_echo::config::Config;
use parallel_echo::echo::EchoClient;
use parallel_echo::fanout::Aggregator;
use parallel_echo::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env next to the binary first, then fall back to the CWD search.
    let beside_binary = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(".env")))
        .filter(|path| path.exists());
    match beside_binary {
        Some(path) => {
            dotenvy::from_path(&path).ok();
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let config = Config::load();
    tracing::info!(
        variant = %config.variant,
        width = config.fanout.width,
        deadline = ?config.fanout.deadline,
        echo = %config.echo_base_url,
        "parallel-echo starting"
    );

    // One client for the whole process; every fan-out shares its pool.
    let client = EchoClient::new(&config.echo_base_url, &config.client)
        .context("failed to build HTTP client")?;
    let aggregator = Arc::new(Aggregator::new(
        Arc::new(client),
        config.variant,
        config.fanout,
    ));

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    server::serve(listener, server::router(aggregator), shutdown_signal())
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    tracing::info!("parallel-echo shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}
