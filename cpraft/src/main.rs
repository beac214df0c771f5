mod server;

use anyhow::Context;
use clap::Parser;
use tokio::signal;

use cpraft::RuntimeConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Runtime config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install signal handler")?;
        tokio::select! {
            res = signal::ctrl_c() => res.context("failed to install Ctrl+C handler")?,
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    RuntimeConfig::from_toml(&args.config);

    let mut server = server::Server::builder()?;
    server.start().await?;
    shutdown_signal().await?;
    server.stop().await;
    Ok(())
}
