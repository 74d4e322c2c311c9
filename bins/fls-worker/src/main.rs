use std::sync::Arc;

use anyhow::{Context, Result};
use fls_common::config::LogFormat;
use fls_common::{Arch, Config};
use fls_worker::{health, metrics, runner, shutdown, ApiClient, DockerSandbox, Worker, WorkerSettings};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("invalid worker configuration")?;
    init_tracing(config.log_format);

    let arch = match config.arch.or_else(Arch::detect) {
        Some(arch) => arch,
        None => anyhow::bail!(
            "unsupported host architecture {}; set FLS_ARCH",
            std::env::consts::ARCH
        ),
    };

    info!(arch = %arch, base_url = %config.api.base_url, "fls worker booting");
    info!(
        builder = %config.sandbox.builder_image,
        grader = %config.sandbox.grader_image,
        jobs_root = %config.sandbox.jobs_root().display(),
        "sandbox configured"
    );

    metrics::init_metrics();
    let shutdown = shutdown::install_shutdown_handler().context("failed to install signal handlers")?;

    let api = Arc::new(ApiClient::new(&config.api).context("failed to build control-plane client")?);
    let sandbox = Arc::new(DockerSandbox::connect(&config.sandbox).context("failed to connect to Docker")?);
    let worker = Worker::new(api, sandbox, WorkerSettings::from_config(&config, arch));

    let server = match &config.metrics_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {}", addr))?;
            let token = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = health::serve(listener, arch, token).await {
                    error!(error = %e, "health server stopped");
                }
            }))
        }
        None => None,
    };

    runner::run_until_shutdown(&worker, &config.run, shutdown.clone()).await;

    shutdown.cancel();
    if let Some(server) = server {
        let _ = server.await;
    }

    info!("worker shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
