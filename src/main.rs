use anyhow::Context;
use sitegate::cli::Shell;
use sitegate::config::GatewayConfig;
use sitegate::lifecycle::{ReloadReport, ServerManager};
use sitegate::topology::{SiteDirectory, SiteSource};
use sitegate::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "/etc/sitegate/gateway.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sitegate=debug".parse().expect("valid log directive")),
        )
        .init();

    let mut interactive = false;
    let mut config_path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--cli" => interactive = true,
            "--version" | "-V" => {
                println!("{} {}", PKG_NAME, VERSION);
                return Ok(());
            }
            _ if config_path.is_none() => config_path = Some(PathBuf::from(&arg)),
            _ => warn!(arg = %arg, "Ignoring extra argument"),
        }
    }
    let config_path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = GatewayConfig::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let sites = SiteDirectory::new(config.paths.sites_available(), config.paths.sites_enabled());
    sites
        .ensure_layout()
        .with_context(|| format!("cannot create site layout under {}", config.paths.base_dir.display()))?;

    let source: Arc<dyn SiteSource> = Arc::new(sites);
    let manager = Arc::new(ServerManager::new(config, source));
    log_report(&manager.start_all().await);

    if interactive {
        run_shell(&manager).await?;
    } else {
        wait_for_signals(&manager).await?;
    }

    if let Err(e) = manager.shutdown().await {
        warn!(error = %e, "Shutdown finished with errors");
    }
    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signals(manager: &ServerManager) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading sites...");
                log_report(&manager.reload().await);
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_manager: &ServerManager) -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

/// Interactive shell. SIGTERM still stops the gateway; Ctrl-C is left to
/// the shell for interrupting `log`.
async fn run_shell(manager: &Arc<ServerManager>) -> anyhow::Result<()> {
    let shell = Shell::new(Arc::clone(manager));

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = shell.run() => result?,
            _ = sigterm.recv() => info!("Received SIGTERM, leaving shell..."),
        }
    }

    #[cfg(not(unix))]
    shell.run().await?;

    Ok(())
}

fn log_report(report: &ReloadReport) {
    info!(sites = ?report.running, "Sites running");
    for (site, e) in &report.failed {
        error!(site = %site, error = %e, "Site unavailable");
    }
}

fn print_startup_banner(config: &GatewayConfig) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        http_port = config.server.http_port,
        https_port = config.server.https_port,
        base_dir = %config.paths.base_dir.display(),
        "Server configuration"
    );
    info!(
        enabled = config.acme.enabled,
        cache_dir = %config.acme.cache_dir.display(),
        staging = config
            .acme
            .directory_url
            .as_deref()
            .is_some_and(|url| url.contains("staging")),
        "ACME settings"
    );
    info!(
        shutdown_timeout_secs = config.server.shutdown_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Request handling settings"
    );
}
