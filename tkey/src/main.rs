mod bootstrap;
mod cli;
mod notify;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use tkey_core::{Notifier, config};
use tkey_ssh_agent::{
    Endpoint, IdentityKeyring, ProxyKeyring, RpClient, SessionFactory, UnixSocketBackend,
    activation, serve,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{AgentArgs, Command};
use crate::notify::{ConsoleNotifier, DesktopNotifier};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match cli::parse(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!();
            cli::print_help();
            std::process::exit(2);
        }
    };

    match command {
        Command::Help => {
            cli::print_help();
            Ok(())
        }
        Command::Config { config, proxy } => cmd_config(&config, proxy.as_deref()),
        Command::Agent(args) => cmd_agent(args).await,
    }
}

/// Logs go to stderr; stdout carries the `SSH_AUTH_SOCK` line and codes.
fn init_logging(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_config(path: &Path, proxy: Option<&str>) -> Result<()> {
    init_logging(false);
    let Some(proxy) = proxy else {
        bail!("nothing to change: pass --proxy <path>, or --proxy '' to clear it");
    };
    config::save_proxy(path, Some(proxy))
        .with_context(|| format!("update config {}", path.display()))?;
    println!("Updated configuration!");
    Ok(())
}

async fn cmd_agent(args: AgentArgs) -> Result<()> {
    init_logging(args.quiet);
    bootstrap::secure_bootstrap();

    let config = config::load(&args.config)
        .with_context(|| format!("load config {}", args.config.display()))?;
    let identities = config
        .remote_identities()
        .with_context(|| format!("invalid identity in {}", args.config.display()))?;
    info!(
        count = identities.len(),
        config = %args.config.display(),
        "identities loaded"
    );

    let endpoints = if args.systemd {
        activation::listen_fds().context("socket activation")?
    } else {
        vec![Endpoint::bind(&args.socket).context("bind agent socket")?]
    };

    if !args.quiet && !args.systemd {
        println!("{}", args.shell.export_line(&args.socket.display().to_string()));
    }

    let notifier: Arc<dyn Notifier> = if args.console {
        Arc::new(ConsoleNotifier)
    } else {
        Arc::new(DesktopNotifier)
    };
    let rp = RpClient::new().context("build HTTP client")?;
    let keyring = IdentityKeyring::from_identities(identities, rp, notifier);

    let backend = args
        .proxy
        .or(config.settings.proxy)
        .filter(|path| !path.is_empty());

    let cancel = CancellationToken::new();
    let served = match backend {
        Some(path) => {
            info!(backend = %path, "forwarding unknown keys");
            let proxy = ProxyKeyring::new(keyring, Arc::new(UnixSocketBackend::new(path)));
            run_until_shutdown(endpoints, proxy, cancel).await
        }
        None => run_until_shutdown(endpoints, keyring, cancel).await,
    };

    if !args.systemd
        && let Err(e) = std::fs::remove_file(&args.socket)
    {
        warn!(path = %args.socket.display(), "failed to remove agent socket: {e}");
    }
    served
}

async fn run_until_shutdown<F: SessionFactory>(
    endpoints: Vec<Endpoint>,
    factory: F,
    cancel: CancellationToken,
) -> Result<()> {
    tokio::select! {
        result = serve(endpoints, factory, cancel.clone()) => result.context("agent stopped"),
        () = shutdown_signal() => {
            info!("shutting down");
            cancel.cancel();
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to register SIGTERM handler: {e}, falling back to SIGINT only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
