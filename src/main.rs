use std::io::BufRead;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use gitgate::auth::file as file_auth;
use gitgate::config::{Cli, Command};
use gitgate::daemon::GitDaemon;
use gitgate::http::{self, HttpState};
use gitgate::paths::{DiskResolver, PathResolver};
use gitgate::ssh::SshListener;
use gitgate::hostkey;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("GITGATE_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Some(Command::HashPassword { username }) = &cli.command {
        return hash_password(username);
    }

    let auth = file_auth::stack(
        cli.perms_file.clone(),
        Some(cli.htpasswd_file.clone()),
        Some(cli.ssh_keys_file.clone()),
    );
    let resolver: Arc<dyn PathResolver> = Arc::new(DiskResolver::new(
        cli.repo_base.clone(),
        cli.external_http_addr(),
        cli.external_git_host(),
        cli.external_ssh_addr(),
    ));

    let host_key = hostkey::load_or_generate(&cli.host_key_path())?;

    let git_listener = TcpListener::bind(&cli.git_listen)
        .await
        .with_context(|| format!("failed to bind git daemon on {}", cli.git_listen))?;
    let ssh_listener = TcpListener::bind(&cli.ssh_listen)
        .await
        .with_context(|| format!("failed to bind ssh on {}", cli.ssh_listen))?;
    let http_listener = TcpListener::bind(&cli.http_listen)
        .await
        .with_context(|| format!("failed to bind http on {}", cli.http_listen))?;

    tracing::info!(
        git = %cli.git_listen,
        ssh = %cli.ssh_listen,
        http = %cli.http_listen,
        repos = %cli.repo_base.display(),
        "starting gitgate"
    );

    let daemon = Arc::new(GitDaemon::new(
        auth.clone(),
        resolver.clone(),
        cli.git_binary.clone(),
    ));
    let sshd = SshListener::new(
        auth.clone(),
        resolver.clone(),
        cli.git_shell_binary.clone(),
        vec![host_key],
    );
    let http_state = HttpState {
        auth,
        resolver,
        viewer: None,
        git_binary: cli.git_binary.clone(),
    };

    tokio::select! {
        res = daemon.serve(git_listener) => res.context("git daemon failed")?,
        res = sshd.serve(ssh_listener) => res.context("ssh listener failed")?,
        res = http::serve(http_listener, http_state) => res.context("http listener failed")?,
        () = shutdown_signal() => {}
    }

    tracing::info!("gitgate stopped");
    Ok(())
}

/// `gitgate hash-password <user>`: read the password from stdin and
/// print an htpasswd line.
fn hash_password(username: &str) -> anyhow::Result<()> {
    let mut password = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut password)
        .context("failed to read password from stdin")?;
    let hash = file_auth::hash_password(password.trim_end_matches(['\r', '\n']))?;
    println!("{username}:{hash}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
