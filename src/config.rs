//! Process configuration: CLI flags with environment fallbacks.
//!
//! Every knob has a compiled default, so the server runs with no
//! required environment variables or flags.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "gitgate", version, about = "Serve Git repositories over git://, SSH and HTTP")]
pub struct Cli {
    /// git:// daemon listen address
    #[arg(long, env = "GITGATE_GIT_LISTEN", default_value = "0.0.0.0:9418")]
    pub git_listen: String,

    /// SSH listen address
    #[arg(long, env = "GITGATE_SSH_LISTEN", default_value = "0.0.0.0:5522")]
    pub ssh_listen: String,

    /// HTTP listen address
    #[arg(long, env = "GITGATE_HTTP_LISTEN", default_value = "0.0.0.0:8080")]
    pub http_listen: String,

    /// Directory containing the served `<name>.git` repositories
    #[arg(long, env = "GITGATE_REPO_BASE", default_value = "./")]
    pub repo_base: PathBuf,

    /// SSH host key location (generated on first run when absent).
    /// Defaults to `~/.gitgate/key.pem`.
    #[arg(long, env = "GITGATE_HOST_KEY")]
    pub host_key: Option<PathBuf>,

    /// htpasswd-format password file (`user:argon2-hash` lines)
    #[arg(long, env = "GITGATE_HTPASSWD", default_value = ".htpasswd")]
    pub htpasswd_file: PathBuf,

    /// TOML permissions file: one table per repository, usernames as
    /// keys, `"r"`/`"w"`/`"rw"` as values
    #[arg(long, env = "GITGATE_REPO_PERMS", default_value = ".repoperms.toml")]
    pub perms_file: PathBuf,

    /// SSH keys file (`user:openssh-key-line` lines)
    #[arg(long, env = "GITGATE_SSH_KEYS", default_value = ".sshkeys")]
    pub ssh_keys_file: PathBuf,

    /// Hostname advertised in clone URLs
    #[arg(long, env = "GITGATE_EXTERNAL_HOST", default_value = "localhost")]
    pub external_host: String,

    #[arg(long, env = "GITGATE_GIT_BINARY", default_value = "git")]
    pub git_binary: String,

    #[arg(long, env = "GITGATE_GIT_SHELL", default_value = "git-shell")]
    pub git_shell_binary: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Hash a password (read from stdin) into an htpasswd line
    HashPassword { username: String },
}

impl Cli {
    pub fn host_key_path(&self) -> PathBuf {
        self.host_key.clone().unwrap_or_else(|| {
            let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("."), PathBuf::from);
            home.join(".gitgate").join("key.pem")
        })
    }

    /// `host:port` for clone URLs, from the advertised host and the
    /// port actually listened on.
    pub fn external_http_addr(&self) -> String {
        format!("{}:{}", self.external_host, port_of(&self.http_listen))
    }

    pub fn external_ssh_addr(&self) -> String {
        format!("{}:{}", self.external_host, port_of(&self.ssh_listen))
    }

    pub fn external_git_host(&self) -> String {
        self.external_host.clone()
    }
}

fn port_of(listen: &str) -> &str {
    listen.rsplit(':').next().unwrap_or("0")
}
