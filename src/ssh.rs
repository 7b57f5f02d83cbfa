//! SSH listener (TCP 5522).
//!
//! Full SSH server on russh. Auth methods are offered according to
//! what the configured [`AuthStack`] can actually check; after auth,
//! only session channels are useful and `exec` of the two Git RPCs is
//! the only real entry point. Everything else is refused over the
//! fail-channel primitive without tearing down the transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::PrivateKey;
use russh::server::{Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet, Pty};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::ChildStdin;

use crate::auth::{AuthStack, Identity};
use crate::broker;
use crate::paths::{PathResolver, Protocol};
use crate::rpc::Rpc;

pub struct SshListener {
    stack: AuthStack,
    resolver: Arc<dyn PathResolver>,
    git_shell_binary: String,
    host_keys: Vec<PrivateKey>,
}

impl SshListener {
    pub fn new(
        stack: AuthStack,
        resolver: Arc<dyn PathResolver>,
        git_shell_binary: String,
        host_keys: Vec<PrivateKey>,
    ) -> Self {
        Self {
            stack,
            resolver,
            git_shell_binary,
            host_keys,
        }
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let config = Arc::new(russh::server::Config {
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: self.host_keys.clone(),
            ..Default::default()
        });

        if self.stack.password.is_some() {
            tracing::info!("ssh: password authentication enabled");
        }
        if self.stack.public_key.is_some() {
            tracing::info!("ssh: public key authentication enabled");
        }

        let mut factory = Factory {
            stack: self.stack,
            resolver: self.resolver,
            git_shell_binary: self.git_shell_binary,
        };
        factory.run_on_socket(config, &listener).await?;
        Ok(())
    }
}

#[derive(Clone)]
struct Factory {
    stack: AuthStack,
    resolver: Arc<dyn PathResolver>,
    git_shell_binary: String,
}

impl russh::server::Server for Factory {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<std::net::SocketAddr>) -> Self::Handler {
        tracing::debug!(?peer_addr, "ssh connection");
        SshSession {
            stack: self.stack.clone(),
            resolver: self.resolver.clone(),
            git_shell_binary: self.git_shell_binary.clone(),
            username: None,
            children: HashMap::new(),
            exec_done: false,
        }
    }
}

struct ChannelChild {
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
}

pub struct SshSession {
    stack: AuthStack,
    resolver: Arc<dyn PathResolver>,
    git_shell_binary: String,
    username: Option<String>,
    children: HashMap<ChannelId, ChannelChild>,
    exec_done: bool,
}

impl SshSession {
    fn offered_methods(&self) -> MethodSet {
        let mut methods = MethodSet::empty();
        if self.stack.password.is_some() {
            methods |= MethodSet::PASSWORD;
        }
        if self.stack.public_key.is_some() {
            methods |= MethodSet::PUBLICKEY;
        }
        methods
    }

    fn reject(&self) -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(self.offered_methods()),
        }
    }
}

/// Fail an exec/shell request in-channel: message on stderr, exit 128,
/// close. The SSH transport stays up.
fn refuse(
    session: &mut Session,
    channel: ChannelId,
    message: &str,
) -> Result<(), russh::Error> {
    session.channel_success(channel)?;
    session.extended_data(channel, 1, CryptoVec::from(format!("{message}\n").into_bytes()))?;
    session.exit_status_request(channel, 128)?;
    session.close(channel)?;
    Ok(())
}

/// Shell-split an exec command into (rpc, repository argument).
///
/// Git quotes the path as passed by the client
/// (`git-upload-pack '/my repos/foo.git'`), so the command is
/// tokenized with shell quoting rules; the first token is the RPC
/// and the last the repository.
fn parse_exec(command: &str) -> Option<(String, String)> {
    let mut tokens = shlex::split(command)?;
    if tokens.len() < 2 {
        return None;
    }
    let repo = tokens.pop()?;
    if repo.is_empty() {
        return None;
    }
    let rpc = tokens.swap_remove(0);
    Some((rpc, repo))
}

#[async_trait]
impl russh::server::Handler for SshSession {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(self.reject())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let Some(checker) = self.stack.password.clone() else {
            return Ok(self.reject());
        };
        if checker.check_password(user, password).await {
            self.username = Some(user.to_owned());
            return Ok(Auth::Accept);
        }
        tracing::info!(user, "ssh password authentication failed");
        Ok(self.reject())
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let Some(checker) = self.stack.public_key.clone() else {
            return Ok(self.reject());
        };
        let Ok(blob) = public_key.to_bytes() else {
            return Ok(self.reject());
        };
        if checker.check_public_key(user, &blob).await {
            self.username = Some(user.to_owned());
            return Ok(Auth::Accept);
        }
        tracing::info!(user, "ssh public key authentication failed");
        Ok(self.reject())
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    #[allow(clippy::too_many_lines)]
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // One child per session.
        if self.exec_done {
            session.channel_failure(channel)?;
            return Ok(());
        }

        let command = String::from_utf8_lossy(data).to_string();
        let username = self.username.clone().unwrap_or_default();
        let identity = Identity::User(username.clone());

        let Some((rpc_token, repo_arg)) = parse_exec(&command) else {
            return refuse(session, channel, "Unknown RPC");
        };
        let Some(rpc) = Rpc::from_service_name(&rpc_token) else {
            tracing::warn!(user = %username, rpc = %rpc_token, "unknown ssh rpc");
            return refuse(session, channel, "Unknown RPC");
        };

        let location = self.resolver.lookup(&repo_arg, Protocol::Ssh).await;
        let Some(fs_path) = location.fs_path.clone() else {
            tracing::info!(user = %username, repo = %repo_arg, "ssh lookup failed");
            return refuse(session, channel, "Unknown Repository");
        };

        match rpc {
            Rpc::UploadPack if !self.stack.can_read(&identity, &location).await => {
                tracing::info!(user = %username, repo = %repo_arg, "ssh read denied");
                return refuse(session, channel, "You don't have read permissions");
            }
            Rpc::ReceivePack if !self.stack.can_write(&identity, &location).await => {
                tracing::info!(user = %username, repo = %repo_arg, "ssh write denied");
                return refuse(session, channel, "You don't have write permissions");
            }
            _ => {}
        }

        tracing::info!(
            protocol = "ssh",
            %rpc,
            repo = %fs_path.display(),
            identity = %identity,
            "dispatching"
        );

        let shell_command = format!("{rpc} '{}'", fs_path.display());
        let mut child = match broker::spawn(&self.git_shell_binary, ["-c", shell_command.as_str()]) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(error = %e, "ssh child spawn failed");
                session.channel_failure(channel)?;
                return Ok(());
            }
        };

        let stdin = child.stdin.take().expect("stdin piped");
        let mut stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");
        let pid = child.id();

        self.children.insert(
            channel,
            ChannelChild {
                stdin: Some(stdin),
                pid,
            },
        );
        self.exec_done = true;
        session.channel_success(channel)?;

        // Child output pump: stdout as channel data, stderr as
        // extended data, exit status once both pipes drain.
        let handle = session.handle();
        tokio::spawn(async move {
            let mut out_buf = [0u8; 8192];
            let mut err_buf = [0u8; 8192];
            let mut out_open = true;
            let mut err_open = true;

            while out_open || err_open {
                let sent = tokio::select! {
                    read = stdout.read(&mut out_buf), if out_open => match read {
                        Ok(0) => { out_open = false; continue; }
                        Ok(n) => handle.data(channel, CryptoVec::from(&out_buf[..n])).await.is_ok(),
                        Err(_) => false,
                    },
                    read = stderr.read(&mut err_buf), if err_open => match read {
                        Ok(0) => { err_open = false; continue; }
                        Ok(n) => handle.extended_data(channel, 1, CryptoVec::from(&err_buf[..n])).await.is_ok(),
                        Err(_) => false,
                    },
                };

                if !sent {
                    // client went away mid-stream
                    broker::send_hup(pid);
                    break;
                }
            }

            match child.wait().await {
                Ok(status) => {
                    if !status.success() {
                        tracing::warn!(pid, %status, "ssh child exited abnormally");
                    }
                    let code = status
                        .code()
                        .and_then(|c| u32::try_from(c).ok())
                        .unwrap_or(128);
                    let _ = handle.exit_status_request(channel, code).await;
                }
                Err(e) => {
                    tracing::warn!(pid, error = %e, "failed to reap ssh child");
                }
            }
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });

        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(child) = self.children.get_mut(&channel) {
            if let Some(stdin) = child.stdin.as_mut() {
                if stdin.write_all(data).await.is_err() {
                    // child closed its stdin; drop further client bytes
                    child.stdin = None;
                }
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(child) = self.children.get_mut(&channel) {
            child.stdin.take();
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(child) = self.children.remove(&channel) {
            broker::send_hup(child.pid);
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::info!(user = ?self.username, "ssh shell refused");
        refuse(session, channel, "Shell access not allowed")
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // accepted as a no-op
        session.channel_success(channel)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_exec_commands() {
        assert_eq!(
            parse_exec("git-upload-pack 'repo.git'"),
            Some(("git-upload-pack".into(), "repo.git".into()))
        );
        assert_eq!(
            parse_exec("git-receive-pack \"r.git\""),
            Some(("git-receive-pack".into(), "r.git".into()))
        );
        assert_eq!(
            parse_exec("git-upload-pack --strict 'repo.git'"),
            Some(("git-upload-pack".into(), "repo.git".into()))
        );
    }

    #[test]
    fn quoting_preserves_spaces_in_the_path() {
        assert_eq!(
            parse_exec("git-upload-pack '/my repos/foo.git'"),
            Some(("git-upload-pack".into(), "/my repos/foo.git".into()))
        );
        assert_eq!(
            parse_exec("git-receive-pack \"/my repos/foo.git\""),
            Some(("git-receive-pack".into(), "/my repos/foo.git".into()))
        );
    }

    #[test]
    fn rejects_commands_without_an_argument() {
        assert_eq!(parse_exec("git-upload-pack"), None);
        assert_eq!(parse_exec(""), None);
        assert_eq!(parse_exec("git-upload-pack ''"), None);
        // unbalanced quoting fails the shell split
        assert_eq!(parse_exec("git-upload-pack 'repo.git"), None);
    }
}
