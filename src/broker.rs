//! Child process broker.
//!
//! Owns the lifetime coupling between a spawned `git` subprocess and
//! the network peer it serves: stdout and stderr are merged into the
//! peer stream in arrival order, peer bytes are fed to child stdin,
//! and back-pressure in both directions falls out of await-based
//! copying (a full pipe suspends the corresponding pump, which stops
//! reads on the other side).
//!
//! Lifecycle rules:
//! - the peer stream is not consumed until the child has spawned;
//! - the child closing its stdin does not tear anything down; the
//!   stdin pump just stops, teardown waits for process exit;
//! - peer disconnect sends a best-effort SIGHUP and closes stdin;
//! - child exit stops peer reads, drains buffered output, closes the
//!   stream. Non-zero exits are logged, never retried.

use std::ffi::OsStr;
use std::io;
use std::process::{ExitStatus, Stdio};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: io::Error,
    },

    #[error("transport error while splicing: {0}")]
    Transport(#[from] io::Error),
}

/// Lifecycle of one attach, observable through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BrokerState {
    Idle,
    Spawning,
    Running,
    Draining,
    Closed,
}

/// Spawn a subprocess with fully piped stdio.
pub fn spawn<I, S>(program: &str, args: I) -> Result<Child, BrokerError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| BrokerError::Spawn {
            command: program.to_owned(),
            source,
        })
}

/// Best-effort SIGHUP. Failure (already exited) is not an error.
pub fn send_hup(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGHUP);
}

/// Splices one child process to one duplex peer stream.
pub struct PipeBroker {
    state: watch::Sender<BrokerState>,
}

impl PipeBroker {
    pub fn new() -> (Self, watch::Receiver<BrokerState>) {
        let (state, rx) = watch::channel(BrokerState::Idle);
        (Self { state }, rx)
    }

    fn set(&self, state: BrokerState) {
        let _ = self.state.send(state);
    }

    /// Spawn `program args…` and splice it to `stream` until both
    /// sides are done. `initial_stdin` is written to the child before
    /// any peer bytes; listeners use it for request bytes they had
    /// already buffered while parsing.
    ///
    /// Returns the child's exit status once all of its output has been
    /// flushed to the peer.
    pub async fn attach<I, S, T>(
        self,
        program: &str,
        args: I,
        stream: T,
        initial_stdin: Bytes,
    ) -> Result<ExitStatus, BrokerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.set(BrokerState::Spawning);
        let mut child = spawn(program, args)?;
        let pid = child.id();

        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        self.set(BrokerState::Running);
        let (client_r, client_w) = tokio::io::split(stream);

        // Aborting this task drops stdin, which closes it.
        let to_child = tokio::spawn(feed_stdin(client_r, stdin, initial_stdin));

        let pumped = pump_output(stdout, stderr, client_w).await;
        self.set(BrokerState::Draining);
        to_child.abort();

        match pumped {
            Ok(mut client_w) => {
                let status = child.wait().await?;
                if !status.success() {
                    tracing::warn!(pid, %status, "child exited abnormally");
                }
                let _ = client_w.flush().await;
                let _ = client_w.shutdown().await;
                self.set(BrokerState::Closed);
                Ok(status)
            }
            Err(e) => {
                send_hup(pid);
                let _ = child.wait().await;
                self.set(BrokerState::Closed);
                Err(BrokerError::Transport(e))
            }
        }
    }
}

/// Convenience wrapper when nobody watches the state.
pub async fn splice<I, S, T>(
    program: &str,
    args: I,
    stream: T,
    initial_stdin: Bytes,
) -> Result<ExitStatus, BrokerError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (broker, _rx) = PipeBroker::new();
    broker.attach(program, args, stream, initial_stdin).await
}

async fn feed_stdin<R>(mut client_r: R, mut stdin: ChildStdin, initial: Bytes)
where
    R: AsyncRead + Send + Unpin,
{
    if !initial.is_empty() && stdin.write_all(&initial).await.is_err() {
        return;
    }

    let mut buf = [0u8; 8192];
    loop {
        match client_r.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                // A write error means the child closed its stdin; not
                // a teardown, the output side keeps going.
                if stdin.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
    let _ = stdin.shutdown().await;
}

/// Merge stdout and stderr into the peer writer, preserving arrival
/// order per pipe. Returns the writer back for the final flush.
async fn pump_output<W>(
    mut stdout: ChildStdout,
    mut stderr: ChildStderr,
    mut client_w: W,
) -> io::Result<W>
where
    W: AsyncWrite + Send + Unpin,
{
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => match read? {
                0 => out_open = false,
                n => client_w.write_all(&out_buf[..n]).await?,
            },
            read = stderr.read(&mut err_buf), if err_open => match read? {
                0 => err_open = false,
                n => client_w.write_all(&err_buf[..n]).await?,
            },
        }
    }
    Ok(client_w)
}

/// Child stdout+stderr as a chunk stream, for response bodies.
///
/// The child is reaped once both pipes hit EOF; if the consumer goes
/// away first (client disconnect), the child gets a SIGHUP.
pub fn merged_output(mut child: Child) -> ReceiverStream<io::Result<Bytes>> {
    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");
    let pid = child.id();
    let (tx, rx) = tokio::sync::mpsc::channel::<io::Result<Bytes>>(8);

    tokio::spawn(async move {
        let mut out_buf = [0u8; 8192];
        let mut err_buf = [0u8; 8192];
        let mut out_open = true;
        let mut err_open = true;

        while out_open || err_open {
            let chunk = tokio::select! {
                read = stdout.read(&mut out_buf), if out_open => match read {
                    Ok(0) => { out_open = false; continue; }
                    Ok(n) => Ok(Bytes::copy_from_slice(&out_buf[..n])),
                    Err(e) => Err(e),
                },
                read = stderr.read(&mut err_buf), if err_open => match read {
                    Ok(0) => { err_open = false; continue; }
                    Ok(n) => Ok(Bytes::copy_from_slice(&err_buf[..n])),
                    Err(e) => Err(e),
                },
            };

            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() {
                send_hup(pid);
                break;
            }
            if failed {
                break;
            }
        }

        match child.wait().await {
            Ok(status) if !status.success() => {
                tracing::warn!(pid, %status, "child exited abnormally");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(pid, error = %e, "failed to reap child"),
        }
    });

    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn attach_echoes_through_cat() {
        let (mut peer, ours) = tokio::io::duplex(1024);
        let (broker, mut state) = PipeBroker::new();

        let task = tokio::spawn(async move {
            broker
                .attach("cat", Vec::<String>::new(), ours, Bytes::new())
                .await
        });

        peer.write_all(b"hello through the pipe").await.unwrap();
        peer.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        peer.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"hello through the pipe");

        let status = task.await.unwrap().unwrap();
        assert!(status.success());

        // States only move forward and finish at Closed.
        let mut seen = vec![*state.borrow_and_update()];
        while state.changed().await.is_ok() {
            seen.push(*state.borrow_and_update());
        }
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "states went backwards: {seen:?}");
        assert_eq!(seen.last(), Some(&BrokerState::Closed));
    }

    #[tokio::test]
    async fn initial_stdin_reaches_the_child_first() {
        let (mut peer, ours) = tokio::io::duplex(1024);

        let task = tokio::spawn(splice(
            "cat",
            Vec::<String>::new(),
            ours,
            Bytes::from_static(b"buffered "),
        ));

        peer.write_all(b"later").await.unwrap();
        peer.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        peer.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"buffered later");
        assert!(task.await.unwrap().unwrap().success());
    }

    #[tokio::test]
    async fn stderr_is_merged_and_exit_status_reported() {
        let (mut peer, ours) = tokio::io::duplex(1024);

        let task = tokio::spawn(splice(
            "sh",
            ["-c", "printf out; printf err >&2; exit 3"],
            ours,
            Bytes::new(),
        ));

        peer.shutdown().await.unwrap();
        let mut output = Vec::new();
        peer.read_to_end(&mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("out"), "missing stdout in {text:?}");
        assert!(text.contains("err"), "missing stderr in {text:?}");

        let status = task.await.unwrap().unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_not_a_panic() {
        let (_peer, ours) = tokio::io::duplex(64);
        let err = splice("/definitely/not/a/binary", Vec::<String>::new(), ours, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn merged_output_streams_both_pipes() {
        let child = spawn("sh", ["-c", "printf one; printf two >&2"]).unwrap();
        let mut stream = merged_output(child);

        let mut collected = String::new();
        while let Some(chunk) = stream.next().await {
            collected.push_str(std::str::from_utf8(&chunk.unwrap()).unwrap());
        }
        assert!(collected.contains("one"));
        assert!(collected.contains("two"));
    }
}
