//! Anonymous `git://` daemon listener (TCP 9418).
//!
//! Read-only by policy: there is no authentication on this transport,
//! so only `git-upload-pack` is accepted, ever. Errors are reported
//! as a single `ERR <reason>` pkt-line before closing.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::auth::{AuthStack, Identity};
use crate::broker;
use crate::paths::{PathResolver, Protocol};
use crate::pktline::{self, Frame};

pub struct GitDaemon {
    auth: AuthStack,
    resolver: Arc<dyn PathResolver>,
    git_binary: String,
}

impl GitDaemon {
    pub fn new(auth: AuthStack, resolver: Arc<dyn PathResolver>, git_binary: String) -> Self {
        Self {
            auth,
            resolver,
            git_binary,
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let daemon = self.clone();
            tokio::spawn(async move {
                tracing::debug!(%addr, "git daemon connection");
                if let Err(e) = daemon.handle(stream).await {
                    tracing::debug!(%addr, error = %e, "git daemon connection failed");
                }
            });
        }
    }

    async fn handle(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        let decoder = pktline::Decoder;
        let mut buf = BytesMut::with_capacity(4096);

        // Accumulate the request pkt-line; everything already buffered
        // beyond it belongs to the pack negotiation and is handed to
        // the child verbatim.
        let frame = loop {
            match decoder.decode(&mut buf) {
                Ok(Some(frame)) => break frame,
                Ok(None) => {
                    if stream.read_buf(&mut buf).await? == 0 {
                        // went away before sending a full request
                        return Ok(());
                    }
                }
                Err(pktline::ProtocolError::InvalidLength(header)) => {
                    return send_error(stream, &format!("ERR Invalid packet length: {header}"))
                        .await;
                }
                Err(e) => return send_error(stream, &format!("ERR {e}")).await,
            }
        };

        let payload = match &frame {
            Frame::Data(payload) => payload.as_ref(),
            Frame::Flush => &[][..],
        };

        let path = match parse_request(payload) {
            Ok(path) => path,
            Err(reason) => return send_error(stream, &format!("ERR {reason}")).await,
        };

        let location = self.resolver.lookup(&path, Protocol::Git).await;
        let Some(fs_path) = location.fs_path.clone() else {
            return send_error(stream, "ERR Repository not found").await;
        };

        if !self.auth.can_read(&Identity::Anonymous, &location).await {
            return send_error(
                stream,
                "ERR Repository does not allow anonymous read access",
            )
            .await;
        }

        tracing::info!(
            protocol = "git",
            rpc = "upload-pack",
            repo = %fs_path.display(),
            identity = %Identity::Anonymous,
            "dispatching"
        );

        broker::splice(
            &self.git_binary,
            [std::ffi::OsString::from("upload-pack"), fs_path.into()],
            stream,
            buf.freeze(),
        )
        .await?;
        Ok(())
    }
}

/// Validate the request pkt-line payload and extract the path.
///
/// Expected form: `git-upload-pack <path>\0host=<host>\0` with an
/// optional extra terminating NUL. The host field is opaque.
fn parse_request(payload: &[u8]) -> Result<String, &'static str> {
    let text = std::str::from_utf8(payload).map_err(|_| "Unable to parse request line")?;

    let rest = text.strip_prefix("git-upload-pack").ok_or(
        "Request not supported. Only git-upload-pack will be accepted",
    )?;
    let rest = rest.strip_prefix(' ').ok_or("Unable to parse request line")?;

    let fields: Vec<&str> = rest.split('\0').collect();
    match fields.as_slice() {
        [path, _host, ""] | [path, _host, "", ""] if !path.is_empty() => Ok((*path).to_owned()),
        _ => Err("Unable to parse request line"),
    }
}

async fn send_error(mut stream: TcpStream, message: &str) -> anyhow::Result<()> {
    let pkt = pktline::encode(Some(message.as_bytes()))?;
    stream.write_all(&pkt).await?;
    stream.shutdown().await?;
    Ok(())
}
