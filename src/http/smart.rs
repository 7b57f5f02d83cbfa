//! Smart HTTP: ref advertisement and the stateless-rpc POST endpoints.
//!
//! POST bodies are piped into the child's stdin chunk by chunk as
//! they arrive (pack uploads can be arbitrarily large, so the body
//! is never buffered) and the child's output streams straight back
//! out as the response body.

use std::path::Path;

use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::broker;
use crate::error::ApiError;
use crate::http::files::{CacheClass, apply_cache_headers};
use crate::pktline;
use crate::rpc::Rpc;

/// `GET …/info/refs?service=…`: pkt-line service banner, flush, then
/// the streamed output of `git <rpc> --stateless-rpc --advertise-refs`.
pub fn advertise_refs(git_binary: &str, fs_path: &Path, rpc: Rpc) -> Result<Response, ApiError> {
    let mut child = broker::spawn(
        git_binary,
        [
            rpc.subcommand().as_ref(),
            "--stateless-rpc".as_ref(),
            "--advertise-refs".as_ref(),
            fs_path.as_os_str(),
        ],
    )?;
    // ref advertisement takes no input
    drop(child.stdin.take());

    let mut banner = pktline::encode(Some(format!("# service={rpc}\n").as_bytes()))?;
    banner.extend_from_slice(b"0000");

    let stream = futures_util::stream::once(async move { Ok(Bytes::from(banner)) })
        .chain(broker::merged_output(child));

    let builder = apply_cache_headers(
        Response::builder().header(
            header::CONTENT_TYPE,
            format!("application/x-{}-advertisement", rpc.service_name()),
        ),
        CacheClass::Never,
    );
    builder
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(e.into()))
}

/// `POST …/git-upload-pack` / `…/git-receive-pack`: splice the request
/// body into `git <rpc> --stateless-rpc` and stream the result back.
pub fn service_rpc(
    git_binary: &str,
    fs_path: &Path,
    rpc: Rpc,
    body: Body,
) -> Result<Response, ApiError> {
    let mut child = broker::spawn(
        git_binary,
        [
            rpc.subcommand().as_ref(),
            "--stateless-rpc".as_ref(),
            fs_path.as_os_str(),
        ],
    )?;
    let mut stdin = child.stdin.take().expect("stdin piped");

    // Feed body chunks to the child as they arrive.
    tokio::spawn(async move {
        let mut chunks = body.into_data_stream();
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => {
                    if stdin.write_all(&chunk).await.is_err() {
                        // child closed stdin; stop feeding, let its
                        // output run to completion
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "request body aborted");
                    return;
                }
            }
        }
        let _ = stdin.shutdown().await;
    });

    let builder = Response::builder()
        .header(
            header::CONTENT_TYPE,
            format!("application/x-{}-result", rpc.service_name()),
        )
        .header(header::CACHE_CONTROL, "no-cache");
    builder
        .body(Body::from_stream(broker::merged_output(child)))
        .map_err(|e| ApiError::Internal(e.into()))
}
