//! Smart/Dumb HTTP listener (TCP 8080).
//!
//! Routing follows git-http-backend's URL conventions. Because the
//! repository mount is resolved dynamically, dispatch happens in a
//! single fallback handler: resolve, authenticate, authorize read,
//! then match the URL tail against the Smart RPC endpoints, the dumb
//! file table, and finally the viewer bridge.

pub mod access;
pub mod files;
pub mod smart;
pub mod viewer;

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method};
use axum::response::Response;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::auth::AuthStack;
use crate::error::ApiError;
use crate::paths::{PathResolver, Protocol};
use crate::rpc::Rpc;
use viewer::Viewer;

#[derive(Clone)]
pub struct HttpState {
    pub auth: AuthStack,
    pub resolver: Arc<dyn PathResolver>,
    pub viewer: Option<Arc<dyn Viewer>>,
    pub git_binary: String,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: HttpState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

#[derive(Debug, Deserialize)]
struct ServiceQuery {
    service: Option<String>,
}

/// Content types that must never take the streaming path: forms need
/// full parsing, so they fall back to buffered handling (the viewer).
fn is_form_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| {
            ct.starts_with("multipart/form-data")
                || ct.starts_with("application/x-www-form-urlencoded")
        })
}

#[tracing::instrument(skip(state, request), fields(method = %request.method(), path = request.uri().path()))]
async fn dispatch(
    State(state): State<HttpState>,
    request: Request,
) -> Result<Response, ApiError> {
    let path = request.uri().path().to_owned();
    let identity = access::authenticate(request.headers(), &state.auth).await?;

    let location = state.resolver.lookup(&path, Protocol::Http).await;
    let Some(fs_path) = location.fs_path.clone() else {
        return Err(access::not_found(&state.auth, &identity));
    };

    // everything below needs read access
    access::require_read(&state.auth, &identity, &location).await?;

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let streaming_ok = !is_form_content_type(request.headers());
    let method = request.method().clone();

    match (&method, segments.as_slice()) {
        (&Method::GET, [.., "info", "refs"]) => {
            let Query(query) = Query::<ServiceQuery>::try_from_uri(request.uri())
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;

            match query.service.as_deref() {
                None => files::dumb_info_refs(&fs_path).await,
                Some(service) => {
                    let rpc = Rpc::from_service_name(service)
                        .ok_or_else(|| ApiError::BadRequest(format!("invalid service: {service}")))?;
                    if rpc.is_write() {
                        access::require_write(&state.auth, &identity, &location).await?;
                    }
                    tracing::info!(protocol = "http", %rpc, repo = %fs_path.display(), %identity, "advertising refs");
                    smart::advertise_refs(&state.git_binary, &fs_path, rpc)
                }
            }
        }

        (&Method::POST, [.., "git-upload-pack"]) if streaming_ok => {
            tracing::info!(protocol = "http", rpc = %Rpc::UploadPack, repo = %fs_path.display(), %identity, "dispatching");
            smart::service_rpc(&state.git_binary, &fs_path, Rpc::UploadPack, request.into_body())
        }

        (&Method::POST, [.., "git-receive-pack"]) if streaming_ok => {
            access::require_write(&state.auth, &identity, &location).await?;
            tracing::info!(protocol = "http", rpc = %Rpc::ReceivePack, repo = %fs_path.display(), %identity, "dispatching");
            smart::service_rpc(&state.git_binary, &fs_path, Rpc::ReceivePack, request.into_body())
        }

        _ => {
            if method == Method::GET {
                if let Some((relative, rule)) = files::match_rule(&path) {
                    return files::serve(&fs_path, &relative, rule).await;
                }
            }
            viewer::delegate(state.viewer.as_ref(), &location, request).await
        }
    }
}
