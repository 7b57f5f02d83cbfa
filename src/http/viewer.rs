//! Viewer bridge: optional opaque HTTP handler for everything the Git
//! rules don't claim (a repository web frontend, typically).
//!
//! The bridge exposes per-request repository context and rewrites the
//! request path so the viewer sees paths relative to the repository
//! mount. The viewer itself is opaque to the core.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::http::uri::Uri;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::paths::RepositoryLocation;

/// Repository context handed to the viewer on every request.
#[derive(Debug, Clone)]
pub struct ViewerContext {
    pub repository_path: Option<PathBuf>,
    pub repository_base: PathBuf,
    pub repository_clone_urls: BTreeMap<String, String>,
}

impl From<&RepositoryLocation> for ViewerContext {
    fn from(location: &RepositoryLocation) -> Self {
        let mut urls = BTreeMap::new();
        if let Some(http) = &location.clone_urls.http {
            urls.insert("http".to_owned(), http.clone());
        }
        if let Some(git) = &location.clone_urls.git {
            urls.insert("git".to_owned(), git.clone());
        }
        if let Some(ssh) = &location.clone_urls.ssh {
            urls.insert("ssh".to_owned(), ssh.clone());
        }
        Self {
            repository_path: location.fs_path.clone(),
            repository_base: location.base_fs_path.clone(),
            repository_clone_urls: urls,
        }
    }
}

#[async_trait]
pub trait Viewer: Send + Sync {
    async fn handle(&self, ctx: ViewerContext, request: Request) -> Response;
}

/// Adapter for synchronous viewers, run on the blocking pool. The
/// request body is dropped; a browsing frontend only needs the parts.
pub struct SyncViewer<F>(pub F);

#[async_trait]
impl<F> Viewer for SyncViewer<F>
where
    F: Fn(ViewerContext, axum::http::request::Parts) -> Response + Clone + Send + Sync + 'static,
{
    async fn handle(&self, ctx: ViewerContext, request: Request) -> Response {
        let (parts, _body) = request.into_parts();
        let f = self.0.clone();
        match tokio::task::spawn_blocking(move || f(ctx, parts)).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "viewer panicked");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// Hand a request to the configured viewer, or 404 without one.
pub async fn delegate(
    viewer: Option<&Arc<dyn Viewer>>,
    location: &RepositoryLocation,
    request: Request,
) -> Result<Response, ApiError> {
    let Some(viewer) = viewer else {
        return Err(ApiError::NotFound);
    };
    let ctx = ViewerContext::from(location);
    let request = rewrite_mount(request, &location.base_url_path);
    Ok(viewer.handle(ctx, request).await)
}

/// Strip the repository mount prefix so the viewer sees paths
/// relative to the repository root.
fn rewrite_mount(request: Request, base_url_path: &str) -> Request {
    let (mut parts, body) = request.into_parts();

    let path = parts.uri.path();
    let stripped = match path.strip_prefix(base_url_path) {
        Some(rest) if rest.starts_with('/') => rest.to_owned(),
        Some(rest) => format!("/{rest}"),
        None => path.to_owned(),
    };

    let path_and_query = match parts.uri.query() {
        Some(query) => format!("{stripped}?{query}"),
        None => stripped,
    };
    if let Ok(uri) = Uri::try_from(path_and_query) {
        parts.uri = uri;
    }

    Request::from_parts(parts, body)
}
