//! Dumb-HTTP static file serving.
//!
//! Old clients fetch `HEAD`, `info/refs` and raw object files over
//! plain GET. The rule table fixes both the content type and the
//! caching class per file shape: loose objects and packs are
//! immutable (cache forever), everything else must revalidate.

use std::path::Path;
use std::sync::LazyLock;

use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use chrono::Utc;
use regex::Regex;
use tokio_util::io::ReaderStream;

use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    Forever,
    Never,
}

pub struct FileRule {
    pattern: Regex,
    pub content_type: &'static str,
    pub cache: CacheClass,
}

static FILE_RULES: LazyLock<Vec<FileRule>> = LazyLock::new(|| {
    let rule = |pattern: &str, content_type: &'static str, cache| FileRule {
        pattern: Regex::new(pattern).expect("static file pattern"),
        content_type,
        cache,
    };
    vec![
        rule(r".*/(HEAD)$", "text/plain", CacheClass::Never),
        rule(
            r".*/(objects/info/alternates)$",
            "text/plain",
            CacheClass::Never,
        ),
        rule(
            r".*/(objects/info/http-alternates)$",
            "text/plain",
            CacheClass::Never,
        ),
        rule(
            r".*/(objects/info/packs)$",
            "text/plain; charset=utf-8",
            CacheClass::Never,
        ),
        rule(
            r".*/(objects/info/[^/]+)$",
            "text/plain",
            CacheClass::Never,
        ),
        rule(
            r".*/(objects/[0-9a-f]{2}/[0-9a-f]{38})$",
            "application/x-git-loose-object",
            CacheClass::Forever,
        ),
        rule(
            r".*/(objects/pack/pack-[0-9a-f]{40}\.pack)$",
            "application/x-git-packed-objects",
            CacheClass::Forever,
        ),
        rule(
            r".*/(objects/pack/pack-[0-9a-f]{40}\.idx)$",
            "application/x-git-packed-objects-toc",
            CacheClass::Forever,
        ),
    ]
});

/// Match a URL path against the dumb-file table, returning the
/// repo-relative file to serve and its rule.
pub fn match_rule(url_path: &str) -> Option<(String, &'static FileRule)> {
    FILE_RULES.iter().find_map(|rule| {
        rule.pattern
            .captures(url_path)
            .and_then(|c| c.get(1))
            .map(|m| (m.as_str().to_owned(), rule))
    })
}

/// Stream `<repo>/<relative>` with the rule's headers.
pub async fn serve(repo: &Path, relative: &str, rule: &FileRule) -> Result<Response, ApiError> {
    let full = repo.join(relative);
    let file = tokio::fs::File::open(&full)
        .await
        .map_err(|_| ApiError::NotFound)?;

    tracing::debug!(file = %full.display(), "serving dumb file");

    let mut builder = Response::builder().header(header::CONTENT_TYPE, rule.content_type);
    builder = apply_cache_headers(builder, rule.cache);
    builder
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| ApiError::Internal(e.into()))
}

/// Dumb `info/refs`: the plain refs file, never cached.
pub async fn dumb_info_refs(repo: &Path) -> Result<Response, ApiError> {
    let file = tokio::fs::File::open(repo.join("info").join("refs"))
        .await
        .map_err(|_| ApiError::NotFound)?;

    let builder = apply_cache_headers(
        Response::builder().header(header::CONTENT_TYPE, "text/plain; charset=utf-8"),
        CacheClass::Never,
    );
    builder
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| ApiError::Internal(e.into()))
}

pub fn apply_cache_headers(
    builder: axum::http::response::Builder,
    cache: CacheClass,
) -> axum::http::response::Builder {
    match cache {
        CacheClass::Forever => {
            let expires = (Utc::now() + chrono::Duration::days(365))
                .format("%a, %d %b %Y %H:%M:%S GMT")
                .to_string();
            builder
                .header(header::EXPIRES, expires)
                .header(header::PRAGMA, "no-cache")
                .header(header::CACHE_CONTROL, "public, max-age=31556926")
        }
        CacheClass::Never => builder
            .header(header::EXPIRES, "Fri, 01 Jan 1980 00:00:00 GMT")
            .header(header::PRAGMA, "no-cache")
            .header(
                header::CACHE_CONTROL,
                "no-cache, max-age=0, must-revalidate",
            ),
    }
}
