//! URL path → repository location resolution.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Which listener a lookup request came from. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Git,
    Ssh,
    Http,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Git => write!(f, "git"),
            Self::Ssh => write!(f, "ssh"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Advertised clone URLs for a resolved repository, one per protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneUrls {
    pub http: Option<String>,
    pub git: Option<String>,
    pub ssh: Option<String>,
}

/// Immutable result of a path lookup.
///
/// `fs_path = None` means "no such repository"; the remaining fields
/// still describe the mount so callers can render useful errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryLocation {
    pub fs_path: Option<PathBuf>,
    pub base_fs_path: PathBuf,
    pub base_url_path: String,
    pub clone_urls: CloneUrls,
}

impl RepositoryLocation {
    /// A lookup miss against the given base.
    pub fn not_found(base_fs_path: impl Into<PathBuf>, base_url_path: impl Into<String>) -> Self {
        Self {
            fs_path: None,
            base_fs_path: base_fs_path.into(),
            base_url_path: base_url_path.into(),
            clone_urls: CloneUrls::default(),
        }
    }

    /// Basename of the repository directory, used as the permissions
    /// file section name.
    pub fn repo_name(&self) -> Option<&str> {
        self.fs_path
            .as_deref()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
    }
}

/// Maps a URL path (or the pathname a Git client passed on the wire)
/// to an on-disk repository.
///
/// Implementations must be deterministic and side-effect-free.
#[async_trait]
pub trait PathResolver: Send + Sync {
    async fn lookup(&self, url_path: &str, hint: Protocol) -> RepositoryLocation;
}

/// Resolver serving `<base>/<name>.git` directories.
///
/// The first path segment must end in `.git` and exist on disk;
/// anything else is a miss. Clone URLs are built from the configured
/// external addresses.
#[derive(Debug, Clone)]
pub struct DiskResolver {
    base: PathBuf,
    http_addr: String,
    git_host: String,
    ssh_addr: String,
}

impl DiskResolver {
    pub fn new(
        base: impl Into<PathBuf>,
        http_addr: impl Into<String>,
        git_host: impl Into<String>,
        ssh_addr: impl Into<String>,
    ) -> Self {
        Self {
            base: base.into(),
            http_addr: http_addr.into(),
            git_host: git_host.into(),
            ssh_addr: ssh_addr.into(),
        }
    }
}

#[async_trait]
impl PathResolver for DiskResolver {
    async fn lookup(&self, url_path: &str, _hint: Protocol) -> RepositoryLocation {
        let mut location = RepositoryLocation::not_found(self.base.clone(), "/");

        let Some(first) = url_path.trim_matches('/').split('/').next() else {
            return location;
        };

        // Plain `.git` segment only; rejects traversal by construction.
        if !first.ends_with(".git") || first == ".git" || first.contains('\\') || first == ".."
        {
            return location;
        }

        let fs_path = self.base.join(first);
        if !fs_path.exists() {
            return location;
        }

        location.base_url_path = format!("/{first}");
        location.clone_urls = CloneUrls {
            http: Some(format!("http://{}/{first}", self.http_addr)),
            git: Some(format!("git://{}/{first}", self.git_host)),
            ssh: Some(format!("ssh://{}/{first}", self.ssh_addr)),
        };
        location.fs_path = Some(fs_path);
        location
    }
}
