//! File-backed implementations of the auth contracts.
//!
//! Three flat files, all hand-editable:
//! - an htpasswd-format password file (`user:argon2-phc-hash` lines),
//!   reloaded automatically when its mtime changes;
//! - a TOML permissions file with one table per repository basename,
//!   usernames as keys and access-letter strings (`"r"`, `"w"`,
//!   `"rw"`) as values;
//! - an SSH keys file with one `user:openssh-key-line` per line.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{AccessControl, AuthStack, Identity, PasswordAuth, PublicKeyAuth};
use crate::paths::RepositoryLocation;

/// Hash a password into the PHC string stored in the htpasswd file.
pub fn hash_password(plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
    let hash = Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hash failed: {e}"))?
        .to_string();
    Ok(hash)
}

fn verify_password(plain: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(plain.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Build an [`AuthStack`] from the configured files.
///
/// Password and public-key capabilities are present only when the
/// corresponding file is configured; listeners pick auth methods off
/// the resulting stack.
pub fn stack(
    perms_file: PathBuf,
    htpasswd_file: Option<PathBuf>,
    ssh_keys_file: Option<PathBuf>,
) -> AuthStack {
    AuthStack {
        access: Arc::new(RepoPerms::new(perms_file)),
        password: htpasswd_file.map(|p| Arc::new(Htpasswd::new(p)) as Arc<dyn PasswordAuth>),
        public_key: ssh_keys_file
            .map(|p| Arc::new(AuthorizedKeys::new(p)) as Arc<dyn PublicKeyAuth>),
    }
}

// ---------------------------------------------------------------------------
// Repository permissions
// ---------------------------------------------------------------------------

/// TOML permissions file, re-read on every decision so edits take
/// effect immediately. Anonymous callers are looked up under the
/// literal username `anonymous`.
pub struct RepoPerms {
    path: PathBuf,
}

impl RepoPerms {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn check_access(
        &self,
        identity: &Identity,
        location: &RepositoryLocation,
        level: char,
    ) -> bool {
        let Some(repo) = location.repo_name() else {
            return false;
        };
        let username = identity.name().unwrap_or("anonymous");

        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "permissions file unreadable, denying");
                return false;
            }
        };

        let table: HashMap<String, HashMap<String, String>> = match toml::from_str(&raw) {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "permissions file invalid, denying");
                return false;
            }
        };

        table
            .get(repo)
            .and_then(|users| users.get(username))
            .is_some_and(|letters| letters.contains(level))
    }
}

#[async_trait]
impl AccessControl for RepoPerms {
    async fn can_read(&self, identity: &Identity, location: &RepositoryLocation) -> bool {
        self.check_access(identity, location, 'r').await
    }

    async fn can_write(&self, identity: &Identity, location: &RepositoryLocation) -> bool {
        if identity.is_anonymous() {
            return false;
        }
        self.check_access(identity, location, 'w').await
    }
}

// ---------------------------------------------------------------------------
// Passwords
// ---------------------------------------------------------------------------

#[derive(Default)]
struct HtpasswdState {
    loaded_at: Option<SystemTime>,
    users: HashMap<String, String>,
}

/// htpasswd-format file (`user:hash`), cached and reloaded when the
/// file mtime moves. Safe to call concurrently from all listeners.
pub struct Htpasswd {
    path: PathBuf,
    state: RwLock<HtpasswdState>,
}

impl Htpasswd {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: RwLock::new(HtpasswdState::default()),
        }
    }

    async fn load_if_changed(&self) {
        let mtime = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.modified().ok(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "htpasswd file unreadable");
                return;
            }
        };

        if self.state.read().await.loaded_at == mtime && mtime.is_some() {
            return;
        }

        let mut state = self.state.write().await;
        if state.loaded_at == mtime && mtime.is_some() {
            return;
        }

        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => {
                state.users = raw
                    .lines()
                    .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
                    .filter_map(|l| {
                        l.split_once(':')
                            .map(|(user, hash)| (user.trim().to_owned(), hash.trim().to_owned()))
                    })
                    .collect();
                state.loaded_at = mtime;
                tracing::debug!(path = %self.path.display(), users = state.users.len(), "htpasswd loaded");
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "htpasswd reload failed");
            }
        }
    }
}

#[async_trait]
impl PasswordAuth for Htpasswd {
    async fn check_password(&self, username: &str, password: &str) -> bool {
        self.load_if_changed().await;

        let hash = {
            let state = self.state.read().await;
            state.users.get(username).cloned()
        };
        hash.is_some_and(|hash| verify_password(password, &hash))
    }
}

// ---------------------------------------------------------------------------
// SSH public keys
// ---------------------------------------------------------------------------

/// SSH keys file: one `username:openssh-key-line` per line. The
/// offered wire blob is compared against each parsed key; lines that
/// fail to parse are logged and skipped.
pub struct AuthorizedKeys {
    path: PathBuf,
}

impl AuthorizedKeys {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PublicKeyAuth for AuthorizedKeys {
    async fn check_public_key(&self, username: &str, key_blob: &[u8]) -> bool {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ssh keys file unreadable");
                return false;
            }
        };

        for line in raw.lines() {
            let Some((user, key)) = line.split_once(':') else {
                continue;
            };
            if user.trim() != username {
                continue;
            }
            match ssh_key::PublicKey::from_openssh(key.trim()) {
                Ok(key) => match key.to_bytes() {
                    Ok(blob) if blob == key_blob => return true,
                    Ok(_) => {}
                    Err(e) => tracing::warn!(user = %username, error = %e, "loading key failed"),
                },
                Err(e) => tracing::warn!(user = %username, error = %e, "loading key failed"),
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn location(dir: &std::path::Path, repo: &str) -> RepositoryLocation {
        RepositoryLocation {
            fs_path: Some(dir.join(repo)),
            base_fs_path: dir.to_path_buf(),
            base_url_path: format!("/{repo}"),
            clone_urls: crate::paths::CloneUrls::default(),
        }
    }

    #[test]
    fn hash_and_verify_roundtrip() {
        let hash = hash_password("correcthorsebatterystaple").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correcthorsebatterystaple", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[tokio::test]
    async fn perms_grant_and_deny() {
        let tmp = tempfile::tempdir().unwrap();
        let perms_path = tmp.path().join("perms.toml");
        std::fs::write(
            &perms_path,
            r#"
["public.git"]
anonymous = "r"
alice = "rw"

["private.git"]
alice = "rw"
bob = "r"
"#,
        )
        .unwrap();

        let perms = RepoPerms::new(&perms_path);
        let public = location(tmp.path(), "public.git");
        let private = location(tmp.path(), "private.git");
        let alice = Identity::User("alice".into());
        let bob = Identity::User("bob".into());

        assert!(perms.can_read(&Identity::Anonymous, &public).await);
        assert!(!perms.can_read(&Identity::Anonymous, &private).await);
        assert!(!perms.can_write(&Identity::Anonymous, &public).await);

        assert!(perms.can_read(&alice, &private).await);
        assert!(perms.can_write(&alice, &private).await);
        assert!(perms.can_read(&bob, &private).await);
        assert!(!perms.can_write(&bob, &private).await);

        // unknown repo and unknown user both deny
        assert!(!perms.can_read(&alice, &location(tmp.path(), "other.git")).await);
        assert!(
            !perms
                .can_read(&Identity::User("mallory".into()), &private)
                .await
        );
    }

    #[tokio::test]
    async fn perms_deny_without_fs_path() {
        let tmp = tempfile::tempdir().unwrap();
        let perms_path = tmp.path().join("perms.toml");
        std::fs::write(&perms_path, "[\"repo.git\"]\nalice = \"rw\"\n").unwrap();

        let perms = RepoPerms::new(&perms_path);
        let missing = RepositoryLocation::not_found(tmp.path(), "/");
        assert!(
            !perms
                .can_read(&Identity::User("alice".into()), &missing)
                .await
        );
    }

    #[tokio::test]
    async fn htpasswd_checks_and_reloads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".htpasswd");
        let hash = hash_password("secret123").unwrap();
        std::fs::write(&path, format!("alice:{hash}\n")).unwrap();

        let htpasswd = Htpasswd::new(&path);
        assert!(htpasswd.check_password("alice", "secret123").await);
        assert!(!htpasswd.check_password("alice", "wrong").await);
        assert!(!htpasswd.check_password("bob", "secret123").await);

        // Rewrite with a new user and a bumped mtime; must be picked up.
        let bob_hash = hash_password("hunter2").unwrap();
        {
            let mut f = std::fs::File::create(&path).unwrap();
            writeln!(f, "bob:{bob_hash}").unwrap();
        }
        let future = SystemTime::now() + std::time::Duration::from_secs(5);
        let times = std::fs::FileTimes::new().set_modified(future);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_times(times)
            .unwrap();

        assert!(htpasswd.check_password("bob", "hunter2").await);
        assert!(!htpasswd.check_password("alice", "secret123").await);
    }

    #[tokio::test]
    async fn authorized_keys_match_on_blob() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".sshkeys");

        let alice_key = ssh_key::PublicKey::new(
            ssh_key::public::KeyData::Ed25519(ssh_key::public::Ed25519PublicKey([7u8; 32])),
            "alice@example",
        );
        let other_key = ssh_key::PublicKey::new(
            ssh_key::public::KeyData::Ed25519(ssh_key::public::Ed25519PublicKey([9u8; 32])),
            "other@example",
        );

        std::fs::write(
            &path,
            format!(
                "garbage line without separator\nalice:not a key\nalice:{}\n",
                alice_key.to_openssh().unwrap()
            ),
        )
        .unwrap();

        let keys = AuthorizedKeys::new(&path);
        let blob = alice_key.to_bytes().unwrap();
        let other_blob = other_key.to_bytes().unwrap();

        assert!(keys.check_public_key("alice", &blob).await);
        assert!(!keys.check_public_key("bob", &blob).await);
        assert!(!keys.check_public_key("alice", &other_blob).await);
    }

    #[test]
    fn stack_capabilities_follow_configuration() {
        let stack = super::stack("perms.toml".into(), None, None);
        assert!(stack.password.is_none());
        assert!(stack.public_key.is_none());

        let stack = super::stack(
            "perms.toml".into(),
            Some(".htpasswd".into()),
            Some(".sshkeys".into()),
        );
        assert!(stack.password.is_some());
        assert!(stack.public_key.is_some());
    }
}
