//! SSH host key material.
//!
//! The key lives at `~/.gitgate/key.pem`; a 2048-bit RSA key is
//! generated on first run. Persisting the generated key is
//! best-effort: a read-only home directory costs key stability
//! across restarts, not startup.

use std::path::Path;

use anyhow::Context;
use russh::keys::PrivateKey;
use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::LineEnding;

pub fn load_or_generate(path: &Path) -> anyhow::Result<PrivateKey> {
    if path.exists() {
        match PrivateKey::read_openssh_file(path) {
            Ok(key) => {
                tracing::info!(path = %path.display(), algorithm = %key.algorithm(), "host key loaded");
                return Ok(key);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "host key unreadable, regenerating");
            }
        }
    }

    let keypair = RsaKeypair::random(&mut OsRng, 2048).context("failed to generate RSA host key")?;
    let key = PrivateKey::new(KeypairData::Rsa(keypair), "gitgate host key")
        .context("failed to assemble host key")?;
    tracing::info!("generated new 2048-bit RSA host key");

    if let Err(e) = persist(&key, path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to write host key");
    }
    Ok(key)
}

fn persist(key: &PrivateKey, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    key.write_openssh_file(path, LineEnding::LF)?;

    // private key material: owner-only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
