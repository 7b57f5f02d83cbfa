#![allow(dead_code)]

use std::path::{Path, PathBuf};

/// Stand-in for the `git` binary: prints its arguments, then echoes
/// stdin. Lets wire tests observe exactly what would be spawned and
/// that bytes flow through both directions, without needing git.
pub fn fake_git(dir: &Path) -> PathBuf {
    let path = dir.join("fake-git");
    std::fs::write(&path, "#!/bin/sh\nprintf 'ARGS:%s\\n' \"$*\"\ncat\n").unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// A minimal repository layout: `<dir>/<name>` with `HEAD` and
/// `info/refs` files.
pub fn make_repo(dir: &Path, name: &str) -> PathBuf {
    let repo = dir.join(name);
    std::fs::create_dir_all(repo.join("info")).unwrap();
    std::fs::write(repo.join("HEAD"), "ref: refs/heads/main\n").unwrap();
    std::fs::write(
        repo.join("info").join("refs"),
        "0123456789abcdef0123456789abcdef01234567\trefs/heads/main\n",
    )
    .unwrap();
    repo
}

/// Permissions: `public.git` is world-readable, `private.git` is
/// alice read/write and bob read-only.
pub fn write_perms(dir: &Path) -> PathBuf {
    let path = dir.join("perms.toml");
    std::fs::write(
        &path,
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
    path
}

pub fn write_htpasswd(dir: &Path, users: &[(&str, &str)]) -> PathBuf {
    let path = dir.join(".htpasswd");
    let mut contents = String::new();
    for (user, password) in users {
        let hash = gitgate::auth::file::hash_password(password).unwrap();
        contents.push_str(&format!("{user}:{hash}\n"));
    }
    std::fs::write(&path, contents).unwrap();
    path
}

pub fn basic_auth(user: &str, password: &str) -> String {
    use base64::Engine as _;
    let encoded =
        base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
    format!("Basic {encoded}")
}
