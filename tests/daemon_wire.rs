//! Wire-level tests for the git:// daemon: real TCP conversations
//! against a listener bound on an ephemeral port.

mod helpers;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use gitgate::auth::file as file_auth;
use gitgate::daemon::GitDaemon;
use gitgate::paths::{DiskResolver, PathResolver};
use gitgate::pktline;

async fn start_daemon(base: &Path, git_binary: &Path) -> SocketAddr {
    let auth = file_auth::stack(base.join("perms.toml"), None, None);
    let resolver: Arc<dyn PathResolver> = Arc::new(DiskResolver::new(
        base,
        "localhost:8080",
        "localhost",
        "localhost:5522",
    ));
    let daemon = Arc::new(GitDaemon::new(
        auth,
        resolver,
        git_binary.to_string_lossy().into_owned(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(daemon.serve(listener));
    addr
}

async fn roundtrip(addr: SocketAddr, send: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(send).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    reply
}

fn err_pkt(message: &str) -> Vec<u8> {
    pktline::encode(Some(message.as_bytes())).unwrap()
}

fn request_pkt(path: &str) -> Vec<u8> {
    pktline::encode(Some(format!("git-upload-pack {path}\0host=localhost\0").as_bytes())).unwrap()
}

#[tokio::test]
async fn anonymous_read_denied_is_a_single_err_pktline() {
    let tmp = tempfile::tempdir().unwrap();
    helpers::make_repo(tmp.path(), "private.git");
    helpers::write_perms(tmp.path());
    let fake = helpers::fake_git(tmp.path());
    let addr = start_daemon(tmp.path(), &fake).await;

    let reply = roundtrip(addr, &request_pkt("/private.git")).await;
    assert_eq!(
        reply,
        err_pkt("ERR Repository does not allow anonymous read access")
    );
}

#[tokio::test]
async fn unknown_repository() {
    let tmp = tempfile::tempdir().unwrap();
    helpers::write_perms(tmp.path());
    let fake = helpers::fake_git(tmp.path());
    let addr = start_daemon(tmp.path(), &fake).await;

    let reply = roundtrip(addr, &request_pkt("/nope.git")).await;
    assert_eq!(reply, err_pkt("ERR Repository not found"));
}

#[tokio::test]
async fn malformed_length_header() {
    let tmp = tempfile::tempdir().unwrap();
    helpers::write_perms(tmp.path());
    let fake = helpers::fake_git(tmp.path());
    let addr = start_daemon(tmp.path(), &fake).await;

    let reply = roundtrip(addr, b"zzzzgarbage").await;
    assert_eq!(reply, err_pkt("ERR Invalid packet length: zzzz"));
}

#[tokio::test]
async fn receive_pack_is_never_accepted() {
    let tmp = tempfile::tempdir().unwrap();
    helpers::make_repo(tmp.path(), "public.git");
    helpers::write_perms(tmp.path());
    let fake = helpers::fake_git(tmp.path());
    let addr = start_daemon(tmp.path(), &fake).await;

    let request =
        pktline::encode(Some(b"git-receive-pack /public.git\0host=localhost\0")).unwrap();
    let reply = roundtrip(addr, &request).await;
    assert_eq!(
        reply,
        err_pkt("ERR Request not supported. Only git-upload-pack will be accepted")
    );
}

#[tokio::test]
async fn accepted_request_spawns_upload_pack_and_splices() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = helpers::make_repo(tmp.path(), "public.git");
    helpers::write_perms(tmp.path());
    let fake = helpers::fake_git(tmp.path());
    let addr = start_daemon(tmp.path(), &fake).await;

    // request pkt-line plus raw negotiation bytes in the same write
    let mut send = request_pkt("/public.git");
    send.extend_from_slice(b"RAW-NEGOTIATION-BYTES");
    let reply = roundtrip(addr, &send).await;

    let text = String::from_utf8(reply).unwrap();
    let expected_args = format!("ARGS:upload-pack {}\n", repo.display());
    assert!(
        text.starts_with(&expected_args),
        "unexpected child args: {text:?}"
    );
    // bytes after the first pkt-line reached the child verbatim and
    // its echo came back
    assert!(text.ends_with("RAW-NEGOTIATION-BYTES"), "echo missing: {text:?}");
}
