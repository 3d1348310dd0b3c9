use std::io;
use std::path::{Path, PathBuf};

use super::common::{
    SshClient, TEST_USER, TestServer, handler_with_message, ssh_available, ssh_keygen_available,
};
use burrow::{PublicKey, ServerBuilder};
use russh_keys::PublicKeyBase64;

#[tokio::test]
async fn test_password_auth() {
    if !ssh_available() {
        eprintln!("ssh not available; skipping test_password_auth");
        return;
    }

    let server = TestServer::start(
        ServerBuilder::new()
            .password_auth(|ctx, password| ctx.user() == TEST_USER && password == "secret")
            .handler_arc(handler_with_message("password ok")),
    )
    .await;

    let client = SshClient::new(server.port());

    let output = client
        .exec_with_options(
            "echo should-fail",
            &["BatchMode=yes", "PreferredAuthentications=password,none"],
        )
        .await
        .expect("ssh exec");
    assert!(!output.status.success(), "ssh should fail without password");

    let output = client
        .exec_with_password("echo wrong", "not-the-password")
        .await
        .expect("ssh exec with wrong password");
    assert!(!output.status.success(), "wrong password accepted");

    let output = client
        .exec_with_password("echo ok", "secret")
        .await
        .expect("ssh exec with password");
    assert!(output.status.success(), "ssh password auth failed");
    assert!(String::from_utf8_lossy(&output.stdout).contains("password ok"));

    server.stop().await;
}

#[tokio::test]
async fn test_public_key_auth() {
    if !ssh_available() {
        eprintln!("ssh not available; skipping test_public_key_auth");
        return;
    }

    if !ssh_keygen_available() {
        eprintln!("ssh-keygen not available; skipping test_public_key_auth");
        return;
    }

    let temp_dir = tempfile::tempdir().expect("tempdir");
    let key_path = generate_test_keypair(temp_dir.path(), "id_ed25519").expect("generate keypair");
    let other_path = generate_test_keypair(temp_dir.path(), "id_other").expect("generate keypair");
    let authorized = read_public_key(&key_path.with_extension("pub")).expect("read public key");

    let server = TestServer::start(
        ServerBuilder::new()
            .public_key_auth(move |_ctx, key| *key == authorized)
            .handler(|session| async move {
                let key_type = session
                    .public_key()
                    .map(|key| key.key_type.clone())
                    .unwrap_or_default();
                burrow::println(&session, format!("pubkey ok {key_type}"));
            }),
    )
    .await;

    let options = [
        "BatchMode=yes",
        "PreferredAuthentications=publickey",
        "PubkeyAuthentication=yes",
    ];

    let client = SshClient::new(server.port()).with_identity_file(key_path);
    let output = client
        .exec_with_options("echo ok", &options)
        .await
        .expect("ssh exec with pubkey");
    assert!(output.status.success(), "ssh pubkey auth failed");
    assert!(String::from_utf8_lossy(&output.stdout).contains("pubkey ok ssh-ed25519"));

    let client = SshClient::new(server.port()).with_identity_file(other_path);
    let output = client
        .exec_with_options("echo ok", &options)
        .await
        .expect("ssh exec with other key");
    assert!(!output.status.success(), "unknown key accepted");

    server.stop().await;
}

fn generate_test_keypair(dir: &Path, name: &str) -> io::Result<PathBuf> {
    let key_path = dir.join(name);
    let status = std::process::Command::new("ssh-keygen")
        .arg("-q")
        .arg("-t")
        .arg("ed25519")
        .arg("-N")
        .arg("")
        .arg("-f")
        .arg(&key_path)
        .arg("-C")
        .arg("burrow-test")
        .status()?;

    if !status.success() {
        return Err(io::Error::other("ssh-keygen failed"));
    }

    Ok(key_path)
}

/// Parses an OpenSSH `.pub` file into the form the auth callback sees.
fn read_public_key(path: &Path) -> io::Result<PublicKey> {
    let line = std::fs::read_to_string(path)?;
    let mut fields = line.split_whitespace();
    let (Some(key_type), Some(encoded)) = (fields.next(), fields.next()) else {
        return Err(io::Error::other("malformed public key file"));
    };
    let key = russh_keys::parse_public_key_base64(encoded).map_err(io::Error::other)?;
    Ok(PublicKey::new(key_type, key.public_key_bytes()))
}
