use tokio::io::AsyncWriteExt;

use super::common::{DEFAULT_TIMEOUT, SshClient, TestServer, read_until_contains, ssh_available};
use burrow::ServerBuilder;

#[tokio::test]
async fn test_pty_allocation_and_io() {
    if !ssh_available() {
        eprintln!("ssh not available; skipping test_pty_allocation_and_io");
        return;
    }

    let server = TestServer::start(ServerBuilder::new().handler(|session| async move {
        let (pty, _windows, active) = session.pty();
        if active {
            burrow::println(&session, "PTY: yes");
        } else {
            burrow::println(&session, "PTY: no");
        }
        if let Some(pty) = pty {
            burrow::println(&session, format!("TERM: {}", pty.term));
        }

        if let Some(data) = session.recv().await {
            let _ = session.write(&data);
        }
    }))
    .await;

    let client = SshClient::new(server.port());
    let mut child = client.spawn_interactive().expect("ssh spawn");

    let mut stdout = child.stdout.take().expect("stdout");
    let mut stdin = child.stdin.take().expect("stdin");

    let _ = read_until_contains(&mut stdout, "PTY: yes", DEFAULT_TIMEOUT)
        .await
        .expect("pty output");

    stdin.write_all(b"ping\n").await.expect("write input");
    stdin.flush().await.expect("flush");

    let _ = read_until_contains(&mut stdout, "ping", DEFAULT_TIMEOUT)
        .await
        .expect("echo output");

    let status = tokio::time::timeout(DEFAULT_TIMEOUT, child.wait())
        .await
        .expect("wait timeout")
        .expect("wait failed");
    assert!(status.success(), "ssh exit status failed");

    server.stop().await;
}

#[tokio::test]
async fn test_exec_without_pty() {
    if !ssh_available() {
        eprintln!("ssh not available; skipping test_exec_without_pty");
        return;
    }

    let server = TestServer::start(ServerBuilder::new().handler(|session| async move {
        let (_, _, active) = session.pty();
        burrow::print(
            &session,
            format!("pty={active} command={}", session.command().join(",")),
        );
    }))
    .await;
    let client = SshClient::new(server.port());

    let output = client.exec("ls -l /srv").await.expect("ssh exec");
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "pty=false command=ls,-l,/srv"
    );

    server.stop().await;
}

#[tokio::test]
async fn test_subsystem_request() {
    if !ssh_available() {
        eprintln!("ssh not available; skipping test_subsystem_request");
        return;
    }

    let server = TestServer::start(
        ServerBuilder::new()
            .handler(|session| async move {
                burrow::print(&session, "shell");
            })
            .subsystem("greeter", |session| async move {
                let name = session.subsystem().unwrap_or_default();
                burrow::print(&session, format!("subsystem {name}"));
            }),
    )
    .await;
    let client = SshClient::new(server.port());

    let output = client
        .exec_with_options("greeter", &["BatchMode=yes", "SessionType=subsystem"])
        .await
        .expect("ssh subsystem");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "subsystem greeter");

    let output = client
        .exec_with_options("sftp", &["BatchMode=yes", "SessionType=subsystem"])
        .await
        .expect("ssh subsystem");
    assert!(!output.status.success(), "unknown subsystem accepted");

    server.stop().await;
}
