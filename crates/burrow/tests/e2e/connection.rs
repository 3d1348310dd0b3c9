use super::common::{SshClient, TestServer, handler_with_message, ssh_available};
use burrow::{ServerBuilder, errorln};

fn basic_builder() -> ServerBuilder {
    ServerBuilder::new().handler(|session| async move {
        burrow::println(&session, "ok");
    })
}

#[tokio::test]
async fn test_ssh_connection() {
    if !ssh_available() {
        eprintln!("ssh not available; skipping test_ssh_connection");
        return;
    }

    let server = TestServer::start(basic_builder()).await;
    let client = SshClient::new(server.port());

    let output = client.exec("echo hello").await.expect("ssh exec");
    assert!(output.status.success(), "ssh exit status failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ok"), "unexpected output: {stdout}");

    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_connections() {
    if !ssh_available() {
        eprintln!("ssh not available; skipping test_concurrent_connections");
        return;
    }

    let server = TestServer::start(basic_builder()).await;
    let port = server.port();

    let mut handles = Vec::new();
    for idx in 0..10 {
        handles.push(tokio::spawn(async move {
            let client = SshClient::new(port);
            let output = client
                .exec(&format!("echo conn{idx}"))
                .await
                .expect("ssh exec");
            assert!(output.status.success(), "conn {idx} failed");
        }));
    }

    for handle in handles {
        handle.await.expect("join");
    }

    server.stop().await;
}

#[tokio::test]
async fn test_exit_status_and_stderr() {
    if !ssh_available() {
        eprintln!("ssh not available; skipping test_exit_status_and_stderr");
        return;
    }

    let server = TestServer::start(ServerBuilder::new().handler(|session| async move {
        let command = session.command();
        match command.first().map(String::as_str) {
            Some("fail") => {
                errorln(&session, "failing on request");
                let _ = session.exit(3);
            }
            _ => burrow::println(&session, "fine"),
        }
    }))
    .await;
    let client = SshClient::new(server.port());

    let output = client.exec("fail now").await.expect("ssh exec");
    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failing on request"), "stderr: {stderr}");
    assert!(output.stdout.is_empty());

    let output = client.exec("succeed").await.expect("ssh exec");
    assert!(output.status.success());

    server.stop().await;
}

#[tokio::test]
async fn test_stdin_is_streamed() {
    if !ssh_available() {
        eprintln!("ssh not available; skipping test_stdin_is_streamed");
        return;
    }

    let server = TestServer::start(ServerBuilder::new().handler(|session| async move {
        let mut reader = session.clone();
        let mut writer = session.clone();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    }))
    .await;
    let client = SshClient::new(server.port());

    let input = b"line one\nline two\n".repeat(512);
    let output = client
        .exec_with_input("cat", &input)
        .await
        .expect("ssh exec");
    assert!(output.status.success(), "ssh exit status failed");
    assert_eq!(output.stdout, input);

    server.stop().await;
}

#[tokio::test]
async fn test_custom_server_version() {
    if !ssh_available() {
        eprintln!("ssh not available; skipping test_custom_server_version");
        return;
    }

    let server = TestServer::start(
        ServerBuilder::new()
            .version("SSH-2.0-BurrowTest")
            .handler_arc(handler_with_message("hello")),
    )
    .await;
    let client = SshClient::new(server.port());

    let output = client.exec("anything").await.expect("ssh exec");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));

    server.stop().await;
}
