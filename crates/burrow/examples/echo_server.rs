//! SSH echo server with TCP tunnels.
//!
//! Every session echoes its input back until the client sends EOF; sessions
//! with a terminal also report window resizes. `direct-tcpip` channels are
//! enabled, so `ssh -W` and `ssh -L` work against this server.
//!
//! ## Running
//!
//! ```bash
//! cargo run --example echo_server
//! ```
//!
//! Then connect with:
//!
//! ```bash
//! echo hello | ssh -p 2222 -o StrictHostKeyChecking=no localhost
//! ssh -p 2222 -o StrictHostKeyChecking=no -L 8080:example.com:80 localhost
//! ```

use std::time::Duration;

use burrow::{DirectTcpipHandler, ServerBuilder, Session, errorln, println};
use tokio::sync::mpsc;

async fn echo(session: Session) {
    println(&session, format!("Hello, {}!", session.user()));

    let (signals_tx, mut signals) = mpsc::channel(1);
    session.signals(signals_tx);

    let (pty, windows, _) = session.pty();
    if let (Some(pty), Some(mut windows)) = (pty, windows) {
        println(&session, format!("Terminal: {}", pty.term));
        let resizes = session.clone();
        tokio::spawn(async move {
            while let Some(window) = windows.recv().await {
                errorln(&resizes, format!("window: {}x{}", window.width, window.height));
            }
        });
    }

    let mut reader = session.clone();
    let mut writer = session.clone();
    tokio::select! {
        copied = tokio::io::copy(&mut reader, &mut writer) => {
            if let Err(e) = copied {
                tracing::warn!(error = %e, "echo failed");
            }
        }
        Some(signal) = signals.recv() => {
            errorln(&session, format!("caught {signal}"));
            let _ = session.exit(130);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), burrow::Error> {
    // Initialize tracing for logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let server = ServerBuilder::new()
        .address("127.0.0.1:2222")
        .version("SSH-2.0-BurrowExample")
        .banner("Welcome to the burrow echo server!\r\n")
        .idle_timeout(Duration::from_secs(300))
        .channel_handler("direct-tcpip", DirectTcpipHandler::new())
        .handler(echo)
        .build()?;

    tracing::info!("Connect with: ssh -p 2222 -o StrictHostKeyChecking=no localhost");
    server.listen().await
}
