//! SSH server with password and public key authentication.
//!
//! ## Running
//!
//! ```bash
//! cargo run --example authenticated_server
//! ```
//!
//! Then connect with password:
//!
//! ```bash
//! ssh -p 2222 -o StrictHostKeyChecking=no admin@localhost
//! # Password: secret
//! ```
//!
//! Any ed25519 key is accepted for user `keyholder`.

use burrow::{Context, PublicKey, ServerBuilder, println};

fn check_password(ctx: &Context, password: &str) -> bool {
    let valid = match ctx.user() {
        "admin" => password == "secret",
        "guest" => password == "guest",
        _ => false,
    };
    if !valid {
        tracing::warn!(user = %ctx.user(), remote_addr = %ctx.remote_addr(), "Password rejected");
    }
    valid
}

fn check_key(ctx: &Context, key: &PublicKey) -> bool {
    ctx.user() == "keyholder" && key.key_type == "ssh-ed25519"
}

#[tokio::main]
async fn main() -> Result<(), burrow::Error> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let server = ServerBuilder::new()
        .address("127.0.0.1:2222")
        .version("SSH-2.0-BurrowAuth")
        .max_auth_attempts(3)
        .auth_rejection_delay(100)
        .password_auth(check_password)
        .public_key_auth(check_key)
        .handler(|session| async move {
            println(&session, format!("Welcome, {}!", session.user()));
            match session.public_key() {
                Some(key) => println(&session, format!("Authenticated with {} key", key.key_type)),
                None => println(&session, "Authenticated with password"),
            }
            if !session.command().is_empty() {
                println(&session, format!("You asked for: {}", session.command().join(" ")));
            }
        })
        .build()?;

    tracing::info!("Connect with: ssh -p 2222 admin@localhost (password: secret)");
    server.listen().await
}
