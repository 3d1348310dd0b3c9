//! End-to-end SSH integration tests for burrow.

#[path = "../common/mod.rs"]
mod common;

mod auth;
mod connection;
mod session;
