//! librarian-rs: A library management service with catalog, lending and accounts.
//!
//! This crate provides an HTTP service for running a small library: a
//! book catalog, reader registration and login, and a borrowing
//! workflow with due dates, renewals and ratings, backed by SQLite.
//!
//! # Features
//!
//! - Book catalog with search and category browsing
//! - Reader accounts with Argon2 password hashing
//! - Login throttling with temporary account lockout
//! - Borrow, return, renew and rate workflow with inventory tracking
//! - Reader feedback with admin replies
//! - Usage statistics for administrators

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Authentication and user management.
pub mod auth;
/// Configuration and CLI.
pub mod config;
/// Database operations.
pub mod db;
/// Error types.
pub mod error;
/// HTTP server.
pub mod server;

#[cfg(test)]
mod tests;

pub use config::{Cli, Command, Config};
pub use db::Database;
pub use error::{AppError, Result};
pub use server::AppState;
