//! postdrop library entrypoint.
//!
//! Modules:
//! - `app`: configuration, shared state, server startup
//! - `cli`: command-line entrypoint and inbox management
//! - `db`: SQLite pool and migrations
//! - `http`: Axum router and handlers
//! - `models`: typed records used across layers
//! - `secrets`: credential hashing and verification
//! - `smtp`: SMTP protocol engine
//! - `store`: storage interface over the data model

pub mod app;
pub mod cli;
pub mod db;
pub mod http;
pub mod models;
pub mod secrets;
pub mod smtp;
pub mod store;
