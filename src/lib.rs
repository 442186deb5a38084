//! Learning Sync Server Library
//!
//! Versioned change-log synchronization of per-user learning data across
//! devices. The server binary is in main.rs.
//!
//! # Modules
//!
//! - `sync`: The engine (version store, change log, coordinator, reconciler)
//! - `db`: SQLite backend for the engine
//! - `routes`: HTTP surface

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod sync;
