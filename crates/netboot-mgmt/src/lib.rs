#![warn(missing_docs)]

//! Netboot management subsystem: admin HTTP API, config loading, operator CLI

pub mod api;
pub mod cli;
pub mod config;

pub use api::AdminApi;
pub use config::MgmtConfig;
