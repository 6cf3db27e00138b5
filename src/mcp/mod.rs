//! SSH gateway internals.
//!
//! This module tree is organized leaves-first:
//!
//! - `config`: flag > env > default resolution and tunables
//! - `error`: error kinds and transport-loss classification
//! - `quote`: shell quoting and remote path handling
//! - `keys`: the gateway's Ed25519 identity
//! - `auth`: authentication strategies (password, key file, system key)
//! - `connection`: one SSH connection with CWD tracking and SFTP
//! - `manager`: a tenant's alias registry with per-alias serialization
//! - `pool`: the tenant registry and idle reaper
//! - `types`: serializable tool responses
//! - `tools`: the MCP tool surface

pub(crate) mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod keys;
pub mod manager;
pub mod pool;
pub(crate) mod quote;
pub mod tools;
pub mod types;

pub use pool::{Pool, Tenant};
pub use tools::GatewayTools;
