//! # trackspace-server
//!
//! WebSocket chat hub for track-space.
//!
//! - [`server::ChatServer`]: axum router, `/health`, WebSocket upgrade
//! - [`hub`]: registry, dispatcher and the per-connection tasks
//! - [`config`] / [`loader`]: `ServerConfig` and its layered loading
//! - [`identity`]: upstream identity resolution for upgrade requests
//! - [`shutdown`]: cancellation and task draining

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod hub;
pub mod identity;
pub mod loader;
pub mod server;
pub mod shutdown;

pub use config::ServerConfig;
pub use errors::ConfigError;
pub use hub::{HubHandle, HubSettings};
pub use identity::{Anonymous, HeaderIdentity, IdentityResolver};
pub use loader::load_config;
pub use server::{ChatServer, ShutdownReport};
pub use shutdown::ShutdownCoordinator;
