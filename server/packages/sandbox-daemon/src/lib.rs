//! Sandbox control daemon: supervises one coding agent and exposes it over HTTP.

pub mod auth;
pub mod checkpoint;
pub mod config;
pub mod cors;
pub mod credentials;
pub mod event_log;
pub mod events;
pub mod git;
pub mod logging;
pub mod provider;
pub mod router;
pub mod transport;
pub mod workspace;

pub use router::{build_router, ApiDoc, AppState};
