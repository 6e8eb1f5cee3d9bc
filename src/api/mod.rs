//! HTTP surface: listener, admin API, and the instance proxy.

pub mod middleware;
pub mod proxy;
pub mod routes;
pub mod server;
pub mod types;

pub use server::{build_router, serve, AppState};
