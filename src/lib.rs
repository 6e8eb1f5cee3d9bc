//! serverbox
//!
//! A reverse proxy and lifecycle orchestrator that gives ephemeral Daytona
//! sandboxes stable, authenticated URLs. Each sandbox runs a long-lived
//! `opencode` server; serverbox keeps durable metadata per instance, injects
//! upstream credentials, and transparently resumes stopped sandboxes so that
//! concurrent requests cause exactly one resume.

pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod daytona;
pub mod error;
pub mod health;
pub mod manager;
pub mod resume;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{Result, ServerboxError};
pub use manager::{InstanceManager, ListFilter, ManagerConfig};
pub use resume::ResumeCoordinator;
pub use store::{InstanceStore, SqliteInstanceStore};
pub use types::{InstanceRecord, InstanceState};
