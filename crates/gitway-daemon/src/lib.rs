//! # Gitway Daemon
//!
//! A `git://` daemon serving in-memory repositories through the Gitway
//! protocol core. Each TCP connection carries one request line naming the
//! service and repository, followed by one upload-pack or receive-pack
//! session.

pub mod config;
pub mod error;
pub mod logging;
pub mod request;
pub mod server;

pub use config::{DaemonConfig, Overrides};
pub use error::{DaemonError, Result};
pub use request::DaemonRequest;
pub use server::Daemon;
