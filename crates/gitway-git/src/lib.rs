//! Git smart protocol core for Gitway.
//!
//! This crate speaks the server side of the git smart protocol (v0/v1):
//! pkt-line framing, capability negotiation, ref advertisement, and the
//! upload-pack and receive-pack sessions. Storage is reached only through
//! the traits of `gitway-storage`, and transports hand each session a
//! duplex byte stream already scoped to one repository and service.
//!
//! ```rust,no_run
//! use gitway_git::{Dispatcher, ServiceKind, SessionConfig};
//! use gitway_storage::{BasicPackCodec, MemoryStore};
//! use std::io::{BufReader, Cursor};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let store = Arc::new(MemoryStore::new());
//! store.create("alice/project").unwrap();
//! let dispatcher = Dispatcher::new(store, Arc::new(BasicPackCodec), SessionConfig::default());
//!
//! let input = BufReader::new(Cursor::new(b"0000".to_vec()));
//! let mut output = Vec::new();
//! dispatcher
//!     .serve("alice/project", ServiceKind::UploadPack, input, &mut output, CancellationToken::new())
//!     .unwrap();
//! ```

pub mod advertise;
mod cancel;
pub mod capabilities;
pub mod closure;
mod config;
mod dispatcher;
mod error;
pub mod pktline;
pub mod receive_pack;
mod service;
pub mod sideband;
pub mod upload_pack;

pub use advertise::{advertise, Advertisement, RefAdvertisement};
pub use capabilities::{Capabilities, Capability};
pub use config::{SessionConfig, DEFAULT_AGENT};
pub use dispatcher::{Dispatcher, Session, SessionOutcome};
pub use error::{CommandError, ErrorKind, GitError};
pub use pktline::{PktLine, PktLineReader, PktLineWriter};
pub use receive_pack::{ReceiveOutcome, ReceivePackSession, RefUpdateCommand, ReportStatus};
pub use service::ServiceKind;
pub use sideband::{Band, SidebandMode};
pub use upload_pack::{UploadOutcome, UploadPackSession};

/// Result type for git protocol operations.
pub type Result<T> = std::result::Result<T, GitError>;
