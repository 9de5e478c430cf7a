//! Service selection.

use crate::{GitError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two smart-protocol services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    /// Fetch and clone.
    UploadPack,
    /// Push.
    ReceivePack,
}

impl ServiceKind {
    /// Returns the wire name of the service.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }
}

impl FromStr for ServiceKind {
    type Err = GitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.strip_prefix("git-").unwrap_or(s) {
            "upload-pack" => Ok(Self::UploadPack),
            "receive-pack" => Ok(Self::ReceivePack),
            _ => Err(GitError::Protocol(format!("unknown service: {}", s))),
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
