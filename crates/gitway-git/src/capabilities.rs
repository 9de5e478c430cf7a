//! Capability lists.
//!
//! Capabilities travel as space-separated `<name>[=<value>]` tokens: after a
//! NUL on the first advertised ref line, and after the first `want` or the
//! first receive-pack command on the client side.

use crate::{GitError, Result, ServiceKind, SessionConfig};
use gitway_storage::HashAlgorithm;
use std::fmt;

pub const MULTI_ACK: &str = "multi_ack";
pub const MULTI_ACK_DETAILED: &str = "multi_ack_detailed";
pub const NO_DONE: &str = "no-done";
pub const THIN_PACK: &str = "thin-pack";
pub const NO_THIN: &str = "no-thin";
pub const SIDE_BAND: &str = "side-band";
pub const SIDE_BAND_64K: &str = "side-band-64k";
pub const OFS_DELTA: &str = "ofs-delta";
pub const NO_PROGRESS: &str = "no-progress";
pub const ALLOW_REACHABLE_SHA1_IN_WANT: &str = "allow-reachable-sha1-in-want";
pub const REPORT_STATUS: &str = "report-status";
pub const DELETE_REFS: &str = "delete-refs";
pub const QUIET: &str = "quiet";
pub const ATOMIC: &str = "atomic";
pub const PUSH_OPTIONS: &str = "push-options";
pub const OBJECT_FORMAT: &str = "object-format";
pub const SYMREF: &str = "symref";
pub const AGENT: &str = "agent";

/// A single capability token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Capability {
    name: String,
    value: Option<String>,
}

impl Capability {
    /// Creates a bare capability.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    /// Creates a `name=value` capability.
    pub fn with_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Parses one token.
    pub fn parse(token: &str) -> Self {
        match token.split_once('=') {
            Some((name, value)) => Self::with_value(name, value),
            None => Self::new(token),
        }
    }

    /// Capability name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value after `=`, if any.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.name, value),
            None => f.write_str(&self.name),
        }
    }
}

/// An ordered capability set, unique by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    entries: Vec<Capability>,
}

impl Capabilities {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a space-separated token list. Later duplicates are dropped.
    pub fn parse(line: &str) -> Self {
        let mut caps = Self::new();
        for token in line.split_whitespace() {
            let cap = Capability::parse(token);
            if !caps.contains(cap.name()) {
                caps.entries.push(cap);
            }
        }
        caps
    }

    /// Adds a capability, replacing any entry with the same name in place.
    pub fn insert(&mut self, cap: Capability) {
        match self.entries.iter_mut().find(|c| c.name == cap.name) {
            Some(existing) => *existing = cap,
            None => self.entries.push(cap),
        }
    }

    /// Removes a capability by name.
    pub fn remove(&mut self, name: &str) -> Option<Capability> {
        let pos = self.entries.iter().position(|c| c.name == name)?;
        Some(self.entries.remove(pos))
    }

    /// True if a capability with this name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|c| c.name == name)
    }

    /// Returns the capability's value, if present with one.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.value())
    }

    /// Capabilities in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.entries.iter()
    }

    /// Number of capabilities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are none.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Intersects the client's request with what this (server) set offers.
    ///
    /// Unknown client capabilities are dropped. The client's value is kept
    /// for `agent`; an `object-format` that differs from the server's has no
    /// negotiation path and fails.
    pub fn negotiate(&self, requested: &Capabilities) -> Result<Capabilities> {
        let mut effective = Capabilities::new();
        for cap in requested.iter() {
            if !self.contains(cap.name()) {
                tracing::debug!(capability = %cap, "ignoring unsupported capability");
                continue;
            }
            if cap.name() == OBJECT_FORMAT && cap.value() != self.value(OBJECT_FORMAT) {
                return Err(GitError::Capability(format!(
                    "client requested {}, repository uses {}",
                    cap,
                    self.value(OBJECT_FORMAT).unwrap_or("sha1")
                )));
            }
            effective.insert(cap.clone());
        }
        Ok(effective)
    }

    /// Capabilities the server offers for `service`.
    pub fn for_service(
        service: ServiceKind,
        config: &SessionConfig,
        algorithm: HashAlgorithm,
    ) -> Self {
        let mut caps = Self::new();
        let mut add = |name: &str| caps.insert(Capability::new(name));
        match service {
            ServiceKind::UploadPack => {
                add(MULTI_ACK);
                add(MULTI_ACK_DETAILED);
                add(NO_DONE);
                if config.allow_thin_pack {
                    add(THIN_PACK);
                }
                add(SIDE_BAND);
                add(SIDE_BAND_64K);
                add(OFS_DELTA);
                add(NO_PROGRESS);
                if config.allow_reachable_sha1_in_want {
                    add(ALLOW_REACHABLE_SHA1_IN_WANT);
                }
            }
            ServiceKind::ReceivePack => {
                add(REPORT_STATUS);
                if config.allow_deletes {
                    add(DELETE_REFS);
                }
                add(QUIET);
                if config.allow_atomic {
                    add(ATOMIC);
                }
                if config.allow_push_options {
                    add(PUSH_OPTIONS);
                }
                add(OFS_DELTA);
                add(SIDE_BAND_64K);
            }
        }
        if !config.allow_thin_pack {
            caps.insert(Capability::new(NO_THIN));
        }
        caps.insert(Capability::with_value(OBJECT_FORMAT, algorithm.as_str()));
        caps.insert(Capability::with_value(AGENT, config.agent.clone()));
        caps
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cap) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", cap)?;
        }
        Ok(())
    }
}
