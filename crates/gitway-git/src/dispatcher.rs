//! Session dispatcher.
//!
//! Resolves a repository path against the backend and starts the session
//! for the requested service. Backend failures are mapped onto the
//! protocol error taxonomy here, so transports only deal with [`GitError`].

use crate::pktline::PktLineWriter;
use crate::receive_pack::{ReceiveOutcome, ReceivePackSession};
use crate::upload_pack::{UploadOutcome, UploadPackSession};
use crate::{GitError, Result, ServiceKind, SessionConfig};
use gitway_storage::{PackCodec, Repository, RepositoryStore, StorageError};
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A session bound to one repository and one service.
pub enum Session {
    UploadPack(UploadPackSession),
    ReceivePack(ReceivePackSession),
}

/// Result of a finished session.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    UploadPack(UploadOutcome),
    ReceivePack(ReceiveOutcome),
}

impl Session {
    /// Service this session speaks.
    pub fn service(&self) -> ServiceKind {
        match self {
            Self::UploadPack(_) => ServiceKind::UploadPack,
            Self::ReceivePack(_) => ServiceKind::ReceivePack,
        }
    }

    /// Aborts the session when `token` fires.
    pub fn with_cancellation(self, token: CancellationToken) -> Self {
        match self {
            Self::UploadPack(s) => Self::UploadPack(s.with_cancellation(token)),
            Self::ReceivePack(s) => Self::ReceivePack(s.with_cancellation(token)),
        }
    }

    /// Writes only the ref advertisement (smart-HTTP `info/refs`).
    pub fn advertise<W: Write>(&self, output: W) -> Result<()> {
        match self {
            Self::UploadPack(s) => s.advertise(output).map(|_| ()),
            Self::ReceivePack(s) => s.advertise(output).map(|_| ()),
        }
    }

    /// Runs the session over a duplex stream.
    pub fn run<R: BufRead, W: Write>(&self, input: R, output: W) -> Result<SessionOutcome> {
        match self {
            Self::UploadPack(s) => s.run(input, output).map(SessionOutcome::UploadPack),
            Self::ReceivePack(s) => s.run(input, output).map(SessionOutcome::ReceivePack),
        }
    }
}

/// Maps a resolve failure onto the session error taxonomy.
fn resolve_error(path: &str, err: StorageError) -> GitError {
    match err {
        StorageError::RepositoryNotFound(_) | StorageError::InvalidPath(_) => {
            GitError::NotFound(path.to_string())
        }
        StorageError::Locked(name) => GitError::Backend(format!("repository {} is locked", name)),
        other => other.into(),
    }
}

/// Hands out sessions for repositories of one backend.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn RepositoryStore>,
    codec: Arc<dyn PackCodec>,
    config: SessionConfig,
}

impl Dispatcher {
    /// Creates a dispatcher over a repository store and pack codec.
    pub fn new(store: Arc<dyn RepositoryStore>, codec: Arc<dyn PackCodec>, config: SessionConfig) -> Self {
        Self {
            store,
            codec,
            config,
        }
    }

    /// Knobs handed to every session.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Resolves `path` to a repository handle.
    pub fn resolve(&self, path: &str) -> Result<Arc<dyn Repository>> {
        self.store.resolve(path).map_err(|e| resolve_error(path, e))
    }

    /// Opens a session for `service` on the repository at `path`.
    pub fn open(&self, path: &str, service: ServiceKind) -> Result<Session> {
        let repo = self.resolve(path)?;
        let codec = self.codec.clone();
        let config = self.config.clone();
        Ok(match service {
            ServiceKind::UploadPack => Session::UploadPack(UploadPackSession::new(repo, codec, config)),
            ServiceKind::ReceivePack => {
                Session::ReceivePack(ReceivePackSession::new(repo, codec, config))
            }
        })
    }

    /// Opens and runs a session, answering `ERR` when the repository is missing.
    pub fn serve<R: BufRead, W: Write>(
        &self,
        path: &str,
        service: ServiceKind,
        input: R,
        mut output: W,
        cancel: CancellationToken,
    ) -> Result<SessionOutcome> {
        let span = tracing::info_span!("session", service = %service, repo = %path);
        let _guard = span.enter();

        let session = match self.open(path, service) {
            Ok(session) => session.with_cancellation(cancel),
            Err(err) => {
                tracing::warn!(error = %err, "cannot open session");
                if let GitError::NotFound(_) = err {
                    let mut writer = PktLineWriter::new(&mut output);
                    writer.write_error("repository not found")?;
                    writer.flush()?;
                }
                return Err(err);
            }
        };

        tracing::debug!("session opened");
        let outcome = session.run(input, output);
        if let Err(ref e) = outcome {
            tracing::error!(error = %e, kind = ?e.kind(), "session failed");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktline::{PktLine, PktLineReader};
    use crate::ErrorKind;
    use gitway_storage::{BasicPackCodec, GitObject, MemoryStore};
    use std::io::Cursor;

    fn dispatcher(store: Arc<MemoryStore>) -> Dispatcher {
        Dispatcher::new(store, Arc::new(BasicPackCodec), SessionConfig::default())
    }

    #[test]
    fn test_open_selects_service() {
        let store = Arc::new(MemoryStore::new());
        store.create("alice/project").unwrap();
        let d = dispatcher(store);

        let session = d.open("alice/project", ServiceKind::UploadPack).unwrap();
        assert_eq!(session.service(), ServiceKind::UploadPack);
        let session = d.open("/alice/project/", ServiceKind::ReceivePack);
        assert!(session.is_ok());
    }

    #[test]
    fn test_missing_repository() {
        let d = dispatcher(Arc::new(MemoryStore::new()));
        let err = d.open("nobody/here", ServiceKind::UploadPack).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = d.open("../escape", ServiceKind::UploadPack).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_locked_repository_is_backend_error() {
        let store = Arc::new(MemoryStore::new());
        store.create("r").unwrap();
        store.set_locked("r", true).unwrap();
        let d = dispatcher(store);
        let err = d.open("r", ServiceKind::ReceivePack).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert!(err.to_string().contains("locked"));
    }

    #[test]
    fn test_serve_not_found_writes_err() {
        let d = dispatcher(Arc::new(MemoryStore::new()));
        let mut out = Vec::new();
        let err = d
            .serve(
                "missing",
                ServiceKind::UploadPack,
                Cursor::new(Vec::<u8>::new()),
                &mut out,
                CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, GitError::NotFound(_)));
        let pkt = PktLineReader::new(Cursor::new(out)).read().unwrap();
        assert_eq!(pkt, Some(PktLine::from_string("ERR repository not found\n")));
    }

    #[test]
    fn test_serve_runs_session() {
        let store = Arc::new(MemoryStore::new());
        let repo = store.create("r").unwrap();
        let blob = repo.write_object(GitObject::blob(b"x".to_vec())).unwrap();
        repo.refs.set("refs/heads/main", blob);
        let d = dispatcher(store);

        let mut out = Vec::new();
        let outcome = d
            .serve(
                "r",
                ServiceKind::UploadPack,
                Cursor::new(b"0000".to_vec()),
                &mut out,
                CancellationToken::new(),
            )
            .unwrap();
        match outcome {
            SessionOutcome::UploadPack(o) => assert!(o.objects_sent.is_none()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(String::from_utf8_lossy(&out).contains("refs/heads/main"));
    }

    #[test]
    fn test_advertise_only() {
        let store = Arc::new(MemoryStore::new());
        store.create("r").unwrap();
        let d = dispatcher(store);
        let mut out = Vec::new();
        d.open("r", ServiceKind::ReceivePack)
            .unwrap()
            .advertise(&mut out)
            .unwrap();
        let first = PktLineReader::new(Cursor::new(out)).read().unwrap().unwrap();
        assert_eq!(first.as_str(), Some("# service=git-receive-pack"));
    }
}
