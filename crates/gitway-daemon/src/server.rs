//! TCP accept loop.
//!
//! Each connection gets its own blocking task: the protocol core does
//! synchronous I/O, so the tokio stream is turned back into a std socket
//! and handed to the dispatcher on the blocking pool.

use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};
use crate::request::DaemonRequest;
use gitway_git::{Dispatcher, PktLine, PktLineReader, SessionOutcome};
use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// The `git://` daemon.
pub struct Daemon {
    dispatcher: Dispatcher,
    limit: Arc<Semaphore>,
    timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Creates a daemon with the limits from `config`.
    pub fn new(dispatcher: Dispatcher, config: &DaemonConfig) -> Self {
        Self {
            dispatcher,
            limit: Arc::new(Semaphore::new(config.max_connections.max(1))),
            timeout: config.session_timeout(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the accept loop and cancels running sessions.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accepts connections until shut down.
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "Daemon listening");

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let dispatcher = self.dispatcher.clone();
            let timeout = self.timeout;
            let token = self.shutdown.child_token();
            tokio::spawn(async move {
                match handle_connection(dispatcher, stream, peer, timeout, token).await {
                    Ok(_) => tracing::debug!(peer = %peer, "connection closed"),
                    Err(e) => tracing::warn!(peer = %peer, error = %e, "connection failed"),
                }
                drop(permit);
            });
        }

        tracing::info!("Daemon stopped");
        Ok(())
    }
}

/// Serves one connection, enforcing the session time limit.
async fn handle_connection(
    dispatcher: Dispatcher,
    stream: TcpStream,
    peer: SocketAddr,
    timeout: Option<Duration>,
    token: CancellationToken,
) -> Result<SessionOutcome> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    let closer = stream.try_clone()?;

    let session_token = token.clone();
    let mut task =
        tokio::task::spawn_blocking(move || serve_stream(&dispatcher, stream, session_token));

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = deadline => {
            tracing::warn!(peer = %peer, "session timed out");
            abort(&token, &closer);
            task.await
        }
        _ = token.cancelled() => {
            abort(&token, &closer);
            task.await
        }
    };
    joined.map_err(|e| DaemonError::Io(io::Error::other(e.to_string())))?
}

/// Cancels the session and unblocks any pending socket read.
fn abort(token: &CancellationToken, socket: &std::net::TcpStream) {
    token.cancel();
    if let Err(e) = socket.shutdown(Shutdown::Both) {
        tracing::debug!(error = %e, "socket already closed");
    }
}

/// Reads the request line and runs the session on the blocking pool.
fn serve_stream(
    dispatcher: &Dispatcher,
    stream: std::net::TcpStream,
    token: CancellationToken,
) -> Result<SessionOutcome> {
    let output = BufWriter::new(stream.try_clone()?);
    let mut input = BufReader::new(stream);

    let request = match PktLineReader::new(&mut input).read()? {
        Some(PktLine::Data(line)) => DaemonRequest::parse(&line)?,
        other => {
            return Err(DaemonError::InvalidRequest(format!(
                "expected request line, got {:?}",
                other
            )))
        }
    };
    tracing::info!(
        service = %request.service,
        repo = %request.path,
        host = ?request.host,
        "request"
    );

    Ok(dispatcher.serve(&request.path, request.service, input, output, token)?)
}
