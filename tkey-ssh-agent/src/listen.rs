//! Serving the agent on one or more listening sockets.
//!
//! Every [`Endpoint`] gets its own accept task.  The tasks feed one channel
//! that [`ssh_agent_lib::agent::listen`] drains through [`Incoming`]; that
//! loop spawns a task per connection, so a confirmation pending on one
//! connection never holds up another.  An endpoint whose accept fails for
//! good reports [`Accepted::Closed`] and stops; the others keep going.
//!
//! Each connection is watched on a duplicate of its descriptor.  When the
//! client hangs up, the connection's cancellation token fires and any
//! confirmation it was waiting for is abandoned.

use std::io;
use std::os::fd::{AsFd as _, RawFd};
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ssh_agent_lib::agent::{Agent, ListeningSocket, Session, listen};
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{Request, Response};
use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::error::ListenError;
use crate::keyring::IdentityKeyring;
use crate::proxy::ProxyKeyring;

/// Pause after running out of descriptors or buffers before accepting again.
const RESOURCE_BACKOFF: Duration = Duration::from_millis(100);

/// Connections queued between the accept tasks and the dispatch loop.
const QUEUE_DEPTH: usize = 32;

/// A listening socket, bound here or inherited from a supervisor.
#[derive(Debug)]
pub struct Endpoint {
    name: String,
    path: Option<PathBuf>,
    listener: UnixListener,
}

impl Endpoint {
    /// Bind a fresh socket at `path`, replacing a stale one, readable and
    /// writable by the owner only.
    pub fn bind(path: &Path) -> Result<Self, ListenError> {
        let io_err = |source| ListenError::Io {
            endpoint: path.display().to_string(),
            source,
        };

        if path.exists()
            && let Err(e) = std::fs::remove_file(path)
        {
            warn!(path = %path.display(), "failed to remove stale agent socket: {e}");
        }

        let listener = UnixListener::bind(path).map_err(io_err)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(io_err)?;

        info!(path = %path.display(), "listening");
        Ok(Self {
            name: path.display().to_string(),
            path: Some(path.to_path_buf()),
            listener,
        })
    }

    /// Wrap a descriptor handed over by a supervisor.
    pub fn inherited(listener: UnixListener, fd: RawFd) -> Self {
        info!(fd, "listening on inherited socket");
        Self {
            name: format!("fd {fd}"),
            path: None,
            listener,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem path, for sockets bound by this process.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// What an accept task reports.
#[derive(Debug)]
pub enum Accepted {
    Stream(UnixStream),
    /// The endpoint failed permanently and will send nothing more.
    Closed { endpoint: String, error: io::Error },
}

/// All endpoints' connections, in arrival order.
pub struct Incoming {
    rx: mpsc::Receiver<Accepted>,
}

impl std::fmt::Debug for Incoming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Incoming").finish_non_exhaustive()
    }
}

impl Incoming {
    fn new(rx: mpsc::Receiver<Accepted>) -> Self {
        Self { rx }
    }
}

#[ssh_agent_lib::async_trait]
impl ListeningSocket for Incoming {
    type Stream = UnixStream;

    /// Fails only once every endpoint has stopped.
    async fn accept(&mut self) -> io::Result<Self::Stream> {
        loop {
            match self.rx.recv().await {
                Some(Accepted::Stream(stream)) => return Ok(stream),
                Some(Accepted::Closed { endpoint, error }) => {
                    warn!(endpoint, %error, "listener closed");
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "no listening sockets left",
                    ));
                }
            }
        }
    }
}

/// Errors after which the same listener can keep accepting.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || is_resource_exhaustion(err)
}

fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

async fn accept_loop(endpoint: Endpoint, tx: mpsc::Sender<Accepted>, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(endpoint = %endpoint.name, "accept loop cancelled");
                return;
            }
            accepted = endpoint.listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, _)) => {
                if tx.send(Accepted::Stream(stream)).await.is_err() {
                    return;
                }
            }
            Err(e) if is_transient(&e) => {
                debug!(endpoint = %endpoint.name, error = %e, "transient accept error");
                if is_resource_exhaustion(&e) {
                    tokio::time::sleep(RESOURCE_BACKOFF).await;
                }
            }
            Err(error) => {
                let _ = tx
                    .send(Accepted::Closed {
                        endpoint: endpoint.name.clone(),
                        error,
                    })
                    .await;
                return;
            }
        }
    }
}

/// A keyring that can hand out a per-connection session.
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Session;

    /// A session on the shared keyring whose pending signatures are
    /// abandoned once `cancel` fires.
    fn session(&self, cancel: CancellationToken) -> Self::Session;
}

impl SessionFactory for IdentityKeyring {
    type Session = IdentityKeyring;

    fn session(&self, cancel: CancellationToken) -> Self::Session {
        self.with_cancellation(cancel)
    }
}

impl SessionFactory for ProxyKeyring {
    type Session = ProxyKeyring;

    fn session(&self, cancel: CancellationToken) -> Self::Session {
        self.with_cancellation(cancel)
    }
}

/// A second handle on a connected socket, used only to notice hangups.
fn duplicate(socket: &UnixStream) -> io::Result<UnixStream> {
    let fd = socket.as_fd().try_clone_to_owned()?;
    let std = std::os::unix::net::UnixStream::from(fd);
    std.set_nonblocking(true)?;
    UnixStream::from_std(std)
}

/// Cancel `conn` once the peer closes its end.  Returns when the session
/// ends (`done`) or the connection is cancelled some other way.
async fn watch_hangup(peer: UnixStream, conn: CancellationToken, done: CancellationToken) {
    loop {
        let ready = tokio::select! {
            _ = done.cancelled() => return,
            _ = conn.cancelled() => return,
            ready = peer.ready(Interest::READABLE) => ready,
        };
        match ready {
            Ok(ready) if ready.is_read_closed() => {
                debug!("client hung up, abandoning pending requests");
                conn.cancel();
                return;
            }
            // Request bytes belong to the session; only clear our readiness.
            Ok(_) => {
                let _ = peer.try_io(Interest::READABLE, || {
                    Err::<(), _>(io::ErrorKind::WouldBlock.into())
                });
            }
            Err(e) => {
                debug!(error = %e, "hangup watch failed");
                return;
            }
        }
    }
}

/// One client connection.  Dropping it stops the hangup watch, which
/// releases the duplicated descriptor.
struct Connection<S> {
    session: S,
    _watch: Option<DropGuard>,
}

#[ssh_agent_lib::async_trait]
impl<S: Session> Session for Connection<S> {
    async fn handle(&mut self, message: Request) -> Result<Response, AgentError> {
        self.session.handle(message).await
    }
}

struct Dispatch<F> {
    factory: F,
    cancel: CancellationToken,
}

impl<F: SessionFactory> Agent<Incoming> for Dispatch<F> {
    fn new_session(&mut self, socket: &UnixStream) -> impl Session {
        let conn = self.cancel.child_token();
        let watch = match duplicate(socket) {
            Ok(peer) => {
                let done = CancellationToken::new();
                tokio::spawn(watch_hangup(peer, conn.clone(), done.clone()));
                Some(done.drop_guard())
            }
            Err(e) => {
                warn!(error = %e, "cannot watch connection for hangup");
                None
            }
        };
        Connection {
            session: self.factory.session(conn),
            _watch: watch,
        }
    }
}

/// Serve `factory` on every endpoint until `cancel` fires or all endpoints
/// have failed.
///
/// Cancelling stops the accept loops and aborts signatures still waiting
/// for confirmation.
pub async fn serve<F: SessionFactory>(
    endpoints: Vec<Endpoint>,
    factory: F,
    cancel: CancellationToken,
) -> Result<(), AgentError> {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    for endpoint in endpoints {
        tokio::spawn(accept_loop(endpoint, tx.clone(), cancel.clone()));
    }
    drop(tx);

    listen(Incoming::new(rx), Dispatch { factory, cancel }).await
}
