//! A single relay connection: one socket to the broker's tunnel
//! endpoint, one socket to the local service, and a pump task per
//! direction copying bytes until either side closes.

use std::fmt;
use std::io;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::dial;
use crate::error::TunnelError;

/// Which side of the relay a connect failure happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Remote,
    Local,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Remote => write!(f, "remote"),
            Endpoint::Local => write!(f, "local"),
        }
    }
}

/// Terminal state of one relay connection.
#[derive(Debug)]
pub enum RelayOutcome {
    /// Dialing one of the two endpoints failed; no bytes were relayed.
    ConnectFailed {
        endpoint: Endpoint,
        error: TunnelError,
    },
    /// A pump direction terminated. `None` is a clean peer close.
    Finished(Option<io::Error>),
    /// Torn down before any pump could report.
    Stopped,
}

/// One duplex pipe between the broker's tunnel endpoint and the local
/// service. Created by the session at pool-fill time; `run` is invoked
/// exactly once per instance.
pub struct RelayConnection {
    remote_host: String,
    remote_port: u16,
    local_port: u16,
    shutdown: CancellationToken,
}

impl RelayConnection {
    pub fn new(
        remote_host: String,
        remote_port: u16,
        local_port: u16,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            remote_host,
            remote_port,
            local_port,
            shutdown,
        }
    }

    /// Dial both endpoints, then pump bytes in both directions until one
    /// direction terminates. Remote is always dialed first; a failed
    /// remote dial never opens a local socket.
    pub async fn run(&self) -> RelayOutcome {
        let remote = match dial::dial_remote(&self.remote_host, self.remote_port).await {
            Ok(stream) => stream,
            Err(error) => {
                debug!(
                    "connect remote {}:{} failed: {}",
                    self.remote_host, self.remote_port, error
                );
                return RelayOutcome::ConnectFailed {
                    endpoint: Endpoint::Remote,
                    error,
                };
            }
        };
        debug!(
            "connect remote {}:{} successful",
            self.remote_host, self.remote_port
        );

        let local = match TcpStream::connect(("localhost", self.local_port)).await {
            Ok(stream) => stream,
            Err(error) => {
                // Release the broker-side slot before giving up.
                drop(remote);
                debug!("connect local :{} failed: {}", self.local_port, error);
                return RelayOutcome::ConnectFailed {
                    endpoint: Endpoint::Local,
                    error: error.into(),
                };
            }
        };
        debug!("connect local :{} successful", self.local_port);

        let (remote_read, remote_write) = remote.into_split();
        let (local_read, local_write) = local.into_split();

        // Fresh completion channel per run; a pump never blocks on it.
        let (done_tx, mut done_rx) = mpsc::channel::<Option<io::Error>>(2);

        tokio::spawn(pump(
            local_read,
            remote_write,
            self.shutdown.clone(),
            done_tx.clone(),
            "local->remote",
        ));
        tokio::spawn(pump(
            remote_read,
            local_write,
            self.shutdown.clone(),
            done_tx,
            "remote->local",
        ));

        // The first direction to terminate decides the outcome. The
        // other pump ends on its own once the shared sockets go away.
        match done_rx.recv().await {
            Some(error) => RelayOutcome::Finished(error),
            None => RelayOutcome::Stopped,
        }
    }

    /// Tear the connection down. Idempotent, callable from any task;
    /// unblocks the pump loops so they report naturally.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Copy bytes from `read` to `write` until end-of-stream, an I/O error,
/// or shutdown. Dropping the halves on exit is what closes the sockets
/// and unblocks the opposite direction.
async fn pump(
    mut read: OwnedReadHalf,
    mut write: OwnedWriteHalf,
    shutdown: CancellationToken,
    done: mpsc::Sender<Option<io::Error>>,
    direction: &'static str,
) {
    let error = tokio::select! {
        result = tokio::io::copy(&mut read, &mut write) => result.err(),
        _ = shutdown.cancelled() => None,
    };
    debug!("stop copy {} (error: {:?})", direction, error);
    let _ = done.try_send(error);
}
