//! Tunnel session lifecycle.
//!
//! A session negotiates an assignment with the broker, fills a pool of
//! relay connections against the broker's tunnel endpoint, and waits
//! until every relay has reported or a stop command arrives. All
//! coordination goes through channels and cancellation tokens; nothing
//! is shared mutably across tasks.

mod dial;
mod relay;

pub use relay::{Endpoint, RelayConnection, RelayOutcome};

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::broker::{Assignment, AssignmentClient};
use crate::error::{Result, TunnelError};

#[derive(Debug, Clone, Copy)]
enum Command {
    Stop,
}

/// Clone-able handle for stopping a running session from another task
/// (ctrl-c handler, tests). Stopping is idempotent; a second stop while
/// one is pending is dropped harmlessly.
#[derive(Clone)]
pub struct StopHandle {
    cmd_tx: mpsc::Sender<Command>,
    shutdown: CancellationToken,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.cmd_tx.try_send(Command::Stop);
        self.shutdown.cancel();
    }
}

/// One tunnel session against one broker. Negotiate once, start at most
/// once; stop as often as you like.
pub struct TunnelSession {
    broker: Url,
    assignment: Option<Assignment>,
    connections: Vec<Arc<RelayConnection>>,
    shutdown: CancellationToken,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl TunnelSession {
    pub fn new(broker: Url) -> Self {
        // Capacity 1: only the first pending stop matters.
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        Self {
            broker,
            assignment: None,
            connections: Vec::new(),
            shutdown: CancellationToken::new(),
            cmd_tx,
            cmd_rx,
        }
    }

    /// Obtain an assignment from the broker and reserve the connection
    /// pool. An empty `subdomain` means "any available subdomain".
    /// Negotiation is atomic: a stop arriving mid-call takes effect at
    /// the next `start`.
    pub async fn negotiate(&mut self, subdomain: &str) -> Result<String> {
        let assignment = AssignmentClient::new(self.broker.clone())
            .request(subdomain)
            .await?;
        info!(
            "assigned {} ({} connections)",
            assignment.url, assignment.max_conn_count
        );
        self.connections = Vec::with_capacity(assignment.max_conn_count);
        let url = assignment.url.clone();
        self.assignment = Some(assignment);
        Ok(url)
    }

    /// Fill the relay pool and wait until every relay has reported its
    /// outcome or a stop command arrives. Per-connection failures only
    /// count against the pool, they never fail the session.
    pub async fn start(&mut self, local_port: u16) -> Result<()> {
        let assignment = self
            .assignment
            .clone()
            .ok_or(TunnelError::NotNegotiated)?;

        // Fail fast before consuming any broker-side connection slot.
        probe_local_port(local_port).await?;

        let (reply_tx, mut reply_rx) = mpsc::channel(assignment.max_conn_count);
        for _ in 0..assignment.max_conn_count {
            let connection = Arc::new(RelayConnection::new(
                assignment.remote_host.clone(),
                assignment.port,
                local_port,
                self.shutdown.child_token(),
            ));
            self.connections.push(connection.clone());
            let reply = reply_tx.clone();
            tokio::spawn(async move {
                let outcome = connection.run().await;
                let _ = reply.try_send(outcome);
            });
        }
        drop(reply_tx);

        let mut remaining = assignment.max_conn_count;
        while remaining > 0 {
            tokio::select! {
                outcome = reply_rx.recv() => match outcome {
                    Some(outcome) => {
                        log_outcome(&outcome);
                        remaining -= 1;
                    }
                    None => break,
                },
                _ = self.cmd_rx.recv() => {
                    debug!("stop command received, leaving wait loop");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Stop the session: unblock a pending `start` wait and close every
    /// relay connection regardless of its state. Safe before `start`,
    /// after it returned, and repeatedly.
    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            cmd_tx: self.cmd_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

fn log_outcome(outcome: &RelayOutcome) {
    match outcome {
        RelayOutcome::ConnectFailed { endpoint, error } => {
            warn!("relay {} connect failed: {}", endpoint, error);
        }
        RelayOutcome::Finished(Some(error)) => debug!("relay terminated: {}", error),
        RelayOutcome::Finished(None) => debug!("relay closed"),
        RelayOutcome::Stopped => debug!("relay stopped"),
    }
}

/// Connect-and-drop probe against the local service.
async fn probe_local_port(port: u16) -> Result<()> {
    TcpStream::connect(("localhost", port))
        .await
        .map_err(|_| TunnelError::LocalPortUnreachable(port))?;
    Ok(())
}
