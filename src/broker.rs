//! Broker negotiation.
//!
//! One-shot HTTP call against a localtunnel-style broker to obtain a
//! public URL, the port of the broker's tunnel endpoint, and the number
//! of physical connections the client is expected to maintain.

use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::{Result, TunnelError};

/// Wire format of the broker's assignment response.
#[derive(Debug, Deserialize)]
struct AssignedUrlInfo {
    #[serde(default)]
    id: Option<String>,
    url: String,
    port: u16,
    max_conn_count: usize,
}

/// Result of a successful negotiation. Immutable once obtained.
#[derive(Debug, Clone)]
pub struct Assignment {
    /// Public URL the broker routes to this tunnel.
    pub url: String,
    /// Host to dial for tunnel connections, derived from the broker's
    /// own address rather than the response body.
    pub remote_host: String,
    /// Port of the broker's tunnel endpoint.
    pub port: u16,
    /// Number of physical connections the broker expects us to hold.
    pub max_conn_count: usize,
}

pub struct AssignmentClient {
    http: Client,
    base: Url,
}

impl AssignmentClient {
    pub fn new(base: Url) -> Self {
        Self {
            http: Client::new(),
            base,
        }
    }

    /// Request an assignment. An empty `subdomain` asks the broker for
    /// any available subdomain (`?new`), never a literal empty segment.
    pub async fn request(&self, subdomain: &str) -> Result<Assignment> {
        let remote_host = self
            .base
            .host_str()
            .ok_or_else(|| TunnelError::InvalidAssignment("broker URL has no host".into()))?
            .to_string();

        let token = if subdomain.is_empty() { "?new" } else { subdomain };
        let endpoint = format!("{}/{}", self.base.as_str().trim_end_matches('/'), token);
        debug!("requesting assignment from {}", endpoint);

        let info: AssignedUrlInfo = self
            .http
            .get(&endpoint)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if info.port == 0 {
            return Err(TunnelError::InvalidAssignment("tunnel port is 0".into()));
        }
        if info.max_conn_count == 0 {
            return Err(TunnelError::InvalidAssignment(
                "connection count is 0".into(),
            ));
        }

        debug!(
            "assigned {} (id {:?}), {} connections to {}:{}",
            info.url, info.id, info.max_conn_count, remote_host, info.port
        );

        Ok(Assignment {
            url: info.url,
            remote_host,
            port: info.port,
            max_conn_count: info.max_conn_count,
        })
    }
}
