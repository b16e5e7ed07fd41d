//! Free TCP port discovery for the sidecar's listeners.
//!
//! The main API port prefers a small, predictable range so firewall rules and
//! bookmarks keep working across restarts; the MCP port can be anything.

use std::{
    net::{IpAddr, SocketAddr},
    ops::RangeInclusive,
};

use anyhow::{Context, Result, bail};
use tokio::net::TcpListener;
use tracing::{debug, warn};

/// Upper bound on bind attempts inside a preferred range.
const MAX_RANGE_ATTEMPTS: usize = 20;
/// How often the ephemeral MCP port is re-drawn if it collides with the main port.
const MAX_DISTINCT_ATTEMPTS: usize = 5;

/// The pair of listening ports handed to one sidecar instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidecarPorts {
    pub main: u16,
    pub mcp: u16,
}

/// Finds a free port on `host`.
///
/// With a range, up to 20 distinct random candidates inside it are bind-tested
/// and the first free one wins. When every candidate is busy (or no range is
/// given) the OS picks an ephemeral port instead.
pub async fn find_free_port(host: IpAddr, range: Option<RangeInclusive<u16>>) -> Result<u16> {
    if let Some(range) = range {
        if range.is_empty() {
            bail!("invalid port range {}-{}", range.start(), range.end());
        }

        for port in random_candidates(&range, MAX_RANGE_ATTEMPTS) {
            if port_is_free(host, port).await {
                debug!(port, "found free port in preferred range");
                return Ok(port);
            }
        }

        warn!(
            start = range.start(),
            end = range.end(),
            "no free port in preferred range; falling back to an OS-assigned port"
        );
    }

    os_assigned_port(host).await
}

/// Allocates the main port from `range` and an ephemeral MCP port, guaranteeing they differ.
pub async fn allocate_sidecar_ports(
    host: IpAddr,
    range: RangeInclusive<u16>,
) -> Result<SidecarPorts> {
    let main = find_free_port(host, Some(range)).await?;

    for _ in 0..MAX_DISTINCT_ATTEMPTS {
        let mcp = find_free_port(host, None).await?;
        if mcp != main {
            return Ok(SidecarPorts { main, mcp });
        }
        debug!(port = mcp, "ephemeral port collided with main port; retrying");
    }

    bail!("could not allocate an MCP port distinct from main port {main}")
}

async fn os_assigned_port(host: IpAddr) -> Result<u16> {
    let listener = TcpListener::bind(SocketAddr::new(host, 0))
        .await
        .with_context(|| format!("failed to bind an ephemeral port on {host}"))?;
    let port = listener
        .local_addr()
        .context("failed to read ephemeral listener address")?
        .port();
    drop(listener);
    Ok(port)
}

async fn port_is_free(host: IpAddr, port: u16) -> bool {
    match TcpListener::bind(SocketAddr::new(host, port)).await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(_) => false,
    }
}

/// Draws up to `limit` distinct ports from `range` in random order.
fn random_candidates(range: &RangeInclusive<u16>, limit: usize) -> Vec<u16> {
    let start = *range.start();
    let len = range.clone().count();
    let take = limit.min(len);

    rand::seq::index::sample(&mut rand::rng(), len, take)
        .into_iter()
        .filter_map(|offset| u16::try_from(offset).ok())
        .map(|offset| start + offset)
        .collect()
}
