use anyhow::{Context, Result};
use std::net::SocketAddr;

pub fn check_bind(bind: &str) -> Result<()> {
    let addr: SocketAddr = bind.parse().with_context(|| format!("map.bind {:?} is not host:port", bind))?;
    anyhow::ensure!(addr.port() != 0, "map.bind needs an explicit port");
    if !addr.ip().is_loopback() {
        tracing::warn!("map server will listen on {} (reachable off-host)", addr);
    }
    Ok(())
}
