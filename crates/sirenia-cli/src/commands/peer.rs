//! `sirenia status` and `sirenia stop`.

use anyhow::{Context, Result};
use sirenia_client::SireniaClient;

pub async fn status(addr: &str) -> Result<()> {
    let client = SireniaClient::new(addr)?;
    let status = client
        .status()
        .await
        .with_context(|| format!("fetching status from {}", client.base_url()))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    if !status.is_healthy() {
        eprintln!("peer is not healthy");
    }
    Ok(())
}

pub async fn stop(addr: &str) -> Result<()> {
    let client = SireniaClient::new(addr)?;
    client
        .stop()
        .await
        .with_context(|| format!("stopping {}", client.base_url()))?;
    println!("stopped {addr}");
    Ok(())
}
