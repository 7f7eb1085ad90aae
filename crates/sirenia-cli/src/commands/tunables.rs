//! `sirenia tunables get|set`.

use anyhow::{bail, Context, Result};
use sirenia_client::SireniaClient;
use sirenia_core::Tunables;

pub async fn get(addr: &str) -> Result<()> {
    let client = SireniaClient::new(addr)?;
    let tunables = client
        .get_tunables()
        .await
        .with_context(|| format!("fetching tunables from {}", client.base_url()))?;
    println!("{}", serde_json::to_string_pretty(&tunables)?);
    Ok(())
}

pub async fn set(addr: &str, settings: &[String]) -> Result<()> {
    let client = SireniaClient::new(addr)?;
    let current = client
        .get_tunables()
        .await
        .with_context(|| format!("fetching tunables from {}", client.base_url()))?;
    let next = apply(current, settings)?;
    client
        .update_tunables(&next)
        .await
        .context("updating tunables")?;
    println!("tunables updated to version {}", next.version);
    Ok(())
}

/// The next tunables version with `settings` merged in.
fn apply(mut tunables: Tunables, settings: &[String]) -> Result<Tunables> {
    for setting in settings {
        let (key, value) = parse_setting(setting)?;
        tunables.data.insert(key.to_owned(), value.to_owned());
    }
    tunables.version += 1;
    Ok(tunables)
}

fn parse_setting(setting: &str) -> Result<(&str, &str)> {
    match setting.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value.trim())),
        _ => bail!("invalid setting {setting:?}, expected KEY=VALUE"),
    }
}
