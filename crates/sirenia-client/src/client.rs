use std::time::Duration;

use reqwest::{Client, Response};
use serde::Deserialize;
use sirenia_core::{Instance, Status, Tunables};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// Delay between status polls in the wait helpers.
pub const CHECK_INTERVAL: Duration = Duration::from_millis(100);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for one peer's status port.
#[derive(Debug, Clone)]
pub struct SireniaClient {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl SireniaClient {
    /// Create a client for `addr`, which may be a bare `host:port`.
    pub fn new(addr: &str) -> ClientResult<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let url = if addr.starts_with("http") {
            addr.to_owned()
        } else {
            format!("http://{addr}")
        };
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_owned(),
        })
    }

    /// Client for the peer whose database listens on `addr`. Peers serve
    /// their status port one above the database port.
    pub fn for_database(addr: &str) -> ClientResult<Self> {
        let Some((host, port)) = addr.rsplit_once(':') else {
            return Self::new(addr);
        };
        match port.parse::<u16>().ok().and_then(|p| p.checked_add(1)) {
            Some(port) => Self::new(&format!("{host}:{port}")),
            None => Self::new(addr),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn status(&self) -> ClientResult<Status> {
        let response = self.client.get(self.url("/status")).send().await?;
        Ok(check(response).await?.json().await?)
    }

    /// Ask the peer to shut down gracefully.
    pub async fn stop(&self) -> ClientResult<()> {
        let response = self.client.post(self.url("/stop")).send().await?;
        check(response).await.map(drop)
    }

    pub async fn get_tunables(&self) -> ClientResult<Tunables> {
        let response = self.client.get(self.url("/tunables")).send().await?;
        Ok(check(response).await?.json().await?)
    }

    /// Submit new tunables. The peer must be primary and `tunables.version`
    /// must be one more than the current version.
    pub async fn update_tunables(&self, tunables: &Tunables) -> ClientResult<()> {
        let response = self
            .client
            .post(self.url("/tunables"))
            .json(tunables)
            .send()
            .await?;
        check(response).await.map(drop)
    }

    /// Wait until the peer reports `downstream` as its synced downstream.
    pub async fn wait_for_repl_sync(
        &self,
        downstream: &Instance,
        timeout: Duration,
    ) -> ClientResult<()> {
        self.wait_for(timeout, |status| {
            status
                .database
                .as_ref()
                .and_then(|db| db.synced_downstream.as_ref())
                .is_some_and(|synced| synced.id == downstream.id)
        })
        .await
    }

    /// Wait until the peer's database accepts writes.
    pub async fn wait_for_read_write(&self, timeout: Duration) -> ClientResult<()> {
        self.wait_for(timeout, |status| {
            status.database.as_ref().is_some_and(|db| db.read_write)
        })
        .await
    }

    /// Poll status until `done` holds. Request failures count as "not yet".
    pub async fn wait_for(
        &self,
        timeout: Duration,
        mut done: impl FnMut(&Status) -> bool,
    ) -> ClientResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.status().await {
                Ok(status) if done(&status) => return Ok(()),
                Ok(_) => {}
                Err(err) => debug!(url = %self.base_url, error = %err, "status poll failed"),
            }
            if Instant::now() + CHECK_INTERVAL > deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }
}

async fn check(response: Response) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or(body);
    Err(ClientError::Status {
        status: status.as_u16(),
        message,
    })
}
