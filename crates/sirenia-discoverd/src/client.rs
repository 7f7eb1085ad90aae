//! HTTP client for the discoverd service API.

use std::time::Duration;

use md5::{Digest, Md5};
use reqwest::header::ACCEPT;
use reqwest::{Client, Response, StatusCode};
use sirenia_core::{Instance, ServiceMeta};
use tracing::debug;

use crate::error::{DiscoverdError, DiscoverdResult};
use crate::watch::Watch;

/// Address used when `DISCOVERD` is not set.
pub const DEFAULT_URL: &str = "http://127.0.0.1:1111";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The id discoverd gives an instance: the md5 of `"{proto}-{addr}"`.
#[must_use]
pub fn instance_id(proto: &str, addr: &str) -> String {
    hex::encode(Md5::digest(format!("{proto}-{addr}").as_bytes()))
}

/// Client for a discoverd server.
#[derive(Debug, Clone)]
pub struct DiscoverdClient {
    client: Client,
    base_url: String,
}

impl DiscoverdClient {
    /// Create a client for `url`, adding `http://` if no scheme is given.
    pub fn new(url: &str) -> DiscoverdResult<Self> {
        // No overall timeout: event streams stay open indefinitely.
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(DiscoverdError::Http)?;
        let url = if url.starts_with("http") {
            url.to_owned()
        } else {
            format!("http://{url}")
        };
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_owned(),
        })
    }

    /// Create a client from the `DISCOVERD` environment variable.
    pub fn from_env() -> DiscoverdResult<Self> {
        let url = std::env::var("DISCOVERD").unwrap_or_else(|_| DEFAULT_URL.to_owned());
        Self::new(&url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn service(&self, name: impl Into<String>) -> Service {
        Service {
            client: self.clone(),
            name: name.into(),
        }
    }

    pub async fn ping(&self) -> DiscoverdResult<()> {
        let response = self
            .client
            .get(format!("{}/ping", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check(response).await.map(drop)
    }
}

/// One named service.
#[derive(Debug, Clone)]
pub struct Service {
    client: DiscoverdClient,
    name: String,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn url(&self, path: &str) -> String {
        format!("{}/services/{}{}", self.client.base_url, self.name, path)
    }

    /// Currently registered instances.
    pub async fn instances(&self) -> DiscoverdResult<Vec<Instance>> {
        let response = self
            .client
            .client
            .get(self.url("/instances"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Service metadata, or `None` if none has been written yet.
    pub async fn get_meta(&self) -> DiscoverdResult<Option<ServiceMeta>> {
        let response = self
            .client
            .client
            .get(self.url("/meta"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        match check(response).await {
            Ok(response) => Ok(Some(response.json().await?)),
            Err(DiscoverdError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Write metadata if `meta.index` still matches the stored index.
    /// Returns the metadata as stored, carrying its new index.
    pub async fn set_meta(&self, meta: &ServiceMeta) -> DiscoverdResult<ServiceMeta> {
        let response = self
            .client
            .client
            .put(self.url("/meta"))
            .timeout(REQUEST_TIMEOUT)
            .json(meta)
            .send()
            .await?;
        if response.status() == StatusCode::PRECONDITION_FAILED {
            return Err(DiscoverdError::IndexStale {
                expected: meta.index,
            });
        }
        Ok(check(response).await?.json().await?)
    }

    /// Register or refresh an instance.
    pub async fn register(&self, instance: &Instance) -> DiscoverdResult<()> {
        let response = self
            .client
            .client
            .put(self.url(&format!("/instances/{}", instance.id)))
            .timeout(REQUEST_TIMEOUT)
            .json(instance)
            .send()
            .await?;
        check(response).await.map(drop)
    }

    pub async fn unregister(&self, id: &str) -> DiscoverdResult<()> {
        let response = self
            .client
            .client
            .delete(self.url(&format!("/instances/{id}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check(response).await.map(drop)
    }

    /// Open a raw event stream. The first events describe the current
    /// instances and metadata, followed by a `current` marker.
    pub(crate) async fn open_stream(&self) -> DiscoverdResult<Response> {
        debug!(service = %self.name, "opening event stream");
        let response = self
            .client
            .client
            .get(self.url(""))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        check(response).await
    }

    /// Watch the service, reconnecting on error.
    pub fn watch(&self) -> Watch {
        Watch::spawn(self.clone())
    }
}

async fn check(response: Response) -> DiscoverdResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().path().to_owned();
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND => Err(DiscoverdError::NotFound(url)),
        _ => Err(DiscoverdError::Status {
            status: status.as_u16(),
            body,
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn adds_scheme_and_trims_slash() {
        let client = DiscoverdClient::new("127.0.0.1:1111/").unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:1111");
        let service = client.service("pg");
        assert_eq!(service.url("/meta"), "http://127.0.0.1:1111/services/pg/meta");
        assert_eq!(service.url(""), "http://127.0.0.1:1111/services/pg");
    }

    #[test]
    fn instance_ids_hash_proto_and_addr() {
        let id = instance_id("tcp", "10.0.0.1:5432");
        assert_eq!(id.len(), 32);
        assert_eq!(id, instance_id("tcp", "10.0.0.1:5432"));
        assert_ne!(id, instance_id("tcp", "10.0.0.2:5432"));
    }
}
