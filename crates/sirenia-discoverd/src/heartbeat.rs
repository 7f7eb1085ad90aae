use std::time::Duration;

use sirenia_core::Instance;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::Service;
use crate::error::DiscoverdResult;

/// Keeps an instance registered by re-registering it on an interval.
#[derive(Debug)]
pub struct Heartbeater {
    service: Service,
    instance: Instance,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Heartbeater {
    /// Register `instance` and keep it alive every `interval`.
    ///
    /// # Errors
    ///
    /// Fails if the first registration fails; later failures are logged
    /// and retried on the next tick.
    pub async fn start(
        service: Service,
        instance: Instance,
        interval: Duration,
    ) -> DiscoverdResult<Self> {
        service.register(&instance).await?;
        info!(service = %service.name(), id = %instance.id, addr = %instance.addr, "registered instance");

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let service = service.clone();
            let instance = instance.clone();
            let cancel = cancel.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    if let Err(err) = service.register(&instance).await {
                        warn!(service = %service.name(), error = %err, "heartbeat failed");
                    }
                }
            }
        });

        Ok(Self {
            service,
            instance,
            cancel,
            task,
        })
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Stop heartbeating and remove the registration.
    ///
    /// # Errors
    ///
    /// Returns the unregister error, if any.
    pub async fn stop(self) -> DiscoverdResult<()> {
        self.cancel.cancel();
        let _ = self.task.await;
        self.service.unregister(&self.instance.id).await
    }
}
