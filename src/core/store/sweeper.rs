use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::RunStore;
use crate::core::lifecycle::LifecycleComponent;

/// Periodically purges runs abandoned past their TTL.
pub struct RunSweeper {
    store: Arc<dyn RunStore>,
    ttl: Duration,
    every: Duration,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl RunSweeper {
    pub fn new(store: Arc<dyn RunStore>, ttl: Duration, every: Duration) -> Self {
        Self {
            store,
            ttl,
            every,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub async fn sweep_once(store: &dyn RunStore, ttl: Duration) -> usize {
        match store.purge_expired(ttl).await {
            Ok(purged) => {
                if purged > 0 {
                    info!(purged, "Expired runs swept");
                }
                purged
            }
            Err(e) => {
                warn!("Run sweep failed: {}", e);
                0
            }
        }
    }
}

#[async_trait]
impl LifecycleComponent for RunSweeper {
    async fn on_start(&mut self) -> Result<()> {
        let store = self.store.clone();
        let ttl = self.ttl;
        let every = self.every;
        let cancel = self.cancel.clone();
        info!(ttl_secs = ttl.as_secs(), "Run sweeper started");
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        RunSweeper::sweep_once(store.as_ref(), ttl).await;
                    }
                }
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await.ok();
        }
        Ok(())
    }
}
