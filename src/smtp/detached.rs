//! Bounded tracking of detached pipeline runs.
//!
//! In detached mode the peer is acknowledged before the pipeline runs.
//! Every such run holds a slot here until it finishes, so the number in
//! flight (and the capture buffers they pin) stays bounded, and shutdown
//! can wait for accepted mail instead of dropping it with the runtime.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::Instrument;

#[derive(Debug)]
pub struct DetachedDeliveries {
    permits: Arc<Semaphore>,
    limit: u32,
}

impl DetachedDeliveries {
    pub fn new(limit: usize) -> Self {
        let limit = u32::try_from(limit.max(1)).unwrap_or(u32::MAX);
        Self {
            permits: Arc::new(Semaphore::new(limit as usize)),
            limit,
        }
    }

    /// Wait for a slot. `None` only if the tracker was closed.
    pub async fn reserve(&self) -> Option<DeliverySlot> {
        let permit = Arc::clone(&self.permits).acquire_owned().await.ok()?;
        Some(DeliverySlot { _permit: permit })
    }

    /// Run `work` in the background, holding `slot` until it completes.
    pub fn spawn<F>(&self, slot: DeliverySlot, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(
            async move {
                work.await;
                drop(slot);
            }
            .in_current_span(),
        );
    }

    /// Runs currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.limit as usize - self.permits.available_permits()
    }

    /// Wait up to `grace` for every run to finish. Returns how many are
    /// still running.
    pub async fn drain(&self, grace: Duration) -> usize {
        let pending = self.in_flight();
        if pending == 0 {
            return 0;
        }
        tracing::info!(pending, grace = ?grace, "Waiting for detached deliveries");
        match tokio::time::timeout(grace, self.permits.acquire_many(self.limit)).await {
            Ok(Ok(_all)) => 0,
            _ => self.in_flight(),
        }
    }
}

/// A reserved detached-delivery slot.
#[derive(Debug)]
pub struct DeliverySlot {
    _permit: OwnedSemaphorePermit,
}
