use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{StoreError, SubscriptionStore};

/// Bounds the number of concurrently checked-out store handles.
///
/// Every request acquires one handle on entry; the permit goes back to the
/// pool when the handle is dropped, on every exit path.
#[derive(Clone)]
pub struct StorePool {
    store: Arc<dyn SubscriptionStore>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl StorePool {
    pub fn new(store: Arc<dyn SubscriptionStore>, max_handles: usize) -> Self {
        let capacity = max_handles.max(1);
        Self {
            store,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Waits for a free slot and returns a handle bound to it.
    pub async fn acquire(&self) -> Result<StoreHandle, StoreError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| StoreError::PoolClosed)?;
        Ok(StoreHandle {
            store: Arc::clone(&self.store),
            _permit: permit,
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rejects all pending and future acquisitions.
    pub fn close(&self) {
        self.permits.close();
    }
}

pub struct StoreHandle {
    store: Arc<dyn SubscriptionStore>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for StoreHandle {
    type Target = dyn SubscriptionStore;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref()
    }
}
