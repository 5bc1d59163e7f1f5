use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// The shared counter enforcing a global ceiling on concurrently in-flight
/// events across every consumer instance of a handler group.
///
/// Cloning shares the underlying state: all consumers holding a clone draw
/// from the same pool of permits, which is what makes the ceiling global
/// rather than per-consumer. Constructed once and injected, so tests can
/// substitute a sensor with a limit of their choosing.
#[derive(Clone)]
pub struct GlobalLoadSensor {
    limit: usize,
    in_flight: Arc<AtomicUsize>,
    permits: Arc<Semaphore>,
}

impl GlobalLoadSensor {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_flight: Arc::new(AtomicUsize::new(0)),
            permits: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Waits until the group is below its ceiling. Holding the returned
    /// permit counts as one in-flight event until it is dropped.
    pub async fn acquire(&self) -> LoadPermit {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("load sensor semaphore closed");
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        LoadPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        }
    }

    pub fn try_acquire(&self) -> Option<LoadPermit> {
        let permit = self.permits.clone().try_acquire_owned().ok()?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(LoadPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn current(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Waits for every in-flight handler to finish. Intake must have stopped
    /// before calling this, otherwise new events keep taking the permits.
    pub async fn drain(&self) {
        let permits = self
            .permits
            .acquire_many(self.limit as u32)
            .await
            .expect("load sensor semaphore closed");
        drop(permits);
    }
}

/// One unit of in-flight work. Dropping it releases the slot back to the
/// group.
pub struct LoadPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for LoadPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ceiling_is_shared_across_clones() {
        let sensor = GlobalLoadSensor::new(2);
        let other_consumer = sensor.clone();

        let first = sensor.acquire().await;
        let second = other_consumer.acquire().await;
        assert_eq!(sensor.current(), 2);

        // A third event anywhere in the group must wait.
        assert!(sensor.try_acquire().is_none());
        assert!(other_consumer.try_acquire().is_none());

        drop(first);
        assert!(sensor.try_acquire().is_some());
        drop(second);
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_permits() {
        let sensor = GlobalLoadSensor::new(3);
        let permit = sensor.acquire().await;

        let drained = {
            let sensor = sensor.clone();
            tokio::spawn(async move { sensor.drain().await })
        };
        tokio::task::yield_now().await;
        assert!(!drained.is_finished());

        drop(permit);
        drained.await.unwrap();
        assert_eq!(sensor.current(), 0);
    }
}
