// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see broken.rs for the full text.

//! Message-size flow control: a connection may have at most a fixed total
//! number of bytes of outstanding (sent but not yet acknowledged) message
//! data in flight.

use std::sync::Arc;

use tokio::sync::Semaphore;

use vatkit::capability::Promise;
use vatkit::Error;

/// Something that can throttle outgoing message bytes. Each call result is
/// the Return/Finish round-trip that frees the reservation.
pub trait FlowLimiter {
    fn start_message(&self, size: u32) -> Promise<FlowControlGuard, Error>;
}

/// Holds a flow-control reservation; releases it back to the limiter when
/// dropped.
pub struct FlowControlGuard {
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

/// A `FlowLimiter` that enforces a fixed cap on total outstanding message
/// bytes.
pub struct FixedLimiter {
    size: u32,
    semaphore: Arc<Semaphore>,
}

impl FixedLimiter {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size as usize)),
        }
    }
}

impl FlowLimiter for FixedLimiter {
    fn start_message(&self, size: u32) -> Promise<FlowControlGuard, Error> {
        // A message larger than the configured limit can never be sent; this
        // is a misconfiguration, not a runtime condition a caller can react
        // to.
        if size > self.size {
            panic!("start_message: message size {size} is too large (max {})", self.size);
        }
        let semaphore = self.semaphore.clone();
        Promise::from_future(async move {
            let permit = semaphore
                .acquire_many_owned(size)
                .await
                .map_err(|_| Error::disconnected("flow control semaphore closed".into()))?;
            Ok(FlowControlGuard {
                _permit: Some(permit),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_and_releases_permits() {
        let limiter = FixedLimiter::new(10);
        let guard = limiter.start_message(10).await.unwrap();
        // The semaphore is fully reserved; a second message must wait until
        // the first guard is dropped.
        let second = limiter.start_message(1);
        drop(guard);
        second.await.unwrap();
    }

    #[test]
    #[should_panic(expected = "too large")]
    fn panics_on_oversized_message() {
        let limiter = FixedLimiter::new(10);
        let _ = limiter.start_message(11);
    }
}
