//! Duplicate call suppression
//!
//! Concurrent calls for the same key share a single execution. The execution
//! runs in its own task, so a waiter that gives up (for instance because its
//! query deadline fired) does not cancel the work other waiters depend on.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use derive_more::{Display, Error};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

#[derive(Debug, Display, Clone, PartialEq, Eq, Error)]
pub enum FlightError {
    #[display(fmt = "coalesced call panicked")]
    Panicked,
    #[display(fmt = "coalesced call was cancelled")]
    Cancelled,
}

type Flight<T> = Shared<BoxFuture<'static, Result<T, FlightError>>>;

struct Call<T> {
    id: u64,
    flight: Flight<T>,
}

type CallMap<T> = Arc<Mutex<HashMap<String, Call<T>>>>;

/// Removes a finished call from the map, including when the work panicked
struct Completion<T> {
    calls: CallMap<T>,
    key: String,
    id: u64,
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        let mut calls = self.calls.lock();
        if calls.get(&self.key).map(|call| call.id) == Some(self.id) {
            calls.remove(&self.key);
        }
    }
}

pub struct Group<T> {
    calls: CallMap<T>,
    next_id: AtomicU64,
}

impl<T> Default for Group<T> {
    fn default() -> Self {
        Group {
            calls: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> Group<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Group<T> {
        Group::default()
    }

    /// Run `work` for `key` unless a call for the same key is already in
    /// flight, in which case its result is awaited instead. The returned flag
    /// is true when the result was shared with another caller.
    pub async fn work<F, Fut>(&self, key: &str, work: F) -> (Result<T, FlightError>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (flight, shared) = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some(call) => (call.flight.clone(), true),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let completion = Completion {
                        calls: Arc::clone(&self.calls),
                        key: key.to_string(),
                        id,
                    };

                    let fut = work();
                    let handle = tokio::spawn(async move {
                        let _completion = completion;
                        fut.await
                    });

                    let flight = async move {
                        match handle.await {
                            Ok(value) => Ok(value),
                            Err(e) if e.is_panic() => Err(FlightError::Panicked),
                            Err(_) => Err(FlightError::Cancelled),
                        }
                    }
                    .boxed()
                    .shared();

                    calls.insert(
                        key.to_string(),
                        Call {
                            id,
                            flight: flight.clone(),
                        },
                    );

                    (flight, false)
                }
            }
        };

        (flight.await, shared)
    }

    /// Number of keys with a call in flight
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}
