//! Loopback redirect delivery
//!
//! Each authorization flow registers a waiter keyed by its nonce. The
//! `/callback` route hands the full redirect URL to `deliver`, which wakes
//! the matching waiter. A callback without a nonce goes to the oldest
//! waiter, since some relays strip unknown query parameters.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use spotify_session::{Error, NONCE_PARAM, RedirectWaiter, Result};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;

struct Waiter {
    seq: u64,
    nonce: String,
    tx: oneshot::Sender<Url>,
}

#[derive(Default)]
struct Waiters {
    next_seq: u64,
    pending: Vec<Waiter>,
}

/// Routes redirects arriving on the loopback listener to waiting flows.
#[derive(Clone, Default)]
pub struct LoopbackRedirectWaiter {
    waiters: Arc<Mutex<Waiters>>,
}

impl LoopbackRedirectWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand a callback URL to its waiter. Returns false when nobody was
    /// waiting for it.
    pub fn deliver(&self, callback: Url) -> bool {
        let nonce = callback
            .query_pairs()
            .find(|(k, _)| k == NONCE_PARAM)
            .map(|(_, v)| v.into_owned());

        let waiter = {
            let mut waiters = self.lock();
            let index = match &nonce {
                Some(nonce) => waiters.pending.iter().position(|w| &w.nonce == nonce),
                None => (!waiters.pending.is_empty()).then_some(0),
            };
            index.map(|i| waiters.pending.remove(i))
        };

        match waiter {
            Some(waiter) => {
                debug!(nonce = %waiter.nonce, "delivering redirect");
                // Receiver dropped means the flow gave up in the meantime
                waiter.tx.send(callback).is_ok()
            }
            None => {
                warn!(nonce = ?nonce, "redirect with no waiting flow");
                false
            }
        }
    }

    /// Number of flows currently waiting for a redirect.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    fn register(&self, nonce: &str) -> (u64, oneshot::Receiver<Url>) {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.lock();
        let seq = waiters.next_seq;
        waiters.next_seq += 1;
        waiters.pending.push(Waiter {
            seq,
            nonce: nonce.to_string(),
            tx,
        });
        (seq, rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes an abandoned waiter when its future is dropped.
struct Registration {
    seq: u64,
    waiters: Arc<Mutex<Waiters>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .retain(|w| w.seq != self.seq);
    }
}

impl RedirectWaiter for LoopbackRedirectWaiter {
    fn wait_for_callback<'a>(
        &'a self,
        nonce: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Url>> + Send + 'a>> {
        // Registered eagerly so a redirect that lands before the first poll is kept
        let (seq, rx) = self.register(nonce);
        let registration = Registration {
            seq,
            waiters: Arc::clone(&self.waiters),
        };
        Box::pin(async move {
            let _registration = registration;
            rx.await
                .map_err(|_| Error::RedirectClosed("callback listener dropped the waiter".into()))
        })
    }
}
