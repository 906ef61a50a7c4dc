//! Single-writer completion cell bridging the loop thread and caller threads.
//!
//! A [`Resolver`] lives on the loop thread and writes the outcome exactly
//! once; the matching [`Completion`] is held by an ordinary thread that
//! blocks on it, optionally with a timeout. Dropping an unresolved resolver
//! fails the completion with [`QuicMuxError::SchedulerStopped`], so a waiter
//! never hangs on a loop that went away.

use quicmux_common::{QuicMuxError, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct Slot<T> {
    outcome: Mutex<Option<Result<T>>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn lock(&self) -> MutexGuard<'_, Option<Result<T>>> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a connected resolver/completion pair
pub fn pair<T>() -> (Resolver<T>, Completion<T>) {
    let slot = Arc::new(Slot {
        outcome: Mutex::new(None),
        ready: Condvar::new(),
    });

    (
        Resolver {
            slot: Some(slot.clone()),
        },
        Completion { slot },
    )
}

/// Writing half; consumed by the first resolution
pub struct Resolver<T> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T> Resolver<T> {
    pub fn resolve(mut self, outcome: Result<T>) {
        self.fill(outcome);
    }

    pub fn succeed(self, value: T) {
        self.resolve(Ok(value));
    }

    pub fn fail(self, error: QuicMuxError) {
        self.resolve(Err(error));
    }

    fn fill(&mut self, outcome: Result<T>) {
        if let Some(slot) = self.slot.take() {
            let mut guard = slot.lock();
            if guard.is_none() {
                *guard = Some(outcome);
            }
            drop(guard);
            slot.ready.notify_all();
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if self.slot.is_some() {
            self.fill(Err(QuicMuxError::SchedulerStopped));
        }
    }
}

impl<T> std::fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("pending", &self.slot.is_some())
            .finish()
    }
}

/// Reading half, waited on by caller threads
pub struct Completion<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Completion<T> {
    /// A completion that is already resolved
    pub fn ready(outcome: Result<T>) -> Self {
        let (resolver, completion) = pair();
        resolver.resolve(outcome);
        completion
    }

    pub fn is_ready(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Block until the outcome is written
    pub fn wait(self) -> Result<T> {
        let mut guard = self.slot.lock();
        loop {
            if let Some(outcome) = guard.take() {
                return outcome;
            }
            guard = self
                .slot
                .ready
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout`; hands the completion back if nothing arrived
    pub fn wait_timeout(self, timeout: Duration) -> std::result::Result<Result<T>, Self> {
        let deadline = Instant::now() + timeout;
        {
            let mut guard = self.slot.lock();
            loop {
                if let Some(outcome) = guard.take() {
                    return Ok(outcome);
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (next, _) = self
                    .slot
                    .ready
                    .wait_timeout(guard, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                guard = next;
            }
        }
        Err(self)
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_resolve_before_wait() {
        let (resolver, completion) = pair();
        resolver.succeed(42);
        assert!(completion.is_ready());
        assert_eq!(completion.wait(), Ok(42));
    }

    #[test]
    fn test_resolve_from_other_thread() {
        let (resolver, completion) = pair::<String>();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.succeed("done".to_string());
        });

        assert_eq!(completion.wait(), Ok("done".to_string()));
        writer.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_returns_completion() {
        let (resolver, completion) = pair::<u8>();

        let completion = completion
            .wait_timeout(Duration::from_millis(10))
            .expect_err("nothing resolved yet");
        resolver.succeed(7);

        assert_eq!(completion.wait_timeout(Duration::from_millis(10)).ok(), Some(Ok(7)));
    }

    #[test]
    fn test_dropped_resolver_reports_stopped() {
        let (resolver, completion) = pair::<()>();
        drop(resolver);
        assert_eq!(completion.wait(), Err(QuicMuxError::SchedulerStopped));
    }

    #[test]
    fn test_failure_outcome() {
        let (resolver, completion) = pair::<()>();
        resolver.fail(QuicMuxError::NotReady);
        assert_eq!(completion.wait(), Err(QuicMuxError::NotReady));
    }

    #[test]
    fn test_ready_completion() {
        let completion = Completion::ready(Err::<(), _>(QuicMuxError::ConnectionClosed));
        assert_eq!(completion.wait(), Err(QuicMuxError::ConnectionClosed));
    }
}
