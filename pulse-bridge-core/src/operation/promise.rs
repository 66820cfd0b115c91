//! One-shot handoff of a result (or a cancellation) from the event-loop
//! thread to any waiting thread.
//!
//! A [`Promise`] may be cloned and handed to several callbacks racing to
//! settle it; only the first `resolve`/`cancel` has an effect. Dropping every
//! clone without settling cancels the paired [`Completion`], so a request
//! whose callbacks are discarded by the native layer never hangs its awaiter.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::FutureExt;
use parking_lot::Mutex;

use crate::models::error::Cancelled;

/// Create a connected promise/completion pair.
pub fn promise<T>() -> (Promise<T>, Completion<T>) {
    let (sender, receiver) = oneshot::channel();
    let promise = Promise {
        sender: Arc::new(Mutex::new(Some(sender))),
    };
    let completion = Completion {
        inner: Inner::Pending(receiver),
    };
    (promise, completion)
}

/// Settling side of the bridge.
pub struct Promise<T> {
    sender: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

impl<T> Promise<T> {
    /// Resolve with `value`. Returns false if already settled.
    pub fn resolve(&self, value: T) -> bool {
        match self.sender.lock().take() {
            Some(sender) => {
                // The awaiter may have given up; the promise is settled either way.
                let _ = sender.send(value);
                true
            }
            None => false,
        }
    }

    /// Resolve as cancelled. Returns false if already settled.
    pub fn cancel(&self) -> bool {
        self.sender.lock().take().is_some()
    }

    pub fn is_settled(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}

enum Inner<T> {
    Ready(Option<T>),
    Pending(oneshot::Receiver<T>),
}

/// Awaiting side of the bridge.
///
/// Resolves to `Ok(value)` or `Err(Cancelled)`. Can be awaited on any
/// executor or blocked on with [`wait`](Self::wait).
#[must_use = "a completion does nothing unless awaited or waited on"]
pub struct Completion<T> {
    inner: Inner<T>,
}

impl<T> Completion<T> {
    /// An already-resolved completion.
    pub fn ready(value: T) -> Self {
        Self {
            inner: Inner::Ready(Some(value)),
        }
    }

    /// Block the calling thread until settled.
    ///
    /// Must not be called from the event-loop thread: resolution happens
    /// there, so it would wait forever.
    pub fn wait(self) -> Result<T, Cancelled> {
        futures::executor::block_on(self)
    }

    /// Take the outcome if already settled, without blocking.
    pub fn try_wait(&mut self) -> Option<Result<T, Cancelled>> {
        match &mut self.inner {
            Inner::Ready(value) => Some(value.take().ok_or(Cancelled)),
            Inner::Pending(receiver) => match receiver.try_recv() {
                Ok(Some(value)) => Some(Ok(value)),
                Ok(None) => None,
                Err(oneshot::Canceled) => Some(Err(Cancelled)),
            },
        }
    }
}

// No field is structurally pinned: the value is moved out by `take`.
impl<T> Unpin for Completion<T> {}

impl<T> Future for Completion<T> {
    type Output = Result<T, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            Inner::Ready(value) => Poll::Ready(value.take().ok_or(Cancelled)),
            Inner::Pending(receiver) => receiver
                .poll_unpin(cx)
                .map(|result| result.map_err(|oneshot::Canceled| Cancelled)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn resolves_with_value() {
        let (promise, completion) = promise();
        assert!(promise.resolve(7));
        assert_eq!(completion.wait(), Ok(7));
    }

    #[test]
    fn cancel_resolves_as_cancelled() {
        let (promise, completion) = promise::<u32>();
        assert!(promise.cancel());
        assert_eq!(completion.wait(), Err(Cancelled));
    }

    #[test]
    fn second_settlement_is_a_no_op() {
        let (promise, completion) = promise();
        let racer = promise.clone();

        assert!(promise.resolve("info"));
        assert!(!racer.cancel());
        assert!(!racer.resolve("late"));
        assert!(racer.is_settled());

        assert_eq!(completion.wait(), Ok("info"));
    }

    #[test]
    fn cancel_first_wins_over_late_resolve() {
        let (promise, completion) = promise();
        assert!(promise.cancel());
        assert!(!promise.resolve(1));
        assert_eq!(completion.wait(), Err(Cancelled));
    }

    #[test]
    fn dropping_every_promise_cancels() {
        let (promise, completion) = promise::<()>();
        let clone = promise.clone();
        drop(promise);
        drop(clone);
        assert_eq!(completion.wait(), Err(Cancelled));
    }

    #[test]
    fn resolved_from_another_thread() {
        let (promise, completion) = promise();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            promise.resolve(String::from("ready"));
        });

        assert_eq!(completion.wait(), Ok("ready".to_string()));
        worker.join().unwrap();
    }

    #[test]
    fn try_wait_reports_pending_then_outcome() {
        let (promise, mut completion) = promise();
        assert_eq!(completion.try_wait(), None);
        promise.resolve(3);
        assert_eq!(completion.try_wait(), Some(Ok(3)));
    }

    #[test]
    fn ready_completion_is_awaitable() {
        let completion = Completion::ready(());
        assert_eq!(futures::executor::block_on(completion), Ok(()));
    }
}
