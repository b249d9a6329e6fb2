//! Cancellation tokens: [`AbortController`] and [`AbortSignal`].
//!
//! A signal starts un-aborted and can be aborted exactly once. Interested
//! parties either *observe* it (register a one-shot callback) or *follow* it
//! (derive a dependent signal that aborts whenever the source aborts). The
//! dependency is one-way: aborting a follower never touches its source. A
//! follower that is dropped before its source aborts unregisters itself.
//!
//! Async code can also await [`AbortSignal::cancelled`], which is backed by a
//! `tokio_util` [`CancellationToken`].

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

type Observer = Box<dyn FnOnce() + Send>;

/// Identifies a registered observer so it can be removed again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
struct Observers {
    aborted: bool,
    next_id: u64,
    callbacks: Vec<(u64, Observer)>,
}

struct SignalInner {
    token: CancellationToken,
    observers: Mutex<Observers>,
    /// Set on followers: the observer they hold on their source
    source: Mutex<Option<(Weak<SignalInner>, ObserverId)>>,
}

impl Drop for SignalInner {
    fn drop(&mut self) {
        if let Some((source, id)) = self.source.get_mut().take() {
            if let Some(inner) = source.upgrade() {
                AbortSignal { inner }.remove_observer(id);
            }
        }
    }
}

/// A cancellation token shared between a fetch and everything it spawned.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

impl AbortSignal {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                token: CancellationToken::new(),
                observers: Mutex::new(Observers::default()),
                source: Mutex::new(None),
            }),
        }
    }

    /// Returns a signal that is already aborted.
    pub fn aborted() -> Self {
        let signal = Self::new();
        signal.trigger();
        signal
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.observers.lock().aborted
    }

    /// Registers a one-shot callback that runs when the signal aborts.
    ///
    /// When the signal has already been aborted the callback runs immediately.
    pub fn observe(&self, f: impl FnOnce() + Send + 'static) -> ObserverId {
        let mut observers = self.inner.observers.lock();
        let id = observers.next_id;
        observers.next_id += 1;

        if observers.aborted {
            drop(observers);
            f();
        } else {
            observers.callbacks.push((id, Box::new(f)));
        }

        ObserverId(id)
    }

    /// Unregisters an observer. Unknown or already fired ids are ignored.
    pub fn remove_observer(&self, id: ObserverId) {
        let removed = {
            let mut observers = self.inner.observers.lock();
            observers
                .callbacks
                .iter()
                .position(|(cb_id, _)| *cb_id == id.0)
                .map(|idx| observers.callbacks.remove(idx))
        };
        // Dropping a callback can drop a follower, which locks its source
        drop(removed);
    }

    /// Derives a new signal that aborts when this one aborts (and only then).
    ///
    /// The source only holds a weak reference to the follower, and dropping
    /// the last handle of the follower removes its observer from the source.
    pub fn follow(&self) -> AbortSignal {
        let follower = AbortSignal::new();
        let target = Arc::downgrade(&follower.inner);
        let id = self.observe(move || {
            if let Some(inner) = target.upgrade() {
                AbortSignal { inner }.trigger();
            }
        });
        *follower.inner.source.lock() = Some((Arc::downgrade(&self.inner), id));
        follower
    }

    /// Number of callbacks still waiting for this signal to abort.
    pub(crate) fn observer_count(&self) -> usize {
        self.inner.observers.lock().callbacks.len()
    }

    /// Resolves once the signal is aborted.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Aborts the signal. Returns false when it was already aborted.
    fn trigger(&self) -> bool {
        let callbacks = {
            let mut observers = self.inner.observers.lock();
            if observers.aborted {
                return false;
            }
            observers.aborted = true;
            std::mem::take(&mut observers.callbacks)
        };

        self.inner.token.cancel();

        // Observers may re-enter the signal, so they run without the lock held
        for (_, cb) in callbacks {
            cb();
        }

        true
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

/// Owner side of an [`AbortSignal`].
#[derive(Debug, Clone)]
pub struct AbortController {
    signal: AbortSignal,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Aborts the controlled signal. Aborting twice is a no-op.
    pub fn abort(&self) {
        if self.signal.trigger() {
            log::trace!("AbortController: signal aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn observers_fire_once_in_registration_order() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            signal.observe(move || order.lock().push(i));
        }

        controller.abort();
        controller.abort();

        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert!(signal.is_aborted());
    }

    #[test]
    fn observing_an_aborted_signal_runs_immediately() {
        let signal = AbortSignal::aborted();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        signal.observe(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_observers_do_not_fire() {
        let controller = AbortController::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = controller.signal().observe(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        controller.signal().remove_observer(id);
        controller.abort();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn followers_abort_with_their_source_but_never_the_reverse() {
        let source = AbortController::new();
        let follower = source.signal().follow();
        let grandchild = follower.follow();

        // Aborting a follower does not propagate upwards
        let other_source = AbortController::new();
        let other_follower = other_source.signal().follow();
        other_follower.trigger();
        assert!(!other_source.signal().is_aborted());

        assert!(!follower.is_aborted());
        source.abort();
        assert!(follower.is_aborted());
        assert!(grandchild.is_aborted());
    }

    #[test]
    fn dropped_followers_unregister_from_their_source() {
        let controller = AbortController::new();
        let source = controller.signal();

        let followers: Vec<_> = (0..10).map(|_| source.follow()).collect();
        let grandchild = followers[0].follow();
        assert_eq!(source.observer_count(), 10);
        assert_eq!(followers[0].observer_count(), 1);

        drop(grandchild);
        assert_eq!(followers[0].observer_count(), 0);

        // Clones keep the follower registered until the last one goes
        let kept = followers[3].clone();
        drop(followers);
        assert_eq!(source.observer_count(), 1);

        controller.abort();
        assert!(kept.is_aborted());
        drop(kept);
        assert_eq!(source.observer_count(), 0);
    }

    #[test]
    fn following_an_aborted_signal_is_aborted() {
        let follower = AbortSignal::aborted().follow();
        assert!(follower.is_aborted());
    }

    #[tokio::test]
    async fn cancelled_resolves_after_abort() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let waiter = tokio::spawn(async move { signal.cancelled().await });
        controller.abort();
        waiter.await.unwrap();
    }
}
