//! Cancel token returned by every subscription and scheduling call

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type CancelFn = Box<dyn FnOnce() + Send>;

/// An opaque, cloneable cancel token
///
/// `cancel()` is idempotent: the registered teardown runs at most once no
/// matter how many clones call it, and it is safe to call from inside the
/// callback the handle guards. Dropping a handle does not cancel it.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: AtomicBool,
    on_cancel: Mutex<Option<CancelFn>>,
}

impl CancelHandle {
    /// Create a handle that runs `on_cancel` the first time it is cancelled
    pub fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                on_cancel: Mutex::new(Some(Box::new(on_cancel))),
            }),
        }
    }

    /// A handle with nothing to tear down
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Cancel the subscription
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let on_cancel = self.inner.on_cancel.lock().take();
        if let Some(on_cancel) = on_cancel {
            on_cancel();
        }
    }

    /// Whether `cancel()` has been called on this handle or a clone of it
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = CancelHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let clone = handle.clone();
        handle.cancel();
        clone.cancel();
        handle.cancel();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_cancel_from_inside_teardown_is_noop() {
        let slot: Arc<Mutex<Option<CancelHandle>>> = Arc::new(Mutex::new(None));
        let inner_slot = slot.clone();
        let handle = CancelHandle::new(move || {
            if let Some(me) = inner_slot.lock().clone() {
                me.cancel();
            }
        });
        *slot.lock() = Some(handle.clone());

        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
