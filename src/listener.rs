//! First-accept listener decoration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum_server::accept::Accept;

type Callback = Box<dyn Fn() + Send + Sync>;

/// Acceptor decorator that fires a callback exactly once, on the first
/// accepted connection, before delegating to the wrapped acceptor.
///
/// Entering the serve loop does not prove the socket is reachable; the
/// first accepted peer does. The orchestrator hangs its
/// `Starting` → `Ready` transition off this hook.
///
/// The single-fire guard is an atomic flag local to the wrapper, shared by
/// all clones the serve loop makes of it.
#[derive(Clone)]
pub struct FirstAccept<A> {
    inner: A,
    hook: Arc<Hook>,
}

struct Hook {
    fired: AtomicBool,
    callback: Callback,
}

impl<A> FirstAccept<A> {
    /// Wrap `inner`, arranging for `callback` to run once before the first
    /// delegated accept.
    pub fn new(inner: A, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner,
            hook: Arc::new(Hook {
                fired: AtomicBool::new(false),
                callback: Box::new(callback),
            }),
        }
    }
}

impl<A, I, S> Accept<I, S> for FirstAccept<A>
where
    A: Accept<I, S>,
{
    type Stream = A::Stream;
    type Service = A::Service;
    type Future = A::Future;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        if !self.hook.fired.swap(true, Ordering::AcqRel) {
            (self.hook.callback)();
        }
        self.inner.accept(stream, service)
    }
}
