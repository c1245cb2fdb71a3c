//! The intercepting dispatcher.
//!
//! [`InterceptingDispatcher`] wraps a [`ScopeBound`] target and sits on the path of
//! every call to it, construction included. For each call it:
//!
//! 1. records the chain's stack length as the frame watermark;
//! 2. runs the real call, catching a panic if one escapes;
//! 3. detaches every handle pushed above the watermark and releases them newest first;
//! 4. returns the call's own result, or resumes its panic.
//!
//! Cleanup never changes what the caller observes. A stack that shrank below the
//! watermark means another frame consumed entries it did not own. That is reported
//! and raised as a panic, since releasing anything further could free the wrong
//! resources.

use crate::diagnostics::notify;
use crate::scope_context::{CallChain, release_entries};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Opt-in marker for types whose instances are only reachable through an
/// [`InterceptingDispatcher`].
pub trait ScopeBound {}

/// The method invocation pipeline: run `call` against `self` on `chain`.
pub trait Invoke<C> {
    type Output;

    fn invoke(&self, chain: &CallChain, call: C) -> Self::Output;
}

pub struct InterceptingDispatcher<T> {
    target: Arc<T>,
}

impl<T> Clone for InterceptingDispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            target: Arc::clone(&self.target),
        }
    }
}

impl<T: ScopeBound> InterceptingDispatcher<T> {
    /// Constructs the target inside an intercepted frame and returns the wrapper.
    ///
    /// Handles registered while constructing are released as soon as construction returns.
    pub fn construct<F>(chain: &CallChain, ctor: F) -> Self
    where
        F: FnOnce(&CallChain) -> T,
    {
        let target = intercept(chain, Self::target_name(), "construct", || ctor(chain));
        Self { target: Arc::new(target) }
    }

    /// Like [`construct`](Self::construct) for fallible constructors. The error is
    /// returned unchanged after the frame has been unwound.
    pub fn try_construct<E, F>(chain: &CallChain, ctor: F) -> Result<Self, E>
    where
        F: FnOnce(&CallChain) -> Result<T, E>,
    {
        let target = intercept(chain, Self::target_name(), "construct", || ctor(chain))?;
        Ok(Self { target: Arc::new(target) })
    }

    /// Wraps an instance produced by other activation code.
    ///
    /// The chain's stack is created here if it does not exist yet.
    pub fn wrap(chain: &CallChain, target: T) -> Self {
        chain.stack();
        Self { target: Arc::new(target) }
    }

    /// Runs `f` against the target as one intercepted call.
    pub fn call<R, F>(&self, chain: &CallChain, f: F) -> R
    where
        F: FnOnce(&T, &CallChain) -> R,
    {
        intercept(chain, Self::target_name(), "call", || f(&self.target, chain))
    }

    pub fn target_name() -> &'static str {
        std::any::type_name::<T>()
    }

    /// Whether both wrappers refer to the same target instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.target, &other.target)
    }
}

impl<T, C> Invoke<C> for InterceptingDispatcher<T>
where
    T: ScopeBound + Invoke<C>,
{
    type Output = T::Output;

    fn invoke(&self, chain: &CallChain, call: C) -> Self::Output {
        self.call(chain, |target, chain| target.invoke(chain, call))
    }
}

impl<T> std::fmt::Debug for InterceptingDispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptingDispatcher")
            .field("target", &std::any::type_name::<T>())
            .finish()
    }
}

fn intercept<R>(chain: &CallChain, target: &str, kind: &str, f: impl FnOnce() -> R) -> R {
    let stack = chain.stack();
    let watermark = stack.enter();
    log::trace!("{}: enter {kind} on {target} (watermark {watermark}, depth {})", chain.tag(), stack.depth());

    let outcome = panic::catch_unwind(AssertUnwindSafe(f));

    let entries = match stack.leave(watermark) {
        Ok(entries) => entries,
        Err(err) => {
            notify(chain.tag(), "stack corruption", || {
                chain.config().sink().invariant_violated(chain.tag(), &err)
            });
            panic!("{err}");
        }
    };
    let delta = entries.len();
    if outcome.is_err() {
        log::debug!("{}: {kind} on {target} panicked; releasing {delta} handle(s) before resuming", chain.tag());
    }
    release_entries(chain.tag(), chain.config(), entries);
    notify(chain.tag(), "an unwound frame", || {
        chain.config().sink().frame_unwound(chain.tag(), watermark, delta)
    });

    match outcome {
        Ok(value) => value,
        Err(payload) => panic::resume_unwind(payload),
    }
}
