//! Registration units pushed onto a chain's disposal stack.
//!
//! A [`ResourceHandle`] combines two independent cleanup behaviours:
//!
//! - an adopted external resource implementing [`Disposable`], released first;
//! - a [`CleanupHook`] for custom release logic, run second.
//!
//! Either part may fail or panic. Each failure is caught and recorded, and the other
//! part still runs. A handle registers itself on construction and is released by
//! the intercepting dispatcher when the frame that created it returns.

use crate::diagnostics::notify;
use crate::error::{CleanupError, CleanupFailure, CleanupStage, DisposalError, FailureReason};
use crate::scope_context::{CallChain, ChainId, StackEntry};
use std::any::TypeId;
use std::cell::RefCell;
use std::fmt;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

/// An external resource that must be released explicitly.
pub trait Disposable {
    fn dispose(&mut self) -> Result<(), CleanupError>;
}

impl<T: Disposable + ?Sized> Disposable for Box<T> {
    fn dispose(&mut self) -> Result<(), CleanupError> {
        (**self).dispose()
    }
}

/// Flushes and syncs the file so write-back errors surface here instead of being
/// lost when the descriptor is closed.
impl Disposable for std::fs::File {
    fn dispose(&mut self) -> Result<(), CleanupError> {
        self.flush()?;
        self.sync_all()?;
        Ok(())
    }
}

impl<W: Write> Disposable for std::io::BufWriter<W> {
    fn dispose(&mut self) -> Result<(), CleanupError> {
        self.flush()?;
        Ok(())
    }
}

/// Custom release logic attached to a handle. The default does nothing.
pub trait CleanupHook {
    fn cleanup(&mut self) -> Result<(), CleanupError> {
        Ok(())
    }
}

/// Placeholder for handles that do not adopt an external resource.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NoResource;

impl Disposable for NoResource {
    fn dispose(&mut self) -> Result<(), CleanupError> {
        Ok(())
    }
}

/// Placeholder for handles without custom cleanup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NoHook;

impl CleanupHook for NoHook {}

/// A closure run once when its handle is released.
pub struct Deferred<F>(Option<F>);

impl<F> Deferred<F>
where
    F: FnOnce() -> Result<(), CleanupError>,
{
    pub fn new(f: F) -> Self {
        Deferred(Some(f))
    }
}

impl<F> CleanupHook for Deferred<F>
where
    F: FnOnce() -> Result<(), CleanupError>,
{
    fn cleanup(&mut self) -> Result<(), CleanupError> {
        match self.0.take() {
            Some(f) => f(),
            None => Ok(()),
        }
    }
}

impl<F> fmt::Debug for Deferred<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Deferred").field(&self.0.is_some()).finish()
    }
}

struct Parts<D, H> {
    resource: D,
    hook: H,
}

/// State shared between the caller's handle and the stack entry.
struct HandleCell<D, H> {
    name: String,
    chain: ChainId,
    parts: RefCell<Option<Parts<D, H>>>,
}

fn guarded(step: impl FnOnce() -> Result<(), CleanupError>) -> Result<(), FailureReason> {
    match panic::catch_unwind(AssertUnwindSafe(step)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(FailureReason::Error(err)),
        Err(payload) => Err(FailureReason::from_panic(payload)),
    }
}

impl<D, H> HandleCell<D, H> {
    fn in_use(&self) -> DisposalError {
        DisposalError::HandleInUse {
            name: self.name.clone(),
        }
    }
}

impl<D: Disposable, H: CleanupHook> StackEntry for HandleCell<D, H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn cleanup(&self) -> Vec<CleanupFailure> {
        let taken = match self.parts.try_borrow_mut() {
            Ok(mut parts) => parts.take(),
            Err(_) => {
                return vec![CleanupFailure {
                    name: self.name.clone(),
                    stage: CleanupStage::Resource,
                    reason: FailureReason::Error(Box::new(self.in_use())),
                }];
            }
        };
        let Some(Parts { mut resource, mut hook }) = taken else {
            return Vec::new();
        };

        let mut failures = Vec::new();
        let released = guarded(move || {
            let result = resource.dispose();
            drop(resource);
            result
        });
        if let Err(reason) = released {
            failures.push(CleanupFailure {
                name: self.name.clone(),
                stage: CleanupStage::Resource,
                reason,
            });
        }

        let hooked = guarded(move || {
            let result = hook.cleanup();
            drop(hook);
            result
        });
        if let Err(reason) = hooked {
            failures.push(CleanupFailure {
                name: self.name.clone(),
                stage: CleanupStage::Hook,
                reason,
            });
        }
        failures
    }
}

/// A resource enlisted for release when the current intercepted call returns.
///
/// Handles are not `Clone`; the stack holds the only other reference and drops it
/// after cleanup.
pub struct ResourceHandle<D = NoResource, H = NoHook> {
    cell: Rc<HandleCell<D, H>>,
}

impl ResourceHandle {
    /// Registers a handle with neither a resource nor a hook. Useful as a marker.
    pub fn register(chain: &CallChain) -> Result<Self, DisposalError> {
        HandleBuilder::new().register(chain)
    }
}

impl<D: Disposable + 'static> ResourceHandle<D> {
    /// Takes ownership of `resource` and releases it when the frame returns.
    pub fn adopt(chain: &CallChain, resource: D) -> Result<Self, DisposalError> {
        HandleBuilder::new().resource(resource).register(chain)
    }
}

impl<H: CleanupHook + 'static> ResourceHandle<NoResource, H> {
    pub fn with_cleanup(chain: &CallChain, hook: H) -> Result<Self, DisposalError> {
        HandleBuilder::new().on_cleanup(hook).register(chain)
    }
}

impl<F> ResourceHandle<NoResource, Deferred<F>>
where
    F: FnOnce() -> Result<(), CleanupError> + 'static,
{
    pub fn defer(chain: &CallChain, f: F) -> Result<Self, DisposalError> {
        HandleBuilder::new().name("deferred").on_cleanup(Deferred::new(f)).register(chain)
    }
}

impl<D, H> ResourceHandle<D, H>
where
    D: Disposable,
    H: CleanupHook,
{
    pub fn name(&self) -> &str {
        &self.cell.name
    }

    pub fn chain(&self) -> ChainId {
        self.cell.chain
    }

    /// A handle that is currently borrowed by one of the accessors below still holds
    /// its parts, so it reports `false`.
    pub fn is_disposed(&self) -> bool {
        self.cell.parts.try_borrow().is_ok_and(|parts| parts.is_none())
    }

    /// Borrows the adopted resource.
    ///
    /// Accessors may nest shared borrows. Any accessor that needs the handle
    /// mutably while another borrow is live, including [`dispose_now`](Self::dispose_now),
    /// fails with [`DisposalError::HandleInUse`].
    pub fn with<R>(&self, f: impl FnOnce(&D) -> R) -> Result<R, DisposalError> {
        let parts = self.cell.parts.try_borrow().map_err(|_| self.cell.in_use())?;
        match &*parts {
            Some(parts) => Ok(f(&parts.resource)),
            None => Err(self.already_disposed()),
        }
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut D) -> R) -> Result<R, DisposalError> {
        let mut parts = self.cell.parts.try_borrow_mut().map_err(|_| self.cell.in_use())?;
        match &mut *parts {
            Some(parts) => Ok(f(&mut parts.resource)),
            None => Err(self.already_disposed()),
        }
    }

    pub fn with_hook<R>(&self, f: impl FnOnce(&mut H) -> R) -> Result<R, DisposalError> {
        let mut parts = self.cell.parts.try_borrow_mut().map_err(|_| self.cell.in_use())?;
        match &mut *parts {
            Some(parts) => Ok(f(&mut parts.hook)),
            None => Err(self.already_disposed()),
        }
    }

    /// Releases the handle now instead of at frame exit.
    ///
    /// The stack entry stays in place and does nothing when its frame unwinds.
    /// Failures are returned to the caller rather than sent to the diagnostic sink.
    pub fn dispose_now(&self) -> Result<Vec<CleanupFailure>, DisposalError> {
        // Checked up front so a busy handle is an error, not a recorded failure.
        drop(self.cell.parts.try_borrow_mut().map_err(|_| self.cell.in_use())?);
        log::debug!("{}: '{}' disposed early", self.cell.chain, self.cell.name);
        Ok(self.cell.cleanup())
    }

    fn already_disposed(&self) -> DisposalError {
        DisposalError::AlreadyDisposed {
            name: self.cell.name.clone(),
        }
    }
}

impl<D, H> fmt::Debug for ResourceHandle<D, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("name", &self.cell.name)
            .field("chain", &self.cell.chain)
            .field("disposed", &self.cell.parts.try_borrow().is_ok_and(|parts| parts.is_none()))
            .finish()
    }
}

/// Builds a [`ResourceHandle`] with any combination of resource, hook and name.
pub struct HandleBuilder<D = NoResource, H = NoHook> {
    name: Option<String>,
    resource: D,
    hook: H,
}

impl HandleBuilder {
    pub fn new() -> Self {
        HandleBuilder {
            name: None,
            resource: NoResource,
            hook: NoHook,
        }
    }
}

impl Default for HandleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, H> HandleBuilder<D, H>
where
    D: Disposable + 'static,
    H: CleanupHook + 'static,
{
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn resource<R: Disposable + 'static>(self, resource: R) -> HandleBuilder<R, H> {
        HandleBuilder {
            name: self.name,
            resource,
            hook: self.hook,
        }
    }

    pub fn on_cleanup<K: CleanupHook + 'static>(self, hook: K) -> HandleBuilder<D, K> {
        HandleBuilder {
            name: self.name,
            resource: self.resource,
            hook,
        }
    }

    /// Pushes the handle onto the chain's stack.
    ///
    /// Fails with [`DisposalError::NoActiveScope`] when no intercepted call is active
    /// on `chain`: such a handle would never be released.
    pub fn register(self, chain: &CallChain) -> Result<ResourceHandle<D, H>, DisposalError> {
        let name = self.name.unwrap_or_else(default_name::<D, H>);
        let Some(stack) = chain.active_stack() else {
            let err = DisposalError::NoActiveScope { chain: chain.id(), name };
            notify(chain.tag(), "a registration outside any frame", || {
                chain.config().sink().invariant_violated(chain.tag(), &err)
            });
            return Err(err);
        };

        let cell = Rc::new(HandleCell {
            name,
            chain: chain.id(),
            parts: RefCell::new(Some(Parts {
                resource: self.resource,
                hook: self.hook,
            })),
        });
        let entry: Rc<dyn StackEntry> = cell.clone();
        let len = stack.push(entry);
        log::trace!("{}: registered '{}' (stack length {len}, depth {})", chain.tag(), cell.name, stack.depth());
        Ok(ResourceHandle { cell })
    }
}

fn default_name<D: 'static, H: 'static>() -> String {
    if TypeId::of::<D>() != TypeId::of::<NoResource>() {
        std::any::type_name::<D>().to_string()
    } else if TypeId::of::<H>() != TypeId::of::<NoHook>() {
        std::any::type_name::<H>().to_string()
    } else {
        "resource".to_string()
    }
}
