//! Call-chain identity and the per-chain disposal stacks.
//!
//! Every logical call chain owns exactly one [`DisposalStack`]. Nested intercepted
//! calls on the same chain share that stack and tell their entries apart by the
//! watermark recorded on entry, never by keeping a private stack per frame.
//!
//! A [`CallChain`] is an explicit context value threaded through calls. It holds an
//! `Rc`, so it cannot leave the thread that created it; a chain's stack is therefore
//! only ever touched by one thread and needs no locking.

use crate::config::DisposalConfig;
use crate::diagnostics::{ChainRef, notify};
use crate::error::{CleanupFailure, DisposalError};
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CHAIN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a logical call chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(u64);

impl ChainId {
    pub(crate) fn next() -> Self {
        ChainId(NEXT_CHAIN_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain#{}", self.0)
    }
}

/// Something the stack can release. Implemented by the cell behind every `ResourceHandle`.
pub(crate) trait StackEntry {
    fn name(&self) -> &str;

    /// Release the entry. Runs at most once; later calls report nothing.
    fn cleanup(&self) -> Vec<CleanupFailure>;
}

/// LIFO record of the handles registered on one chain.
pub struct DisposalStack {
    chain: ChainId,
    entries: RefCell<Vec<Rc<dyn StackEntry>>>,
    depth: Cell<usize>,
}

impl DisposalStack {
    fn new(chain: ChainId) -> Self {
        Self {
            chain,
            entries: RefCell::new(Vec::new()),
            depth: Cell::new(0),
        }
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Number of intercepted frames currently active on this chain.
    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    /// Pushes an entry and returns the new stack length.
    pub(crate) fn push(&self, entry: Rc<dyn StackEntry>) -> usize {
        let mut entries = self.entries.borrow_mut();
        entries.push(entry);
        entries.len()
    }

    /// Opens an intercepted frame and returns its watermark.
    pub(crate) fn enter(&self) -> usize {
        self.depth.set(self.depth.get() + 1);
        self.len()
    }

    /// Closes the frame opened at `watermark` and detaches every entry pushed since, in push order.
    ///
    /// The frame is closed before anything is released, so a handle registered by a
    /// cleanup hook lands in the enclosing frame.
    pub(crate) fn leave(&self, watermark: usize) -> Result<Vec<Rc<dyn StackEntry>>, DisposalError> {
        self.depth.set(self.depth.get().saturating_sub(1));
        let mut entries = self.entries.borrow_mut();
        let len = entries.len();
        if len < watermark {
            return Err(DisposalError::StackCorruption {
                chain: self.chain,
                watermark,
                len,
            });
        }
        Ok(entries.split_off(watermark))
    }

    fn drain(&self) -> Vec<Rc<dyn StackEntry>> {
        std::mem::take(&mut *self.entries.borrow_mut())
    }

    #[cfg(test)]
    pub(crate) fn truncate(&self, len: usize) {
        self.entries.borrow_mut().truncate(len);
    }
}

impl fmt::Debug for DisposalStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.borrow();
        let names: Vec<&str> = entries.iter().map(|e| e.name()).collect();
        f.debug_struct("DisposalStack")
            .field("chain", &self.chain)
            .field("depth", &self.depth.get())
            .field("entries", &names)
            .finish()
    }
}

/// Releases detached entries most-recently-pushed first.
///
/// Every entry is released before any sink callback runs. Sink panics are contained.
pub(crate) fn release_entries(chain: ChainRef<'_>, config: &DisposalConfig, entries: Vec<Rc<dyn StackEntry>>) {
    let outcomes: Vec<_> = entries
        .into_iter()
        .rev()
        .map(|entry| {
            let failures = entry.cleanup();
            (entry, failures)
        })
        .collect();

    let sink = config.sink();
    for (entry, failures) in &outcomes {
        if failures.is_empty() {
            notify(chain, "a disposal", || sink.disposed(chain, entry.name()));
        }
        for failure in failures {
            notify(chain, "a cleanup failure", || sink.cleanup_failed(chain, failure));
        }
    }
}

/// Maps each live chain on a thread to its disposal stack.
#[derive(Default)]
pub struct ScopeContext {
    stacks: RefCell<IndexMap<ChainId, Rc<DisposalStack>>>,
}

thread_local! {
    static CURRENT_CONTEXT: Rc<ScopeContext> = Rc::new(ScopeContext::new());
}

impl ScopeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The context shared by every chain created on the current thread.
    pub fn current() -> Rc<ScopeContext> {
        CURRENT_CONTEXT.with(Rc::clone)
    }

    pub fn get_or_create_stack(&self, chain: ChainId) -> Rc<DisposalStack> {
        let mut stacks = self.stacks.borrow_mut();
        let stack = stacks.entry(chain).or_insert_with(|| {
            log::trace!("{chain}: created disposal stack");
            Rc::new(DisposalStack::new(chain))
        });
        Rc::clone(stack)
    }

    pub fn stack(&self, chain: ChainId) -> Option<Rc<DisposalStack>> {
        self.stacks.borrow().get(&chain).cloned()
    }

    pub fn remove(&self, chain: ChainId) -> Option<Rc<DisposalStack>> {
        self.stacks.borrow_mut().shift_remove(&chain)
    }

    pub fn chain_count(&self) -> usize {
        self.stacks.borrow().len()
    }

    /// Chains that currently own a stack, oldest first.
    pub fn chains(&self) -> Vec<ChainId> {
        self.stacks.borrow().keys().copied().collect()
    }
}

impl fmt::Debug for ScopeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeContext").field("chains", &self.chains()).finish()
    }
}

/// One logical call chain. Pass it by reference to every call that belongs to the chain.
///
/// Dropping the chain removes its stack from the [`ScopeContext`].
///
/// A chain is bound to the thread that created it:
///
/// ```compile_fail
/// let chain = autodispose::CallChain::new();
/// std::thread::spawn(move || drop(chain));
/// ```
pub struct CallChain {
    id: ChainId,
    context: Rc<ScopeContext>,
    config: DisposalConfig,
}

impl CallChain {
    pub fn new() -> Self {
        Self::with_config(DisposalConfig::default())
    }

    pub fn with_config(config: DisposalConfig) -> Self {
        Self::in_context(ScopeContext::current(), config)
    }

    pub fn in_context(context: Rc<ScopeContext>, config: DisposalConfig) -> Self {
        let id = ChainId::next();
        log::trace!("{id}: chain started");
        Self { id, context, config }
    }

    pub fn id(&self) -> ChainId {
        self.id
    }

    pub fn config(&self) -> &DisposalConfig {
        &self.config
    }

    pub fn context(&self) -> &Rc<ScopeContext> {
        &self.context
    }

    pub(crate) fn tag(&self) -> ChainRef<'_> {
        ChainRef {
            id: self.id,
            label: self.config.label(),
        }
    }

    /// This chain's stack, created on first use.
    pub fn stack(&self) -> Rc<DisposalStack> {
        self.context.get_or_create_stack(self.id)
    }

    /// Number of handles registered and not yet released.
    pub fn pending(&self) -> usize {
        self.context.stack(self.id).map_or(0, |stack| stack.len())
    }

    pub fn depth(&self) -> usize {
        self.context.stack(self.id).map_or(0, |stack| stack.depth())
    }

    pub fn is_intercepting(&self) -> bool {
        self.depth() > 0
    }

    /// The stack, but only while at least one intercepted frame is active.
    pub(crate) fn active_stack(&self) -> Option<Rc<DisposalStack>> {
        self.context.stack(self.id).filter(|stack| stack.depth() > 0)
    }
}

impl Default for CallChain {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallChain")
            .field("id", &self.id)
            .field("label", &self.config.label())
            .field("pending", &self.pending())
            .field("depth", &self.depth())
            .finish()
    }
}

impl Drop for CallChain {
    fn drop(&mut self) {
        let Some(stack) = self.context.remove(self.id) else {
            return;
        };
        let leftovers = stack.drain();
        if !leftovers.is_empty() {
            log::warn!(
                "{}: {} handle(s) still registered when the chain ended; releasing them now",
                self.tag(),
                leftovers.len()
            );
            release_entries(self.tag(), &self.config, leftovers);
        }
        log::trace!("{}: chain ended", self.tag());
    }
}
