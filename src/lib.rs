//! Deterministic, call-scoped disposal.
//!
//! Resources registered with a [`ResourceHandle`] while an intercepted call is running
//! are released, newest first, as soon as that call returns. This happens on every exit
//! path, a panic included. Calls are intercepted by wrapping a [`ScopeBound`] target in an
//! [`InterceptingDispatcher`]. The resources of one logical call chain live on that
//! chain's [`DisposalStack`], reached through an explicit [`CallChain`] context.
//!
//! ```
//! use autodispose::{CallChain, InterceptingDispatcher, ResourceHandle, ScopeBound};
//!
//! struct Worker;
//! impl ScopeBound for Worker {}
//!
//! let chain = CallChain::new();
//! let worker = InterceptingDispatcher::construct(&chain, |_| Worker);
//! worker.call(&chain, |_, chain| {
//!     ResourceHandle::defer(chain, || {
//!         println!("released");
//!         Ok(())
//!     })
//!     .unwrap();
//! });
//! assert_eq!(chain.pending(), 0);
//! ```

pub(crate) mod config;
pub(crate) mod diagnostics;
pub(crate) mod dispatcher;
pub(crate) mod error;
pub(crate) mod resource_handle;
pub(crate) mod scope_context;

pub use config::DisposalConfig;
pub use diagnostics::{ChainRef, DiagnosticSink, LogSink};
pub use dispatcher::{InterceptingDispatcher, Invoke, ScopeBound};
pub use error::{CleanupError, CleanupFailure, CleanupStage, DisposalError, FailureReason};
pub use resource_handle::{CleanupHook, Deferred, Disposable, HandleBuilder, NoHook, NoResource, ResourceHandle};
pub use scope_context::{CallChain, ChainId, DisposalStack, ScopeContext};
