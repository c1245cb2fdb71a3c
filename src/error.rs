use crate::scope_context::ChainId;
use std::any::Any;
use std::fmt;

/// Error type returned by [`Disposable::dispose`](crate::Disposable::dispose) and
/// [`CleanupHook::cleanup`](crate::CleanupHook::cleanup).
pub type CleanupError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(thiserror::Error, Debug)]
pub enum DisposalError {
    #[error("resource '{name}' registered on {chain} outside of any intercepted call")]
    NoActiveScope { chain: ChainId, name: String },

    #[error("disposal stack corrupted on {chain}: length {len} fell below frame watermark {watermark}")]
    StackCorruption { chain: ChainId, watermark: usize, len: usize },

    #[error("resource '{name}' has already been disposed")]
    AlreadyDisposed { name: String },

    #[error("resource '{name}' is borrowed by an enclosing accessor")]
    HandleInUse { name: String },
}

/// Which half of a handle's cleanup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStage {
    /// Releasing the adopted [`Disposable`](crate::Disposable).
    Resource,
    /// Running the handle's [`CleanupHook`](crate::CleanupHook).
    Hook,
}

impl fmt::Display for CleanupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupStage::Resource => f.write_str("resource release"),
            CleanupStage::Hook => f.write_str("cleanup hook"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FailureReason {
    #[error("{0}")]
    Error(CleanupError),

    #[error("panicked: {0}")]
    Panic(String),
}

impl FailureReason {
    pub fn is_panic(&self) -> bool {
        matches!(self, FailureReason::Panic(_))
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        FailureReason::Panic(message)
    }
}

/// A cleanup failure that was caught and suppressed while releasing a handle.
#[derive(thiserror::Error, Debug)]
#[error("cleanup of '{name}' failed during {stage}: {reason}")]
pub struct CleanupFailure {
    pub name: String,
    pub stage: CleanupStage,
    pub reason: FailureReason,
}
