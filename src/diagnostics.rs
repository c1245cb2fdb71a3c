//! Pluggable diagnostic sink for swallowed cleanup failures and invariant violations.
//!
//! The library never propagates a cleanup failure to the caller of an intercepted
//! method. Instead every failure is forwarded to the chain's [`DiagnosticSink`].
//! The default sink, [`LogSink`], writes through the `log` facade so the usual
//! `RUST_LOG` filtering applies.

use crate::error::{CleanupFailure, DisposalError, FailureReason};
use crate::scope_context::ChainId;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// Identifies the chain an event belongs to, including its optional label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainRef<'a> {
    pub id: ChainId,
    pub label: Option<&'a str>,
}

impl fmt::Display for ChainRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label {
            Some(label) => write!(f, "{} ({})", self.id, label),
            None => write!(f, "{}", self.id),
        }
    }
}

pub trait DiagnosticSink {
    /// A cleanup step failed; the failure has been suppressed.
    fn cleanup_failed(&self, chain: ChainRef<'_>, failure: &CleanupFailure);

    /// An internal invariant was violated. Called before the error is returned or raised.
    fn invariant_violated(&self, chain: ChainRef<'_>, error: &DisposalError);

    /// A handle was released without any failure.
    fn disposed(&self, _chain: ChainRef<'_>, _name: &str) {}

    /// An intercepted frame finished unwinding `delta` handles above `watermark`.
    fn frame_unwound(&self, _chain: ChainRef<'_>, _watermark: usize, _delta: usize) {}
}

/// Default sink forwarding every event to the `log` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn cleanup_failed(&self, chain: ChainRef<'_>, failure: &CleanupFailure) {
        log::warn!("{chain}: {failure}; continuing with remaining handles");
    }

    fn invariant_violated(&self, chain: ChainRef<'_>, error: &DisposalError) {
        log::error!("{chain}: {error}");
    }

    fn disposed(&self, chain: ChainRef<'_>, name: &str) {
        log::debug!("{chain}: disposed '{name}'");
    }

    fn frame_unwound(&self, chain: ChainRef<'_>, watermark: usize, delta: usize) {
        log::trace!("{chain}: frame unwound, released {delta} handle(s) above watermark {watermark}");
    }
}

/// Runs one sink callback. A panicking sink is logged and otherwise ignored.
pub(crate) fn notify(chain: ChainRef<'_>, event: &str, report: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(report)) {
        let reason = FailureReason::from_panic(payload);
        log::error!("{chain}: diagnostic sink {reason} while reporting {event}");
    }
}
