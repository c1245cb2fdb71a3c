use crate::diagnostics::{DiagnosticSink, LogSink};
use std::fmt;
use std::rc::Rc;

/// Per-chain settings: where diagnostics go and how the chain is named in them.
#[derive(Clone)]
pub struct DisposalConfig {
    sink: Rc<dyn DiagnosticSink>,
    label: Option<String>,
}

impl DisposalConfig {
    pub fn new() -> Self {
        Self {
            sink: Rc::new(LogSink),
            label: None,
        }
    }

    pub fn with_sink(mut self, sink: impl DiagnosticSink + 'static) -> Self {
        self.sink = Rc::new(sink);
        self
    }

    /// Share one sink between several chains.
    pub fn with_shared_sink(mut self, sink: Rc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn sink(&self) -> &dyn DiagnosticSink {
        self.sink.as_ref()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

impl Default for DisposalConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DisposalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisposalConfig")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}
