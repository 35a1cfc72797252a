//! Per-call context handed to instrumented handlers, publishers and subscribers.
//!
//! A context carries optional transport metadata (the operation or route template plus the
//! method) and a cancellation signal. Missing metadata is a normal condition: internal calls
//! simply have none, and instrumentation skips recording for them.

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMetadata {
    /// Route template ("/users/{id}") or RPC operation ("/pkg.Service/Method").
    pub operation: String,
    pub method: String,
}

impl CallMetadata {
    pub fn new(operation: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            method: method.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallContext {
    metadata: Option<CallMetadata>,
    cancellation: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, metadata: CallMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// A context that is cancelled together with `self` but can also be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            metadata: self.metadata.clone(),
            cancellation: self.cancellation.child_token(),
        }
    }

    pub fn metadata(&self) -> Option<&CallMetadata> {
        self.metadata.as_ref()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }
}
