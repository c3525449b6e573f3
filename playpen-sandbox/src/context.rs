//! The execution context seam.
//!
//! A context hosts exactly one composite document for its whole life. It
//! can only talk to the host by posting string payloads through its
//! [`Outbox`], which stamps every payload with the context's id.

use std::fmt;

use tokio::sync::mpsc;

use crate::composite::CompositeDocument;
use crate::policy::SandboxPolicy;
use crate::SandboxError;

/// Identity of one sandbox lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// A payload as received by the host, tagged with its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub context: ContextId,
    pub payload: String,
}

/// The only channel out of a context.
#[derive(Debug, Clone)]
pub struct Outbox {
    context: ContextId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Outbox {
    pub fn new(context: ContextId, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { context, tx }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Returns false once the host has gone away.
    pub fn post(&self, payload: impl Into<String>) -> bool {
        self.tx
            .send(Envelope {
                context: self.context,
                payload: payload.into(),
            })
            .is_ok()
    }
}

/// One isolated environment that runs a composite document.
///
/// Nothing survives from one context to the next: the runner creates a
/// new context for every run and tears the old one down first.
pub trait ExecutionContext: Send {
    /// Load and start running `document`. Called once.
    fn load(&mut self, document: &CompositeDocument) -> Result<(), SandboxError>;

    /// Stop everything running in the context. After this returns the
    /// context must not post any further messages.
    fn teardown(&mut self);
}

/// Creates execution contexts under a given policy.
pub trait ContextFactory: Send + Sync {
    fn create(
        &self,
        policy: &SandboxPolicy,
        outbox: Outbox,
    ) -> Result<Box<dyn ExecutionContext>, SandboxError>;
}
