//! # playpen-sandbox: isolated execution of the composed page
//!
//! Turns the three source buffers into one runnable document, loads it
//! into a fresh isolated execution context on a debounced schedule, and
//! relays the console output produced inside the context back to the host
//! as ordered [`ConsoleEvent`]s.
//!
//! ## Architecture
//!
//! ```text
//!  BufferSet ──schedule/run_now──▸ SandboxHandle
//!                                       │ (command channel)
//!                                       ▼
//!                                 SandboxRunner ──build──▸ CompositeDocument
//!                                       │
//!                          teardown old │ create new
//!                                       ▼
//!                              ExecutionContext ──Outbox──▸ Envelope
//!                                                              │
//!            ConsoleEvent ◂── ConsoleBridge (context check, schema) ◂┘
//! ```
//!
//! ## Modules
//!
//! - [`policy`]: named capability set applied to every context
//! - [`composite`]: document composition and console instrumentation
//! - [`bridge`]: boundary message schema and the ordered console log
//! - [`context`]: the execution context seam
//! - [`process`]: contexts backed by a jailed child process
//! - [`runner`]: debounce, lifecycle state machine, message routing

use std::time::Duration;

pub mod bridge;
pub mod composite;
pub mod context;
pub mod policy;
pub mod process;
pub mod runner;

pub use bridge::{BridgeError, BridgeMessage, ConsoleBridge, ConsoleLog, ConsoleMessage, Severity};
pub use composite::CompositeDocument;
pub use context::{ContextFactory, ContextId, Envelope, ExecutionContext, Outbox};
pub use policy::{Capability, PolicyError, SandboxPolicy};
pub use process::{Jail, ProcessContextFactory};
pub use runner::{ConsoleEvent, RunState, RunnerStats, SandboxHandle, SandboxRunner};

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Quiet period before a scheduled rebuild runs
    pub debounce: Duration,
    /// Capabilities granted to every execution context
    pub policy: SandboxPolicy,
    /// Console lines retained per run
    pub log_capacity: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            policy: SandboxPolicy::default(),
            log_capacity: bridge::DEFAULT_LOG_CAPACITY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Sandbox policy rejected: {0}")]
    Policy(#[from] PolicyError),

    #[error("Failed to start execution context: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Execution context failed: {0}")]
    Context(String),

    #[error("Sandbox runner has stopped")]
    Stopped,
}
