//! Debounced sandbox runner.
//!
//! One actor task owns the console bridge and the live execution context.
//! Callers talk to it through a cloneable [`SandboxHandle`]; console
//! output comes back on the event receiver returned by
//! [`SandboxRunner::spawn`].
//!
//! Lifecycle of one run:
//!
//! ```text
//!  Idle ──▸ Building ──▸ Running(ctx) ──▸ Superseded ──▸ Building …
//!                             │
//!                             └──▸ TornDown (shutdown)
//! ```
//!
//! A new run never reuses the previous context. The old one is torn down
//! before the new one is created, and the bridge stops trusting its id
//! at the same moment.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use playpen_core::BufferSet;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

use crate::bridge::{ConsoleBridge, ConsoleMessage};
use crate::composite::CompositeDocument;
use crate::context::{ContextFactory, ContextId, Envelope, ExecutionContext, Outbox};
use crate::{SandboxConfig, SandboxError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Building,
    Running(ContextId),
    /// A newer run replaced the context.
    Superseded,
    /// The runner shut down.
    TornDown,
}

/// What the console pane needs to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    /// A new run started; drop every line shown so far.
    Cleared { context: ContextId },
    Message(ConsoleMessage),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub cycles: u64,
    pub accepted: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct AtomicRunnerStats {
    cycles: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl AtomicRunnerStats {
    fn snapshot(&self) -> RunnerStats {
        RunnerStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    Schedule(BufferSet),
    RunNow(BufferSet),
    Shutdown,
}

/// Cloneable control surface of a running [`SandboxRunner`].
#[derive(Clone)]
pub struct SandboxHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<RunState>,
    stats: Arc<AtomicRunnerStats>,
}

impl SandboxHandle {
    /// Arm (or re-arm) the debounce timer with the latest buffers.
    /// Never executes before the quiet period elapses.
    pub fn schedule(&self, buffers: BufferSet) -> Result<(), SandboxError> {
        self.send(Command::Schedule(buffers))
    }

    /// Run immediately, cancelling any pending debounced run.
    pub fn run_now(&self, buffers: BufferSet) -> Result<(), SandboxError> {
        self.send(Command::RunNow(buffers))
    }

    /// Tear down the live context and stop the runner.
    pub fn shutdown(&self) -> Result<(), SandboxError> {
        self.send(Command::Shutdown)
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats.snapshot()
    }

    fn send(&self, command: Command) -> Result<(), SandboxError> {
        self.commands
            .send(command)
            .map_err(|_| SandboxError::Stopped)
    }
}

pub struct SandboxRunner {
    config: SandboxConfig,
    factory: Arc<dyn ContextFactory>,
    commands: mpsc::UnboundedReceiver<Command>,
    envelope_tx: mpsc::UnboundedSender<Envelope>,
    envelopes: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<ConsoleEvent>,
    state: watch::Sender<RunState>,
    stats: Arc<AtomicRunnerStats>,
    bridge: ConsoleBridge,
    live: Option<Box<dyn ExecutionContext>>,
    last_context: ContextId,
}

impl SandboxRunner {
    /// Validate the policy and start the runner task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        config: SandboxConfig,
        factory: Arc<dyn ContextFactory>,
    ) -> Result<(SandboxHandle, mpsc::UnboundedReceiver<ConsoleEvent>), SandboxError> {
        config.policy.validate()?;

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (envelope_tx, envelopes) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(RunState::Idle);
        let stats = Arc::new(AtomicRunnerStats::default());
        let bridge = ConsoleBridge::with_log_capacity(config.log_capacity);

        let runner = SandboxRunner {
            config,
            factory,
            commands,
            envelope_tx,
            envelopes,
            events,
            state,
            stats: stats.clone(),
            bridge,
            live: None,
            last_context: ContextId::new(0),
        };
        tokio::spawn(runner.run());

        let handle = SandboxHandle {
            commands: command_tx,
            state: state_rx,
            stats,
        };
        Ok((handle, event_rx))
    }

    async fn run(mut self) {
        let debounce = time::sleep(self.config.debounce);
        tokio::pin!(debounce);
        let mut pending: Option<BufferSet> = None;

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Schedule(buffers)) => {
                        pending = Some(buffers);
                        debounce.as_mut().reset(Instant::now() + self.config.debounce);
                    }
                    Some(Command::RunNow(buffers)) => {
                        pending = None;
                        self.execute(&buffers);
                    }
                    Some(Command::Shutdown) | None => break,
                },

                () = &mut debounce, if pending.is_some() => {
                    if let Some(buffers) = pending.take() {
                        self.execute(&buffers);
                    }
                }

                Some(envelope) = self.envelopes.recv() => self.route(&envelope),
            }
        }

        self.retire();
        self.state.send_replace(RunState::TornDown);
        log::info!("Sandbox runner stopped");
    }

    /// Tear down the live context, if any, and stop trusting it.
    fn retire(&mut self) {
        if let Some(mut context) = self.live.take() {
            context.teardown();
        }
        self.bridge.end_cycle();
    }

    fn execute(&mut self, buffers: &BufferSet) {
        if self.live.is_some() {
            self.state.send_replace(RunState::Superseded);
        }
        self.retire();

        self.state.send_replace(RunState::Building);
        let document = CompositeDocument::build(buffers);

        self.last_context = self.last_context.next();
        let id = self.last_context;
        self.bridge.begin_cycle(id);
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(ConsoleEvent::Cleared { context: id });

        match self.start(id, &document) {
            Ok(context) => {
                log::info!("Sandbox run {id} started");
                self.live = Some(context);
                self.state.send_replace(RunState::Running(id));
            }
            Err(e) => {
                log::error!("Sandbox run {id} failed to start: {e}");
                self.bridge.end_cycle();
                self.state.send_replace(RunState::Idle);
            }
        }
    }

    fn start(
        &self,
        id: ContextId,
        document: &CompositeDocument,
    ) -> Result<Box<dyn ExecutionContext>, SandboxError> {
        let outbox = Outbox::new(id, self.envelope_tx.clone());
        let mut context = self.factory.create(&self.config.policy, outbox)?;
        if let Err(e) = context.load(document) {
            context.teardown();
            return Err(e);
        }
        Ok(context)
    }

    fn route(&mut self, envelope: &Envelope) {
        match self.bridge.accept(envelope) {
            Some(message) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                let _ = self.events.send(ConsoleEvent::Message(message.clone()));
            }
            None => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Capability, SandboxPolicy};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every document it is asked to load.
    #[derive(Default)]
    struct Recorder {
        loaded: Arc<Mutex<Vec<String>>>,
    }

    struct RecordedContext {
        loaded: Arc<Mutex<Vec<String>>>,
    }

    impl ExecutionContext for RecordedContext {
        fn load(&mut self, document: &CompositeDocument) -> Result<(), SandboxError> {
            self.loaded.lock().unwrap().push(document.script().to_owned());
            Ok(())
        }

        fn teardown(&mut self) {}
    }

    impl ContextFactory for Recorder {
        fn create(
            &self,
            _policy: &SandboxPolicy,
            _outbox: Outbox,
        ) -> Result<Box<dyn ExecutionContext>, SandboxError> {
            Ok(Box::new(RecordedContext {
                loaded: self.loaded.clone(),
            }))
        }
    }

    fn buffers(js: &str) -> BufferSet {
        BufferSet::new("", "", js)
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_is_not_immediate() {
        let recorder = Recorder::default();
        let loaded = recorder.loaded.clone();
        let (handle, _events) =
            SandboxRunner::spawn(SandboxConfig::default(), Arc::new(recorder)).unwrap();

        handle.schedule(buffers("a")).unwrap();
        time::sleep(Duration::from_millis(299)).await;
        assert!(loaded.lock().unwrap().is_empty());

        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(*loaded.lock().unwrap(), ["a"]);
        assert!(matches!(handle.state(), RunState::Running(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_now_cancels_pending_schedule() {
        let recorder = Recorder::default();
        let loaded = recorder.loaded.clone();
        let (handle, _events) =
            SandboxRunner::spawn(SandboxConfig::default(), Arc::new(recorder)).unwrap();

        handle.schedule(buffers("stale")).unwrap();
        handle.run_now(buffers("now")).unwrap();
        time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*loaded.lock().unwrap(), ["now"]);
        assert_eq!(handle.stats().cycles, 1);
    }

    #[tokio::test]
    async fn test_unsafe_policy_refused() {
        let config = SandboxConfig {
            policy: SandboxPolicy::default().with(Capability::SameOrigin),
            ..SandboxConfig::default()
        };
        let result = SandboxRunner::spawn(config, Arc::new(Recorder::default()));
        assert!(matches!(result, Err(SandboxError::Policy(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_tears_down() {
        let (handle, _events) =
            SandboxRunner::spawn(SandboxConfig::default(), Arc::new(Recorder::default()))
                .unwrap();
        let mut state = handle.subscribe_state();

        handle.run_now(buffers("x")).unwrap();
        handle.shutdown().unwrap();
        state
            .wait_for(|s| *s == RunState::TornDown)
            .await
            .unwrap();

        time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            handle.run_now(buffers("y")),
            Err(SandboxError::Stopped)
        ));
    }
}
