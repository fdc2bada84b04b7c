//! Threaded runtime for Stardust.
//!
//! `RuleEngine` is a synchronous processor. This module wires it to two
//! threads connected by bounded channels:
//!
//! - `stardust-scheduler` buffers change events and ready notices and
//!   flushes them on every tick.
//! - `stardust-engine` owns the engine and the committed snapshot. It
//!   processes rule operations and flushed input in arrival order and
//!   notifies listeners after every commit.
//!
//! Callers never touch engine state directly; every call is a message.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{
    bounded, never, select, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError,
};
use tracing::{debug, error, warn};

use crate::config::StardustConfig;
use crate::error::{ExecutionError, StardustError, StardustResult};
use crate::rule::{activate, Rule};
use crate::source::{ChangeEvent, ChangeSink, DataSource, MatcherFactory, SelectorMatcherFactory, SubscriptionTransport};
use crate::state::AppState;

use super::scheduler::{scheduler_loop, Input};
use super::{Outcome, RuleEngine, RuleOp};

type StateListener = Box<dyn Fn(&AppState) + Send>;
type ErrorListener = Box<dyn Fn(&StardustError) + Send>;

const CONTROL: &str = "control";

enum ControlMsg {
    Rule(RuleOp),
    RegisterSource {
        source: Arc<dyn DataSource>,
        name: Option<String>,
        reply: Sender<StardustResult<String>>,
    },
    UnregisterSource {
        name: String,
        reply: Sender<bool>,
    },
    Snapshot {
        reply: Sender<AppState>,
    },
    OnStateChange(StateListener),
    OnError(ErrorListener),
}

/// Committed state plus the callbacks that observe it.
#[derive(Default)]
struct MergeStage {
    state: AppState,
    state_listeners: Vec<StateListener>,
    error_listeners: Vec<ErrorListener>,
}

impl MergeStage {
    fn commit(&mut self, outcome: Outcome) {
        for err in &outcome.errors {
            self.report(err);
        }
        if outcome.delta.is_empty() {
            return;
        }

        self.state = self.state.apply(&outcome.delta);
        debug!(
            reason = %outcome.reason.id,
            set = outcome.delta.set.len(),
            unset = outcome.delta.unset.len(),
            "state committed"
        );

        for listener in &self.state_listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&self.state))).is_err() {
                error!("state listener panicked");
            }
        }
    }

    fn report(&self, err: &StardustError) {
        if err.is_fatal() {
            error!(error = %err, "input rejected");
        }
        for listener in &self.error_listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(err))).is_err() {
                error!("error listener panicked");
            }
        }
    }
}

fn engine_loop(mut engine: RuleEngine, control_rx: Receiver<ControlMsg>, batch_rx: Receiver<Input>) {
    let mut stage = MergeStage::default();
    let mut control_rx = control_rx;
    let mut batch_rx = batch_rx;
    let mut control_open = true;
    let mut batch_open = true;

    while control_open || batch_open {
        let mut control_closed = false;
        let mut batch_closed = false;

        select! {
            recv(control_rx) -> msg => match msg {
                Ok(ControlMsg::Rule(op)) => {
                    let rule = op.rule_name().to_string();
                    match engine.process_rule(op) {
                        Ok(outcome) => stage.commit(outcome),
                        Err(err) => {
                            warn!(rule = %rule, error = %err, "rule operation failed");
                            stage.report(&err);
                        }
                    }
                }
                Ok(ControlMsg::RegisterSource { source, name, reply }) => {
                    let _ = reply.send(engine.register_source(source, name.as_deref()));
                }
                Ok(ControlMsg::UnregisterSource { name, reply }) => {
                    let _ = reply.send(engine.unregister_source(&name));
                }
                Ok(ControlMsg::Snapshot { reply }) => {
                    let _ = reply.send(stage.state.clone());
                }
                Ok(ControlMsg::OnStateChange(listener)) => stage.state_listeners.push(listener),
                Ok(ControlMsg::OnError(listener)) => stage.error_listeners.push(listener),
                Err(_) => control_closed = true,
            },
            recv(batch_rx) -> msg => match msg {
                Ok(Input::Transactions(events)) => stage.commit(engine.process_transactions(events)),
                Ok(Input::SubReady(notice)) => stage.commit(engine.process_sub_ready(notice)),
                Err(_) => batch_closed = true,
            },
        }

        if control_closed {
            control_open = false;
            control_rx = never();
        }
        if batch_closed {
            batch_open = false;
            batch_rx = never();
        }
    }

    let released = engine.shutdown();
    debug!(unset = released.unset.len(), "engine stopped");
}

fn spawn_error(err: &std::io::Error) -> StardustError {
    StardustError::internal(format!("failed to spawn stardust thread: {err}"))
}

fn timeout_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

/// The reactive rule engine running on its own threads.
///
/// Dropping the runtime stops the scheduler (after a final flush), lets the
/// engine drain everything already queued, releases every live query and
/// subscription, and joins both threads.
pub struct Stardust {
    config: StardustConfig,
    control_tx: Sender<ControlMsg>,
    events_tx: Sender<ChangeEvent>,
    shutdown_tx: Option<Sender<()>>,
    scheduler: Option<JoinHandle<()>>,
    engine: Option<JoinHandle<()>>,
}

impl Stardust {
    /// Start a runtime using the built-in selector matcher.
    pub fn new(config: StardustConfig, transport: Arc<dyn SubscriptionTransport>) -> StardustResult<Self> {
        Self::with_matchers(config, transport, Arc::new(SelectorMatcherFactory))
    }

    /// Start a runtime with a custom matcher factory.
    pub fn with_matchers(
        config: StardustConfig,
        transport: Arc<dyn SubscriptionTransport>,
        matchers: Arc<dyn MatcherFactory>,
    ) -> StardustResult<Self> {
        let config = config.clamped();

        let (control_tx, control_rx) = bounded::<ControlMsg>(config.control_queue_capacity);
        let (events_tx, events_rx) = bounded::<ChangeEvent>(config.event_queue_capacity);
        let (batch_tx, batch_rx) = bounded::<Input>(config.batch_queue_capacity);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        // Ready callbacks fire on transport threads and must never block.
        let (ready_tx, ready_rx) = unbounded();

        let engine = RuleEngine::new(transport, matchers, ready_tx);
        let interval = config.tick();

        let scheduler = thread::Builder::new()
            .name("stardust-scheduler".to_string())
            .spawn(move || scheduler_loop(interval, events_rx, ready_rx, shutdown_rx, batch_tx))
            .map_err(|e| spawn_error(&e))?;
        let engine = thread::Builder::new()
            .name("stardust-engine".to_string())
            .spawn(move || engine_loop(engine, control_rx, batch_rx))
            .map_err(|e| spawn_error(&e))?;

        debug!(tick_ms = config.tx_buffering_ms, "stardust started");
        Ok(Self {
            config,
            control_tx,
            events_tx,
            shutdown_tx: Some(shutdown_tx),
            scheduler: Some(scheduler),
            engine: Some(engine),
        })
    }

    /// The effective (clamped) configuration.
    #[must_use]
    pub fn config(&self) -> &StardustConfig {
        &self.config
    }

    /// Validate and submit a rule. Returns the rule's name, generated when
    /// the rule had none.
    ///
    /// Validation is synchronous; activation happens on the engine thread.
    pub fn add_rule(&self, rule: Rule) -> StardustResult<String> {
        let active = activate(rule)?;
        let name = active.name().to_string();
        self.try_submit(ControlMsg::Rule(RuleOp::Add(active)))?;
        Ok(name)
    }

    /// Replace the rule called `name` with `rule`.
    pub fn change_rule(&self, name: &str, rule: Rule) -> StardustResult<()> {
        let active = activate(rule.named(name))?;
        self.try_submit(ControlMsg::Rule(RuleOp::Change {
            name: name.to_string(),
            rule: active,
        }))
    }

    /// Remove the rule called `name`, unsetting everything it set.
    pub fn remove_rule(&self, name: &str) -> StardustResult<()> {
        self.try_submit(ControlMsg::Rule(RuleOp::Remove { name: name.to_string() }))
    }

    /// Call `listener` with the full snapshot after every committed merge.
    pub fn on_app_state_change<F>(&self, listener: F) -> StardustResult<()>
    where
        F: Fn(&AppState) + Send + 'static,
    {
        self.send(ControlMsg::OnStateChange(Box::new(listener)))
    }

    /// Call `listener` with every error the engine thread reports.
    pub fn on_error<F>(&self, listener: F) -> StardustResult<()>
    where
        F: Fn(&StardustError) + Send + 'static,
    {
        self.send(ControlMsg::OnError(Box::new(listener)))
    }

    /// Register `source` and start observing its changes.
    ///
    /// The source's own name wins over `name`. Returns the registered name.
    /// If observing fails the registration is rolled back, so the name can
    /// be registered again.
    pub fn register_source(&self, source: Arc<dyn DataSource>, name: Option<&str>) -> StardustResult<String> {
        let (reply, rx) = bounded(1);
        self.send(ControlMsg::RegisterSource {
            source: Arc::clone(&source),
            name: name.map(str::to_string),
            reply,
        })?;
        let registered = rx.recv().map_err(|_| disconnected())??;

        if let Err(err) = source.observe(ChangeSink::new(registered.clone(), self.events_tx.clone())) {
            warn!(source = %registered, error = %err, "observe failed; unregistering source");
            let (reply, rx) = bounded(1);
            self.send(ControlMsg::UnregisterSource {
                name: registered,
                reply,
            })?;
            rx.recv().map_err(|_| disconnected())?;
            return Err(err.into());
        }
        debug!(source = %registered, "source observed");
        Ok(registered)
    }

    /// The latest committed snapshot.
    ///
    /// Ordered after every control message sent before it, so a rule added
    /// from this thread is reflected once activation committed.
    pub fn app_state(&self) -> StardustResult<AppState> {
        let (reply, rx) = bounded(1);
        self.send(ControlMsg::Snapshot { reply })?;
        rx.recv().map_err(|_| disconnected())
    }

    /// Like [`app_state`](Self::app_state), giving up after `timeout`.
    pub fn app_state_timeout(&self, timeout: Duration) -> StardustResult<AppState> {
        let (reply, rx) = bounded(1);
        self.send(ControlMsg::Snapshot { reply })?;
        rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ExecutionError::Timeout {
                duration_ms: timeout_ms(timeout),
            }
            .into(),
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    fn try_submit(&self, msg: ControlMsg) -> StardustResult<()> {
        match self.control_tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ExecutionError::QueueFull {
                path: CONTROL.to_string(),
                capacity: self.config.control_queue_capacity,
            }
            .into()),
            Err(TrySendError::Disconnected(_)) => Err(disconnected()),
        }
    }

    fn send(&self, msg: ControlMsg) -> StardustResult<()> {
        self.control_tx.send(msg).map_err(|_| disconnected())
    }
}

fn disconnected() -> StardustError {
    ExecutionError::Disconnected {
        path: CONTROL.to_string(),
    }
    .into()
}

impl Drop for Stardust {
    fn drop(&mut self) {
        // Scheduler first: its final flush must reach the engine before the
        // batch channel closes.
        drop(self.shutdown_tx.take());
        if let Some(handle) = self.scheduler.take() {
            let _ = handle.join();
        }

        self.control_tx = bounded::<ControlMsg>(1).0;
        if let Some(handle) = self.engine.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Stardust {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stardust")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
