//! Session state machine.
//!
//! One engine thread owns the interactive channel and all session state. It
//! receives channel output, externally submitted input and abort requests on
//! a single queue, so every mutation happens in one sequence:
//!
//! ```text
//! Connecting → Running ⇄ AwaitingUserInput
//!                 ↓
//!              Closing → Done
//! ```
//!
//! Each chunk of output is appended to the bounded tail held by the
//! `OutputDetector` and the tail window is classified. A shell-ready prompt
//! (after the exit marker, when markers are on) finalizes the step in flight
//! and dispatches the next one. Application prompts are answered from the
//! step's configured inputs or surfaced to the caller. A periodic tick drives
//! the quiet-period checks, the inactivity watchdog, the prompt-wait limit
//! and the close timeout.

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::detector::{DetectorConfig, OutputDetector, Quiet};
use crate::error::EngineError;
use crate::events::{EventFeed, EventHub, PromptEvent, SessionEvent, SessionObserver};
use crate::prompt::{Classification, PromptClassifier, PromptKind, last_line, strip_ansi};
use crate::results::{PadReason, StepOutcome, StepResult, finalize_with, summarize};
use crate::sequencer::{
    CommandPlanner, FailurePolicy, extract_marked_output, extract_plain_output, find_begin_marker,
    find_exit_marker, is_session_exit, plan_commands, should_continue_after_step,
};
use crate::step::{Step, validate_steps};
use crate::transport::{ChannelEvent, ChannelWriter, Connection, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Connecting,
    Running,
    AwaitingUserInput,
    Closing,
    Done,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::AwaitingUserInput => "awaiting-user-input",
            Self::Closing => "closing",
            Self::Done => "done",
        };
        f.write_str(label)
    }
}

/// Timing and buffering knobs for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Silence while a command is in flight before it is interrupted.
    pub inactivity_timeout: Duration,
    /// How long a surfaced prompt may wait for an answer.
    pub prompt_wait_timeout: Duration,
    /// Quiet period before free-text prompts and completion markers count.
    pub prompt_settle: Duration,
    pub tail_buffer_bytes: usize,
    pub max_step_output_bytes: usize,
    /// Wrap commands so their exit status is reported on the channel.
    pub exit_markers: bool,
    pub close_timeout: Duration,
    pub tick_interval: Duration,
    pub event_history: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(30),
            prompt_wait_timeout: Duration::from_secs(600),
            prompt_settle: Duration::from_millis(1500),
            tail_buffer_bytes: 8 * 1024,
            max_step_output_bytes: 1024 * 1024,
            exit_markers: true,
            close_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(100),
            event_history: crate::events::DEFAULT_HISTORY,
        }
    }
}

enum Inbound {
    Channel(ChannelEvent),
    UserInput(String),
    Abort,
}

/// State shared between the engine thread and handles.
#[derive(Debug)]
struct ControlState {
    status: SessionStatus,
    prompt: Option<PromptEvent>,
}

type Control = Arc<Mutex<ControlState>>;

fn lock(control: &Control) -> std::sync::MutexGuard<'_, ControlState> {
    control.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Configures and starts a session.
pub struct SessionBuilder {
    steps: Vec<Step>,
    project_root: Option<String>,
    config: SessionConfig,
    classifier: Option<PromptClassifier>,
    observers: Vec<Box<dyn SessionObserver>>,
    session_id: Option<String>,
}

impl SessionBuilder {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            project_root: None,
            config: SessionConfig::default(),
            classifier: None,
            observers: Vec::new(),
            session_id: None,
        }
    }

    /// Remote directory the first command changes into.
    pub fn project_root(mut self, root: impl Into<String>) -> Self {
        self.project_root = Some(root.into());
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn classifier(mut self, classifier: PromptClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn observer(mut self, observer: impl SessionObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Validate the steps, connect, open the interactive channel and start
    /// the engine thread.
    ///
    /// Fails without attempting any step on validation, connection or
    /// channel errors.
    pub fn start(self, transport: &dyn Transport) -> Result<SessionHandle, EngineError> {
        validate_steps(&self.steps)?;
        plan_commands(&self.steps, self.project_root.as_deref(), self.config.exit_markers)?;

        let id = self
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let feed = EventFeed::new(self.config.event_history);
        let mut hub = EventHub::new(self.observers, feed.clone());
        let control: Control = Arc::new(Mutex::new(ControlState {
            status: SessionStatus::Connecting,
            prompt: None,
        }));
        hub.emit(SessionEvent::StatusChanged {
            status: SessionStatus::Connecting,
        });

        info!(session = %id, transport = %transport.name(), steps = self.steps.len(), "connecting");
        let mut connection = transport.connect()?;
        let channel = match connection.open_shell() {
            Ok(channel) => channel,
            Err(e) => {
                connection.disconnect();
                return Err(e);
            }
        };

        let (inbound_tx, inbound_rx) = mpsc::channel();
        let forward_tx = inbound_tx.clone();
        let channel_events = channel.events;
        thread::Builder::new()
            .name("shellrun-channel".to_string())
            .spawn(move || {
                for event in channel_events {
                    if forward_tx.send(Inbound::Channel(event)).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| EngineError::Channel(format!("failed to start channel reader: {e}")))?;

        let classifier = self.classifier.unwrap_or_default();
        let detector = OutputDetector::new(DetectorConfig {
            tail_bytes: self.config.tail_buffer_bytes,
            prompt_settle: self.config.prompt_settle,
            inactivity_timeout: self.config.inactivity_timeout,
        });
        let engine = Engine {
            id: id.clone(),
            planner: CommandPlanner::new(self.project_root, self.config.exit_markers),
            steps: self.steps,
            config: self.config,
            classifier,
            hub,
            control: Arc::clone(&control),
            writer: channel.writer,
            connection,
            inbound: inbound_rx,
            detector,
            status: SessionStatus::Connecting,
            pending: Vec::new(),
            next_index: 0,
            in_flight: None,
            ready_seen: false,
            recovering: false,
            awaiting_since: None,
            last_auto_answer: None,
            surfaced_prompt: None,
            pad_reason: PadReason::NotExecuted,
            close_started: None,
            fatal: None,
            utf8_carry: Vec::new(),
        };

        let join = thread::Builder::new()
            .name(format!("shellrun-session-{}", id.chars().take(8).collect::<String>()))
            .spawn(move || engine.run())
            .map_err(|e| EngineError::Channel(format!("failed to start session engine: {e}")))?;

        Ok(SessionHandle {
            id,
            control,
            inbound: inbound_tx,
            feed,
            join: Some(join),
        })
    }
}

/// Start a session with default settings.
pub fn start_session(
    transport: &dyn Transport,
    project_root: Option<&str>,
    steps: Vec<Step>,
) -> Result<SessionHandle, EngineError> {
    let mut builder = SessionBuilder::new(steps);
    if let Some(root) = project_root {
        builder = builder.project_root(root);
    }
    builder.start(transport)
}

/// Caller-side view of a running session.
pub struct SessionHandle {
    id: String,
    control: Control,
    inbound: Sender<Inbound>,
    feed: EventFeed,
    join: Option<JoinHandle<Result<Vec<StepResult>, EngineError>>>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.control).status
    }

    /// The prompt currently waiting for an answer, if any.
    pub fn pending_prompt(&self) -> Option<PromptEvent> {
        lock(&self.control).prompt.clone()
    }

    /// Answer the outstanding prompt. Returns false when no prompt is
    /// outstanding; only one submission is accepted per prompt.
    pub fn submit_input(&self, text: &str) -> bool {
        let mut control = lock(&self.control);
        if control.prompt.take().is_none() {
            return false;
        }
        self.inbound.send(Inbound::UserInput(text.to_string())).is_ok()
    }

    /// Request cancellation. Safe to call at any time, including while a
    /// prompt is outstanding.
    pub fn abort(&self) {
        let _ = self.inbound.send(Inbound::Abort);
    }

    /// Cloneable handle that can only abort, for signal handlers.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            inbound: self.inbound.clone(),
        }
    }

    /// Events so far (bounded), then live events until the session ends.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.feed.subscribe()
    }

    /// Block until the session is done and return one result per step.
    pub fn wait(mut self) -> Result<Vec<StepResult>, EngineError> {
        let Some(join) = self.join.take() else {
            return Err(EngineError::EngineStopped("already joined".to_string()));
        };
        join.join()
            .map_err(|_| EngineError::EngineStopped("engine thread panicked".to_string()))?
    }
}

#[derive(Clone)]
pub struct AbortHandle {
    inbound: Sender<Inbound>,
}

impl AbortHandle {
    pub fn abort(&self) {
        let _ = self.inbound.send(Inbound::Abort);
    }
}

struct InFlight {
    index: usize,
    started: Instant,
    output: String,
    truncated: bool,
    expects_marker: bool,
    begun: bool,
    marker: Option<i32>,
}

struct Engine {
    id: String,
    steps: Vec<Step>,
    config: SessionConfig,
    classifier: PromptClassifier,
    planner: CommandPlanner,
    hub: EventHub,
    control: Control,
    writer: Box<dyn ChannelWriter>,
    connection: Box<dyn Connection>,
    inbound: Receiver<Inbound>,
    detector: OutputDetector,
    status: SessionStatus,
    pending: Vec<StepResult>,
    next_index: usize,
    in_flight: Option<InFlight>,
    /// The shell has been ready at least once.
    ready_seen: bool,
    /// Waiting for the shell to come back after an interrupted step.
    recovering: bool,
    awaiting_since: Option<Instant>,
    /// Last line of the prompt most recently answered from step inputs.
    last_auto_answer: Option<String>,
    /// Last line of the prompt waiting for external input.
    surfaced_prompt: Option<String>,
    pad_reason: PadReason,
    close_started: Option<Instant>,
    fatal: Option<EngineError>,
    utf8_carry: Vec<u8>,
}

impl Engine {
    fn run(mut self) -> Result<Vec<StepResult>, EngineError> {
        self.set_status(SessionStatus::Running);
        if self.steps.is_empty() {
            self.begin_closing();
        }

        while self.status != SessionStatus::Done {
            match self.inbound.recv_timeout(self.config.tick_interval) {
                Ok(Inbound::Channel(ChannelEvent::Data(bytes))) => self.on_data(&bytes),
                Ok(Inbound::Channel(ChannelEvent::Closed)) => self.on_closed(None),
                Ok(Inbound::Channel(ChannelEvent::Error(e))) => self.on_closed(Some(e)),
                Ok(Inbound::UserInput(text)) => self.on_user_input(&text),
                Ok(Inbound::Abort) => self.on_abort(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.on_closed(Some("event stream ended".to_string()))
                }
            }
            if self.status != SessionStatus::Done {
                self.tick(Instant::now());
            }
        }

        self.finish()
    }

    fn finish(mut self) -> Result<Vec<StepResult>, EngineError> {
        self.writer.close();
        self.connection.disconnect();

        let results = finalize_with(&self.pending, &self.steps, self.pad_reason);
        let summary = summarize(&results);
        info!(
            session = %self.id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            not_executed = summary.not_executed,
            cancelled = summary.cancelled,
            "session finished"
        );
        self.hub.emit(SessionEvent::SessionEnded { summary });
        self.hub.close();

        match self.fatal.take() {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status == status {
            return;
        }
        debug!(session = %self.id, from = %self.status, to = %status, "status change");
        self.status = status;
        {
            let mut control = lock(&self.control);
            control.status = status;
            if status != SessionStatus::AwaitingUserInput {
                control.prompt = None;
            }
        }
        if status != SessionStatus::AwaitingUserInput {
            self.surfaced_prompt = None;
        }
        self.hub.emit(SessionEvent::StatusChanged { status });
    }

    fn current_step_name(&self) -> Option<String> {
        self.in_flight
            .as_ref()
            .map(|flight| self.steps[flight.index].name.clone())
    }

    // ── channel input ──

    fn on_data(&mut self, bytes: &[u8]) {
        let text = decode_utf8(&mut self.utf8_carry, bytes);
        if text.is_empty() {
            return;
        }
        self.hub.emit(SessionEvent::Output {
            step: self.current_step_name(),
            chunk: text.clone(),
        });

        let clean = strip_ansi(&text);
        let limit = self.config.max_step_output_bytes;
        if let Some(flight) = self.in_flight.as_mut() {
            append_bounded(&mut flight.output, &mut flight.truncated, &clean, limit);
        }
        self.detector.on_output(&clean);

        match self.status {
            SessionStatus::Running => self.evaluate(false),
            SessionStatus::AwaitingUserInput if !clean.is_empty() => self.reconsider_prompt(),
            _ => {}
        }
    }

    /// Classify the tail window and act on it. `settled` is true when the
    /// output has been quiet for the settle period.
    fn evaluate(&mut self, settled: bool) {
        if self.detector.window().is_none() {
            return;
        }
        self.consume_markers();

        let Some(window) = self.detector.window().map(str::to_string) else {
            return;
        };
        match self.classifier.classify(&window) {
            Classification::ApplicationPrompt { kind, text } => {
                if kind.is_explicit() || settled {
                    self.handle_prompt(kind, text);
                }
            }
            Classification::ShellReady => {
                if self.marker_satisfied() {
                    self.on_ready();
                }
            }
            Classification::NaturalCompletion => {
                if settled {
                    self.on_natural_completion();
                }
            }
            Classification::None => {
                if settled && self.settle_means_ready(&window) {
                    self.on_ready();
                }
            }
        }
    }

    /// Output after a surfaced prompt means it matched a partial line, unless
    /// the same prompt was simply drawn again. Either way the markers in the
    /// new output are taken before anything else is written.
    fn reconsider_prompt(&mut self) {
        if self.detector.window().is_none() {
            return;
        }
        self.consume_markers();

        if let Some(window) = self.detector.window() {
            if let Classification::ApplicationPrompt { text, .. } = self.classifier.classify(window) {
                if self.surfaced_prompt.as_deref() == Some(last_line(&text)) {
                    return;
                }
            }
        }

        info!(session = %self.id, step = ?self.current_step_name(), "output after prompt; withdrawing it");
        self.awaiting_since = None;
        self.set_status(SessionStatus::Running);
        self.evaluate(false);
    }

    fn consume_markers(&mut self) {
        if let Some(flight) = self.in_flight.as_mut() {
            if flight.expects_marker && !flight.begun {
                if let Some(end) = self.detector.window().and_then(find_begin_marker) {
                    flight.begun = true;
                    self.detector.consume(end);
                }
            }
            if flight.expects_marker && flight.marker.is_none() {
                if let Some((code, end)) = self.detector.window().and_then(find_exit_marker) {
                    debug!(session = %self.id, index = flight.index, code, "exit marker");
                    flight.marker = Some(code);
                    self.detector.consume(end);
                }
            }
        }
    }

    fn marker_satisfied(&self) -> bool {
        match &self.in_flight {
            Some(flight) => !flight.expects_marker || flight.marker.is_some(),
            None => true,
        }
    }

    /// A quiet window with no recognisable prompt still means ready when
    /// the exit marker has been seen, or while waiting for the first or a
    /// recovered prompt of unknown shape.
    fn settle_means_ready(&self, window: &str) -> bool {
        match &self.in_flight {
            Some(flight) => flight.expects_marker && flight.marker.is_some(),
            None => (!self.ready_seen || self.recovering) && !window.trim().is_empty(),
        }
    }

    // ── step lifecycle ──

    fn on_ready(&mut self) {
        self.ready_seen = true;
        self.recovering = false;
        self.last_auto_answer = None;

        if let Some(flight) = self.in_flight.take() {
            let index = flight.index;
            let outcome = self.complete_from_channel(flight);
            let policy = FailurePolicy::for_step(&self.steps[index]);
            if !should_continue_after_step(outcome, policy) {
                info!(session = %self.id, index, "stopping after failed step");
                self.begin_closing();
                return;
            }
        }
        self.dispatch_next();
    }

    fn complete_from_channel(&mut self, flight: InFlight) -> StepOutcome {
        let name = self.steps[flight.index].name.clone();
        let duration_ms = elapsed_ms(flight.started);
        let mut output = if flight.expects_marker {
            extract_marked_output(&flight.output)
        } else {
            extract_plain_output(&flight.output)
        };
        if flight.truncated {
            output.push_str("\n[output truncated]");
        }
        let result = match flight.marker {
            Some(code) if code != 0 => StepResult::failed(
                &name,
                output,
                duration_ms,
                &EngineError::StepExecution {
                    step: name.clone(),
                    code,
                },
            ),
            marker => StepResult::succeeded(&name, output, duration_ms, marker),
        };
        self.record(flight.index, result)
    }

    fn fail_in_flight(&mut self, flight: InFlight, error: &EngineError) -> StepOutcome {
        let name = self.steps[flight.index].name.clone();
        let mut output = if flight.expects_marker {
            extract_marked_output(&flight.output)
        } else {
            extract_plain_output(&flight.output)
        };
        if flight.truncated {
            output.push_str("\n[output truncated]");
        }
        let result = StepResult::failed(&name, output, elapsed_ms(flight.started), error);
        self.record(flight.index, result)
    }

    fn record(&mut self, index: usize, result: StepResult) -> StepOutcome {
        info!(
            session = %self.id,
            step = %result.step_name,
            index,
            success = result.success,
            duration_ms = result.duration_ms,
            "step completed"
        );
        let outcome = result.outcome;
        self.pending.push(result.clone());
        self.hub.emit(SessionEvent::StepCompleted { index, result });
        outcome
    }

    fn dispatch_next(&mut self) {
        if self.status != SessionStatus::Running {
            return;
        }
        if self.next_index >= self.steps.len() {
            self.begin_closing();
            return;
        }

        let index = self.next_index;
        self.next_index += 1;
        let planned = match self.planner.next(&self.steps[index]) {
            Ok(planned) => planned,
            Err(e) => {
                let name = self.steps[index].name.clone();
                self.record(index, StepResult::failed(&name, String::new(), 0, &e));
                self.begin_closing();
                return;
            }
        };

        let name = self.steps[index].name.clone();
        info!(session = %self.id, step = %name, index, command = %planned.text, "dispatching step");
        self.hub.emit(SessionEvent::StepStarted {
            index,
            name,
            command: planned.text.clone(),
        });
        self.in_flight = Some(InFlight {
            index,
            started: Instant::now(),
            output: String::new(),
            truncated: false,
            expects_marker: planned.expects_marker,
            begun: false,
            marker: None,
        });
        if let Err(e) = self.write_line(&planned.wire) {
            self.on_write_failure(e);
        }
    }

    fn on_natural_completion(&mut self) {
        info!(session = %self.id, "natural completion detected");
        if let Some(flight) = self.in_flight.take() {
            let name = self.steps[flight.index].name.clone();
            let output = extract_marked_output(&flight.output);
            let result = StepResult::succeeded(&name, output, elapsed_ms(flight.started), None);
            self.record(flight.index, result);
        }
        self.begin_closing();
    }

    // ── prompts and input ──

    fn handle_prompt(&mut self, kind: PromptKind, text: String) {
        let prompt_line = last_line(&text).to_string();

        if let Some(flight) = &self.in_flight {
            let step = &self.steps[flight.index];
            if self.last_auto_answer.as_deref() != Some(prompt_line.as_str()) {
                if let Some(input) = step.find_input(&text) {
                    let value = input.value.clone();
                    let name = step.name.clone();
                    info!(session = %self.id, step = %name, prompt = %prompt_line, "answering prompt from step inputs");
                    self.last_auto_answer = Some(prompt_line);
                    self.hub.emit(SessionEvent::AutoAnswered {
                        step: name,
                        prompt: text,
                    });
                    if let Err(e) = self.write_line(&value) {
                        self.on_write_failure(e);
                    }
                    return;
                }
            }
        }

        let event = PromptEvent {
            session_id: self.id.clone(),
            step: self.current_step_name(),
            kind,
            prompt: text,
            timestamp: Utc::now(),
        };
        info!(session = %self.id, step = ?event.step, kind = ?kind, "awaiting user input");
        self.awaiting_since = Some(Instant::now());
        self.set_status(SessionStatus::AwaitingUserInput);
        self.surfaced_prompt = Some(prompt_line);
        lock(&self.control).prompt = Some(event.clone());
        self.hub.emit(SessionEvent::PromptDetected(event));
    }

    fn on_user_input(&mut self, text: &str) {
        if self.status != SessionStatus::AwaitingUserInput {
            debug!(session = %self.id, "ignoring input with no prompt outstanding");
            return;
        }
        self.awaiting_since = None;
        self.set_status(SessionStatus::Running);
        if self.in_flight.as_ref().is_some_and(|flight| flight.marker.is_some()) {
            debug!(session = %self.id, "command already exited; input not written");
            return;
        }
        let step = self.current_step_name();
        if let Err(e) = self.write_line(text) {
            self.on_write_failure(e);
            return;
        }
        self.hub.emit(SessionEvent::InputSubmitted {
            step,
            length: text.len(),
        });
    }

    // ── timers ──

    fn tick(&mut self, now: Instant) {
        match self.status {
            SessionStatus::Running => {
                if self.detector.take_settled(now) {
                    self.evaluate(true);
                }
                if self.status == SessionStatus::Running
                    && self.detector.quiet(now) == Quiet::Inactive
                {
                    self.on_inactivity();
                }
            }
            SessionStatus::AwaitingUserInput => {
                let expired = self
                    .awaiting_since
                    .is_some_and(|since| now.duration_since(since) >= self.config.prompt_wait_timeout);
                if expired {
                    self.on_prompt_expired();
                }
            }
            SessionStatus::Closing => {
                let expired = self
                    .close_started
                    .is_some_and(|since| now.duration_since(since) >= self.config.close_timeout);
                if expired {
                    warn!(session = %self.id, "channel did not close in time; forcing");
                    self.writer.close();
                    self.set_status(SessionStatus::Done);
                }
            }
            SessionStatus::Connecting | SessionStatus::Done => {}
        }
    }

    fn on_inactivity(&mut self) {
        let limit = self.config.inactivity_timeout;
        match self.in_flight.take() {
            Some(flight) => {
                let name = self.steps[flight.index].name.clone();
                warn!(session = %self.id, step = %name, index = flight.index, ?limit, "step timed out without output");
                let continue_on_error = self.steps[flight.index].continue_on_error;
                self.fail_in_flight(flight, &EngineError::Timeout { step: name, limit });
                self.interrupt(continue_on_error && !self.recovering);
            }
            None if !self.ready_seen => {
                warn!(session = %self.id, ?limit, "no shell prompt");
                self.fatal = Some(EngineError::Connection(format!(
                    "no shell prompt within {limit:?}"
                )));
                self.writer.close();
                self.set_status(SessionStatus::Done);
            }
            None if self.recovering => {
                warn!(session = %self.id, "shell did not recover after interrupt");
                self.interrupt(false);
            }
            None => {}
        }
    }

    fn on_prompt_expired(&mut self) {
        let limit = self.config.prompt_wait_timeout;
        let prompt = lock(&self.control)
            .prompt
            .take()
            .map(|p| p.prompt)
            .unwrap_or_default();
        self.awaiting_since = None;
        self.set_status(SessionStatus::Running);

        match self.in_flight.take() {
            Some(flight) => {
                let name = self.steps[flight.index].name.clone();
                warn!(session = %self.id, step = %name, ?limit, "prompt not answered");
                let continue_on_error = self.steps[flight.index].continue_on_error;
                self.fail_in_flight(
                    flight,
                    &EngineError::PromptResolution {
                        step: name,
                        prompt,
                        limit,
                    },
                );
                self.interrupt(continue_on_error);
            }
            None => {
                warn!(session = %self.id, ?limit, "prompt before the shell was ready not answered");
                self.fatal = Some(EngineError::Connection(format!(
                    "prompt not answered within {limit:?}: {prompt}"
                )));
                self.writer.close();
                self.set_status(SessionStatus::Done);
            }
        }
    }

    /// Write an interrupt. With `recover` the engine waits for the shell to
    /// come back and carries on; otherwise the channel is torn down.
    fn interrupt(&mut self, recover: bool) {
        if let Err(e) = self.writer.write(b"\x03") {
            debug!(session = %self.id, "interrupt write failed: {e}");
        }
        self.detector.on_write();
        if recover {
            self.recovering = true;
        } else {
            self.writer.close();
            self.set_status(SessionStatus::Done);
        }
    }

    // ── shutdown ──

    fn begin_closing(&mut self) {
        if matches!(self.status, SessionStatus::Closing | SessionStatus::Done) {
            return;
        }
        self.set_status(SessionStatus::Closing);
        self.close_started = Some(Instant::now());
        let exits = self.planner.depth() + 1;
        debug!(session = %self.id, exits, "closing channel");
        for _ in 0..exits {
            if self.write_line("exit").is_err() {
                self.set_status(SessionStatus::Done);
                return;
            }
        }
    }

    fn on_closed(&mut self, error: Option<String>) {
        match self.status {
            SessionStatus::Done => return,
            SessionStatus::Closing => {
                self.set_status(SessionStatus::Done);
                return;
            }
            _ => {}
        }
        if let Some(e) = &error {
            warn!(session = %self.id, "channel error: {e}");
        }

        if !self.ready_seen && self.in_flight.is_none() && self.pending.is_empty() {
            let detail = error.unwrap_or_else(|| {
                let tail = last_line(self.detector.tail().trim_end()).trim();
                if tail.is_empty() {
                    "channel closed before the shell was ready".to_string()
                } else {
                    format!("channel closed before the shell was ready: {tail}")
                }
            });
            self.fatal = Some(EngineError::Connection(detail));
            self.set_status(SessionStatus::Done);
            return;
        }

        if let Some(flight) = self.in_flight.take() {
            if is_session_exit(self.steps[flight.index].command.trim()) {
                self.complete_from_channel(flight);
            } else {
                let reason = error.unwrap_or_else(|| "channel closed while the step was running".to_string());
                self.fail_in_flight(flight, &EngineError::Channel(reason));
            }
        }
        self.set_status(SessionStatus::Done);
    }

    fn on_abort(&mut self) {
        if self.status == SessionStatus::Done {
            return;
        }
        info!(session = %self.id, status = %self.status, "session aborted");
        let _ = self.writer.write(b"\x03");
        self.writer.close();
        if let Some(flight) = self.in_flight.take() {
            self.fail_in_flight(flight, &EngineError::Aborted);
        }
        // Steps skipped by an earlier stop stay "not executed".
        if self.status != SessionStatus::Closing {
            self.pad_reason = PadReason::Cancelled;
        }
        self.set_status(SessionStatus::Done);
    }

    fn write_line(&mut self, text: &str) -> std::io::Result<()> {
        self.writer.write(format!("{text}\n").as_bytes())?;
        self.detector.on_write();
        Ok(())
    }

    fn on_write_failure(&mut self, error: std::io::Error) {
        warn!(session = %self.id, "channel write failed: {error}");
        self.on_closed(Some(format!("channel write failed: {error}")));
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Decode `bytes` after any partial sequence left from the last chunk,
/// keeping a trailing incomplete sequence for next time.
fn decode_utf8(carry: &mut Vec<u8>, bytes: &[u8]) -> String {
    carry.extend_from_slice(bytes);
    match std::str::from_utf8(carry) {
        Ok(text) => {
            let text = text.to_string();
            carry.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&carry[..valid]).into_owned();
            carry.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            text
        }
    }
}

fn append_bounded(buf: &mut String, truncated: &mut bool, text: &str, limit: usize) {
    if *truncated {
        return;
    }
    let room = limit.saturating_sub(buf.len());
    if text.len() <= room {
        buf.push_str(text);
        return;
    }
    let mut cut = room;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    buf.push_str(&text[..cut]);
    *truncated = true;
}
