//! Execution modes.
//!
//! Interactive mode is the session state machine in `session`. The two
//! batch modes here need no persistent channel: one-shot runs every step as
//! its own remote command, sentinel-script renders the whole list into one
//! script and splits the output back into steps afterwards. Both report
//! through the same `SessionEvent`s as an interactive session.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::events::{EventFeed, EventHub, SessionEvent, SessionObserver};
use crate::results::{StepResult, finalize, summarize};
use crate::sequencer::{
    FailurePolicy, ScriptStepRecord, build_command, is_bare_remote_hop, is_session_control,
    is_session_exit, parse_sentinel_output, render_sentinel_script, should_continue_after_step,
};
use crate::session::SessionStatus;
use crate::step::{Step, validate_steps};
use crate::transport::{Connection, ExecOutput, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// One persistent shell, prompts resolved as they appear.
    Interactive,
    /// Each step as its own remote command.
    OneShot,
    /// All steps as one script with per-step markers.
    SentinelScript,
}

impl ExecutionMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::OneShot => "one-shot",
            Self::SentinelScript => "sentinel-script",
        }
    }
}

/// Pick the execution mode for a step list.
///
/// Steps that hop to another host, leave a session, are marked interactive
/// or carry prompt inputs only work in a persistent interactive shell, so
/// they override whatever was requested.
pub fn select_mode(
    steps: &[Step],
    requested: Option<ExecutionMode>,
    persistent: bool,
) -> ExecutionMode {
    let needs_shell = steps.iter().find(|step| {
        let command = step.command.trim();
        step.interactive
            || !step.inputs.is_empty()
            || is_bare_remote_hop(command)
            || is_session_exit(command)
    });
    if let Some(step) = needs_shell {
        if requested.is_some_and(|mode| mode != ExecutionMode::Interactive) {
            info!(step = %step.name, "step needs an interactive shell; overriding requested mode");
        }
        return ExecutionMode::Interactive;
    }
    match requested {
        Some(mode) => mode,
        None if persistent => ExecutionMode::Interactive,
        None => ExecutionMode::OneShot,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchMode {
    OneShot,
    SentinelScript,
}

/// Runs a step list without an interactive channel.
pub struct BatchRunner {
    mode: BatchMode,
    steps: Vec<Step>,
    project_root: Option<String>,
    observers: Vec<Box<dyn SessionObserver>>,
    feed: EventFeed,
}

impl BatchRunner {
    pub fn one_shot(steps: Vec<Step>) -> Self {
        Self::new(BatchMode::OneShot, steps)
    }

    pub fn sentinel_script(steps: Vec<Step>) -> Self {
        Self::new(BatchMode::SentinelScript, steps)
    }

    fn new(mode: BatchMode, steps: Vec<Step>) -> Self {
        Self {
            mode,
            steps,
            project_root: None,
            observers: Vec::new(),
            feed: EventFeed::default(),
        }
    }

    pub fn project_root(mut self, root: impl Into<String>) -> Self {
        self.project_root = Some(root.into());
        self
    }

    pub fn observer(mut self, observer: impl SessionObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    /// Feed that receives this run's events.
    pub fn feed(&self) -> EventFeed {
        self.feed.clone()
    }

    pub fn run(self, transport: &dyn Transport) -> Result<Vec<StepResult>, EngineError> {
        validate_steps(&self.steps)?;
        if let Some(step) = self
            .steps
            .iter()
            .find(|step| is_session_control(step.command.trim()))
        {
            return Err(EngineError::validation(
                &step.name,
                "session-control commands need an interactive session",
            ));
        }

        let mut hub = EventHub::new(self.observers, self.feed);
        hub.emit(SessionEvent::StatusChanged {
            status: SessionStatus::Connecting,
        });
        info!(transport = %transport.name(), steps = self.steps.len(), mode = ?self.mode, "starting batch run");

        let result = match transport.connect() {
            Ok(mut connection) => {
                hub.emit(SessionEvent::StatusChanged {
                    status: SessionStatus::Running,
                });
                let root = self.project_root.as_deref();
                let outcome = match self.mode {
                    BatchMode::OneShot => run_one_shot(connection.as_mut(), &self.steps, root, &mut hub),
                    BatchMode::SentinelScript => {
                        run_script(connection.as_mut(), &self.steps, root, &mut hub)
                    }
                };
                connection.disconnect();
                outcome
            }
            Err(e) => Err(e),
        };

        hub.emit(SessionEvent::StatusChanged {
            status: SessionStatus::Done,
        });
        if let Ok(results) = &result {
            hub.emit(SessionEvent::SessionEnded {
                summary: summarize(results),
            });
        }
        hub.close();
        result
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn emit_output(hub: &mut EventHub, step: &str, output: &str) {
    if !output.is_empty() {
        hub.emit(SessionEvent::Output {
            step: Some(step.to_string()),
            chunk: output.to_string(),
        });
    }
}

fn result_from_exec(step: &Step, out: &ExecOutput, duration_ms: u64) -> StepResult {
    let output = out.combined();
    match out.exit_code {
        Some(0) => StepResult::succeeded(&step.name, output, duration_ms, Some(0)),
        Some(code) => StepResult::failed(
            &step.name,
            output,
            duration_ms,
            &EngineError::StepExecution {
                step: step.name.clone(),
                code,
            },
        ),
        None => StepResult::failed(
            &step.name,
            output,
            duration_ms,
            &EngineError::Exec("terminated by a signal".to_string()),
        ),
    }
}

fn run_one_shot(
    connection: &mut dyn Connection,
    steps: &[Step],
    project_root: Option<&str>,
    hub: &mut EventHub,
) -> Result<Vec<StepResult>, EngineError> {
    let mut pending = Vec::new();

    for (index, step) in steps.iter().enumerate() {
        // No shell state carries over, so every command starts from the root.
        let command = build_command(step, true, project_root)?;
        info!(step = %step.name, index, command = %command, "running step");
        hub.emit(SessionEvent::StepStarted {
            index,
            name: step.name.clone(),
            command: command.clone(),
        });

        let started = Instant::now();
        let result = match connection.run_once(&command) {
            Ok(out) => {
                let result = result_from_exec(step, &out, elapsed_ms(started));
                emit_output(hub, &step.name, &result.output);
                result
            }
            Err(EngineError::Connection(detail)) if pending.is_empty() => {
                return Err(EngineError::Connection(detail));
            }
            Err(e) => {
                warn!(step = %step.name, "step could not be executed: {e}");
                let result = StepResult::failed(&step.name, String::new(), elapsed_ms(started), &e);
                pending.push(result.clone());
                hub.emit(SessionEvent::StepCompleted { index, result });
                if matches!(e, EngineError::Connection(_)) || !step.continue_on_error {
                    break;
                }
                continue;
            }
        };

        let outcome = result.outcome;
        debug!(step = %step.name, success = result.success, duration_ms = result.duration_ms, "step completed");
        pending.push(result.clone());
        hub.emit(SessionEvent::StepCompleted { index, result });
        if !should_continue_after_step(outcome, FailurePolicy::for_step(step)) {
            info!(step = %step.name, index, "stopping after failed step");
            break;
        }
    }

    let results = finalize(&pending, steps);
    emit_padding(hub, &pending, &results);
    Ok(results)
}

fn run_script(
    connection: &mut dyn Connection,
    steps: &[Step],
    project_root: Option<&str>,
    hub: &mut EventHub,
) -> Result<Vec<StepResult>, EngineError> {
    let script = render_sentinel_script(steps, project_root)?;
    debug!(bytes = script.len(), "running sentinel script");

    let out = connection.run_once(&script)?;
    let stderr = out.stderr.trim();
    if !stderr.is_empty() {
        debug!("script stderr: {stderr}");
    }

    let records = parse_sentinel_output(&out.stdout);
    if records.is_empty() && !steps.is_empty() && !out.success() {
        // Nothing ran at all; the remote side rejected the script.
        let detail = if stderr.is_empty() {
            format!("script exited with status {:?} before the first step", out.exit_code)
        } else {
            stderr.to_string()
        };
        return Err(EngineError::Exec(detail));
    }

    let mut pending = Vec::new();
    for record in records {
        if record.index != pending.len() || record.index >= steps.len() {
            warn!(index = record.index, "ignoring out-of-order script marker");
            continue;
        }
        let step = &steps[record.index];
        hub.emit(SessionEvent::StepStarted {
            index: record.index,
            name: step.name.clone(),
            command: step.command.clone(),
        });
        emit_output(hub, &step.name, &record.output);
        let result = result_from_record(step, &record);
        pending.push(result.clone());
        hub.emit(SessionEvent::StepCompleted {
            index: record.index,
            result,
        });
    }

    let results = finalize(&pending, steps);
    emit_padding(hub, &pending, &results);
    Ok(results)
}

fn result_from_record(step: &Step, record: &ScriptStepRecord) -> StepResult {
    let duration_ms = record
        .finished
        .map(|finished| finished.saturating_sub(record.started).saturating_mul(1000))
        .unwrap_or(0);
    let output = record.output.clone();
    match record.exit_code {
        Some(0) => StepResult::succeeded(&step.name, output, duration_ms, Some(0)),
        Some(code) => StepResult::failed(
            &step.name,
            output,
            duration_ms,
            &EngineError::StepExecution {
                step: step.name.clone(),
                code,
            },
        ),
        None => StepResult::failed(
            &step.name,
            output,
            duration_ms,
            &EngineError::Exec("script ended before the step finished".to_string()),
        ),
    }
}

/// Report steps that were never reached.
fn emit_padding(hub: &mut EventHub, pending: &[StepResult], results: &[StepResult]) {
    for (index, result) in results.iter().enumerate().skip(pending.len()) {
        hub.emit(SessionEvent::StepCompleted {
            index,
            result: result.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::StepOutcome;
    use crate::transport::ShellChannel;
    use crate::transport::fake::{FakeScript, FakeTransport, Reply};
    use crate::transport::local::LocalTransport;
    use std::sync::{Arc, Mutex};

    fn outcomes(results: &[StepResult]) -> Vec<StepOutcome> {
        results.iter().map(|r| r.outcome).collect()
    }

    /// Returns a fixed output for whatever command it is given.
    #[derive(Clone)]
    struct Canned {
        output: ExecOutput,
        commands: Arc<Mutex<Vec<String>>>,
    }

    impl Canned {
        fn new(exit_code: i32, stdout: &str, stderr: &str) -> Self {
            Self {
                output: ExecOutput {
                    exit_code: Some(exit_code),
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                },
                commands: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Transport for Canned {
        fn name(&self) -> String {
            "canned".to_string()
        }

        fn connect(&self) -> Result<Box<dyn Connection>, EngineError> {
            Ok(Box::new(self.clone()))
        }
    }

    impl Connection for Canned {
        fn open_shell(&mut self) -> Result<ShellChannel, EngineError> {
            Err(EngineError::Channel("no shell".to_string()))
        }

        fn run_once(&mut self, command: &str) -> Result<ExecOutput, EngineError> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(self.output.clone())
        }
    }

    #[test]
    fn hops_exits_inputs_and_interactive_steps_force_interactive() {
        let plain = vec![Step::new("build", "make")];
        assert_eq!(select_mode(&plain, None, true), ExecutionMode::Interactive);
        assert_eq!(select_mode(&plain, None, false), ExecutionMode::OneShot);
        assert_eq!(
            select_mode(&plain, Some(ExecutionMode::SentinelScript), true),
            ExecutionMode::SentinelScript
        );

        let forcing = [
            Step::new("hop", "ssh -p 2222 web1"),
            Step::new("leave", "logout"),
            Step::new("shell", "make").continue_on_error(),
            Step::new("migrate", "./migrate").with_input("[y/N]", "y"),
        ];
        let mut interactive = Step::new("console", "rails console");
        interactive.interactive = true;

        for step in [&forcing[0], &forcing[1], &forcing[3], &interactive] {
            let steps = vec![Step::new("build", "make"), step.clone()];
            assert_eq!(
                select_mode(&steps, Some(ExecutionMode::OneShot), false),
                ExecutionMode::Interactive,
                "{}",
                step.name
            );
        }
        // continue_on_error alone does not need a shell
        assert_eq!(
            select_mode(&forcing[2..3], Some(ExecutionMode::OneShot), true),
            ExecutionMode::OneShot
        );
    }

    #[test]
    fn one_shot_prefixes_every_step_with_root() {
        let transport = FakeTransport::new(
            FakeScript::new("$ ")
                .reply(Reply::to("npm ci").output("added 312 packages\n"))
                .reply(Reply::to("npm run build").output("built\n")),
        );
        let results = BatchRunner::one_shot(vec![
            Step::new("install", "npm ci"),
            Step::new("build", "npm run build"),
            Step::new("logs", "ls").in_dir("logs"),
        ])
        .project_root("/srv/app")
        .run(&transport)
        .unwrap();

        assert!(results.iter().all(|r| r.success));
        assert_eq!(results[0].output, "added 312 packages");
        assert_eq!(
            transport.writes(),
            vec![
                "cd /srv/app && npm ci",
                "cd /srv/app && npm run build",
                "cd /srv/app/logs && ls",
            ]
        );
    }

    #[test]
    fn one_shot_stops_on_failure() {
        let transport = FakeTransport::new(
            FakeScript::new("$ ").reply(Reply::to("make test").output("FAIL\n").exit(2)),
        );
        let results = BatchRunner::one_shot(vec![
            Step::new("test", "make test"),
            Step::new("install", "make install"),
        ])
        .run(&transport)
        .unwrap();

        assert_eq!(outcomes(&results), vec![StepOutcome::Failed, StepOutcome::NotExecuted]);
        assert_eq!(results[0].exit_code, Some(2));
        assert_eq!(transport.writes().len(), 1);
    }

    #[test]
    fn one_shot_reports_stderr_under_separator() {
        let transport = Canned::new(0, "ok\n", "npm WARN deprecated\n");
        let results = BatchRunner::one_shot(vec![Step::new("build", "npm run build")])
            .run(&transport)
            .unwrap();
        assert_eq!(results[0].output, "ok\n--- stderr ---\nnpm WARN deprecated");
    }

    #[test]
    fn refused_connection_is_fatal() {
        let transport = FakeTransport::refusing("Connection refused");
        let err = BatchRunner::one_shot(vec![Step::new("build", "make")])
            .run(&transport)
            .unwrap_err();
        assert!(matches!(err, EngineError::Connection(_)));
    }

    #[test]
    fn batch_modes_reject_session_control_steps() {
        let transport = FakeTransport::new(FakeScript::new("$ "));
        let err = BatchRunner::one_shot(vec![Step::new("hop", "ssh web1")])
            .run(&transport)
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
        assert!(transport.writes().is_empty());
    }

    #[test]
    fn sentinel_output_is_split_into_steps() {
        let stdout = "__SR_STEP=0:1700000000__\ncc -o app main.c\n__SR_END=0:0:1700000002__\n\
                      __SR_STEP=1:1700000002__\n2 tests failed\n__SR_END=1:1:1700000003__\n";
        let transport = Canned::new(1, stdout, "");
        let steps = vec![
            Step::new("build", "make"),
            Step::new("test", "make test"),
            Step::new("install", "make install"),
        ];
        let runner = BatchRunner::sentinel_script(steps).project_root("/srv/app");
        let events = runner.feed().subscribe();
        let results = runner.run(&transport).unwrap();

        assert_eq!(
            outcomes(&results),
            vec![StepOutcome::Succeeded, StepOutcome::Failed, StepOutcome::NotExecuted]
        );
        assert_eq!(results[0].output, "cc -o app main.c");
        assert_eq!(results[0].duration_ms, 2000);
        assert_eq!(results[1].exit_code, Some(1));

        let commands = transport.commands.lock().unwrap().clone();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].starts_with("set +e\n"));

        let completed = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::StepCompleted { .. }))
            .count();
        assert_eq!(completed, 3);
    }

    #[test]
    fn script_rejected_before_first_step_is_an_exec_error() {
        let transport = Canned::new(127, "", "sh: 1: syntax error\n");
        let err = BatchRunner::sentinel_script(vec![Step::new("build", "make")])
            .run(&transport)
            .unwrap_err();
        assert_eq!(err, EngineError::Exec("sh: 1: syntax error".to_string()));
    }

    #[test]
    fn sentinel_script_runs_in_a_real_shell() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = LocalTransport::new("sh");
        let results = BatchRunner::sentinel_script(vec![
            Step::new("write", "echo one > a.txt && echo wrote"),
            Step::new("noisy", "echo oops >&2; false").continue_on_error(),
            Step::new("read", "cat a.txt"),
        ])
        .project_root(tmp.path().display().to_string())
        .run(&transport)
        .unwrap();

        assert_eq!(
            outcomes(&results),
            vec![StepOutcome::Succeeded, StepOutcome::Failed, StepOutcome::Succeeded]
        );
        assert_eq!(results[0].output, "wrote");
        assert_eq!(results[1].output, "oops");
        assert_eq!(results[2].output, "one");
    }
}
