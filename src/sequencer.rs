//! Command sequencing primitives for a session.
//!
//! Builds the literal text written to the shell for each step (directory
//! change, environment exports, quoting), recognises session-control commands
//! (bare remote hops, `exit`/`logout`), wraps ordinary commands in exit-status
//! markers, renders the single-script form used by sentinel-script mode, and
//! provides the stop/continue policy applied after each step.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::EngineError;
use crate::results::StepOutcome;
use crate::step::Step;

/// Marker printed right before a wrapped command runs.
pub const BEGIN_MARKER: &str = "__SR_BEGIN__";

static EXIT_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__SR_RC=(-?\d+)__").expect("static pattern"));
static SCRIPT_STEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^__SR_STEP=(\d+):(\d+)__$").expect("static pattern"));
static SCRIPT_END_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^__SR_END=(\d+):(-?\d+):(\d+)__$").expect("static pattern"));

/// Programs that open a nested remote session when run without a command.
const HOP_PROGRAMS: &[(&str, &str, usize)] = &[
    // (program, single-letter options that take an argument, max positionals)
    ("ssh", "BbcDEeFIiJLlmOoPpQRSWw", 1),
    ("mosh", "p", 1),
    ("telnet", "bln", 2),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    StopOnFailure,
    ContinueOnFailure,
}

impl FailurePolicy {
    pub fn for_step(step: &Step) -> Self {
        if step.continue_on_error {
            Self::ContinueOnFailure
        } else {
            Self::StopOnFailure
        }
    }
}

/// Decide whether the sequence should continue after a step outcome.
///
/// Default behavior is fail-fast. Failures, timeouts and unanswered prompts
/// are tolerated only under `ContinueOnFailure`; cancellation always stops.
pub fn should_continue_after_step(outcome: StepOutcome, policy: FailurePolicy) -> bool {
    match outcome {
        StepOutcome::Succeeded => true,
        StepOutcome::Failed | StepOutcome::TimedOut | StepOutcome::PromptUnanswered => {
            matches!(policy, FailurePolicy::ContinueOnFailure)
        }
        StepOutcome::Cancelled | StepOutcome::NotExecuted => false,
    }
}

/// Quote a value for a POSIX shell. Plain words are left bare.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_./:@%+=,-".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Quote a directory for `cd`, keeping a leading `~` expandable.
fn quote_dir(dir: &str) -> String {
    if dir == "~" {
        return dir.to_string();
    }
    match dir.strip_prefix("~/") {
        Some(rest) if !rest.is_empty() => format!("~/{}", shell_quote(rest)),
        Some(_) => "~/".to_string(),
        None => shell_quote(dir),
    }
}

fn has_shell_operators(command: &str) -> bool {
    command.chars().any(|c| ";&|<>`()$\n".contains(c))
}

/// Whether `command` is a single remote-hop invocation with no remote command
/// attached (`ssh deploy@jumphost`, `ssh -p 2222 -i key host`).
pub fn is_bare_remote_hop(command: &str) -> bool {
    let command = command.trim();
    if command.is_empty() || has_shell_operators(command) {
        return false;
    }
    let mut tokens = command.split_whitespace();
    let Some(program) = tokens.next() else {
        return false;
    };
    let program = program.rsplit('/').next().unwrap_or(program);
    let Some((_, arg_options, max_positionals)) =
        HOP_PROGRAMS.iter().find(|(name, _, _)| *name == program)
    else {
        return false;
    };

    let mut positionals = 0usize;
    let mut skip_next = false;
    for token in tokens {
        if skip_next {
            skip_next = false;
            continue;
        }
        if let Some(flags) = token.strip_prefix("--") {
            if !flags.contains('=') && !flags.is_empty() {
                skip_next = program == "mosh" && flags == "ssh";
            }
            continue;
        }
        if let Some(flags) = token.strip_prefix('-') {
            // Option cluster: an argument-taking letter consumes the rest of
            // the token, or the next token when it is last.
            for (idx, letter) in flags.char_indices() {
                if arg_options.contains(letter) {
                    skip_next = idx + letter.len_utf8() == flags.len();
                    break;
                }
            }
            continue;
        }
        positionals += 1;
    }
    positionals >= 1 && positionals <= *max_positionals
}

/// `exit`, `exit <status>` or `logout`.
pub fn is_session_exit(command: &str) -> bool {
    let mut tokens = command.split_whitespace();
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some("logout"), None, _) | (Some("exit"), None, _) => true,
        (Some("exit"), Some(code), None) => code.chars().all(|c| c.is_ascii_digit()),
        _ => false,
    }
}

/// Commands that change which shell the channel talks to. They are sent bare
/// and complete on the next shell prompt rather than on an exit marker.
pub fn is_session_control(command: &str) -> bool {
    is_bare_remote_hop(command) || is_session_exit(command)
}

fn resolve_dir(working_dir: &str, project_root: Option<&str>) -> String {
    let absolute = working_dir.starts_with('/') || working_dir.starts_with('~');
    match project_root {
        Some(root) if !absolute => format!("{}/{}", root.trim_end_matches('/'), working_dir),
        _ => working_dir.to_string(),
    }
}

/// Build the literal command text for one step.
///
/// Session-control commands are returned unmodified. Otherwise the command is
/// prefixed with at most one `cd` (the step's working directory when it is
/// not `"."`, or the project root on the first command) and one `export` per
/// environment variable, all joined with `&&`.
pub fn build_command(
    step: &Step,
    is_first_command: bool,
    project_root: Option<&str>,
) -> Result<String, EngineError> {
    let command = step.command.trim();
    if command.is_empty() {
        return Err(EngineError::validation(&step.name, "command is empty"));
    }
    if command.contains('\n') || command.contains('\r') {
        return Err(EngineError::validation(
            &step.name,
            "command spans multiple lines; use sentinel-script mode",
        ));
    }
    if is_session_control(command) {
        return Ok(command.to_string());
    }

    let mut parts = command_prefix(step, is_first_command, project_root);
    parts.push(command.to_string());
    Ok(parts.join(" && "))
}

fn command_prefix(step: &Step, is_first_command: bool, project_root: Option<&str>) -> Vec<String> {
    let mut parts = Vec::new();
    if step.working_dir != "." && !step.working_dir.trim().is_empty() {
        parts.push(format!(
            "cd {}",
            quote_dir(&resolve_dir(&step.working_dir, project_root))
        ));
    } else if is_first_command {
        if let Some(root) = project_root {
            parts.push(format!("cd {}", quote_dir(root)));
        }
    }
    for var in &step.env {
        parts.push(format!("export {}={}", var.name, shell_quote(&var.value)));
    }
    parts
}

/// Wrap a command so its exit status is printed as a marker line. The marker
/// text is produced by `printf`, so it never appears in the echoed input.
pub fn wrap_with_markers(command: &str) -> String {
    format!(
        "printf '__SR_%s__\\n' BEGIN; eval {}; printf '__SR_RC=%s__\\n' \"$?\"",
        shell_quote(command)
    )
}

/// Locate the exit-status marker. Returns the status and the byte offset just
/// past the marker line.
pub fn find_exit_marker(text: &str) -> Option<(i32, usize)> {
    let caps = EXIT_MARKER_RE.captures(text)?;
    let code = caps.get(1)?.as_str().parse::<i32>().ok()?;
    let mut end = caps.get(0)?.end();
    let rest = &text[end..];
    if rest.starts_with("\r\n") {
        end += 2;
    } else if rest.starts_with('\n') || rest.starts_with('\r') {
        end += 1;
    }
    Some((code, end))
}

/// Byte offset just past the begin marker line, once it is complete.
pub fn find_begin_marker(text: &str) -> Option<usize> {
    let pos = text.find(BEGIN_MARKER)?;
    let newline = text[pos..].find('\n')?;
    Some(pos + newline + 1)
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n")
}

/// Output a wrapped command produced, between the begin marker line and the
/// exit marker.
pub fn extract_marked_output(raw: &str) -> String {
    let start = match raw.find(BEGIN_MARKER) {
        Some(pos) => raw[pos..]
            .find('\n')
            .map(|nl| pos + nl + 1)
            .unwrap_or(raw.len()),
        None => raw.find('\n').map(|nl| nl + 1).unwrap_or(raw.len()),
    };
    let body = &raw[start..];
    let body = match EXIT_MARKER_RE.find(body) {
        Some(m) => &body[..m.start()],
        None => body,
    };
    normalize_newlines(body).trim_end_matches('\n').to_string()
}

/// Output of an unwrapped command: everything after the echoed line, minus
/// the trailing prompt line.
pub fn extract_plain_output(raw: &str) -> String {
    let normalized = normalize_newlines(raw);
    let Some((_, after_echo)) = normalized.split_once('\n') else {
        return String::new();
    };
    let body = match after_echo.rfind('\n') {
        Some(pos) => &after_echo[..pos],
        None => "",
    };
    body.trim_end_matches('\n').to_string()
}

/// What the session writes for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCommand {
    /// Command text as built for the step.
    pub text: String,
    /// Text written to the channel (without the trailing newline).
    pub wire: String,
    /// Sent bare; completes on the next shell prompt.
    pub control: bool,
    /// Completion is signalled by an exit marker.
    pub expects_marker: bool,
}

/// Tracks nesting across dispatches so each step gets the right prefix.
#[derive(Debug, Clone)]
pub struct CommandPlanner {
    project_root: Option<String>,
    markers: bool,
    depth: usize,
    dispatched: usize,
}

impl CommandPlanner {
    pub fn new(project_root: Option<String>, markers: bool) -> Self {
        Self {
            project_root,
            markers,
            depth: 0,
            dispatched: 0,
        }
    }

    /// Number of nested remote sessions currently open.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn next(&mut self, step: &Step) -> Result<PlannedCommand, EngineError> {
        // The project root only means something on the outermost host.
        let root = if self.depth == 0 {
            self.project_root.as_deref()
        } else {
            None
        };
        let text = build_command(step, self.dispatched == 0, root)?;
        self.dispatched += 1;

        let control = is_session_control(&text);
        if is_bare_remote_hop(&text) {
            self.depth += 1;
        } else if is_session_exit(&text) {
            self.depth = self.depth.saturating_sub(1);
        }

        let expects_marker = self.markers && !control;
        let wire = if expects_marker {
            wrap_with_markers(&text)
        } else {
            text.clone()
        };
        Ok(PlannedCommand {
            text,
            wire,
            control,
            expects_marker,
        })
    }
}

/// Plan every step in interactive order.
pub fn plan_commands(
    steps: &[Step],
    project_root: Option<&str>,
    markers: bool,
) -> Result<Vec<PlannedCommand>, EngineError> {
    let mut planner = CommandPlanner::new(project_root.map(str::to_string), markers);
    steps.iter().map(|step| planner.next(step)).collect()
}

/// Render all steps as one POSIX script with per-step markers.
pub fn render_sentinel_script(
    steps: &[Step],
    project_root: Option<&str>,
) -> Result<String, EngineError> {
    let mut script = String::from("set +e\n");
    for (index, step) in steps.iter().enumerate() {
        if is_session_control(step.command.trim()) {
            return Err(EngineError::validation(
                &step.name,
                "session-control commands need an interactive session",
            ));
        }
        let command = compose_script_command(step, index == 0, project_root)?;
        script.push_str(&format!(
            "printf '__SR_STEP=%s:%s__\\n' {index} \"$(date +%s)\"\n"
        ));
        script.push_str(&format!("{{\n{command}\n}} 2>&1\n"));
        script.push_str("__sr_rc=$?\n");
        script.push_str(&format!(
            "printf '__SR_END=%s:%s:%s__\\n' {index} \"$__sr_rc\" \"$(date +%s)\"\n"
        ));
        if !step.continue_on_error {
            script.push_str("[ \"$__sr_rc\" -eq 0 ] || exit \"$__sr_rc\"\n");
        }
    }
    Ok(script)
}

fn compose_script_command(
    step: &Step,
    is_first: bool,
    project_root: Option<&str>,
) -> Result<String, EngineError> {
    // Multi-line bodies are fine inside a script.
    let body = step.command.trim();
    if body.is_empty() {
        return Err(EngineError::validation(&step.name, "command is empty"));
    }
    let mut parts = command_prefix(step, is_first, project_root);
    parts.push(body.to_string());
    Ok(parts.join(" && "))
}

/// One step's slice of sentinel-script output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptStepRecord {
    pub index: usize,
    pub output: String,
    /// `None` when the script died before the end marker.
    pub exit_code: Option<i32>,
    pub started: u64,
    pub finished: Option<u64>,
}

/// Split sentinel-script stdout back into per-step records.
pub fn parse_sentinel_output(stdout: &str) -> Vec<ScriptStepRecord> {
    let mut records: Vec<ScriptStepRecord> = Vec::new();
    let mut current: Option<(ScriptStepRecord, Vec<&str>)> = None;

    for line in stdout.lines() {
        let line_trimmed = line.trim_end_matches('\r');
        if let Some(caps) = SCRIPT_STEP_RE.captures(line_trimmed) {
            if let Some((record, lines)) = current.take() {
                records.push(close_record(record, lines));
            }
            let index = caps[1].parse().unwrap_or(records.len());
            let started = caps[2].parse().unwrap_or(0);
            current = Some((
                ScriptStepRecord {
                    index,
                    output: String::new(),
                    exit_code: None,
                    started,
                    finished: None,
                },
                Vec::new(),
            ));
            continue;
        }
        if let Some(caps) = SCRIPT_END_RE.captures(line_trimmed) {
            if let Some((mut record, lines)) = current.take() {
                record.exit_code = caps[2].parse().ok();
                record.finished = caps[3].parse().ok();
                records.push(close_record(record, lines));
            }
            continue;
        }
        if let Some((_, lines)) = current.as_mut() {
            lines.push(line_trimmed);
        }
    }
    if let Some((record, lines)) = current.take() {
        records.push(close_record(record, lines));
    }
    records
}

fn close_record(mut record: ScriptStepRecord, lines: Vec<&str>) -> ScriptStepRecord {
    record.output = lines.join("\n");
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_leaves_plain_words_bare() {
        assert_eq!(shell_quote("production"), "production");
        assert_eq!(shell_quote("/srv/app"), "/srv/app");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn first_command_changes_to_project_root() {
        let step = Step::new("build", "npm run build");
        assert_eq!(
            build_command(&step, true, Some("/srv/app")).unwrap(),
            "cd /srv/app && npm run build"
        );
    }

    #[test]
    fn later_default_dir_commands_have_no_cd() {
        let step = Step::new("restart", "pm2 restart app");
        assert_eq!(
            build_command(&step, false, Some("/srv/app")).unwrap(),
            "pm2 restart app"
        );
    }

    #[test]
    fn working_dir_is_resolved_against_root() {
        let step = Step::new("migrate", "./migrate").in_dir("api");
        assert_eq!(
            build_command(&step, false, Some("/srv/app/")).unwrap(),
            "cd /srv/app/api && ./migrate"
        );
        let step = Step::new("logs", "ls").in_dir("/var/log");
        assert_eq!(
            build_command(&step, true, Some("/srv/app")).unwrap(),
            "cd /var/log && ls"
        );
        let step = Step::new("home", "ls").in_dir("~/my apps");
        assert_eq!(
            build_command(&step, false, None).unwrap(),
            "cd ~/'my apps' && ls"
        );
    }

    #[test]
    fn env_vars_are_exported_in_order_and_escaped() {
        let step = Step::new("build", "npm run build")
            .with_env("NODE_ENV", "production")
            .with_env("GREETING", "hello world");
        assert_eq!(
            build_command(&step, false, None).unwrap(),
            "export NODE_ENV=production && export GREETING='hello world' && npm run build"
        );
    }

    #[test]
    fn bare_hop_is_sent_unmodified() {
        let step = Step::new("hop", "  ssh jumphost ").with_env("X", "1");
        assert_eq!(
            build_command(&step, true, Some("/srv/app")).unwrap(),
            "ssh jumphost"
        );
    }

    #[test]
    fn hop_detection() {
        assert!(is_bare_remote_hop("ssh jumphost"));
        assert!(is_bare_remote_hop("ssh -p 2222 -i ~/.ssh/id deploy@10.0.0.5"));
        assert!(is_bare_remote_hop("ssh -tt -oStrictHostKeyChecking=no host"));
        assert!(is_bare_remote_hop("/usr/bin/ssh host"));
        assert!(is_bare_remote_hop("telnet switch 23"));
        assert!(!is_bare_remote_hop("ssh host uptime"));
        assert!(!is_bare_remote_hop("ssh -p 22"));
        assert!(!is_bare_remote_hop("ssh host && ls"));
        assert!(!is_bare_remote_hop("sshd -t"));
        assert!(!is_bare_remote_hop("echo ssh host"));
    }

    #[test]
    fn exit_detection() {
        assert!(is_session_exit("exit"));
        assert!(is_session_exit(" exit 3 "));
        assert!(is_session_exit("logout"));
        assert!(!is_session_exit("exit now"));
        assert!(!is_session_exit("exiftool a.jpg"));
    }

    #[test]
    fn multiline_command_is_rejected() {
        let step = Step::new("script", "echo a\necho b");
        assert!(matches!(
            build_command(&step, false, None),
            Err(EngineError::Validation { .. })
        ));
    }

    #[test]
    fn marker_wrapper_does_not_echo_marker_text() {
        let wire = wrap_with_markers("npm run build");
        assert_eq!(
            wire,
            r#"printf '__SR_%s__\n' BEGIN; eval 'npm run build'; printf '__SR_RC=%s__\n' "$?""#
        );
        assert!(find_exit_marker(&wire).is_none());
        assert!(!wire.contains(BEGIN_MARKER));
    }

    #[test]
    fn exit_marker_is_found_with_line_end() {
        let text = "out\r\n__SR_RC=127__\r\nuser@host:~$ ";
        let (code, end) = find_exit_marker(text).unwrap();
        assert_eq!(code, 127);
        assert_eq!(&text[end..], "user@host:~$ ");
    }

    #[test]
    fn begin_marker_needs_a_complete_line() {
        assert_eq!(find_begin_marker("__SR_BEGIN__"), None);
        assert_eq!(find_begin_marker("x\r\n__SR_BEGIN__\r\nPassword: "), Some(17));
    }

    #[test]
    fn marked_output_excludes_echo_and_markers() {
        let raw = "printf ... eval 'make'\r\n__SR_BEGIN__\r\ncc main.c\r\nok\r\n__SR_RC=0__\r\n$ ";
        assert_eq!(extract_marked_output(raw), "cc main.c\nok");
    }

    #[test]
    fn plain_output_excludes_echo_and_prompt() {
        let raw = "ssh jumphost\r\nWelcome to jumphost\r\nops@jumphost:~$ ";
        assert_eq!(extract_plain_output(raw), "Welcome to jumphost");
        assert_eq!(extract_plain_output("exit"), "");
    }

    #[test]
    fn planner_tracks_nesting() {
        let steps = vec![
            Step::new("build", "npm run build"),
            Step::new("hop", "ssh web1"),
            Step::new("restart", "pm2 restart app"),
            Step::new("back", "exit"),
        ];
        let plan = plan_commands(&steps, Some("/srv/app"), true).unwrap();
        assert_eq!(plan[0].text, "cd /srv/app && npm run build");
        assert!(plan[0].expects_marker);
        assert_eq!(plan[1].wire, "ssh web1");
        assert!(plan[1].control);
        assert_eq!(plan[2].text, "pm2 restart app");
        assert_eq!(plan[3].wire, "exit");

        let mut planner = CommandPlanner::new(Some("/srv/app".into()), false);
        planner.next(&steps[1]).unwrap();
        assert_eq!(planner.depth(), 1);
        let in_hop = planner.next(&Step::new("ls", "ls").in_dir("logs")).unwrap();
        assert_eq!(in_hop.wire, "cd logs && ls");
        planner.next(&steps[3]).unwrap();
        assert_eq!(planner.depth(), 0);
    }

    #[test]
    fn sentinel_script_round_trips_step_output() {
        let steps = vec![
            Step::new("build", "make").continue_on_error(),
            Step::new("test", "make test"),
        ];
        let script = render_sentinel_script(&steps, Some("/srv/app")).unwrap();
        assert!(script.starts_with("set +e\n"));
        assert!(script.contains("cd /srv/app && make\n"));
        assert_eq!(script.matches("|| exit").count(), 1);

        let stdout = "__SR_STEP=0:100__\ncc -o app\n__SR_END=0:2:103__\n__SR_STEP=1:103__\nrunning\n";
        let records = parse_sentinel_output(stdout);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].output, "cc -o app");
        assert_eq!(records[0].exit_code, Some(2));
        assert_eq!(records[0].finished, Some(103));
        assert_eq!(records[1].output, "running");
        assert_eq!(records[1].exit_code, None);
    }

    #[test]
    fn sentinel_script_rejects_hops() {
        let steps = vec![Step::new("hop", "ssh web1")];
        assert!(render_sentinel_script(&steps, None).is_err());
    }

    #[test]
    fn sentinel_script_keeps_multiline_commands() {
        let steps = vec![Step::new("multi", "echo a\necho b").with_env("A", "1")];
        let script = render_sentinel_script(&steps, None).unwrap();
        assert!(script.contains("{\nexport A=1 && echo a\necho b\n} 2>&1\n"));
    }

    #[test]
    fn stop_policy_is_fail_fast() {
        let stop = FailurePolicy::StopOnFailure;
        assert!(should_continue_after_step(StepOutcome::Succeeded, stop));
        assert!(!should_continue_after_step(StepOutcome::Failed, stop));
        assert!(!should_continue_after_step(StepOutcome::TimedOut, stop));
        assert!(!should_continue_after_step(StepOutcome::PromptUnanswered, stop));
    }

    #[test]
    fn continue_policy_tolerates_failures_but_not_cancellation() {
        let cont = FailurePolicy::for_step(&Step::new("a", "b").continue_on_error());
        assert_eq!(cont, FailurePolicy::ContinueOnFailure);
        assert!(should_continue_after_step(StepOutcome::Failed, cont));
        assert!(should_continue_after_step(StepOutcome::TimedOut, cont));
        assert!(!should_continue_after_step(StepOutcome::Cancelled, cont));
    }
}
