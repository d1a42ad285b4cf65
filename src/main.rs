mod cli;
mod shell_completion;

use anyhow::{Context, Result, bail};
use clap::Parser;
use dialoguer::{Input, Password};
use std::io::{IsTerminal, Read, Write};
use std::path::Path;
use tracing::{info, warn};

use cli::{Cli, Command, TargetArgs};
use shellrun::config::{ProjectConfig, TransportConfig, TransportKind, render_config_human, render_config_json};
use shellrun::events::{PromptEvent, SessionEvent, SessionObserver};
use shellrun::log::{ExecutionLog, LogEvent, LogObserver};
use shellrun::prompt::{Classification, strip_ansi};
use shellrun::results::{RunSummary, StepResult, summarize};
use shellrun::runner::{BatchRunner, ExecutionMode, select_mode};
use shellrun::sequencer::{build_command, plan_commands, render_sentinel_script};
use shellrun::session::SessionBuilder;
use shellrun::step::{Step, load_steps, missing_required_inputs};
use shellrun::transport::transport_from_config;
use shellrun::paths;

/// Everything `run` and `plan` need, resolved from config plus flags.
struct RunTarget {
    steps: Vec<Step>,
    root: Option<String>,
    transport: TransportConfig,
}

fn resolve_target(config: &ProjectConfig, args: &TargetArgs) -> Result<RunTarget> {
    let steps = match &args.steps {
        Some(path) => load_steps(path)?,
        None => config.steps.clone(),
    };
    if steps.is_empty() {
        bail!("no steps to run: pass --steps FILE or add [[steps]] to .shellrun/config.toml");
    }

    let mut transport = config.transport.clone();
    if args.local {
        transport.kind = TransportKind::Local;
    }
    if let Some(host) = &args.host {
        transport.kind = TransportKind::Ssh;
        transport.host = Some(host.clone());
    }
    if let Some(user) = &args.user {
        transport.user = Some(user.clone());
    }

    Ok(RunTarget {
        steps,
        root: args.root.clone().or_else(|| config.project.root.clone()),
        transport,
    })
}

fn render_plan(target: &RunTarget, mode: ExecutionMode, exit_markers: bool) -> Result<String> {
    let root = target.root.as_deref();
    let mut output = format!("Mode: {}\n", mode.label());
    match mode {
        ExecutionMode::Interactive => {
            let plan = plan_commands(&target.steps, root, exit_markers)?;
            for (index, (step, planned)) in target.steps.iter().zip(&plan).enumerate() {
                let note = if planned.control { "  (session control)" } else { "" };
                output.push_str(&format!("  {:>2}. {:<16} {}{note}\n", index + 1, step.name, planned.text));
            }
        }
        ExecutionMode::OneShot => {
            for (index, step) in target.steps.iter().enumerate() {
                let command = build_command(step, true, root)?;
                output.push_str(&format!("  {:>2}. {:<16} {command}\n", index + 1, step.name));
            }
        }
        ExecutionMode::SentinelScript => {
            output.push('\n');
            output.push_str(&render_sentinel_script(&target.steps, root)?);
        }
    }
    Ok(output)
}

/// Interpret `\n`, `\r`, `\t`, `\e` and `\\` so prompts can be typed on the
/// command line.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('e') => out.push('\x1b'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn describe_classification(classification: &Classification) -> String {
    match classification {
        Classification::ShellReady => "shell-ready".to_string(),
        Classification::NaturalCompletion => "natural-completion".to_string(),
        Classification::None => "none".to_string(),
        Classification::ApplicationPrompt { kind, text } => {
            let kind = serde_json::to_value(kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("{kind:?}"));
            format!("application-prompt ({kind}): {text}")
        }
    }
}

/// Ask for every required input that has no value yet.
fn fill_required_inputs(steps: &mut [Step]) -> Result<()> {
    let missing = missing_required_inputs(steps);
    if missing.is_empty() {
        return Ok(());
    }
    if !std::io::stdin().is_terminal() {
        let (step_idx, input_idx) = missing[0];
        bail!(
            "step '{}' requires a value for prompts matching '{}'",
            steps[step_idx].name,
            steps[step_idx].inputs[input_idx].prompt_match
        );
    }
    for (step_idx, input_idx) in missing {
        let step = &mut steps[step_idx];
        let label = format!("{} ({})", step.name, step.inputs[input_idx].prompt_match);
        let value = Password::new()
            .with_prompt(label)
            .interact()
            .context("failed to read required input")?;
        step.inputs[input_idx].value = value;
    }
    Ok(())
}

fn ask(prompt: &PromptEvent) -> Result<String> {
    let step = prompt.step.as_deref().unwrap_or("session");
    let label = format!("[{step}] {}", prompt.prompt);
    let answer = if prompt.kind.is_secret() {
        Password::new()
            .with_prompt(label)
            .allow_empty_password(true)
            .interact()?
    } else {
        Input::<String>::new()
            .with_prompt(label)
            .allow_empty(true)
            .interact_text()?
    };
    Ok(answer)
}

/// Progress lines on stderr.
struct Console {
    total: usize,
}

impl SessionObserver for Console {
    fn on_event(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::StepStarted { index, name, .. } => {
                eprintln!("==> [{}/{}] {name}", index + 1, self.total);
            }
            SessionEvent::StepCompleted { result, .. } => {
                eprintln!(
                    "    {} {} ({} ms)",
                    if result.success { "ok" } else { "!!" },
                    result.outcome.label(),
                    result.duration_ms
                );
            }
            SessionEvent::AutoAnswered { step, .. } => {
                eprintln!("    [{step}] answered prompt from step inputs");
            }
            _ => {}
        }
    }
}

fn render_results_human(results: &[StepResult], summary: &RunSummary) -> String {
    let mut output = String::new();
    for result in results {
        output.push_str(&format!("{:<16} {}", result.step_name, result.outcome.label()));
        if let Some(code) = result.exit_code {
            output.push_str(&format!(" (exit {code})"));
        }
        if let Some(error) = &result.error {
            if !result.success && error != result.outcome.label() {
                output.push_str(&format!(": {error}"));
            }
        }
        output.push('\n');
        for line in result.output.lines() {
            output.push_str(&format!("    {line}\n"));
        }
    }
    output.push_str(&format!(
        "\n{} steps: {} succeeded, {} failed, {} not executed, {} cancelled ({} ms)\n",
        summary.total,
        summary.succeeded,
        summary.failed,
        summary.not_executed,
        summary.cancelled,
        summary.duration_ms
    ));
    output
}

fn run_interactive(
    builder: SessionBuilder,
    transport: &dyn shellrun::transport::Transport,
) -> Result<Vec<StepResult>> {
    let handle = builder.start(transport)?;
    let abort = handle.abort_handle();
    ctrlc::set_handler(move || abort.abort()).context("failed to install Ctrl-C handler")?;

    let interactive = std::io::stdin().is_terminal();
    for event in handle.subscribe() {
        let SessionEvent::PromptDetected(prompt) = event else {
            continue;
        };
        if !interactive {
            warn!(prompt = %prompt.prompt, "prompt needs input but stdin is not a terminal; aborting");
            handle.abort();
            continue;
        }
        match ask(&prompt) {
            Ok(answer) => {
                if !handle.submit_input(&answer) {
                    warn!("prompt was no longer waiting for input");
                }
            }
            Err(e) => {
                warn!("failed to read input: {e}; aborting");
                handle.abort();
            }
        }
    }
    Ok(handle.wait()?)
}

fn run(
    config: &ProjectConfig,
    config_path: Option<&Path>,
    cwd: &Path,
    args: &TargetArgs,
    mode: Option<ExecutionMode>,
    json: bool,
    no_log: bool,
) -> Result<bool> {
    let mut target = resolve_target(config, args)?;
    fill_required_inputs(&mut target.steps)?;
    let mode = select_mode(
        &target.steps,
        mode.or(config.session.mode),
        config.session.persistent,
    );
    let transport = transport_from_config(&target.transport)?;
    let session_id = uuid::Uuid::new_v4().to_string();
    info!(session = %session_id, mode = mode.label(), transport = %transport.name(), "starting run");

    let log = if no_log {
        None
    } else {
        let base = ProjectConfig::base_dir(config_path, cwd);
        let log = ExecutionLog::new(&paths::session_log_path(&base, &session_id))?;
        log.log(LogEvent::SessionStarted {
            session_id: session_id.clone(),
            transport: transport.name(),
            mode: mode.label().to_string(),
            steps: target.steps.len(),
        })?;
        info!(path = %log.path().display(), "execution log");
        Some(LogObserver::new(log))
    };
    let console = Console {
        total: target.steps.len(),
    };

    let results = match mode {
        ExecutionMode::Interactive => {
            let mut builder = SessionBuilder::new(target.steps)
                .session_id(session_id.clone())
                .config(config.session.session_config())
                .classifier(config.prompts.classifier()?)
                .observer(console);
            if let Some(root) = target.root {
                builder = builder.project_root(root);
            }
            if let Some(log) = log {
                builder = builder.observer(log);
            }
            run_interactive(builder, transport.as_ref())?
        }
        ExecutionMode::OneShot | ExecutionMode::SentinelScript => {
            let mut runner = if mode == ExecutionMode::OneShot {
                BatchRunner::one_shot(target.steps)
            } else {
                BatchRunner::sentinel_script(target.steps)
            };
            runner = runner.observer(console);
            if let Some(root) = target.root {
                runner = runner.project_root(root);
            }
            if let Some(log) = log {
                runner = runner.observer(log);
            }
            runner.run(transport.as_ref())?
        }
    };

    let summary = summarize(&results);
    if json {
        let payload = serde_json::json!({
            "session_id": session_id,
            "mode": mode,
            "results": results,
            "summary": summary,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("failed to serialize results")?
        );
    } else {
        print!("{}", render_results_human(&results, &summary));
    }
    Ok(summary.all_succeeded())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_quiet_command = matches!(
        &cli.command,
        Command::Config { .. } | Command::Classify { .. } | Command::Completions { .. }
    );

    let filter = match cli.verbose {
        0 if is_quiet_command => "shellrun=warn",
        0 => "shellrun=info",
        1 => "shellrun=debug",
        _ => "shellrun=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;

    if !is_quiet_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .shellrun/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Run {
            target,
            mode,
            json,
            no_log,
        } => {
            let all_succeeded = run(
                &config,
                config_path.as_deref(),
                &cwd,
                &target,
                mode,
                json,
                no_log,
            )?;
            if !all_succeeded {
                std::io::stdout().flush().ok();
                std::process::exit(1);
            }
        }
        Command::Plan { target, mode } => {
            let target = resolve_target(&config, &target)?;
            let mode = select_mode(
                &target.steps,
                mode.or(config.session.mode),
                config.session.persistent,
            );
            print!("{}", render_plan(&target, mode, config.session.exit_markers)?);
        }
        Command::Classify { text } => {
            let text = match text {
                Some(text) => unescape(&text),
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("failed to read stdin")?;
                    buf
                }
            };
            let classifier = config.prompts.classifier()?;
            println!(
                "{}",
                describe_classification(&classifier.classify(&strip_ansi(&text)))
            );
        }
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
        }
        Command::Completions { shell } => shell_completion::print(shell)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shellrun::prompt::PromptKind;
    use shellrun::results::StepOutcome;
    use shellrun::step::StepInput;

    fn args() -> TargetArgs {
        TargetArgs::default()
    }

    #[test]
    fn steps_file_overrides_config_steps() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("deploy.yaml");
        std::fs::write(&path, "steps:\n  - name: build\n    command: make\n").unwrap();

        let mut config = ProjectConfig::default();
        config.steps = vec![Step::new("old", "true")];
        config.project.root = Some("/srv/app".to_string());

        let target = resolve_target(
            &config,
            &TargetArgs {
                steps: Some(path),
                host: Some("web1".to_string()),
                ..args()
            },
        )
        .unwrap();
        assert_eq!(target.steps, vec![Step::new("build", "make")]);
        assert_eq!(target.root.as_deref(), Some("/srv/app"));
        assert_eq!(target.transport.host.as_deref(), Some("web1"));
    }

    #[test]
    fn local_flag_switches_transport() {
        let mut config = ProjectConfig::default();
        config.steps = vec![Step::new("build", "make")];
        let target = resolve_target(
            &config,
            &TargetArgs {
                local: true,
                root: Some("/tmp/app".to_string()),
                ..args()
            },
        )
        .unwrap();
        assert_eq!(target.transport.kind, TransportKind::Local);
        assert_eq!(target.root.as_deref(), Some("/tmp/app"));
    }

    #[test]
    fn missing_steps_is_an_error() {
        let err = resolve_target(&ProjectConfig::default(), &args())
            .err()
            .unwrap();
        assert!(err.to_string().contains("no steps"));
    }

    #[test]
    fn plan_shows_literal_commands() {
        let target = RunTarget {
            steps: vec![
                Step::new("build", "npm run build"),
                Step::new("hop", "ssh web1"),
                Step::new("restart", "pm2 restart app"),
            ],
            root: Some("/srv/app".to_string()),
            transport: TransportConfig::default(),
        };
        let plan = render_plan(&target, ExecutionMode::Interactive, true).unwrap();
        assert!(plan.starts_with("Mode: interactive\n"));
        assert!(plan.contains("cd /srv/app && npm run build"));
        assert!(plan.contains("ssh web1  (session control)"));

        let one_shot = RunTarget {
            steps: vec![Step::new("build", "make"), Step::new("test", "make test")],
            ..target
        };
        let plan = render_plan(&one_shot, ExecutionMode::OneShot, true).unwrap();
        assert_eq!(plan.matches("cd /srv/app && ").count(), 2);
    }

    #[test]
    fn unescape_handles_common_escapes() {
        assert_eq!(unescape(r"a\r\nuser@host:~$ "), "a\r\nuser@host:~$ ");
        assert_eq!(unescape(r"\e[32mok\e[0m"), "\x1b[32mok\x1b[0m");
        assert_eq!(unescape(r"C:\path\\x"), r"C:\path\x");
        assert_eq!(unescape("trailing\\"), "trailing\\");
    }

    #[test]
    fn classification_descriptions() {
        assert_eq!(describe_classification(&Classification::ShellReady), "shell-ready");
        assert_eq!(
            describe_classification(&Classification::ApplicationPrompt {
                kind: PromptKind::HostKey,
                text: "continue connecting (yes/no)?".to_string(),
            }),
            "application-prompt (host_key): continue connecting (yes/no)?"
        );
    }

    #[test]
    fn human_results_list_every_step() {
        let results = vec![
            StepResult::succeeded("build", "built\nok".to_string(), 1200, Some(0)),
            StepResult::not_executed("restart"),
        ];
        let summary = summarize(&results);
        let rendered = render_results_human(&results, &summary);
        assert!(rendered.contains("build            ok (exit 0)\n    built\n    ok\n"));
        assert!(rendered.contains("restart          not executed\n"));
        assert!(rendered.contains("2 steps: 1 succeeded, 0 failed, 1 not executed"));
        assert_eq!(results[1].outcome, StepOutcome::NotExecuted);
    }

    #[test]
    fn required_inputs_with_values_need_no_prompting() {
        let mut steps = vec![Step::new("login", "docker login")];
        steps[0].inputs.push(StepInput {
            prompt_match: "password".to_string(),
            value: "s3cret".to_string(),
            required: true,
        });
        fill_required_inputs(&mut steps).unwrap();
        assert_eq!(steps[0].inputs[0].value, "s3cret");
    }
}
