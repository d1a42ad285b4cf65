use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::prompt::PromptClassifier;
use crate::runner::ExecutionMode;
use crate::session::SessionConfig;
use crate::step::Step;

const CONFIG_FILENAME: &str = "config.toml";
pub const CONFIG_DIR: &str = ".shellrun";

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    #[default]
    Ssh,
    Local,
}

/// How to reach the target shell.
///
/// ```toml
/// [transport]
/// kind = "ssh"
/// host = "web-01.internal"
/// user = "deploy"
/// args = ["-o", "ServerAliveInterval=15"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// ssh client binary.
    #[serde(default = "default_ssh_program")]
    pub program: String,
    /// Extra arguments for the ssh client.
    #[serde(default)]
    pub args: Vec<String>,
    /// Shell for the local transport.
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_shell_args")]
    pub shell_args: Vec<String>,
    /// Extra environment for local shells.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_shell_args() -> Vec<String> {
    vec!["-i".to_string()]
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            host: None,
            user: None,
            port: None,
            identity_file: None,
            program: default_ssh_program(),
            args: Vec::new(),
            shell: default_shell(),
            shell_args: default_shell_args(),
            env: BTreeMap::new(),
        }
    }
}

fn default_persistent() -> bool {
    true
}

fn default_inactivity_timeout_secs() -> u64 {
    30
}

fn default_prompt_wait_timeout_secs() -> u64 {
    600
}

fn default_prompt_settle_millis() -> u64 {
    1500
}

fn default_tail_buffer_bytes() -> usize {
    8 * 1024
}

fn default_max_step_output_bytes() -> usize {
    1024 * 1024
}

fn default_exit_markers() -> bool {
    true
}

fn default_close_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    /// Requested execution mode; chosen from `persistent` when absent.
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default = "default_persistent")]
    pub persistent: bool,
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_prompt_wait_timeout_secs")]
    pub prompt_wait_timeout_secs: u64,
    #[serde(default = "default_prompt_settle_millis")]
    pub prompt_settle_millis: u64,
    #[serde(default = "default_tail_buffer_bytes")]
    pub tail_buffer_bytes: usize,
    #[serde(default = "default_max_step_output_bytes")]
    pub max_step_output_bytes: usize,
    #[serde(default = "default_exit_markers")]
    pub exit_markers: bool,
    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            mode: None,
            persistent: default_persistent(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            prompt_wait_timeout_secs: default_prompt_wait_timeout_secs(),
            prompt_settle_millis: default_prompt_settle_millis(),
            tail_buffer_bytes: default_tail_buffer_bytes(),
            max_step_output_bytes: default_max_step_output_bytes(),
            exit_markers: default_exit_markers(),
            close_timeout_secs: default_close_timeout_secs(),
        }
    }
}

impl SessionSettings {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
            prompt_wait_timeout: Duration::from_secs(self.prompt_wait_timeout_secs),
            prompt_settle: Duration::from_millis(self.prompt_settle_millis),
            tail_buffer_bytes: self.tail_buffer_bytes,
            max_step_output_bytes: self.max_step_output_bytes,
            exit_markers: self.exit_markers,
            close_timeout: Duration::from_secs(self.close_timeout_secs),
            ..SessionConfig::default()
        }
    }
}

/// Extra classifier patterns.
///
/// ```toml
/// [prompts]
/// shell = ['^\S+ ❯\s*$']
/// completion = ['(?i)deploy(ment)? complete\s*\z']
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PromptSettings {
    #[serde(default)]
    pub shell: Vec<String>,
    #[serde(default)]
    pub completion: Vec<String>,
}

impl PromptSettings {
    pub fn classifier(&self) -> Result<PromptClassifier> {
        PromptClassifier::with_extra_patterns(&self.shell, &self.completion)
            .context("invalid pattern in [prompts]")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProjectSettings {
    /// Remote directory the first command changes into.
    #[serde(default)]
    pub root: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProjectConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub prompts: PromptSettings,
    #[serde(default)]
    pub project: ProjectSettings,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.shellrun/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Directory holding `.shellrun/` for a loaded config, or `fallback`.
    pub fn base_dir(config_path: Option<&Path>, fallback: &Path) -> PathBuf {
        config_path
            .and_then(Path::parent)
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| fallback.to_path_buf())
    }
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .shellrun/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<24} {value}\n"));
}

fn or_none(value: Option<impl std::fmt::Display>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "(none)".to_string())
}

fn list_or_none(values: &[String]) -> String {
    if values.is_empty() {
        "(none)".to_string()
    } else {
        values.join(", ")
    }
}

pub fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    let transport = &config.transport;
    output.push_str("Transport\n");
    push_kv(
        &mut output,
        "kind",
        match transport.kind {
            TransportKind::Ssh => "ssh",
            TransportKind::Local => "local",
        },
    );
    match transport.kind {
        TransportKind::Ssh => {
            push_kv(&mut output, "host", or_none(transport.host.as_deref()));
            push_kv(&mut output, "user", or_none(transport.user.as_deref()));
            push_kv(&mut output, "port", or_none(transport.port));
            push_kv(
                &mut output,
                "identity_file",
                or_none(transport.identity_file.as_ref().map(|p| p.display())),
            );
            push_kv(&mut output, "program", &transport.program);
            push_kv(&mut output, "args", list_or_none(&transport.args));
        }
        TransportKind::Local => {
            push_kv(&mut output, "shell", &transport.shell);
            push_kv(&mut output, "shell_args", list_or_none(&transport.shell_args));
            if transport.env.is_empty() {
                push_kv(&mut output, "env", "(none)");
            } else {
                for (key, value) in &transport.env {
                    output.push_str(&format!("  - {key}={value}\n"));
                }
            }
        }
    }
    output.push('\n');

    let session = &config.session;
    output.push_str("Session\n");
    push_kv(&mut output, "mode", session.mode.map(ExecutionMode::label).unwrap_or("(auto)"));
    push_kv(&mut output, "persistent", session.persistent);
    push_kv(
        &mut output,
        "inactivity_timeout",
        format!("{}s", session.inactivity_timeout_secs),
    );
    push_kv(
        &mut output,
        "prompt_wait_timeout",
        format!("{}s", session.prompt_wait_timeout_secs),
    );
    push_kv(
        &mut output,
        "prompt_settle",
        format!("{}ms", session.prompt_settle_millis),
    );
    push_kv(&mut output, "tail_buffer_bytes", session.tail_buffer_bytes);
    push_kv(&mut output, "max_step_output_bytes", session.max_step_output_bytes);
    push_kv(&mut output, "exit_markers", session.exit_markers);
    push_kv(
        &mut output,
        "close_timeout",
        format!("{}s", session.close_timeout_secs),
    );
    output.push('\n');

    output.push_str("Prompts\n");
    push_kv(&mut output, "shell", list_or_none(&config.prompts.shell));
    push_kv(&mut output, "completion", list_or_none(&config.prompts.completion));
    output.push('\n');

    output.push_str("Project\n");
    push_kv(&mut output, "root", or_none(config.project.root.as_deref()));
    output.push('\n');

    output.push_str("Steps\n");
    if config.steps.is_empty() {
        push_kv(&mut output, "entries", "(none)");
    } else {
        for step in &config.steps {
            output.push_str(&format!("  - {} => {}\n", step.name, step.command));
        }
    }
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

pub fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    if let Some(object) = payload.as_object_mut() {
        object.insert(
            "source_path".to_string(),
            serde_json::Value::String(config_source_label(config_path)),
        );
    }
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}
