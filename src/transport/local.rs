//! Local shell transport.
//!
//! Runs steps against an interactive shell on this machine. Useful for
//! rehearsing a deployment and for the PTY integration tests.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::debug;

use super::pty::{self, PtySpec};
use super::{Connection, ExecOutput, ShellChannel, Transport};
use crate::config::TransportConfig;
use crate::error::EngineError;

/// Prompt exported to the local shell so readiness is recognised.
const LOCAL_PROMPT: &str = "shellrun@local$ ";

#[derive(Debug, Clone)]
pub struct LocalTransport {
    shell: String,
    shell_args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl LocalTransport {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            shell_args: vec!["-i".to_string()],
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        let mut transport = Self::new(config.shell.clone());
        transport.shell_args = config.shell_args.clone();
        transport.env = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        transport
    }

    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    fn spec(&self) -> PtySpec {
        let mut env = vec![
            ("PS1".to_string(), LOCAL_PROMPT.to_string()),
            ("TERM".to_string(), "dumb".to_string()),
        ];
        env.extend(self.env.iter().cloned());
        PtySpec {
            program: self.shell.clone(),
            args: self.shell_args.clone(),
            cwd: self.cwd.clone(),
            env,
        }
    }
}

impl Transport for LocalTransport {
    fn name(&self) -> String {
        format!("local:{}", self.shell)
    }

    fn connect(&self) -> Result<Box<dyn Connection>, EngineError> {
        Ok(Box::new(LocalConnection {
            transport: self.clone(),
        }))
    }
}

struct LocalConnection {
    transport: LocalTransport,
}

impl Connection for LocalConnection {
    fn open_shell(&mut self) -> Result<ShellChannel, EngineError> {
        pty::spawn(&self.transport.spec())
    }

    fn run_once(&mut self, command: &str) -> Result<ExecOutput, EngineError> {
        debug!(shell = %self.transport.shell, "running one-shot command");
        let mut cmd = Command::new(&self.transport.shell);
        cmd.arg("-c").arg(command).stdin(Stdio::null());
        if let Some(cwd) = &self.transport.cwd {
            cmd.current_dir(cwd);
        }
        for (key, val) in &self.transport.env {
            cmd.env(key, val);
        }
        let output = cmd
            .output()
            .map_err(|e| EngineError::Exec(format!("failed to run {}: {e}", self.transport.shell)))?;
        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_once_captures_exit_code_and_streams() {
        let transport = LocalTransport::new("sh");
        let mut conn = transport.connect().unwrap();
        let out = conn.run_once("echo built; echo warn >&2; exit 3").unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout, "built\n");
        assert_eq!(out.stderr, "warn\n");
    }

    #[test]
    fn run_once_uses_working_directory() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("marker.txt"), "x").unwrap();
        let transport = LocalTransport::new("sh").in_dir(tmp.path());
        let out = transport.connect().unwrap().run_once("ls").unwrap();
        assert!(out.stdout.contains("marker.txt"));
    }

    #[test]
    fn missing_shell_is_an_exec_error() {
        let transport = LocalTransport::new("/definitely/not/a/shell");
        let err = transport.connect().unwrap().run_once("true").unwrap_err();
        assert!(matches!(err, EngineError::Exec(_)));
    }

    #[test]
    fn spec_exports_recognisable_prompt() {
        let spec = LocalTransport::new("bash").spec();
        assert!(spec.env.iter().any(|(k, v)| k == "PS1" && v == LOCAL_PROMPT));
        assert_eq!(spec.args, vec!["-i"]);
        assert_eq!(
            crate::prompt::PromptClassifier::default().classify(LOCAL_PROMPT),
            crate::prompt::Classification::ShellReady
        );
    }
}
