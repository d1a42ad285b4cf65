//! SSH transport built on the system `ssh` client.
//!
//! The interactive channel is `ssh -tt` in a PTY, so authentication prompts
//! (password, host-key confirmation) show up in the stream like any other
//! prompt and go through the same resolution path. One-shot commands run as
//! `ssh <destination> <command>` with captured output.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::bail;
use tracing::debug;

use super::pty::{self, PtySpec};
use super::{Connection, ExecOutput, ShellChannel, Transport};
use crate::config::TransportConfig;
use crate::error::EngineError;

/// Exit status `ssh` itself uses for connection failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshTransport {
    program: String,
    host: String,
    user: Option<String>,
    port: Option<u16>,
    identity_file: Option<PathBuf>,
    extra_args: Vec<String>,
}

impl SshTransport {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            program: "ssh".to_string(),
            host: host.into(),
            user: None,
            port: None,
            identity_file: None,
            extra_args: Vec::new(),
        }
    }

    pub fn from_config(config: &TransportConfig) -> anyhow::Result<Self> {
        let Some(host) = config.host.as_deref().filter(|h| !h.trim().is_empty()) else {
            bail!("ssh transport requires transport.host");
        };
        Ok(Self {
            program: config.program.clone(),
            host: host.to_string(),
            user: config.user.clone(),
            port: config.port,
            identity_file: config.identity_file.clone(),
            extra_args: config.args.clone(),
        })
    }

    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    fn option_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Arguments for the interactive channel.
    pub fn shell_args(&self) -> Vec<String> {
        let mut args = vec!["-tt".to_string()];
        args.extend(self.option_args());
        args.push(self.destination());
        args
    }

    /// Arguments for a one-shot command.
    pub fn exec_args(&self, command: &str) -> Vec<String> {
        let mut args = vec!["-T".to_string()];
        args.extend(self.option_args());
        args.push(self.destination());
        args.push(command.to_string());
        args
    }
}

impl Transport for SshTransport {
    fn name(&self) -> String {
        format!("ssh:{}", self.destination())
    }

    /// The system client authenticates when a channel is opened, so there is
    /// no separate handshake here; a channel that closes before the first
    /// prompt is reported as a connection failure by the session.
    fn connect(&self) -> Result<Box<dyn Connection>, EngineError> {
        Ok(Box::new(SshConnection {
            transport: self.clone(),
        }))
    }
}

struct SshConnection {
    transport: SshTransport,
}

impl Connection for SshConnection {
    fn open_shell(&mut self) -> Result<ShellChannel, EngineError> {
        pty::spawn(&PtySpec {
            program: self.transport.program.clone(),
            args: self.transport.shell_args(),
            cwd: None,
            env: vec![("TERM".to_string(), "dumb".to_string())],
        })
    }

    fn run_once(&mut self, command: &str) -> Result<ExecOutput, EngineError> {
        debug!(destination = %self.transport.destination(), "running one-shot remote command");
        let output = Command::new(&self.transport.program)
            .args(self.transport.exec_args(command))
            .stdin(Stdio::null())
            .output()
            .map_err(|e| EngineError::Exec(format!("failed to run {}: {e}", self.transport.program)))?;

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.code() == Some(SSH_CONNECTION_FAILURE) {
            return Err(EngineError::Connection(stderr.trim().to_string()));
        }
        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }
}
