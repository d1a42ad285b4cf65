//! Remote transport seam.
//!
//! The engine only needs three things from a transport: connect, open a
//! full-duplex interactive channel, and run a single command to completion.
//! `ssh` and `local` drive a real shell through a PTY; `fake` replays a
//! script for tests.

pub mod local;
mod pty;
pub mod ssh;

#[cfg(any(test, feature = "scenario-test"))]
pub mod fake;

use std::io;
use std::sync::mpsc::Receiver;

use crate::config::{TransportConfig, TransportKind};
use crate::error::EngineError;

/// What the interactive channel reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Data(Vec<u8>),
    /// The remote end closed the stream.
    Closed,
    Error(String),
}

/// Write half of an interactive channel.
pub trait ChannelWriter: Send {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Close the channel. Idempotent; a `Closed` event follows.
    fn close(&mut self);
}

/// An open interactive channel: a writer plus the stream of events.
pub struct ShellChannel {
    pub writer: Box<dyn ChannelWriter>,
    pub events: Receiver<ChannelEvent>,
}

/// Output of a command run to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout with stderr appended under a separator when present.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim_end();
        let stderr = self.stderr.trim_end();
        if stderr.is_empty() {
            stdout.to_string()
        } else if stdout.is_empty() {
            format!("--- stderr ---\n{stderr}")
        } else {
            format!("{stdout}\n--- stderr ---\n{stderr}")
        }
    }
}

/// An established, authenticated connection.
pub trait Connection: Send {
    fn open_shell(&mut self) -> Result<ShellChannel, EngineError>;
    fn run_once(&mut self, command: &str) -> Result<ExecOutput, EngineError>;
    fn disconnect(&mut self) {}
}

pub trait Transport: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> String;
    fn connect(&self) -> Result<Box<dyn Connection>, EngineError>;
}

/// Build the transport named by the configuration.
pub fn transport_from_config(config: &TransportConfig) -> anyhow::Result<Box<dyn Transport>> {
    match config.kind {
        TransportKind::Ssh => Ok(Box::new(ssh::SshTransport::from_config(config)?)),
        TransportKind::Local => Ok(Box::new(local::LocalTransport::from_config(config))),
    }
}
