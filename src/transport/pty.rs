//! Shell process in a pseudo-terminal.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, info};

use super::{ChannelEvent, ChannelWriter, ShellChannel};
use crate::error::EngineError;

/// What to spawn behind the channel.
#[derive(Debug, Clone)]
pub(crate) struct PtySpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

fn pty_size() -> PtySize {
    PtySize {
        rows: 24,
        cols: 200,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Spawn `spec` in a fresh PTY and stream its output as channel events.
pub(crate) fn spawn(spec: &PtySpec) -> Result<ShellChannel, EngineError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(pty_size())
        .map_err(|e| EngineError::Channel(format!("failed to open PTY: {e}")))?;

    let mut cmd = CommandBuilder::new(&spec.program);
    for arg in &spec.args {
        cmd.arg(arg);
    }
    if let Some(cwd) = &spec.cwd {
        cmd.cwd(cwd);
    }
    for (key, val) in &spec.env {
        cmd.env(key, val);
    }

    info!(program = %spec.program, args = ?spec.args, "spawning shell in PTY");

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| EngineError::Connection(format!("failed to spawn {}: {e}", spec.program)))?;

    // Only the master side is used from here on.
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| EngineError::Channel(format!("failed to clone PTY reader: {e}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| EngineError::Channel(format!("failed to take PTY writer: {e}")))?;

    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("shellrun-pty-reader".to_string())
        .spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(ChannelEvent::Data(buf[..n].to_vec())).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        // EIO once the child has exited
                        debug!("PTY read ended: {e}");
                        break;
                    }
                }
            }
            let _ = tx.send(ChannelEvent::Closed);
        })
        .map_err(|e| EngineError::Channel(format!("failed to start PTY reader: {e}")))?;

    Ok(ShellChannel {
        writer: Box::new(PtyWriter {
            writer,
            child,
            _master: pair.master,
            closed: false,
        }),
        events: rx,
    })
}

struct PtyWriter {
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    // Dropping the master hangs up the PTY; keep it for the channel's lifetime.
    _master: Box<dyn MasterPty + Send>,
    closed: bool,
}

impl ChannelWriter for PtyWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.kill() {
                debug!("failed to kill shell process: {e}");
            }
        }
        let _ = self.child.try_wait();
    }
}

impl Drop for PtyWriter {
    fn drop(&mut self) {
        self.close();
    }
}
