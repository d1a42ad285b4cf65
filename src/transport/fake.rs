//! Scripted transport for driving the session engine without a real shell.
//!
//! The fake shell echoes each written line, looks up a scripted reply by
//! substring of the command (marker-wrapped commands are unwrapped first),
//! plays the reply's chunks and then prints the exit marker and a prompt.
//! Replies can stop to wait for an input line, hang until interrupted, open a
//! nested session with its own prompt, or close the channel.

use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};

use super::{ChannelEvent, ChannelWriter, Connection, ExecOutput, ShellChannel, Transport};
use crate::error::EngineError;
use crate::sequencer::is_session_exit;

const WRAP_PREFIX: &str = "printf '__SR_%s__\\n' BEGIN; eval ";
const WRAP_SUFFIX: &str = "; printf '__SR_RC=%s__\\n' \"$?\"";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Output(String),
    /// Wait for one input line, echoing it back.
    AwaitInput,
    /// Wait for one input line without echo.
    AwaitSecret,
    /// Produce nothing more until interrupted.
    Hang,
    /// Close the channel.
    Close,
}

#[derive(Debug, Clone)]
pub struct Reply {
    matches: String,
    chunks: Vec<Chunk>,
    exit_code: i32,
    enters: Option<String>,
}

impl Reply {
    /// Reply to any command containing `matches`.
    pub fn to(matches: impl Into<String>) -> Self {
        Self {
            matches: matches.into(),
            chunks: Vec::new(),
            exit_code: 0,
            enters: None,
        }
    }

    pub fn output(mut self, text: impl Into<String>) -> Self {
        self.chunks.push(Chunk::Output(text.into()));
        self
    }

    pub fn await_input(mut self) -> Self {
        self.chunks.push(Chunk::AwaitInput);
        self
    }

    pub fn await_secret(mut self) -> Self {
        self.chunks.push(Chunk::AwaitSecret);
        self
    }

    pub fn hang(mut self) -> Self {
        self.chunks.push(Chunk::Hang);
        self
    }

    pub fn close(mut self) -> Self {
        self.chunks.push(Chunk::Close);
        self
    }

    pub fn exit(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    /// The command opens a nested session whose prompt is `prompt`.
    pub fn enters(mut self, prompt: impl Into<String>) -> Self {
        self.enters = Some(prompt.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct FakeScript {
    prompt: String,
    banner: Vec<Chunk>,
    replies: Vec<Reply>,
    initial_prompt: bool,
    closes_on_exit: bool,
}

impl FakeScript {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            banner: Vec::new(),
            replies: Vec::new(),
            initial_prompt: true,
            closes_on_exit: true,
        }
    }

    /// Output (or prompts) played when the channel opens, before the prompt.
    pub fn banner(mut self, chunk: Chunk) -> Self {
        self.banner.push(chunk);
        self
    }

    pub fn reply(mut self, reply: Reply) -> Self {
        self.replies.push(reply);
        self
    }

    /// Open the channel without printing a prompt.
    pub fn without_initial_prompt(mut self) -> Self {
        self.initial_prompt = false;
        self
    }

    /// `exit` on the outermost shell prints `logout` but leaves the channel
    /// open, like a remote host that never hangs up.
    pub fn ignoring_exit(mut self) -> Self {
        self.closes_on_exit = false;
        self
    }

    fn find(&self, command: &str) -> Option<&Reply> {
        self.replies.iter().find(|r| command.contains(&r.matches))
    }
}

#[derive(Debug, Clone)]
enum Failure {
    Connect(String),
    Shell(String),
    CloseOnOpen,
}

/// Transport whose shell is a `FakeScript`. Every line written to the
/// channel (and every interrupt, as `"\x03"`) is recorded.
#[derive(Clone)]
pub struct FakeTransport {
    script: FakeScript,
    writes: Arc<Mutex<Vec<String>>>,
    failure: Option<Failure>,
}

impl FakeTransport {
    pub fn new(script: FakeScript) -> Self {
        Self {
            script,
            writes: Arc::new(Mutex::new(Vec::new())),
            failure: None,
        }
    }

    pub fn refusing(message: impl Into<String>) -> Self {
        let mut transport = Self::new(FakeScript::new("$ "));
        transport.failure = Some(Failure::Connect(message.into()));
        transport
    }

    pub fn without_shell(message: impl Into<String>) -> Self {
        let mut transport = Self::new(FakeScript::new("$ "));
        transport.failure = Some(Failure::Shell(message.into()));
        transport
    }

    /// The channel opens and closes before any prompt.
    pub fn closing_on_open() -> Self {
        let mut transport = Self::new(FakeScript::new("$ "));
        transport.failure = Some(Failure::CloseOnOpen);
        transport
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Transport for FakeTransport {
    fn name(&self) -> String {
        "fake".to_string()
    }

    fn connect(&self) -> Result<Box<dyn Connection>, EngineError> {
        if let Some(Failure::Connect(message)) = &self.failure {
            return Err(EngineError::Connection(message.clone()));
        }
        Ok(Box::new(FakeConnection {
            transport: self.clone(),
        }))
    }
}

struct FakeConnection {
    transport: FakeTransport,
}

impl Connection for FakeConnection {
    fn open_shell(&mut self) -> Result<ShellChannel, EngineError> {
        match &self.transport.failure {
            Some(Failure::Shell(message)) => return Err(EngineError::Channel(message.clone())),
            Some(Failure::CloseOnOpen) => {
                let (tx, rx) = mpsc::channel();
                let _ = tx.send(ChannelEvent::Data(b"kex_exchange_identification: Connection closed\r\n".to_vec()));
                let _ = tx.send(ChannelEvent::Closed);
                let shell = FakeShell::new(self.transport.clone(), tx);
                return Ok(ShellChannel {
                    writer: Box::new(FakeShell {
                        state: State::Closed,
                        ..shell
                    }),
                    events: rx,
                });
            }
            _ => {}
        }

        let (tx, rx) = mpsc::channel();
        let mut shell = FakeShell::new(self.transport.clone(), tx);
        let banner: VecDeque<Chunk> = self.transport.script.banner.iter().cloned().collect();
        let initial_prompt = self.transport.script.initial_prompt;
        shell.play(Running {
            chunks: banner,
            wrapped: false,
            exit_code: 0,
            enters: None,
            echo_input: true,
            prompt: initial_prompt,
        });
        Ok(ShellChannel {
            writer: Box::new(shell),
            events: rx,
        })
    }

    fn run_once(&mut self, command: &str) -> Result<ExecOutput, EngineError> {
        self.transport
            .writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.to_string());
        let Some(reply) = self.transport.script.find(command) else {
            return Ok(ExecOutput {
                exit_code: Some(0),
                ..ExecOutput::default()
            });
        };
        let stdout = reply
            .chunks
            .iter()
            .filter_map(|chunk| match chunk {
                Chunk::Output(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<String>();
        Ok(ExecOutput {
            exit_code: Some(reply.exit_code),
            stdout,
            stderr: String::new(),
        })
    }
}

#[derive(Debug)]
struct Running {
    chunks: VecDeque<Chunk>,
    wrapped: bool,
    exit_code: i32,
    enters: Option<String>,
    echo_input: bool,
    /// Print the exit marker and prompt once the chunks are played.
    prompt: bool,
}

#[derive(Debug)]
enum State {
    Idle,
    /// Paused inside a reply, waiting for an input line.
    Waiting(Running),
    Hung,
    Closed,
}

struct FakeShell {
    script: FakeScript,
    writes: Arc<Mutex<Vec<String>>>,
    tx: Sender<ChannelEvent>,
    prompts: Vec<String>,
    state: State,
    line: String,
}

impl FakeShell {
    fn new(transport: FakeTransport, tx: Sender<ChannelEvent>) -> Self {
        let base = transport.script.prompt.clone();
        Self {
            script: transport.script,
            writes: transport.writes,
            tx,
            prompts: vec![base],
            state: State::Idle,
            line: String::new(),
        }
    }

    fn emit(&self, text: &str) {
        let _ = self.tx.send(ChannelEvent::Data(text.as_bytes().to_vec()));
    }

    fn emit_prompt(&self) {
        if let Some(prompt) = self.prompts.last() {
            self.emit(prompt);
        }
    }

    fn record(&self, line: &str) {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
    }

    fn shut(&mut self) {
        if !matches!(self.state, State::Closed) {
            self.state = State::Closed;
            let _ = self.tx.send(ChannelEvent::Closed);
        }
    }

    fn play(&mut self, mut run: Running) {
        while let Some(chunk) = run.chunks.pop_front() {
            match chunk {
                Chunk::Output(text) => self.emit(&text),
                Chunk::AwaitInput => {
                    run.echo_input = true;
                    self.state = State::Waiting(run);
                    return;
                }
                Chunk::AwaitSecret => {
                    run.echo_input = false;
                    self.state = State::Waiting(run);
                    return;
                }
                Chunk::Hang => {
                    self.state = State::Hung;
                    return;
                }
                Chunk::Close => {
                    self.shut();
                    return;
                }
            }
        }
        if run.wrapped {
            self.emit(&format!("__SR_RC={}__\r\n", run.exit_code));
        }
        if let Some(prompt) = run.enters {
            self.prompts.push(prompt);
        }
        self.state = State::Idle;
        if run.prompt {
            self.emit_prompt();
        }
    }

    fn interrupt(&mut self) {
        if matches!(self.state, State::Closed) {
            return;
        }
        self.record("\x03");
        self.line.clear();
        self.emit("^C\r\n");
        self.state = State::Idle;
        self.emit_prompt();
    }

    fn on_line(&mut self, line: String) {
        self.record(&line);
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Closed => self.state = State::Closed,
            State::Hung => {
                self.emit(&format!("{line}\r\n"));
                self.state = State::Hung;
            }
            State::Waiting(run) => {
                if run.echo_input {
                    self.emit(&format!("{line}\r\n"));
                } else {
                    self.emit("\r\n");
                }
                self.play(run);
            }
            State::Idle => {
                self.emit(&format!("{line}\r\n"));
                self.run_command(&line);
            }
        }
    }

    fn run_command(&mut self, line: &str) {
        let (command, wrapped) = unwrap_marked(line);
        if is_session_exit(&command) {
            self.emit("logout\r\n");
            if self.prompts.len() > 1 {
                self.prompts.pop();
                self.emit_prompt();
            } else if self.script.closes_on_exit {
                self.shut();
            }
            return;
        }
        if wrapped {
            self.emit("__SR_BEGIN__\r\n");
        }
        let (chunks, exit_code, enters) = match self.script.find(&command) {
            Some(reply) => (
                reply.chunks.iter().cloned().collect(),
                reply.exit_code,
                reply.enters.clone(),
            ),
            None => (VecDeque::new(), 0, None),
        };
        self.play(Running {
            chunks,
            wrapped,
            exit_code,
            enters,
            echo_input: true,
            prompt: true,
        });
    }
}

impl ChannelWriter for FakeShell {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if matches!(self.state, State::Closed) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }
        for ch in String::from_utf8_lossy(bytes).chars() {
            match ch {
                '\x03' => self.interrupt(),
                '\n' => {
                    let line = std::mem::take(&mut self.line);
                    self.on_line(line);
                }
                '\r' => {}
                other => self.line.push(other),
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.shut();
    }
}

fn unwrap_marked(line: &str) -> (String, bool) {
    let inner = line
        .strip_prefix(WRAP_PREFIX)
        .and_then(|rest| rest.strip_suffix(WRAP_SUFFIX));
    match inner {
        Some(quoted) => {
            let unquoted = match quoted
                .strip_prefix('\'')
                .and_then(|q| q.strip_suffix('\''))
            {
                Some(body) => body.replace(r"'\''", "'"),
                None => quoted.to_string(),
            };
            (unquoted, true)
        }
        None => (line.trim().to_string(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::wrap_with_markers;
    use std::sync::mpsc::Receiver;

    fn drain(rx: &Receiver<ChannelEvent>) -> String {
        let mut text = String::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                ChannelEvent::Data(bytes) => text.push_str(&String::from_utf8_lossy(&bytes)),
                ChannelEvent::Closed => text.push_str("<closed>"),
                ChannelEvent::Error(e) => text.push_str(&format!("<error {e}>")),
            }
        }
        text
    }

    #[test]
    fn unwraps_marker_wrapper() {
        let wire = wrap_with_markers("echo 'it''s' && make");
        let (command, wrapped) = unwrap_marked(&wire);
        assert!(wrapped);
        assert_eq!(command, "echo 'it''s' && make");
        assert_eq!(unwrap_marked(" ls "), ("ls".to_string(), false));
    }

    #[test]
    fn wrapped_command_gets_markers_and_prompt() {
        let transport = FakeTransport::new(
            FakeScript::new("$ ").reply(Reply::to("make").output("cc\r\n").exit(2)),
        );
        let mut conn = transport.connect().unwrap();
        let ShellChannel { mut writer, events } = conn.open_shell().unwrap();
        assert_eq!(drain(&events), "$ ");

        let wire = wrap_with_markers("make");
        writer.write(format!("{wire}\n").as_bytes()).unwrap();
        assert_eq!(
            drain(&events),
            format!("{wire}\r\n__SR_BEGIN__\r\ncc\r\n__SR_RC=2__\r\n$ ")
        );
        assert_eq!(transport.writes(), vec![wire]);
    }

    #[test]
    fn waits_for_input_and_hangs_until_interrupt() {
        let transport = FakeTransport::new(
            FakeScript::new("$ ")
                .reply(Reply::to("login").output("Password: ").await_secret().output("ok\r\n"))
                .reply(Reply::to("tail -f").hang()),
        );
        let mut conn = transport.connect().unwrap();
        let ShellChannel { mut writer, events } = conn.open_shell().unwrap();
        drain(&events);

        writer.write(b"login\n").unwrap();
        assert_eq!(drain(&events), "login\r\nPassword: ");
        writer.write(b"hunter2\n").unwrap();
        assert_eq!(drain(&events), "\r\nok\r\n$ ");

        writer.write(b"tail -f app.log\n").unwrap();
        assert_eq!(drain(&events), "tail -f app.log\r\n");
        writer.write(b"\x03").unwrap();
        assert_eq!(drain(&events), "^C\r\n$ ");
    }

    #[test]
    fn hop_and_exit_walk_the_prompt_stack() {
        let transport = FakeTransport::new(
            FakeScript::new("a$ ").reply(Reply::to("ssh b").output("hi\r\n").enters("b$ ")),
        );
        let mut conn = transport.connect().unwrap();
        let ShellChannel { mut writer, events } = conn.open_shell().unwrap();
        drain(&events);

        writer.write(b"ssh b\n").unwrap();
        assert_eq!(drain(&events), "ssh b\r\nhi\r\nb$ ");
        writer.write(b"exit\nexit\n").unwrap();
        assert_eq!(drain(&events), "exit\r\nlogout\r\na$ exit\r\nlogout\r\n<closed>");
        assert!(writer.write(b"ls\n").is_err());
    }

    #[test]
    fn ignored_exit_leaves_channel_open() {
        let transport = FakeTransport::new(FakeScript::new("$ ").ignoring_exit());
        let mut conn = transport.connect().unwrap();
        let ShellChannel { mut writer, events } = conn.open_shell().unwrap();
        drain(&events);

        writer.write(b"exit\n").unwrap();
        assert_eq!(drain(&events), "exit\r\nlogout\r\n");
        assert!(writer.write(b"exit\n").is_ok());
    }

    #[test]
    fn run_once_collects_output() {
        let transport =
            FakeTransport::new(FakeScript::new("$ ").reply(Reply::to("npm").output("built\n").exit(1)));
        let out = transport.connect().unwrap().run_once("cd /srv && npm run build").unwrap();
        assert_eq!(out.exit_code, Some(1));
        assert_eq!(out.stdout, "built\n");
    }

    #[test]
    fn failure_modes() {
        assert!(matches!(
            FakeTransport::refusing("no route to host").connect().err(),
            Some(EngineError::Connection(_))
        ));
        let mut conn = FakeTransport::without_shell("administratively prohibited")
            .connect()
            .unwrap();
        assert!(matches!(conn.open_shell().err(), Some(EngineError::Channel(_))));

        let mut conn = FakeTransport::closing_on_open().connect().unwrap();
        let channel = conn.open_shell().unwrap();
        assert!(drain(&channel.events).ends_with("<closed>"));
    }
}
