//! Output tail tracking for the session engine.
//!
//! Keeps the bounded tail of ANSI-stripped channel output that the prompt
//! classifier looks at, and the timing the engine needs for its quiet-period
//! checks and inactivity watchdog.
//!
//! ## Echo gating
//!
//! ```text
//! write(command)  → tail cleared, window closed
//! first newline   → window opens just after it (the echoed command line)
//! more output     → window grows, bounded to `tail_bytes`
//! ```
//!
//! Nothing is classified while the window is closed, so the echo of the
//! command just written can never be mistaken for a prompt.

use std::time::{Duration, Instant};

/// Timing and size limits for a detector.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Maximum bytes of tail retained.
    pub tail_bytes: usize,
    /// Quiet period after which weak prompt matches are trusted.
    pub prompt_settle: Duration,
    /// Silence while a command is in flight that counts as a stall.
    pub inactivity_timeout: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            tail_bytes: 8 * 1024,
            prompt_settle: Duration::from_millis(1500),
            inactivity_timeout: Duration::from_secs(30),
        }
    }
}

/// How long the channel has been silent, relative to the configured windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quiet {
    /// Output arrived recently.
    Active,
    /// Silent for at least `prompt_settle`.
    Settled,
    /// Silent for at least `inactivity_timeout`.
    Inactive,
}

pub struct OutputDetector {
    config: DetectorConfig,
    tail: String,
    window_start: usize,
    line_seen: bool,
    last_activity: Instant,
    settled_checked: bool,
}

impl OutputDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            tail: String::new(),
            window_start: 0,
            line_seen: true,
            last_activity: Instant::now(),
            settled_checked: false,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Record new (ANSI-stripped) output.
    pub fn on_output(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.last_activity = Instant::now();
        self.settled_checked = false;

        if !self.line_seen {
            if let Some(pos) = text.find('\n') {
                self.line_seen = true;
                self.window_start = self.tail.len() + pos + 1;
            }
        }

        self.tail.push_str(text);
        self.trim();
    }

    /// Record that input was written to the channel. Clears the tail and
    /// closes the window until the echoed line is terminated.
    pub fn on_write(&mut self) {
        self.tail.clear();
        self.window_start = 0;
        self.line_seen = false;
        self.last_activity = Instant::now();
        self.settled_checked = false;
    }

    /// Restart the silence clock without touching the buffer.
    pub fn reset_clock(&mut self) {
        self.last_activity = Instant::now();
        self.settled_checked = false;
    }

    /// Text eligible for classification, or `None` while the echo of the
    /// last write is still pending.
    pub fn window(&self) -> Option<&str> {
        if self.line_seen {
            Some(&self.tail[self.window_start..])
        } else {
            None
        }
    }

    /// Drop everything in the window up to `end` (relative to the window).
    pub fn consume(&mut self, end: usize) {
        let available = self.tail.len() - self.window_start;
        let mut cut = self.window_start + end.min(available);
        while !self.tail.is_char_boundary(cut) {
            cut += 1;
        }
        self.window_start = cut;
    }

    /// The whole retained tail, including any echoed text.
    pub fn tail(&self) -> &str {
        &self.tail
    }

    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn quiet(&self, now: Instant) -> Quiet {
        let silence = self.silence(now);
        if silence >= self.config.inactivity_timeout {
            Quiet::Inactive
        } else if silence >= self.config.prompt_settle {
            Quiet::Settled
        } else {
            Quiet::Active
        }
    }

    /// True once per quiet period, as soon as the output has been silent for
    /// `prompt_settle`.
    pub fn take_settled(&mut self, now: Instant) -> bool {
        if self.settled_checked || self.quiet(now) == Quiet::Active {
            return false;
        }
        self.settled_checked = true;
        true
    }

    fn trim(&mut self) {
        if self.tail.len() <= self.config.tail_bytes {
            return;
        }
        let mut cut = self.tail.len() - self.config.tail_bytes;
        while !self.tail.is_char_boundary(cut) {
            cut += 1;
        }
        self.tail.drain(..cut);
        self.window_start = self.window_start.saturating_sub(cut);
    }
}
