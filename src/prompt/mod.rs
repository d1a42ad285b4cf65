//! Prompt classification for interactive shell output.
//!
//! The session engine has no framing on the byte stream coming back from the
//! remote shell, so command boundaries and input requests are inferred from
//! the tail of the accumulated (ANSI-stripped) text. Everything here is a pure
//! function of that tail window.
//!
//! ## Priority
//!
//! ```text
//! credential / host-key / yes-no prompt  → ApplicationPrompt (never ShellReady)
//! shell prompt shape on the last line    → ShellReady
//! completion marker + trailing prompt    → NaturalCompletion
//! generic "Enter ...:" / trailing : or ? → ApplicationPrompt (FreeText)
//! anything else                          → None
//! ```
//!
//! Shell prompts are matched against the last ~500 characters only, and
//! application prompts against the last ~200, so earlier command output that
//! happens to contain `$` or `:` cannot trigger a match.

use regex::Regex;
use serde::Serialize;

/// Trailing characters considered for shell-prompt and completion matching.
pub const SHELL_WINDOW_CHARS: usize = 500;
/// Trailing characters considered for application-prompt matching.
pub const PROMPT_WINDOW_CHARS: usize = 200;

/// What kind of application prompt was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// Password, passphrase, one-time code.
    Credential,
    /// SSH host-key fingerprint confirmation.
    HostKey,
    /// Yes/no style confirmation.
    Confirmation,
    /// Generic free-text request ("Enter name:", trailing `?`).
    FreeText,
}

impl PromptKind {
    /// Explicit prompts are acted on as soon as they appear. Free-text
    /// matches wait for the output to go quiet first.
    pub fn is_explicit(self) -> bool {
        !matches!(self, Self::FreeText)
    }

    /// Whether answers to this prompt should be masked when echoed or logged.
    pub fn is_secret(self) -> bool {
        matches!(self, Self::Credential)
    }
}

/// Verdict for a tail window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The remote shell is idle and ready for the next command.
    ShellReady,
    /// A running program is blocked waiting for input.
    ApplicationPrompt { kind: PromptKind, text: String },
    /// A script or nested session ended without leaving a recognisable prompt.
    NaturalCompletion,
    None,
}

/// Compiled classification patterns.
pub struct PromptClassifier {
    auth: Vec<(Regex, PromptKind)>,
    shell: Vec<Regex>,
    completion: Vec<Regex>,
    input: Vec<Regex>,
}

impl Default for PromptClassifier {
    fn default() -> Self {
        Self {
            auth: vec![
                (
                    Regex::new(
                        r"(?i)\b(?:password|passphrase|passcode|verification code|one-time (?:password|code))\b[^\n]*[:?]\s*$",
                    )
                    .expect("static pattern"),
                    PromptKind::Credential,
                ),
                (
                    Regex::new(r"(?i)continue connecting\b.*\(yes/no").expect("static pattern"),
                    PromptKind::HostKey,
                ),
                (
                    Regex::new(r"(?i)\(yes/no/\[fingerprint\]\)").expect("static pattern"),
                    PromptKind::HostKey,
                ),
                (
                    Regex::new(r"(?i)[\[(]\s*y(?:es)?\s*/\s*no?\s*[\])]\s*[:?]?\s*$")
                        .expect("static pattern"),
                    PromptKind::Confirmation,
                ),
                (
                    Regex::new(r"(?i)\b(?:continue|proceed)\?\s*$").expect("static pattern"),
                    PromptKind::Confirmation,
                ),
            ],
            shell: vec![
                // user@host:~/dir$   (venv) user@host $
                Regex::new(r"^(?:\([^)\n]*\)\s*)?[\w.-]+@[\w.-]+(?::\s?[^\n]*?)?\s?[$#%>]\s*$")
                    .expect("static pattern"),
                // [user@host dir]$
                Regex::new(r"^(?:\([^)\n]*\)\s*)?\[[^\]\n]+\]\s?[$#%>]\s*$")
                    .expect("static pattern"),
                // bash-5.2$  sh-4.4#
                Regex::new(r"^-?(?:ba|z|k|da)?sh-\d+(?:\.\d+)*[$#]\s*$").expect("static pattern"),
                // host:~$
                Regex::new(r"^[\w.-]+:[~/][^\n]*[$#]\s*$").expect("static pattern"),
                // router>   PS C:\>
                Regex::new(r"^[\w.-]+>\s*$").expect("static pattern"),
                Regex::new(r"^PS [^\n]*>\s*$").expect("static pattern"),
                // bare $ or #
                Regex::new(r"^[$#]\s*$").expect("static pattern"),
            ],
            completion: vec![
                Regex::new(
                    r"(?mi)^[^\n]*\b(?:done|completed?|finished|successful(?:ly)?)\b[^\n]*\r?\n[^\n]*[$#>%]\s*\z",
                )
                .expect("static pattern"),
                Regex::new(r"(?i)connection to \S+ closed\.?\s*\z").expect("static pattern"),
            ],
            input: vec![
                Regex::new(r"(?i)^\s*enter\b[^\n]*:\s*$").expect("static pattern"),
                Regex::new(r"(?i)^\s*please\b[^\n]*[:?]\s*$").expect("static pattern"),
                Regex::new(r"\S[^\n]*[:?]\s*$").expect("static pattern"),
            ],
        }
    }
}

impl PromptClassifier {
    /// Built-in patterns extended with caller-supplied shell-prompt and
    /// natural-completion regexes.
    pub fn with_extra_patterns(
        shell: &[String],
        completion: &[String],
    ) -> Result<Self, regex::Error> {
        let mut classifier = Self::default();
        for pattern in shell {
            classifier.shell.push(Regex::new(pattern)?);
        }
        for pattern in completion {
            classifier.completion.push(Regex::new(pattern)?);
        }
        Ok(classifier)
    }

    /// Classify a tail window of ANSI-stripped output.
    pub fn classify(&self, window: &str) -> Classification {
        let prompt_tail = tail_chars(window, PROMPT_WINDOW_CHARS);
        let prompt_line = last_line(prompt_tail);
        let has_prompt_line = !prompt_line.trim().is_empty();

        if has_prompt_line {
            for (regex, kind) in &self.auth {
                if regex.is_match(prompt_line) {
                    return Classification::ApplicationPrompt {
                        kind: *kind,
                        text: prompt_excerpt(prompt_tail),
                    };
                }
            }
        }

        let shell_tail = tail_chars(window, SHELL_WINDOW_CHARS);
        let shell_line = last_line(shell_tail);
        if self.shell.iter().any(|regex| regex.is_match(shell_line)) {
            return Classification::ShellReady;
        }

        if self.completion.iter().any(|regex| regex.is_match(shell_tail)) {
            return Classification::NaturalCompletion;
        }

        if has_prompt_line && self.input.iter().any(|regex| regex.is_match(prompt_line)) {
            return Classification::ApplicationPrompt {
                kind: PromptKind::FreeText,
                text: prompt_excerpt(prompt_tail),
            };
        }

        Classification::None
    }
}

/// The last `max` characters of `text`, respecting char boundaries.
pub fn tail_chars(text: &str, max: usize) -> &str {
    if max == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// The visible last line: text after the final newline, with carriage-return
/// overwrites resolved to the last non-empty segment.
pub fn last_line(text: &str) -> &str {
    let line = text.rsplit('\n').next().unwrap_or("");
    line.rsplit('\r')
        .find(|segment| !segment.is_empty())
        .unwrap_or("")
}

/// Render a prompt for display: trailing window, blank lines dropped,
/// consecutive repeats collapsed.
pub fn prompt_excerpt(text: &str) -> String {
    let window = tail_chars(text, PROMPT_WINDOW_CHARS);
    let mut lines: Vec<&str> = Vec::new();
    for raw in window.split('\n') {
        let line = last_line(raw).trim();
        if line.is_empty() {
            continue;
        }
        if lines.last() != Some(&line) {
            lines.push(line);
        }
    }
    lines.join("\n")
}

/// Strip ANSI escape sequences from PTY output.
pub fn strip_ansi(input: &str) -> String {
    // Matches CSI sequences (ESC [ ... final byte), OSC sequences (ESC ] ... ST),
    // and simple two-byte escapes (ESC + one char).
    static ANSI_RE: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]")
            .expect("static pattern")
    });
    ANSI_RE.replace_all(input, "").to_string()
}
