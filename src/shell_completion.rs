//! Shell completion generation for the shellrun CLI.

use std::io::{self, Write};

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::{Shell, generate};

use crate::cli::{Cli, CompletionShell};

fn to_shell(shell: CompletionShell) -> Shell {
    match shell {
        CompletionShell::Bash => Shell::Bash,
        CompletionShell::Zsh => Shell::Zsh,
        CompletionShell::Fish => Shell::Fish,
    }
}

pub fn write(shell: CompletionShell, out: &mut dyn Write) -> Result<()> {
    let mut cmd = Cli::command();
    generate(to_shell(shell), &mut cmd, "shellrun", out);
    Ok(())
}

pub fn print(shell: CompletionShell) -> Result<()> {
    write(shell, &mut io::stdout())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_script_for_every_supported_shell() {
        for shell in [
            CompletionShell::Bash,
            CompletionShell::Zsh,
            CompletionShell::Fish,
        ] {
            let mut out = Vec::new();
            write(shell, &mut out).unwrap();
            let script = String::from_utf8(out).unwrap();
            assert!(script.contains("shellrun"), "{shell:?}");
        }
    }

    #[test]
    fn bash_script_lists_subcommands() {
        let mut out = Vec::new();
        write(CompletionShell::Bash, &mut out).unwrap();
        let script = String::from_utf8(out).unwrap();
        assert!(script.contains("classify"));
        assert!(script.contains("completions"));
    }
}
