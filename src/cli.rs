use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use shellrun::runner::ExecutionMode;

#[derive(Parser, Debug)]
#[command(
    name = "shellrun",
    about = "Run ordered deployment steps in one stateful remote shell",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the configured steps against the target host
    Run {
        #[command(flatten)]
        target: TargetArgs,

        /// Execution mode (defaults to the configured one)
        #[arg(long, value_enum)]
        mode: Option<ExecutionMode>,

        /// Print the results as JSON instead of a summary
        #[arg(long)]
        json: bool,

        /// Do not write an execution log under .shellrun/logs/
        #[arg(long)]
        no_log: bool,
    },

    /// Print the literal command text each step would dispatch
    Plan {
        #[command(flatten)]
        target: TargetArgs,

        /// Execution mode to plan for
        #[arg(long, value_enum)]
        mode: Option<ExecutionMode>,
    },

    /// Classify a tail of shell output (reads stdin when TEXT is omitted)
    Classify {
        /// Output text; escapes like \n and \r are interpreted
        text: Option<String>,
    },

    /// Show project configuration
    Config {
        /// Emit machine-readable JSON output
        #[arg(long)]
        json: bool,
    },

    /// Print shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

/// Where the steps come from and where they run.
#[derive(clap::Args, Debug, Default)]
pub struct TargetArgs {
    /// Step file (YAML or TOML); defaults to [[steps]] in the config
    #[arg(long)]
    pub steps: Option<PathBuf>,

    /// Remote project root the first command changes into
    #[arg(long)]
    pub root: Option<String>,

    /// Override the configured ssh host
    #[arg(long)]
    pub host: Option<String>,

    /// Override the configured ssh user
    #[arg(long)]
    pub user: Option<String>,

    /// Run against a local shell instead of ssh
    #[arg(long, conflicts_with_all = ["host", "user"])]
    pub local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_overrides() {
        let cli = Cli::parse_from([
            "shellrun", "run", "--steps", "deploy.yaml", "--root", "/srv/app", "--host", "web1",
            "--mode", "one-shot", "--json", "-vv",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Run {
                target, mode, json, ..
            } => {
                assert_eq!(target.steps, Some(PathBuf::from("deploy.yaml")));
                assert_eq!(target.root.as_deref(), Some("/srv/app"));
                assert_eq!(target.host.as_deref(), Some("web1"));
                assert_eq!(mode, Some(ExecutionMode::OneShot));
                assert!(json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn local_conflicts_with_host() {
        let result = Cli::try_parse_from(["shellrun", "run", "--local", "--host", "web1"]);
        assert!(result.is_err());
    }

    #[test]
    fn completions_takes_a_shell() {
        let cli = Cli::parse_from(["shellrun", "completions", "zsh"]);
        assert!(matches!(
            cli.command,
            Command::Completions {
                shell: CompletionShell::Zsh
            }
        ));
    }
}
