//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// fusecap - capability lease and client cache coherence toolkit
///
/// Replays capability and cache-authority scenarios and manages the
/// fusecap configuration.
#[derive(Parser, Debug)]
#[command(name = "fusecap")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "FUSECAP_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay a scenario against in-process registries
    Replay(ReplayArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the replay command
#[derive(Parser, Debug)]
pub struct ReplayArgs {
    /// Scenario file (TOML)
    pub scenario: PathBuf,

    /// Ordering of the final registry dump
    #[arg(long, default_value = "time")]
    pub view: ViewArg,

    /// Case-insensitive regular expression applied to the dump
    #[arg(long)]
    pub filter: Option<String>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Registry dump ordering
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ViewArg {
    /// One line per capability in expiry order
    Time,
    /// Grouped by inode
    Inode,
    /// Grouped by namespace path
    Path,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., caps.default_lease_secs)
        key: String,
        /// Value to set
        value: String,
    },
}

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_replay() {
        let cli = Cli::parse_from([
            "fusecap",
            "replay",
            "scenario.toml",
            "--view",
            "inode",
            "--filter",
            "^0+a$",
            "-f",
            "json",
        ]);
        match cli.command {
            Commands::Replay(args) => {
                assert_eq!(args.scenario, PathBuf::from("scenario.toml"));
                assert!(matches!(args.view, ViewArg::Inode));
                assert_eq!(args.filter.as_deref(), Some("^0+a$"));
                assert!(matches!(args.format, OutputFormat::Json));
            }
            _ => panic!("expected Replay command"),
        }
    }

    #[test]
    fn replay_defaults() {
        let cli = Cli::parse_from(["fusecap", "replay", "s.toml"]);
        match cli.command {
            Commands::Replay(args) => {
                assert!(matches!(args.view, ViewArg::Time));
                assert!(matches!(args.format, OutputFormat::Table));
                assert!(args.filter.is_none());
            }
            _ => panic!("expected Replay command"),
        }
    }

    #[test]
    fn cli_parses_config_set() {
        let cli = Cli::parse_from(["fusecap", "-vv", "config", "set", "restore.attempts", "5"]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Config(ConfigArgs {
                action: Some(ConfigAction::Set { key, value }),
            }) => {
                assert_eq!(key, "restore.attempts");
                assert_eq!(value, "5");
            }
            _ => panic!("expected Config Set command"),
        }
    }

    #[test]
    fn cli_parses_bare_config() {
        let cli = Cli::parse_from(["fusecap", "config"]);
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigArgs { action: None })
        ));
    }
}
