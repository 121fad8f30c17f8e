//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::{FusecapError, FusecapResult};
use console::style;

/// Execute the config command
pub async fn execute(args: ConfigArgs, config: &Config, manager: &ConfigManager) -> FusecapResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => {
            let mut config = config.clone();
            apply(&mut config, &key, &value)?;
            manager.save(&config).await?;
            println!("{} Set {} = {}", style("✓").green(), key, value);
        }
    }

    Ok(())
}

fn show_config(config: &Config) -> FusecapResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> FusecapResult<()> {
    let path = manager.path();

    if path.exists() && !force {
        eprintln!(
            "{} Config already exists at {} (use --force to overwrite)",
            style("!").yellow(),
            path.display()
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    println!(
        "{} Configuration initialized at {}",
        style("✓").green(),
        path.display()
    );
    Ok(())
}

/// Set a dot-separated key on `config`
fn apply(config: &mut Config, key: &str, value: &str) -> FusecapResult<()> {
    let parts: Vec<&str> = key.split('.').collect();

    match parts.as_slice() {
        ["general", "verbose"] => config.general.verbose = parse_bool(value)?,
        ["general", "log_format"] => match value {
            "text" | "json" => config.general.log_format = value.to_string(),
            _ => {
                return Err(FusecapError::User(format!(
                    "Invalid log format: {}. Use text/json",
                    value
                )))
            }
        },

        ["caps", "default_lease_secs"] => config.caps.default_lease_secs = parse_num(value)?,
        ["caps", "sweep_interval_secs"] => config.caps.sweep_interval_secs = parse_num(value)?,
        ["caps", "max_clock_skew_secs"] => config.caps.max_clock_skew_secs = parse_num(value)?,
        ["caps", "broadcast_parallelism"] => config.caps.broadcast_parallelism = parse_num(value)?,

        ["cache", "max_cache_bytes"] => config.cache.max_cache_bytes = parse_num(value)?,
        ["cache", "owner_lifetime_secs"] => config.cache.owner_lifetime_secs = parse_num(value)?,
        ["cache", "sweep_interval_secs"] => config.cache.sweep_interval_secs = parse_num(value)?,
        ["cache", "min_buffer_bytes"] => config.cache.min_buffer_bytes = parse_num(value)?,

        ["restore", "enabled"] => config.restore.enabled = parse_bool(value)?,
        ["restore", "attempts"] => config.restore.attempts = parse_num(value)?,
        ["restore", "snooze_secs"] => config.restore.snooze_secs = parse_num(value)?,
        ["restore", "block_size"] => config.restore.block_size = parse_num(value)?,

        _ => {
            eprintln!("Valid keys:");
            for key in VALID_KEYS {
                eprintln!("  {}", key);
            }
            return Err(FusecapError::User(format!("Unknown config key: {}", key)));
        }
    }

    Ok(())
}

const VALID_KEYS: [&str; 14] = [
    "general.verbose",
    "general.log_format",
    "caps.default_lease_secs",
    "caps.sweep_interval_secs",
    "caps.max_clock_skew_secs",
    "caps.broadcast_parallelism",
    "cache.max_cache_bytes",
    "cache.owner_lifetime_secs",
    "cache.sweep_interval_secs",
    "cache.min_buffer_bytes",
    "restore.enabled",
    "restore.attempts",
    "restore.snooze_secs",
    "restore.block_size",
];

fn parse_bool(value: &str) -> FusecapResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(FusecapError::User(format!(
            "Invalid boolean value: {}. Use true/false",
            value
        ))),
    }
}

fn parse_num<T: std::str::FromStr>(value: &str) -> FusecapResult<T> {
    value
        .parse()
        .map_err(|_| FusecapError::User(format!("Invalid number: {}", value)))
}
