use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dl_client::http::HttpChannel;
use dl_domain::config::{Config, ConfigSeverity};

/// desklink: keeps this desktop connected to the assistant service.
#[derive(Debug, Parser)]
#[command(name = "desklink", version, about)]
pub struct Cli {
    /// Path to the TOML config file.  A missing file means defaults.
    #[arg(long, env = "DESKLINK_CONFIG", default_value = "desklink.toml", global = true)]
    pub config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect and run the companion (default when no subcommand is given).
    Run {
        /// Start disconnected; type `/connect` to connect.
        #[arg(long)]
        no_connect: bool,
    },
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Ask the server whether the configured token is still accepted.
    CheckToken,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load(path).with_context(|| format!("loading {}", path.display()))
}

/// Print every issue.  Returns `false` when any of them is an error.
pub fn validate(config: &Config, config_path: &Path) -> bool {
    let issues = config.validate();

    if issues.is_empty() {
        println!("Config OK ({})", config_path.display());
        return true;
    }

    let error_count = issues
        .iter()
        .filter(|e| e.severity == ConfigSeverity::Error)
        .count();
    let warning_count = issues.len() - error_count;

    for issue in &issues {
        println!("{issue}");
    }
    println!(
        "\n{error_count} error(s), {warning_count} warning(s) in {}",
        config_path.display()
    );

    error_count == 0
}

pub fn show(config: &Config) -> anyhow::Result<()> {
    let output = toml::to_string_pretty(config).context("serializing config")?;
    print!("{output}");
    Ok(())
}

pub async fn check_token(config: &Config) -> anyhow::Result<bool> {
    let Some(token) = config.server.resolve_token() else {
        anyhow::bail!(
            "no token configured (set server.token or ${})",
            config.server.token_env
        );
    };
    let http = HttpChannel::new(
        config.server.http_base(),
        Duration::from_millis(config.server.request_timeout_ms),
    )?;
    let valid = http.check_token(&token).await?;
    if valid {
        println!("token accepted by {}", config.server.http_base());
    } else {
        println!("token rejected by {}", config.server.http_base());
    }
    Ok(valid)
}
