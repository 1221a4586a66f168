//! CLI argument parsing for hlwatch

use std::path::PathBuf;

use clap::Parser;
use hlwatch_core::ProviderKind;

/// hlwatch - accelerator inventory and health-event watcher
#[derive(Debug, Parser)]
#[command(name = "hlwatch")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/hlwatch/config.yaml")]
    pub config: PathBuf,

    /// Hardware monitoring provider (overrides config)
    #[arg(long, value_parser = parse_provider, env = "HLWATCH_PROVIDER")]
    pub provider: Option<ProviderKind>,

    /// Log every call made to the hardware monitoring provider
    #[arg(long)]
    pub verbose_hlml: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "HLWATCH_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "HLWATCH_LOG_JSON")]
    pub log_json: bool,

    /// List devices as JSON and exit
    #[arg(long)]
    pub once: bool,
}

fn parse_provider(value: &str) -> Result<ProviderKind, String> {
    match value.to_ascii_lowercase().as_str() {
        "auto" => Ok(ProviderKind::Auto),
        "real" => Ok(ProviderKind::Real),
        "static" => Ok(ProviderKind::Static),
        "synthetic" => Ok(ProviderKind::Synthetic),
        other => Err(format!(
            "unknown provider {:?} (expected auto, real, static or synthetic)",
            other
        )),
    }
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
