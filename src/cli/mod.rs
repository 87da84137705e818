//! Command Line Interface module
//!
//! Implements the CLI commands and argument parsing for DexSync.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "dexsync")]
#[command(about = "DexSync Exchange State Core")]
#[command(long_about = "Client-side real-time state core for an exchange gateway")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(long, default_value = "config.toml")]
    pub config_file: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to the gateway and maintain live state for the given symbols
    Run {
        /// Trading symbols (e.g., BTC_USD ETH_USD); defaults to the
        /// configured list
        symbols: Vec<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Reset configuration to defaults
    Reset,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Adjust log level based on verbose flag
    pub fn effective_log_level(&self) -> String {
        if self.verbose {
            "debug".to_string()
        } else {
            self.log_level.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command() {
        let cli = Cli::try_parse_from(["dexsync", "run", "BTC_USD", "ETH_USD"]).unwrap();
        match cli.command {
            Commands::Run { symbols } => {
                assert_eq!(symbols, vec!["BTC_USD", "ETH_USD"]);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_verbose_flag() {
        let cli = Cli::try_parse_from(["dexsync", "--verbose", "run"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.effective_log_level(), "debug");
    }

    #[test]
    fn test_config_show() {
        let cli = Cli::try_parse_from(["dexsync", "config", "show"]).unwrap();
        match cli.command {
            Commands::Config { action } => {
                assert!(matches!(action, Some(ConfigAction::Show)));
            }
            _ => panic!("Expected Config command"),
        }
    }
}
