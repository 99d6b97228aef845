//! Configuration commands

use crate::config::{ConfigLoader, KeelConfig};
use anyhow::Result;
use clap::{Args, Subcommand};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show current configuration (merged, with command-line overrides)
    Show,
    /// Show configuration file paths
    Path,
}

pub fn run(args: ConfigArgs, config: &KeelConfig) -> Result<()> {
    match args.command {
        ConfigCommands::Show => show_config(config),
        ConfigCommands::Path => show_paths(),
    }
}

fn show_config(config: &KeelConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{}", toml_str);
    Ok(())
}

fn show_paths() -> Result<()> {
    println!("User config:    {:?}", ConfigLoader::user_config_path());
    println!("Project config: {:?}", ConfigLoader::project_config_path());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: ConfigArgs,
    }

    #[test]
    fn parse_show() {
        let cli = TestCli::try_parse_from(["test", "show"]).unwrap();
        assert!(matches!(cli.config.command, ConfigCommands::Show));
    }

    #[test]
    fn parse_path() {
        let cli = TestCli::try_parse_from(["test", "path"]).unwrap();
        assert!(matches!(cli.config.command, ConfigCommands::Path));
    }

    #[test]
    fn show_renders_defaults() {
        let rendered = toml::to_string_pretty(&KeelConfig::default()).unwrap();
        assert!(rendered.contains("endpoint = \"mem://local\""));
        assert!(rendered.contains("election = \"/leader-election\""));
    }
}
