use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "msteams-sync")]
#[command(about = "Mattermost to Microsoft Teams sync engine", version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config: PathBuf,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    #[command(about = "Run the webhook server, activity workers and subscription monitor")]
    Serve,

    #[command(about = "Validate the configuration file and exit")]
    CheckConfig,

    #[command(about = "Create or update the database schema and exit")]
    Migrate,
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.unwrap_or(Commands::Serve)
    }
}
