mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "arena-cli")]
#[command(about = "Arena CLI - Manage language profiles and inspect engine configuration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the built-in language profiles to a file
    Init {
        /// Destination file
        #[arg(short, long, default_value = "config/languages.json")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// List configured languages
    ListLangs {
        /// Language profile file
        #[arg(short, long, default_value = "config/languages.json")]
        file: PathBuf,
    },

    /// Validate a language profile file
    Check {
        /// Language profile file
        #[arg(short, long, default_value = "config/languages.json")]
        file: PathBuf,
    },

    /// Print the effective engine configuration from the environment
    ShowConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut out = io::stdout().lock();

    match cli.command {
        Commands::Init { path, force } => commands::init_languages(&path, force, &mut out)?,
        Commands::ListLangs { file } => commands::list_languages(&file, &mut out)?,
        Commands::Check { file } => commands::check_languages(&file, &mut out)?,
        Commands::ShowConfig => commands::show_config(&mut out)?,
    }

    Ok(())
}
