use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Translate strings given as arguments, or stdin lines when none are given
    Translate {
        /// Target language (defaults to the configured target)
        #[arg(short, long)]
        target: Option<String>,

        /// Page URL used to select a domain override
        #[arg(short, long)]
        url: Option<String>,

        /// Treat as an explicit user request (ignores cache-only overrides)
        #[arg(short, long)]
        manual: bool,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,

        /// Strings to translate
        texts: Vec<String>,
    },

    /// Inspect or correct provider quotas
    Quota {
        #[command(subcommand)]
        action: QuotaAction,
    },

    /// Manage translation caches
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show or replace runtime settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
pub enum QuotaAction {
    /// List character usage per provider
    List,

    /// Overwrite a provider's character count for this month
    Set {
        /// Quota key of the provider
        quota_key: String,

        /// Characters consumed so far
        characters: u64,
    },
}

#[derive(Subcommand)]
pub enum CacheAction {
    /// Remove every entry from a cache
    Flush {
        /// Cache name (defaults to the shared cache)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Show stored caches and their sizes
    Info,
}

#[derive(Subcommand)]
pub enum SettingsAction {
    /// Print current settings as JSON
    Show,

    /// Replace settings with the contents of a JSON file
    Import {
        /// Settings JSON file
        file: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_translate() {
        let args = Args::parse_from(["transpass", "-v", "translate", "-t", "fr", "--manual", "hi", "bye"]);
        assert!(args.verbose);
        match args.command {
            Commands::Translate { target, manual, texts, url, .. } => {
                assert_eq!(target.as_deref(), Some("fr"));
                assert!(manual);
                assert!(url.is_none());
                assert_eq!(texts, ["hi", "bye"]);
            }
            _ => panic!("expected translate"),
        }
    }

    #[test]
    fn test_parse_quota_set() {
        let args = Args::parse_from(["transpass", "quota", "set", "quota-azure-1", "1200"]);
        match args.command {
            Commands::Quota { action: QuotaAction::Set { quota_key, characters } } => {
                assert_eq!(quota_key, "quota-azure-1");
                assert_eq!(characters, 1200);
            }
            _ => panic!("expected quota set"),
        }
    }
}
