use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "tributary", version, about = "Tributary integration sync service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default if no subcommand given).
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value = "8000")]
        port: u16,

        /// Directory holding the SQLite database and master key.
        #[arg(long, env = "TRIBUTARY_DATA_DIR", default_value = ".tributary")]
        data_dir: PathBuf,

        /// Externally reachable base URL used as the webhook callback origin.
        #[arg(long, env = "TRIBUTARY_PUBLIC_URL")]
        public_url: Option<String>,

        /// Disable the background scheduler that triggers due syncs.
        #[arg(long)]
        no_scheduler: bool,
    },

    /// Create or upgrade the SQLite schema and exit.
    Migrate {
        #[arg(long, env = "TRIBUTARY_DATA_DIR", default_value = ".tributary")]
        data_dir: PathBuf,
    },

    /// Run one sync for a user's integration and print the result as JSON.
    Sync {
        #[arg(long, env = "TRIBUTARY_DATA_DIR", default_value = ".tributary")]
        data_dir: PathBuf,

        #[arg(long)]
        user_id: Uuid,

        /// Provider id (e.g. `github`, `google_calendar`).
        #[arg(long)]
        provider: String,

        /// Ignore the stored cursor and re-list everything.
        #[arg(long)]
        full: bool,

        /// Classify items without dispatching them to the pipeline.
        #[arg(long)]
        dry_run: bool,
    },

    /// List registered providers and their capabilities.
    Providers,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sync_command() {
        let cli = Cli::try_parse_from([
            "tributary",
            "sync",
            "--data-dir",
            "/tmp/t",
            "--user-id",
            "6f1c1f0e-5a3b-4a5e-9f1e-0d6c2b1a7e11",
            "--provider",
            "linear",
            "--full",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Sync {
                provider,
                full,
                dry_run,
                ..
            }) => {
                assert_eq!(provider, "linear");
                assert!(full);
                assert!(!dry_run);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn no_subcommand_is_allowed() {
        let cli = Cli::try_parse_from(["tributary"]).unwrap();
        assert!(cli.command.is_none());
    }
}
