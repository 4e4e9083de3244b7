use clap::Parser;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tributary_core::{ProviderId, SyncOptions, UserId};
use tributary_server::backends::{self, ServerConfig};
use tributary_server::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // JSON stdout logs unless TRIBUTARY_LOG_FORMAT=pretty.
    let o11y = tributary_core::o11y::init_global_from_env()?;
    let cli = Cli::parse();

    let cmd = cli.command.unwrap_or(Commands::Serve {
        host: "0.0.0.0".to_string(),
        port: 8000,
        data_dir: std::env::var("TRIBUTARY_DATA_DIR")
            .unwrap_or_else(|_| ".tributary".to_string())
            .into(),
        public_url: std::env::var("TRIBUTARY_PUBLIC_URL").ok(),
        no_scheduler: false,
    });

    match cmd {
        Commands::Serve {
            host,
            port,
            data_dir,
            public_url,
            no_scheduler,
        } => {
            let addr: SocketAddr = format!("{host}:{port}").parse()?;
            let cfg = ServerConfig::new(data_dir)
                .with_public_url(public_url)
                .with_scheduler(!no_scheduler);
            let state = backends::build_state(&cfg, o11y.redaction_policy()?).await?;
            tributary_server::server::serve(addr, state, cfg.scheduler_enabled).await?;
        }
        Commands::Migrate { data_dir } => {
            let store = backends::open_store(&data_dir).await?;
            store.migrate().await?;
            tracing::info!(data_dir = %data_dir.display(), "migrations applied");
        }
        Commands::Sync {
            data_dir,
            user_id,
            provider,
            full,
            dry_run,
        } => {
            let provider = ProviderId::from_str(&provider)?;
            let cfg = ServerConfig::new(data_dir).with_scheduler(false);
            let state = backends::build_state(&cfg, o11y.redaction_policy()?).await?;
            let options = SyncOptions {
                full_sync: full,
                dry_run,
                ..SyncOptions::default()
            };
            let orchestrator = Arc::clone(&state.orchestrator);
            let result = orchestrator
                .sync_integration(UserId(user_id), provider, options)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Providers => {
            let registry = backends::build_registry()?;
            for def in registry.definitions() {
                println!("{}", serde_json::to_string(def)?);
            }
        }
    }

    Ok(())
}
