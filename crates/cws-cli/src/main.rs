use anyhow::Result;
use clap::{Parser, Subcommand};
use cws_sync::{run_sync_once_from_env, SyncAction, SyncConfig, SyncRequest};

#[derive(Debug, Parser)]
#[command(name = "cws-cli")]
#[command(about = "Channel Warehouse Sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass for a tenant and print the outcome as JSON.
    Sync {
        #[arg(long)]
        tenant: String,
        /// Restrict the run to one channel; all registered channels otherwise.
        #[arg(long)]
        channel: Option<String>,
        #[arg(long, default_value_t = 30)]
        days_back: i64,
        #[arg(long, default_value_t = 100)]
        batch_size: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        /// Count matching warehouse rows without writing anything.
        #[arg(long)]
        count: bool,
        /// Sync settlements, products and customers alongside orders.
        #[arg(long)]
        all: bool,
    },
    /// Apply the canonical-table migrations to the destination store.
    Migrate,
    /// Serve the JSON sync API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sync {
            tenant,
            channel,
            days_back,
            batch_size,
            offset,
            count,
            all,
        } => {
            let mut request = SyncRequest::new(tenant);
            request.single_channel = channel;
            request.days_back = days_back;
            request.batch_size = batch_size;
            request.offset = offset;
            if count {
                request.action = SyncAction::Count;
            } else if all {
                request.action = SyncAction::SyncAll;
            }
            let response = run_sync_once_from_env(&request).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if !response.success {
                std::process::exit(1);
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let pool = sqlx::PgPool::connect(&config.database_url).await?;
            cws_store::PgStateStore::migrator().run(&pool).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            cws_web::serve_from_env().await?;
        }
    }

    Ok(())
}
