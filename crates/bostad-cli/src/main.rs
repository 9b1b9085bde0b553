use anyhow::{Context, Result};
use bostad_storage::{HttpClientConfig, HttpFetcher, SnapshotStore};
use bostad_sync::{run_service, shutdown_signal, MailSetup, Tracker, TrackerConfig};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bostad")]
#[command(about = "Daily housing counter tracker with a weekly email report")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Schedule the daily scrape and weekly report and run until signalled.
    Run,
    /// Take today's snapshot once.
    Scrape,
    /// Send the report now.
    Report,
    /// Print the stored history, newest first.
    History,
}

/// `RUST_LOG` when it parses, otherwise `info`.
fn log_filter(rust_log: Option<String>) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok()))
        .init();

    let cli = Cli::parse();
    let config = TrackerConfig::from_env()?;
    let store = SnapshotStore::open(config.database_path.clone())
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    info!(path = %config.database_path.display(), "snapshot store ready");

    let collaborators = HttpFetcher::new(HttpClientConfig {
        user_agent: Some(config.user_agent.clone()),
        ..HttpClientConfig::default()
    })
    .and_then(|fetcher| Ok((fetcher, MailSetup::from_env()?)));
    let (fetcher, mail) = match collaborators {
        Ok(parts) => parts,
        Err(err) => {
            store.close()?;
            return Err(err);
        }
    };
    if let MailSetup::Unconfigured { missing } = &mail {
        warn!(missing = %missing.join(", "), "mail not configured; reports will fail until it is");
    }

    let tracker = Tracker::new(config, store, Box::new(fetcher), mail);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_service(tracker, shutdown_signal()).await?,
        Commands::Scrape => {
            let outcome = tracker.run_daily_scrape().await;
            tracker.close()?;
            let snapshot = outcome?;
            println!("saved {snapshot}");
        }
        Commands::Report => {
            let outcome = tracker.run_weekly_report().await;
            tracker.close()?;
            println!("report sent: {}", outcome?);
        }
        Commands::History => {
            let outcome = tracker
                .store()
                .all()
                .map_err(anyhow::Error::from)
                .and_then(|rows| Ok(tracker.report_renderer().render(&rows)?));
            tracker.close()?;
            print!("{}", outcome?.plain_text);
        }
    }

    Ok(())
}
