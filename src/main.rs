use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use project_watch::{NotifyPrimitive, ProjectWatchSupervisor, Settings, WatchPolicy, logging};

#[derive(Parser)]
#[command(name = "projwatch")]
#[command(about = "Watch project folders and print normalized change events")]
struct Cli {
    /// Settings file (defaults to the nearest .projwatch/settings.toml)
    #[arg(short, long, global = true, env = "PROJWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch projects until interrupted, printing one JSON event per line
    Watch {
        /// Extra projects as ID=PATH, in addition to configured ones
        #[arg(value_parser = parse_project)]
        projects: Vec<(String, PathBuf)>,

        /// Print all session states to stderr every N seconds
        #[arg(long)]
        status_every: Option<u64>,
    },

    /// Show the effective configuration
    Config,
}

fn parse_project(arg: &str) -> Result<(String, PathBuf), String> {
    match arg.split_once('=') {
        Some((id, path)) if !id.is_empty() && !path.is_empty() => {
            Ok((id.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected ID=PATH, got '{arg}'")),
    }
}

fn load_settings(path: Option<&PathBuf>) -> anyhow::Result<Settings> {
    let settings = match path {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };
    settings.map_err(|e| anyhow::anyhow!("failed to load settings: {e}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_ref())?;
    logging::init_with_config(&settings.logging);

    match cli.command {
        Commands::Config => {
            let rendered = toml::to_string_pretty(&settings).context("failed to render settings")?;
            println!("{rendered}");
            Ok(())
        }
        Commands::Watch {
            projects,
            status_every,
        } => watch(settings, projects, status_every).await,
    }
}

async fn watch(
    settings: Settings,
    extra: Vec<(String, PathBuf)>,
    status_every: Option<u64>,
) -> anyhow::Result<()> {
    let policy = WatchPolicy::from_config(&settings.watch)?;
    let supervisor = ProjectWatchSupervisor::new(Arc::new(NotifyPrimitive::new()), policy);
    let (subscription, mut events) = supervisor.bus().subscribe_channel();

    let configured = settings
        .projects
        .iter()
        .map(|p| (p.id.clone(), p.path.clone()));
    for (id, path) in configured.chain(extra) {
        if let Err(e) = supervisor.start_watching(id.as_str(), &path).await {
            // A bad folder should not keep the others from being watched
            eprintln!("warning: {e}");
        }
    }

    if supervisor.watched_count() == 0 {
        subscription.unsubscribe();
        bail!("no projects to watch; pass ID=PATH or configure [[projects]]");
    }

    let mut status = tokio::time::interval(Duration::from_secs(status_every.unwrap_or(0).max(1)));
    status.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,

            Some(event) = events.recv() => {
                println!("{}", serde_json::to_string(&event)?);
            }

            _ = status.tick(), if status_every.is_some() => {
                for session in supervisor.get_all_watch_states() {
                    eprintln!("{}", serde_json::to_string(&session)?);
                }
            }
        }
    }

    subscription.unsubscribe();
    supervisor
        .destroy()
        .await
        .context("some watches did not shut down cleanly")?;
    Ok(())
}
