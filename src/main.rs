use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use anv_sync::{
    ProgressTracker,
    config::{Settings, config_path},
    events::OriginAllowList,
    history::{self, LocalStore, progress_dir},
    projector,
    providers::{CatalogProvider, anilist::AniListClient},
    remote::{DocumentStore, HttpDocumentStore, MemoryDocumentStore},
    types::{ProgressTable, TitleMetadata},
};

#[derive(Debug, Parser)]
#[command(
    name = "anv-sync",
    about = "Track the last episode you watched and sync it across devices.",
    version
)]
struct Cli {
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Signed-in user id; overrides `user_id` from the config file.
    #[arg(long, value_name = "ID")]
    user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show titles to continue, most recent first.
    List,
    /// Record that a title was opened, optionally at a given episode.
    Watch {
        id: u64,
        #[arg(short = 'e', long, value_name = "EPISODE")]
        episode: Option<u32>,
    },
    /// Forget a title.
    Remove { id: u64 },
    /// Pick a title from history interactively.
    History,
    /// Merge local progress with the remote copy for the signed-in user.
    Sync,
    /// Read `{"origin": ..., "message": ...}` lines from stdin as player messages.
    Listen,
    /// Write the progress table as JSON to a file or stdout.
    Export { path: Option<PathBuf> },
    /// Merge a previously exported table into local progress.
    Import { path: PathBuf },
    /// Write a default config file.
    InitConfig,
}

#[derive(Debug, Deserialize)]
struct StdinMessage {
    origin: String,
    message: Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let result = run().await;
    if let Err(err) = &result {
        eprintln!("error: {err:?}");
    }
    result
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config_path()?,
    };

    if matches!(cli.command, Command::InitConfig) {
        if config_path.exists() {
            bail!("Config already exists at {}", config_path.display());
        }
        Settings::write_default(&config_path)?;
        println!("Wrote default config to {}.", config_path.display());
        return Ok(());
    }

    let settings = Settings::load(&config_path)?;
    let user_id = cli.user.clone().or_else(|| settings.user_id.clone());
    let tracker = build_tracker(&settings)?;
    tracker.init();

    let remote_configured = settings.remote.base_url.is_some();
    let session = start_session(&tracker, user_id.as_deref(), remote_configured).await;

    let outcome = run_command(
        &cli,
        &settings,
        &tracker,
        user_id.as_deref(),
        session.as_ref(),
    )
    .await;
    tracker.flush().await;
    outcome
}

/// Merges with the remote before associating the user, so the command's
/// writes are dual-written on top of a reconciled table. Returns the merged
/// table, or `None` when the session stays local.
async fn start_session(
    tracker: &ProgressTracker,
    user_id: Option<&str>,
    remote_configured: bool,
) -> Option<ProgressTable> {
    let user_id = user_id?;
    if !remote_configured {
        warn!(user_id, "no remote configured, progress stays local");
        return None;
    }
    Some(tracker.sign_in(user_id).await)
}

fn build_tracker(settings: &Settings) -> Result<ProgressTracker> {
    let dir = match &settings.data_dir {
        Some(dir) => dir.clone(),
        None => progress_dir()?,
    };
    let remote: Arc<dyn DocumentStore> = match &settings.remote.base_url {
        Some(base_url) => Arc::new(HttpDocumentStore::new(
            base_url,
            settings.remote.api_key.clone(),
        )?),
        None => Arc::new(MemoryDocumentStore::new()),
    };
    let allow_list = OriginAllowList::new(&settings.allowed_origins);
    if allow_list.is_empty() {
        warn!("no player origins are allow-listed; every player message will be dropped");
    }
    Ok(ProgressTracker::new(
        LocalStore::in_dir(&dir),
        remote,
        allow_list,
    ))
}

async fn run_command(
    cli: &Cli,
    settings: &Settings,
    tracker: &ProgressTracker,
    user_id: Option<&str>,
    session: Option<&ProgressTable>,
) -> Result<()> {
    match &cli.command {
        Command::List => {
            let catalog = AniListClient::with_url(&settings.catalog_url)?;
            list_continue_watching(tracker, &catalog).await;
        }
        Command::Watch { id, episode } => {
            let catalog = AniListClient::with_url(&settings.catalog_url)?;
            let title = resolve_title(&catalog, *id).await?;
            match episode {
                Some(episode) => {
                    tracker.set_last_watched_episode(&title, *episode);
                    println!("{} \u{00b7} episode {} saved.", title.title, episode);
                }
                None => {
                    tracker.add_to_history(&title);
                    let episode = tracker
                        .get_media_data(title.id)
                        .map(|entry| entry.last_episode_watched)
                        .unwrap_or_default();
                    println!("{} \u{00b7} resume from episode {}.", title.title, episode);
                }
            }
        }
        Command::Remove { id } => {
            if tracker.get_media_data(*id).is_none() {
                println!("Title {id} is not in history.");
            }
            tracker.remove_from_history(*id);
        }
        Command::History => {
            let table = tracker.get_all_media_data();
            let Some(entry) = history::select_entry(&table)? else {
                return Ok(());
            };
            println!("{}", history::describe(&entry));
            let remove = Confirm::with_theme(&history::theme())
                .with_prompt(format!("Remove {} from history?", entry.title))
                .default(false)
                .interact_opt()?
                .unwrap_or(false);
            if remove {
                tracker.remove_from_history(entry.id);
                println!("Removed.");
            }
        }
        Command::Sync => {
            if user_id.is_none() {
                bail!("No user id. Pass --user or set user_id in the config file.");
            }
            let Some(merged) = session else {
                bail!("No remote configured. Set remote.base_url in the config file.");
            };
            println!("{} title(s) in sync.", merged.len());
        }
        Command::Listen => listen(tracker).await?,
        Command::Export { path } => {
            let data = serde_json::to_string_pretty(&tracker.get_all_media_data())?;
            match path {
                Some(path) => {
                    fs::write(path, data)
                        .with_context(|| format!("failed to write export {}", path.display()))?;
                    println!("Exported to {}.", path.display());
                }
                None => println!("{data}"),
            }
        }
        Command::Import { path } => {
            let table = read_export(path)?;
            let changed = tracker.import(&table);
            println!("Imported {changed} of {} title(s).", table.len());
        }
        // Handled in `run` before the tracker exists.
        Command::InitConfig => {}
    }
    Ok(())
}

async fn list_continue_watching(tracker: &ProgressTracker, catalog: &impl CatalogProvider) {
    let mut shown = 0;
    for item in projector::continue_watching(tracker, catalog).await {
        shown += 1;
        let total = item
            .metadata
            .episodes
            .map(|eps| format!("/{eps}"))
            .unwrap_or_default();
        println!(
            "[{}] {} \u{00b7} episode {}{} \u{00b7} watched {}",
            item.metadata.kind.label(),
            item.metadata.title,
            item.last_episode_watched,
            total,
            history::format_accessed(item.last_accessed)
        );
    }
    if shown == 0 {
        println!("Nothing to continue.");
    }
}

async fn resolve_title(catalog: &impl CatalogProvider, id: u64) -> Result<TitleMetadata> {
    catalog
        .get_multiple_titles(&[id])
        .await?
        .into_iter()
        .find(|title| title.id == id)
        .ok_or_else(|| anyhow!("Title {id} was not found in the catalog"))
}

fn read_export(path: &Path) -> Result<ProgressTable> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read export {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("failed to parse export {}", path.display()))
}

async fn listen(tracker: &ProgressTracker) -> Result<()> {
    tracker.add_event_listener(|event| {
        info!(
            origin = %event.origin,
            event = event.event_name().unwrap_or("unknown"),
            id = event.media_id(),
            episode = event.episode(),
            current_time = event.current_time(),
            "player event"
        );
    });
    let inbox = tracker.player_inbox();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StdinMessage>(&line) {
            Ok(msg) => {
                if !inbox.post(msg.origin, msg.message.to_string()) {
                    break;
                }
            }
            Err(err) => warn!("skipping unreadable line: {err}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anv_sync::types::{MediaKind, ProgressEntry};
    use tempfile::TempDir;

    fn entry(id: u64, accessed: i64) -> ProgressEntry {
        ProgressEntry {
            id,
            kind: MediaKind::Series,
            title: format!("Title {id}"),
            poster_url: String::new(),
            last_episode_watched: 1,
            last_accessed: accessed,
        }
    }

    fn tracker_in(dir: &TempDir, remote: Arc<MemoryDocumentStore>) -> ProgressTracker {
        let tracker = ProgressTracker::new(
            LocalStore::in_dir(dir.path()),
            remote,
            OriginAllowList::new(Vec::<String>::new()),
        );
        tracker.init();
        tracker
    }

    #[tokio::test]
    async fn session_merges_before_the_user_is_associated() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryDocumentStore::new());
        remote.insert("u1", [entry(2, 20)].into_iter().collect()).await;
        let tracker = tracker_in(&dir, remote.clone());
        tracker.import(&[entry(1, 10)].into_iter().collect());

        let merged = start_session(&tracker, Some("u1"), true).await.unwrap();

        assert_eq!(merged.len(), 2);
        assert_eq!(tracker.get_all_media_data(), merged);
        assert_eq!(tracker.user_id().as_deref(), Some("u1"));

        tracker.remove_from_history(1);
        tracker.flush().await;
        let remote_table = remote.snapshot("u1").await.unwrap();
        assert!(!remote_table.contains(1));
        assert!(remote_table.contains(2));
    }

    #[tokio::test]
    async fn session_without_a_remote_stays_local() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryDocumentStore::new());
        let tracker = tracker_in(&dir, remote.clone());

        assert!(start_session(&tracker, Some("u1"), false).await.is_none());
        assert_eq!(tracker.user_id(), None);

        tracker.import(&[entry(1, 10)].into_iter().collect());
        tracker.flush().await;
        assert_eq!(remote.snapshot("u1").await, None);
    }

    #[tokio::test]
    async fn session_without_a_user_does_nothing() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker_in(&dir, Arc::new(MemoryDocumentStore::new()));
        assert!(start_session(&tracker, None, true).await.is_none());
        assert_eq!(tracker.user_id(), None);
    }
}
