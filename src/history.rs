use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use dialoguer::{Select, theme::ColorfulTheme};
use dirs_next::data_dir;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use crate::types::{ProgressEntry, ProgressTable};

pub const PROGRESS_FILE: &str = "progress.json";

/// Whole-table JSON persistence for watch progress.
///
/// Every save rewrites the full file through a temporary sibling and a
/// rename, so readers see either the old table or the new one.
#[derive(Debug, Clone)]
pub struct LocalStore {
    path: PathBuf,
}

impl LocalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(PROGRESS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted table. Missing or unreadable data yields an empty
    /// table; the failure is logged and never returned.
    pub fn load(&self) -> ProgressTable {
        match self.try_load() {
            Ok(table) => table,
            Err(err) => {
                warn!(path = %self.path.display(), "discarding unreadable progress: {err:#}");
                ProgressTable::default()
            }
        }
    }

    fn try_load(&self) -> Result<ProgressTable> {
        if !self.path.exists() {
            return Ok(ProgressTable::default());
        }
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read progress file {}", self.path.display()))?;
        if data.trim().is_empty() {
            return Ok(ProgressTable::default());
        }
        let table = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse progress file {}", self.path.display()))?;
        Ok(table)
    }

    pub fn save(&self, table: &ProgressTable) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create progress directory {}", parent.display())
            })?;
        }
        let data = serde_json::to_string_pretty(table)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, data)
            .with_context(|| format!("failed to write progress file {}", staging.display()))?;
        fs::rename(&staging, &self.path).with_context(|| {
            format!("failed to move progress file into {}", self.path.display())
        })?;
        debug!(path = %self.path.display(), entries = table.len(), "progress saved");
        Ok(())
    }
}

pub fn progress_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| anyhow!("Could not determine data directory"))?;
    Ok(base.join("anv-sync"))
}

pub fn select_entry(table: &ProgressTable) -> Result<Option<ProgressEntry>> {
    let entries = table.by_recency();
    if entries.is_empty() {
        println!("History is empty.");
        return Ok(None);
    }

    let items: Vec<String> = entries.iter().map(|entry| describe(entry)).collect();

    let selection = Select::with_theme(&theme())
        .with_prompt("Select a title (Esc to cancel)")
        .items(&items)
        .default(0)
        .interact_opt()?;
    Ok(selection.map(|idx| entries[idx].clone()))
}

pub fn describe(entry: &ProgressEntry) -> String {
    format!(
        "[{}] {} \u{00b7} episode {} \u{00b7} watched {}",
        entry.kind.label(),
        entry.title,
        entry.last_episode_watched,
        format_accessed(entry.last_accessed)
    )
}

pub fn format_accessed(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| String::from("unknown"))
}

pub fn theme() -> ColorfulTheme {
    ColorfulTheme::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaKind;

    fn sample() -> ProgressTable {
        [ProgressEntry {
            id: 1535,
            kind: MediaKind::Series,
            title: String::from("Death Note"),
            poster_url: String::from("https://img.example/1535.jpg"),
            last_episode_watched: 12,
            last_accessed: 1_700_000_000_000,
        }]
        .into_iter()
        .collect()
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::in_dir(dir.path());
        assert!(store.load().is_empty());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::in_dir(dir.path());
        fs::write(store.path(), "{not json").unwrap();
        assert_eq!(store.load(), ProgressTable::default());
    }

    #[test]
    fn save_then_load_returns_same_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("nested").join(PROGRESS_FILE));
        store.save(&sample()).unwrap();
        assert_eq!(store.load(), sample());
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn save_overwrites_whole_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::in_dir(dir.path());
        store.save(&sample()).unwrap();
        store.save(&ProgressTable::default()).unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn describe_mentions_episode_and_date() {
        let table = sample();
        let line = describe(table.get(1535).unwrap());
        assert!(line.contains("Death Note"));
        assert!(line.contains("episode 12"));
        assert!(line.contains("2023-11-14"));
    }
}
