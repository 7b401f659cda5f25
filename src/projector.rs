use std::collections::HashMap;
use tracing::{debug, warn};

use crate::providers::CatalogProvider;
use crate::tracker::ProgressTracker;
use crate::types::{ProgressEntry, ProgressTable, TitleMetadata};

/// A tracked title joined with its current catalog metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinueWatchingItem {
    pub metadata: TitleMetadata,
    pub last_episode_watched: u32,
    pub last_accessed: i64,
}

/// Lazily joins recency-ordered entries with resolved metadata. Entries the
/// catalog did not return, and adult titles, are skipped.
#[derive(Debug)]
pub struct ContinueWatching {
    entries: std::vec::IntoIter<ProgressEntry>,
    resolved: HashMap<u64, TitleMetadata>,
}

impl Iterator for ContinueWatching {
    type Item = ContinueWatchingItem;

    fn next(&mut self) -> Option<Self::Item> {
        for entry in self.entries.by_ref() {
            let Some(metadata) = self.resolved.remove(&entry.id) else {
                continue;
            };
            if metadata.is_adult {
                continue;
            }
            return Some(ContinueWatchingItem {
                metadata,
                last_episode_watched: entry.last_episode_watched,
                last_accessed: entry.last_accessed,
            });
        }
        None
    }
}

/// Builds the continue-watching view for `table`. A failing catalog lookup is
/// logged and yields an empty view.
pub async fn project(table: &ProgressTable, catalog: &impl CatalogProvider) -> ContinueWatching {
    let entries: Vec<ProgressEntry> = table.by_recency().into_iter().cloned().collect();
    let ids: Vec<u64> = entries.iter().map(|entry| entry.id).collect();

    let resolved = if ids.is_empty() {
        HashMap::new()
    } else {
        match catalog.get_multiple_titles(&ids).await {
            Ok(titles) => titles.into_iter().map(|title| (title.id, title)).collect(),
            Err(err) => {
                warn!("catalog lookup failed, continue watching is empty: {err:#}");
                HashMap::new()
            }
        }
    };
    debug!(tracked = ids.len(), resolved = resolved.len(), "continue watching projected");

    ContinueWatching {
        entries: entries.into_iter(),
        resolved,
    }
}

/// Recomputes the view from the tracker's current table on every call.
pub async fn continue_watching(
    tracker: &ProgressTracker,
    catalog: &impl CatalogProvider,
) -> ContinueWatching {
    project(&tracker.get_all_media_data(), catalog).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaKind;
    use anyhow::{Result, bail};
    use std::sync::Mutex;

    struct FakeCatalog {
        titles: Vec<TitleMetadata>,
        fail: bool,
        requests: Mutex<Vec<Vec<u64>>>,
    }

    impl FakeCatalog {
        fn new(titles: Vec<TitleMetadata>) -> Self {
            Self {
                titles,
                fail: false,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl CatalogProvider for FakeCatalog {
        async fn get_multiple_titles(&self, ids: &[u64]) -> Result<Vec<TitleMetadata>> {
            self.requests.lock().unwrap().push(ids.to_vec());
            if self.fail {
                bail!("catalog offline");
            }
            Ok(self
                .titles
                .iter()
                .filter(|title| ids.contains(&title.id))
                .cloned()
                .collect())
        }
    }

    fn metadata(id: u64, is_adult: bool) -> TitleMetadata {
        TitleMetadata {
            id,
            title: format!("Title {id}"),
            poster_url: String::new(),
            kind: MediaKind::Series,
            is_adult,
            episodes: Some(12),
        }
    }

    fn entry(id: u64, accessed: i64) -> ProgressEntry {
        ProgressEntry::new(&metadata(id, false), 2, accessed)
    }

    #[tokio::test]
    async fn orders_by_recency_and_drops_unresolved_and_adult() {
        let table: ProgressTable = [entry(1, 10), entry(2, 40), entry(3, 30), entry(4, 20)]
            .into_iter()
            .collect();
        // 3 is unknown to the catalog, 4 is adult.
        let catalog = FakeCatalog::new(vec![metadata(1, false), metadata(2, false), metadata(4, true)]);

        let ids: Vec<u64> = project(&table, &catalog)
            .await
            .map(|item| item.metadata.id)
            .collect();

        assert_eq!(ids, vec![2, 1]);
        assert_eq!(*catalog.requests.lock().unwrap(), vec![vec![2, 3, 4, 1]]);
    }

    #[tokio::test]
    async fn catalog_failure_yields_empty_view() {
        let table: ProgressTable = [entry(1, 10)].into_iter().collect();
        let mut catalog = FakeCatalog::new(vec![metadata(1, false)]);
        catalog.fail = true;
        assert_eq!(project(&table, &catalog).await.count(), 0);
    }

    #[tokio::test]
    async fn empty_table_skips_the_catalog() {
        let catalog = FakeCatalog::new(Vec::new());
        assert_eq!(project(&ProgressTable::new(), &catalog).await.count(), 0);
        assert!(catalog.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn items_carry_progress_fields() {
        let table: ProgressTable = [entry(9, 77)].into_iter().collect();
        let catalog = FakeCatalog::new(vec![metadata(9, false)]);
        let item = project(&table, &catalog).await.next().unwrap();
        assert_eq!(item.last_episode_watched, 2);
        assert_eq!(item.last_accessed, 77);
        assert_eq!(item.metadata, metadata(9, false));
    }
}
