use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Series,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Series => "series",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MediaKind::Movie => "Movie",
            MediaKind::Series => "Series",
        }
    }
}

/// Catalog metadata for one title, as resolved by a [`crate::providers::CatalogProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleMetadata {
    pub id: u64,
    pub title: String,
    pub poster_url: String,
    pub kind: MediaKind,
    pub is_adult: bool,
    pub episodes: Option<u32>,
}

/// Progress for a single tracked title.
///
/// `last_accessed` is milliseconds since the Unix epoch and is the only
/// ordering signal between entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEntry {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub title: String,
    #[serde(default)]
    pub poster_url: String,
    pub last_episode_watched: u32,
    pub last_accessed: i64,
}

impl ProgressEntry {
    pub fn new(title: &TitleMetadata, episode: u32, accessed_at: i64) -> Self {
        Self {
            id: title.id,
            kind: title.kind,
            title: title.title.clone(),
            poster_url: title.poster_url.clone(),
            last_episode_watched: episode,
            last_accessed: accessed_at,
        }
    }

    pub fn key(&self) -> String {
        self.id.to_string()
    }
}

/// Every tracked title keyed by its id rendered as a string.
///
/// This is also the persisted layout: one JSON object from id to entry.
/// Deserialized tables are re-keyed by each entry's own `id`; when two keys
/// carry the same id the more recently accessed entry is kept.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ProgressTable {
    entries: BTreeMap<String, ProgressEntry>,
}

impl ProgressTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u64) -> Option<&ProgressEntry> {
        self.entries.get(&id.to_string())
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut ProgressEntry> {
        self.entries.get_mut(&id.to_string())
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id.to_string())
    }

    /// Inserts or replaces the entry stored under the entry's own id.
    pub fn upsert(&mut self, entry: ProgressEntry) -> Option<ProgressEntry> {
        self.entries.insert(entry.key(), entry)
    }

    pub fn remove(&mut self, id: u64) -> Option<ProgressEntry> {
        self.entries.remove(&id.to_string())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProgressEntry> {
        self.entries.values()
    }

    /// Entries ordered most recently accessed first. Ties fall back to id so
    /// the order is stable.
    pub fn by_recency(&self) -> Vec<&ProgressEntry> {
        let mut entries: Vec<&ProgressEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            b.last_accessed
                .cmp(&a.last_accessed)
                .then_with(|| a.id.cmp(&b.id))
        });
        entries
    }
}

impl<'de> Deserialize<'de> for ProgressTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, ProgressEntry>::deserialize(deserializer)?;
        let mut table = ProgressTable::new();
        for entry in raw.into_values() {
            let newer = table
                .get(entry.id)
                .is_none_or(|existing| entry.last_accessed > existing.last_accessed);
            if newer {
                table.upsert(entry);
            }
        }
        Ok(table)
    }
}

impl FromIterator<ProgressEntry> for ProgressTable {
    fn from_iter<I: IntoIterator<Item = ProgressEntry>>(iter: I) -> Self {
        let mut table = ProgressTable::new();
        for entry in iter {
            table.upsert(entry);
        }
        table
    }
}

impl IntoIterator for ProgressTable {
    type Item = ProgressEntry;
    type IntoIter = std::collections::btree_map::IntoValues<String, ProgressEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_values()
    }
}

/// Partial update for the remote copy of a table. A `None` value deletes
/// that id from the remote document instead of storing a literal null entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ProgressPatch {
    changes: BTreeMap<String, Option<ProgressEntry>>,
}

impl ProgressPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(mut self, entry: ProgressEntry) -> Self {
        self.changes.insert(entry.key(), Some(entry));
        self
    }

    pub fn delete(mut self, id: u64) -> Self {
        self.changes.insert(id.to_string(), None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<ProgressEntry>)> {
        self.changes.iter()
    }

    /// Applies the patch to a table: upserts replace, deletions remove.
    pub fn apply_to(&self, table: &mut ProgressTable) {
        for (key, change) in &self.changes {
            match change {
                Some(entry) => {
                    table.entries.insert(key.clone(), entry.clone());
                }
                None => {
                    table.entries.remove(key);
                }
            }
        }
    }
}

impl From<&ProgressTable> for ProgressPatch {
    fn from(table: &ProgressTable) -> Self {
        table
            .iter()
            .cloned()
            .fold(ProgressPatch::new(), ProgressPatch::upsert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, episode: u32, accessed: i64) -> ProgressEntry {
        ProgressEntry {
            id,
            kind: MediaKind::Series,
            title: format!("Title {id}"),
            poster_url: String::new(),
            last_episode_watched: episode,
            last_accessed: accessed,
        }
    }

    #[test]
    fn persisted_layout_is_a_map_keyed_by_string_id() {
        let table: ProgressTable = [entry(21, 3, 1_700_000_000_000)].into_iter().collect();
        let json = serde_json::to_value(&table).unwrap();
        let record = &json["21"];
        assert_eq!(record["id"], 21);
        assert_eq!(record["type"], "series");
        assert_eq!(record["lastEpisodeWatched"], 3);
        assert_eq!(record["lastAccessed"], 1_700_000_000_000_i64);
    }

    #[test]
    fn entries_are_keyed_by_their_own_id_when_read() {
        let json = serde_json::json!({
            "5": entry(7, 2, 100),
            "8": entry(8, 1, 100),
            "9": entry(8, 4, 300),
        });
        let table: ProgressTable = serde_json::from_value(json).unwrap();
        assert_eq!(table.len(), 2);
        assert!(!table.contains(5));
        assert_eq!(table.get(7).map(|e| e.last_episode_watched), Some(2));
        assert_eq!(table.get(8).map(|e| e.last_episode_watched), Some(4));

        let mut table = table;
        assert!(table.remove(7).is_some());
        assert_eq!(serde_json::to_value(&table).unwrap()["8"]["id"], 8);
    }

    #[test]
    fn by_recency_puts_latest_first() {
        let table: ProgressTable = [entry(1, 1, 10), entry(2, 1, 30), entry(3, 1, 20)]
            .into_iter()
            .collect();
        let ids: Vec<u64> = table.by_recency().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn patch_serializes_deletions_as_null() {
        let patch = ProgressPatch::new().upsert(entry(5, 2, 1)).delete(9);
        let json = serde_json::to_value(&patch).unwrap();
        assert!(json["9"].is_null());
        assert_eq!(json["5"]["lastEpisodeWatched"], 2);
    }

    #[test]
    fn patch_apply_removes_and_replaces() {
        let mut table: ProgressTable = [entry(1, 1, 1), entry(2, 1, 1)].into_iter().collect();
        ProgressPatch::new()
            .upsert(entry(1, 7, 5))
            .delete(2)
            .apply_to(&mut table);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(1).map(|e| e.last_episode_watched), Some(7));
    }
}
