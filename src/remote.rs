use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::types::{ProgressPatch, ProgressTable};

const USER_AGENT: &str = concat!("anv-sync/", env!("CARGO_PKG_VERSION"));

/// Per-user document storage holding a `progress` map.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// `Ok(None)` when the user has no document yet.
    async fn fetch_progress(&self, user_id: &str) -> Result<Option<ProgressTable>>;

    /// Merge-updates the `progress` map; `None` values delete their field.
    async fn merge_progress(&self, user_id: &str, patch: &ProgressPatch) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct UserDocument<T> {
    #[serde(default)]
    progress: T,
}

/// Remote store reached over a small JSON document API.
pub struct HttpDocumentStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpDocumentStore {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("failed to create document store HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn document_url(&self, user_id: &str) -> String {
        format!("{}/users/{}", self.base_url, user_id)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn fetch_progress(&self, user_id: &str) -> Result<Option<ProgressTable>> {
        let url = self.document_url(user_id);
        let response = self
            .authorize(self.client.get(&url))
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("request failed for {url}"))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = response.text().await?;
        if !status.is_success() {
            bail!("document store HTTP {status}: {text}");
        }
        let document: UserDocument<ProgressTable> = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse user document for {user_id}"))?;
        Ok(Some(document.progress))
    }

    async fn merge_progress(&self, user_id: &str, patch: &ProgressPatch) -> Result<()> {
        let url = self.document_url(user_id);
        let body = UserDocument { progress: patch };
        let response = self
            .authorize(self.client.patch(&url))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("request failed for {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("document store HTTP {status}: {text}");
        }
        Ok(())
    }
}

/// Document store kept in process memory. Used when no remote is configured
/// and to simulate the remote in tests.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<String, ProgressTable>>,
    unavailable: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user_id: &str, table: ProgressTable) {
        self.documents
            .lock()
            .await
            .insert(user_id.to_string(), table);
    }

    pub async fn snapshot(&self, user_id: &str) -> Option<ProgressTable> {
        self.documents.lock().await.get(user_id).cloned()
    }

    /// Makes every subsequent call fail until switched back.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("document store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn fetch_progress(&self, user_id: &str) -> Result<Option<ProgressTable>> {
        self.ensure_available()?;
        Ok(self.documents.lock().await.get(user_id).cloned())
    }

    async fn merge_progress(&self, user_id: &str, patch: &ProgressPatch) -> Result<()> {
        self.ensure_available()?;
        let mut documents = self.documents.lock().await;
        let table = documents.entry(user_id.to_string()).or_default();
        patch.apply_to(table);
        Ok(())
    }
}

/// Unions two tables. When both hold an id, the entry with the greater
/// `last_accessed` is kept whole; on a tie the remote entry stays.
///
/// The whole-entry rule can keep a lower episode number whose timestamp is
/// newer. That matches what already-synced clients expect, so it is kept.
pub fn merge_tables(remote: ProgressTable, local: &ProgressTable) -> ProgressTable {
    let mut merged = remote;
    for entry in local.iter() {
        let replace = merged
            .get(entry.id)
            .is_none_or(|existing| entry.last_accessed > existing.last_accessed);
        if replace {
            merged.upsert(entry.clone());
        }
    }
    merged
}

/// Push, pull and sign-in merge against a [`DocumentStore`].
pub struct RemoteSync {
    store: Arc<dyn DocumentStore>,
}

impl RemoteSync {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn push(&self, user_id: &str, patch: &ProgressPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        self.store
            .merge_progress(user_id, patch)
            .await
            .with_context(|| format!("failed to push {} progress change(s)", patch.len()))?;
        debug!(user_id, changes = patch.len(), "progress pushed");
        Ok(())
    }

    pub async fn pull(&self, user_id: &str) -> Result<ProgressTable> {
        let table = self
            .store
            .fetch_progress(user_id)
            .await
            .context("failed to pull remote progress")?;
        Ok(table.unwrap_or_default())
    }

    /// Pulls the remote table, unions it with `local` and writes the result
    /// back so both sides hold the same table. The caller stores the returned
    /// table locally.
    pub async fn merge(&self, user_id: &str, local: &ProgressTable) -> Result<ProgressTable> {
        let remote = self.pull(user_id).await?;
        let remote_len = remote.len();
        let merged = merge_tables(remote, local);
        self.store
            .merge_progress(user_id, &ProgressPatch::from(&merged))
            .await
            .context("failed to write merged progress")?;
        info!(
            user_id,
            local = local.len(),
            remote = remote_len,
            merged = merged.len(),
            "progress merged"
        );
        Ok(merged)
    }
}

pub(crate) enum SyncJob {
    Push {
        user_id: String,
        patch: ProgressPatch,
    },
    Flush(oneshot::Sender<()>),
}

/// Drains queued pushes in order.
pub(crate) async fn run_push_worker(
    sync: Arc<RemoteSync>,
    mut rx: mpsc::UnboundedReceiver<SyncJob>,
) {
    while let Some(job) = rx.recv().await {
        run_job(&sync, job).await;
    }
    debug!("push queue closed");
}

/// A failed push is logged and dropped; the local table already holds the
/// change.
pub(crate) async fn run_job(sync: &RemoteSync, job: SyncJob) {
    match job {
        SyncJob::Push { user_id, patch } => {
            if let Err(err) = sync.push(&user_id, &patch).await {
                warn!(user_id = %user_id, "remote progress push failed: {err:#}");
            }
        }
        SyncJob::Flush(done) => {
            let _ = done.send(());
        }
    }
}
