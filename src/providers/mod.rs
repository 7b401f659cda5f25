use crate::types::TitleMetadata;
use anyhow::Result;

pub mod anilist;

pub trait CatalogProvider {
    /// Resolves metadata for many titles at once. Ids the catalog does not
    /// know are simply absent from the result.
    async fn get_multiple_titles(&self, ids: &[u64]) -> Result<Vec<TitleMetadata>>;
}
