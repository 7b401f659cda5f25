use anyhow::{Context, Result, anyhow, bail};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::CatalogProvider;
use crate::types::{MediaKind, TitleMetadata};

pub const ANILIST_API_URL: &str = "https://graphql.anilist.co";
/// AniList caps `perPage` at 50.
const PAGE_SIZE: usize = 50;
const USER_AGENT: &str = concat!("anv-sync/", env!("CARGO_PKG_VERSION"));

pub struct AniListClient {
    client: Client,
    api_url: String,
}

impl AniListClient {
    pub fn new() -> Result<Self> {
        Self::with_url(ANILIST_API_URL)
    }

    pub fn with_url(api_url: &str) -> Result<Self> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            api_url: api_url.to_string(),
        })
    }

    async fn fetch_page(&self, ids: &[u64]) -> Result<Vec<TitleMetadata>> {
        let body = serde_json::json!({
            "query": MULTIPLE_TITLES_QUERY,
            "variables": { "ids": ids, "perPage": PAGE_SIZE }
        });
        let response = self
            .client
            .post(&self.api_url)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            bail!("AniList API HTTP {status}: {text}");
        }
        let envelope: GraphQlEnvelope<PagePayload> =
            serde_json::from_str(&text).with_context(|| "failed to parse titles response")?;
        Self::extract_data(envelope).map(|payload| {
            payload
                .page
                .media
                .into_iter()
                .map(TitleMetadata::from)
                .collect()
        })
    }

    fn extract_data<T>(envelope: GraphQlEnvelope<T>) -> Result<T> {
        if let Some(errors) = envelope.errors {
            let joined = errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            bail!("AniList API error: {joined}");
        }
        envelope
            .data
            .ok_or_else(|| anyhow!("AniList API returned empty response"))
    }
}

impl CatalogProvider for AniListClient {
    async fn get_multiple_titles(&self, ids: &[u64]) -> Result<Vec<TitleMetadata>> {
        let titles = fetch_in_chunks(ids, |chunk| self.fetch_page(chunk)).await?;
        debug!(requested = ids.len(), resolved = titles.len(), "titles resolved");
        Ok(titles)
    }
}

/// Resolves `ids` one page at a time. A failed page is logged and skipped so
/// the other pages still resolve; only when every page fails is the last
/// error returned.
async fn fetch_in_chunks<'a, F, Fut>(
    ids: &'a [u64],
    mut fetch: F,
) -> Result<Vec<TitleMetadata>>
where
    F: FnMut(&'a [u64]) -> Fut,
    Fut: Future<Output = Result<Vec<TitleMetadata>>>,
{
    let mut titles = Vec::with_capacity(ids.len());
    let mut last_err = None;
    let mut succeeded = 0;
    for chunk in ids.chunks(PAGE_SIZE) {
        match fetch(chunk).await {
            Ok(page) => {
                succeeded += 1;
                titles.extend(page);
            }
            Err(err) => {
                warn!(
                    first_id = chunk.first().copied(),
                    size = chunk.len(),
                    "title page failed to resolve: {err:#}"
                );
                last_err = Some(err);
            }
        }
    }
    match last_err {
        Some(err) if succeeded == 0 => Err(err),
        _ => Ok(titles),
    }
}

impl From<Media> for TitleMetadata {
    fn from(media: Media) -> Self {
        let kind = match media.format.as_deref() {
            Some("MOVIE") => MediaKind::Movie,
            _ => MediaKind::Series,
        };
        let title = media
            .title
            .english
            .filter(|t| !t.trim().is_empty())
            .or(media.title.romaji)
            .unwrap_or_else(|| format!("#{}", media.id));
        let poster_url = media
            .cover_image
            .and_then(|cover| cover.extra_large.or(cover.large))
            .unwrap_or_default();
        TitleMetadata {
            id: media.id,
            title,
            poster_url,
            kind,
            is_adult: media.is_adult,
            episodes: media.episodes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct PagePayload {
    #[serde(rename = "Page")]
    page: MediaPage,
}

#[derive(Debug, Deserialize)]
struct MediaPage {
    #[serde(default)]
    media: Vec<Media>,
}

#[derive(Debug, Deserialize)]
struct Media {
    id: u64,
    #[serde(default)]
    title: MediaTitle,
    #[serde(rename = "coverImage")]
    #[serde(default)]
    cover_image: Option<CoverImage>,
    #[serde(default)]
    format: Option<String>,
    #[serde(rename = "isAdult")]
    #[serde(default)]
    is_adult: bool,
    #[serde(default)]
    episodes: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct MediaTitle {
    #[serde(default)]
    english: Option<String>,
    #[serde(default)]
    romaji: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CoverImage {
    #[serde(rename = "extraLarge")]
    #[serde(default)]
    extra_large: Option<String>,
    #[serde(default)]
    large: Option<String>,
}

// --- Queries ---

const MULTIPLE_TITLES_QUERY: &str = r#"query($ids: [Int], $perPage: Int) {
  Page(page: 1, perPage: $perPage) {
    media(id_in: $ids, type: ANIME) {
      id
      title {
        english
        romaji
      }
      coverImage {
        extraLarge
        large
      }
      format
      isAdult
      episodes
    }
  }
}"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_response_maps_to_metadata() {
        let text = r#"{
          "data": { "Page": { "media": [
            { "id": 1535, "title": { "english": "Death Note", "romaji": "DEATH NOTE" },
              "coverImage": { "large": "https://img.example/l.jpg" },
              "format": "TV", "isAdult": false, "episodes": 37 },
            { "id": 199, "title": { "english": null, "romaji": "Sen to Chihiro no Kamikakushi" },
              "coverImage": { "extraLarge": "https://img.example/xl.jpg", "large": "https://img.example/l.jpg" },
              "format": "MOVIE", "isAdult": false, "episodes": 1 }
          ] } }
        }"#;
        let envelope: GraphQlEnvelope<PagePayload> = serde_json::from_str(text).unwrap();
        let titles: Vec<TitleMetadata> = AniListClient::extract_data(envelope)
            .unwrap()
            .page
            .media
            .into_iter()
            .map(TitleMetadata::from)
            .collect();

        assert_eq!(titles[0].title, "Death Note");
        assert_eq!(titles[0].kind, MediaKind::Series);
        assert_eq!(titles[0].episodes, Some(37));
        assert_eq!(titles[1].title, "Sen to Chihiro no Kamikakushi");
        assert_eq!(titles[1].kind, MediaKind::Movie);
        assert_eq!(titles[1].poster_url, "https://img.example/xl.jpg");
    }

    fn stub_title(id: u64) -> TitleMetadata {
        TitleMetadata {
            id,
            title: format!("Title {id}"),
            poster_url: String::new(),
            kind: MediaKind::Series,
            is_adult: false,
            episodes: None,
        }
    }

    /// Resolves every id except the second page, which fails.
    async fn second_page_down(chunk: &[u64]) -> Result<Vec<TitleMetadata>> {
        if chunk.contains(&(PAGE_SIZE as u64 + 1)) {
            bail!("AniList API HTTP 500 Internal Server Error");
        }
        Ok(chunk.iter().copied().map(stub_title).collect())
    }

    async fn rate_limited(_chunk: &[u64]) -> Result<Vec<TitleMetadata>> {
        bail!("AniList API error: Too Many Requests.")
    }

    #[tokio::test]
    async fn failed_page_keeps_titles_from_other_pages() {
        let ids: Vec<u64> = (1..=(PAGE_SIZE as u64 * 2 + 1)).collect();
        let titles = fetch_in_chunks(&ids, second_page_down).await.unwrap();

        assert_eq!(titles.len(), PAGE_SIZE + 1);
        assert_eq!(titles.first().map(|t| t.id), Some(1));
        assert_eq!(titles.last().map(|t| t.id), Some(PAGE_SIZE as u64 * 2 + 1));
    }

    #[tokio::test]
    async fn every_page_failing_is_an_error() {
        let ids: Vec<u64> = (1..=3).collect();
        let err = fetch_in_chunks(&ids, rate_limited).await.unwrap_err();
        assert!(err.to_string().contains("Too Many Requests"));
    }

    #[tokio::test]
    async fn no_ids_resolve_to_nothing() {
        let titles = fetch_in_chunks(&[], rate_limited).await.unwrap();
        assert!(titles.is_empty());
    }

    #[test]
    fn graphql_errors_become_an_error() {
        let text = r#"{ "data": null, "errors": [{ "message": "Too Many Requests." }] }"#;
        let envelope: GraphQlEnvelope<PagePayload> = serde_json::from_str(text).unwrap();
        let err = AniListClient::extract_data(envelope).unwrap_err();
        assert!(err.to_string().contains("Too Many Requests"));
    }
}
