//! External music metadata lookup.
//!
//! The catalog only needs three things from a music database: the best match
//! for a free-text query, the release year of an album and the bytes of a
//! cover image. [`MetadataProvider`] captures that; [`DeezerProvider`] talks
//! to the public Deezer API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::audio::normalize_year;

pub const DEFAULT_DEEZER_URL: &str = "https://api.deezer.com";

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Empty image returned from {0}")]
    EmptyImage(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, MetadataError>;

/// Best match returned by a search.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackMatch {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_id: Option<u64>,
    pub cover_url: Option<String>,
}

/// Fields a provider could fill in for a track.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnrichedMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub year: Option<String>,
    pub cover_url: Option<String>,
}

/// Free-text query for a track: `"<artist> <title>"`, or the title alone.
///
/// Returns `None` when there is nothing to search for.
pub fn build_query(title: &str, artist: &str) -> Option<String> {
    let combined = format!("{} {}", artist, title);
    let combined = combined.trim();
    if !combined.is_empty() {
        return Some(combined.to_string());
    }
    let title = title.trim();
    (!title.is_empty()).then(|| title.to_string())
}

/// A music database the catalog can ask about tracks.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Returns the name of this provider (e.g., "deezer")
    fn name(&self) -> &str;

    /// First result for a free-text query
    async fn search(&self, query: &str) -> Result<Option<TrackMatch>>;

    /// Release year of an album, if the provider knows it
    async fn album_year(&self, album_id: u64) -> Result<Option<String>>;

    /// Download an image referenced by a search result
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>>;

    /// Search for a track and collect everything known about it.
    ///
    /// Never fails: lookup errors leave the corresponding fields empty.
    async fn enrich(&self, title: &str, artist: &str) -> EnrichedMetadata {
        let mut enriched = EnrichedMetadata::default();

        let Some(query) = build_query(title, artist) else {
            return enriched;
        };

        let found = match self.search(&query).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                tracing::debug!("{}: no match for '{}'", self.name(), query);
                return enriched;
            }
            Err(e) => {
                tracing::warn!("{}: search for '{}' failed: {}", self.name(), query, e);
                return enriched;
            }
        };

        if let Some(album_id) = found.album_id {
            match self.album_year(album_id).await {
                Ok(year) => enriched.year = year,
                Err(e) => tracing::debug!("{}: album {} lookup failed: {}", self.name(), album_id, e),
            }
        }

        enriched.title = found.title;
        enriched.artist = found.artist;
        enriched.album = found.album;
        enriched.cover_url = found.cover_url;
        enriched
    }
}

#[derive(Debug, Deserialize)]
struct DeezerSearchResponse {
    #[serde(default)]
    data: Vec<DeezerTrack>,
}

#[derive(Debug, Deserialize)]
struct DeezerTrack {
    title: Option<String>,
    artist: Option<DeezerArtist>,
    album: Option<DeezerAlbum>,
}

#[derive(Debug, Deserialize)]
struct DeezerArtist {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeezerAlbum {
    id: Option<u64>,
    title: Option<String>,
    cover: Option<String>,
    cover_xl: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeezerAlbumDetails {
    release_date: Option<String>,
}

impl From<DeezerTrack> for TrackMatch {
    fn from(track: DeezerTrack) -> Self {
        let album = track.album;
        TrackMatch {
            title: track.title,
            artist: track.artist.and_then(|a| a.name),
            album_id: album.as_ref().and_then(|a| a.id),
            cover_url: album
                .as_ref()
                .and_then(|a| a.cover_xl.clone().or_else(|| a.cover.clone())),
            album: album.and_then(|a| a.title),
        }
    }
}

/// Deezer public API client.
pub struct DeezerProvider {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl DeezerProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("musickera/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl MetadataProvider for DeezerProvider {
    fn name(&self) -> &str {
        "deezer"
    }

    async fn search(&self, query: &str) -> Result<Option<TrackMatch>> {
        tracing::debug!("Deezer search query: {}", query);

        let response: DeezerSearchResponse = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[("q", query)])
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.data.into_iter().next().map(TrackMatch::from))
    }

    async fn album_year(&self, album_id: u64) -> Result<Option<String>> {
        let details: DeezerAlbumDetails = self
            .client
            .get(format!("{}/album/{}", self.base_url, album_id))
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(details
            .release_date
            .filter(|d| !d.trim().is_empty())
            .map(|d| normalize_year(&d)))
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        let bytes = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        if bytes.is_empty() {
            return Err(MetadataError::EmptyImage(url.to_string()));
        }
        Ok(bytes.to_vec())
    }
}

/// Provider used when external lookups are switched off.
pub struct OfflineProvider;

#[async_trait]
impl MetadataProvider for OfflineProvider {
    fn name(&self) -> &str {
        "offline"
    }

    async fn search(&self, _query: &str) -> Result<Option<TrackMatch>> {
        Err(MetadataError::Unavailable("external metadata disabled".to_string()))
    }

    async fn album_year(&self, _album_id: u64) -> Result<Option<String>> {
        Err(MetadataError::Unavailable("external metadata disabled".to_string()))
    }

    async fn fetch_image(&self, _url: &str) -> Result<Vec<u8>> {
        Err(MetadataError::Unavailable("external metadata disabled".to_string()))
    }
}
