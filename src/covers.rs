//! Cover art resolution and the flat on-disk cover cache.
//!
//! Covers live in `<music root>/covers/<stem>.jpg`. The presence of the file is
//! the only record that a cover exists. Every step of a lookup is best-effort:
//! a failure falls through to the next step and finally to the placeholder.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::audio::{is_audio_file, read_tags_blocking};
use crate::metadata::{MetadataProvider, build_query};
use crate::names::{cover_stem, infer_title_artist, is_plain_name, playlist_cover_stem};

pub const COVERS_DIR_NAME: &str = "covers";
pub const COVER_URL_PREFIX: &str = "/musics/covers/";
pub const DEFAULT_COVER_URL: &str = "/musics/default-cover.jpg";

/// Public URL of a cached cover.
pub fn cover_url(stem: &str) -> String {
    format!("{}{}.jpg", COVER_URL_PREFIX, stem)
}

fn file_name_lossy(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

#[derive(Clone)]
pub struct CoverStore {
    music_root: PathBuf,
    covers_dir: PathBuf,
    provider: Arc<dyn MetadataProvider>,
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

/// Exclusive right to write one cover stem.
struct StemLock {
    guard: Option<OwnedMutexGuard<()>>,
    stem: String,
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl Drop for StemLock {
    fn drop(&mut self) {
        // Release the guard first so the entry is idle when we inspect it.
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.stem)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.stem);
        }
    }
}

impl CoverStore {
    pub fn new(music_root: PathBuf, provider: Arc<dyn MetadataProvider>) -> Self {
        let covers_dir = music_root.join(COVERS_DIR_NAME);
        Self {
            music_root,
            covers_dir,
            provider,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn covers_dir(&self) -> &Path {
        &self.covers_dir
    }

    pub fn provider(&self) -> &Arc<dyn MetadataProvider> {
        &self.provider
    }

    /// Path of the cache file for a stem.
    pub fn cover_path(&self, stem: &str) -> PathBuf {
        self.covers_dir.join(format!("{}.jpg", stem))
    }

    /// URL of the cached cover for `stem`, if the file exists.
    pub async fn cached_cover(&self, stem: &str) -> Option<String> {
        match tokio::fs::metadata(self.cover_path(stem)).await {
            Ok(meta) if meta.is_file() => Some(cover_url(stem)),
            _ => None,
        }
    }

    /// Cache-only lookup for a track. Never touches the network.
    pub async fn cached_track_cover(&self, audio_path: &Path) -> Option<String> {
        let name = file_name_lossy(audio_path)?;
        self.cached_cover(&cover_stem(&name)).await
    }

    async fn lock_stem(&self, stem: &str) -> StemLock {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(stem.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        StemLock {
            guard: Some(guard),
            stem: stem.to_string(),
            locks: self.locks.clone(),
        }
    }

    /// Write cover bytes so that readers only ever see a complete file.
    async fn write_cover(&self, stem: &str, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.covers_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.covers_dir.display()))?;

        let target = self.cover_path(stem);
        let tmp = self
            .covers_dir
            .join(format!(".{}.{}.tmp", stem, uuid::Uuid::new_v4()));

        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;

        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).with_context(|| format!("Failed to move cover to {}", target.display()));
        }

        Ok(target)
    }

    /// Make sure a cover exists for an audio file and return its URL.
    ///
    /// Order: cache, embedded tags, `"Artist - Title"` filename, external
    /// search. `None` means no cover could be found; callers show
    /// [`DEFAULT_COVER_URL`].
    pub async fn ensure_cover(&self, audio_path: &Path) -> Option<String> {
        let name = file_name_lossy(audio_path)?;
        let stem = cover_stem(&name);

        if let Some(url) = self.cached_cover(&stem).await {
            return Some(url);
        }

        let _lock = self.lock_stem(&stem).await;

        // Another request may have written it while we waited.
        if let Some(url) = self.cached_cover(&stem).await {
            return Some(url);
        }

        let bytes = self.fetch_track_cover(audio_path, &name).await?;
        match self.write_cover(&stem, &bytes).await {
            Ok(path) => {
                tracing::info!("Saved cover for {}: {}", name, path.display());
                Some(cover_url(&stem))
            }
            Err(e) => {
                tracing::warn!("Could not save cover for {}: {:#}", name, e);
                None
            }
        }
    }

    async fn fetch_track_cover(&self, audio_path: &Path, name: &str) -> Option<Vec<u8>> {
        let tags = read_tags_blocking(audio_path.to_path_buf())
            .await
            .unwrap_or_default();

        let complete = tags.is_complete();
        let mut title = tags.title.unwrap_or_default();
        let mut artist = tags.artist.unwrap_or_default();
        if !complete {
            let inferred = infer_title_artist(name);
            if title.is_empty() {
                title = inferred.title;
            }
            if artist.is_empty() {
                artist = inferred.artist;
            }
        }

        let query = build_query(&title, &artist)?;

        let found = match self.provider.search(&query).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                tracing::debug!("No cover match for '{}'", query);
                return None;
            }
            Err(e) => {
                tracing::warn!("Cover search for '{}' failed: {}", query, e);
                return None;
            }
        };

        let url = found.cover_url?;
        match self.provider.fetch_image(&url).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!("Cover download from {} failed: {}", url, e);
                None
            }
        }
    }

    /// Cover URL for a playlist, creating it from the first track that has one.
    ///
    /// Always returns a URL; [`DEFAULT_COVER_URL`] when nothing was found.
    pub async fn get_or_create_playlist_cover(&self, playlist_name: &str) -> String {
        let stem = playlist_cover_stem(playlist_name);

        if let Some(url) = self.cached_cover(&stem).await {
            return url;
        }

        if !is_plain_name(playlist_name) {
            tracing::warn!("Refusing playlist cover lookup for '{}'", playlist_name);
            return DEFAULT_COVER_URL.to_string();
        }

        let playlist_dir = self.music_root.join(playlist_name);
        let mut entries = match tokio::fs::read_dir(&playlist_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("Playlist directory {} unreadable: {}", playlist_dir.display(), e);
                return DEFAULT_COVER_URL.to_string();
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !is_audio_file(&path) {
                continue;
            }

            let Some(track_url) = self.ensure_cover(&path).await else {
                continue;
            };

            let Some(track_name) = file_name_lossy(&path) else {
                continue;
            };
            let source = self.cover_path(&cover_stem(&track_name));

            return match self.copy_into_slot(&source, &stem).await {
                Ok(url) => {
                    tracing::info!("Playlist '{}' cover taken from {}", playlist_name, track_name);
                    url
                }
                Err(e) => {
                    tracing::warn!("Could not copy cover for playlist '{}': {:#}", playlist_name, e);
                    track_url
                }
            };
        }

        tracing::debug!("No cover found for playlist '{}'", playlist_name);
        DEFAULT_COVER_URL.to_string()
    }

    async fn copy_into_slot(&self, source: &Path, stem: &str) -> Result<String> {
        let _lock = self.lock_stem(stem).await;
        if let Some(url) = self.cached_cover(stem).await {
            return Ok(url);
        }

        let bytes = tokio::fs::read(source)
            .await
            .with_context(|| format!("Failed to read {}", source.display()))?;
        self.write_cover(stem, &bytes).await?;
        Ok(cover_url(stem))
    }

    /// Store an image (e.g. a playlist thumbnail) as the playlist cover.
    pub async fn store_playlist_cover_from_url(&self, playlist_name: &str, url: &str) -> Option<String> {
        let stem = playlist_cover_stem(playlist_name);

        let bytes = match self.provider.fetch_image(url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Playlist thumbnail download failed: {}", e);
                return None;
            }
        };

        let _lock = self.lock_stem(&stem).await;
        match self.write_cover(&stem, &bytes).await {
            Ok(path) => {
                tracing::info!("Saved playlist thumbnail: {}", path.display());
                Some(cover_url(&stem))
            }
            Err(e) => {
                tracing::warn!("Could not save playlist thumbnail: {:#}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetadataError, TrackMatch};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MockProvider {
        searches: AtomicUsize,
        queries: Mutex<Vec<String>>,
        has_match: bool,
        image_fails: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl MetadataProvider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn search(&self, query: &str) -> crate::metadata::Result<Option<TrackMatch>> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().unwrap().push(query.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.has_match.then(|| TrackMatch {
                cover_url: Some(format!("http://img/{}", query)),
                ..Default::default()
            }))
        }

        async fn album_year(&self, _album_id: u64) -> crate::metadata::Result<Option<String>> {
            Ok(None)
        }

        async fn fetch_image(&self, url: &str) -> crate::metadata::Result<Vec<u8>> {
            if self.image_fails {
                Err(MetadataError::EmptyImage(url.to_string()))
            } else {
                Ok(url.as_bytes().to_vec())
            }
        }
    }

    fn setup(provider: MockProvider) -> (TempDir, CoverStore, Arc<MockProvider>) {
        let root = TempDir::new().unwrap();
        let provider = Arc::new(provider);
        let store = CoverStore::new(root.path().to_path_buf(), provider.clone());
        (root, store, provider)
    }

    fn add_track(root: &Path, playlist: &str, name: &str) -> PathBuf {
        let dir = root.join(playlist);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, b"not audio").unwrap();
        path
    }

    #[tokio::test]
    async fn test_cached_cover_skips_network() {
        let (root, store, provider) = setup(MockProvider {
            has_match: true,
            ..Default::default()
        });
        let track = add_track(root.path(), "Rock", "Epitáfio.m4a");
        std::fs::create_dir_all(store.covers_dir()).unwrap();
        std::fs::write(store.cover_path("Epit_fio"), b"jpeg").unwrap();

        let url = store.ensure_cover(&track).await;
        assert_eq!(url.as_deref(), Some("/musics/covers/Epit_fio.jpg"));
        assert_eq!(provider.searches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ensure_cover_is_idempotent() {
        let (root, store, provider) = setup(MockProvider {
            has_match: true,
            ..Default::default()
        });
        let track = add_track(root.path(), "Rock", "Titãs - Epitáfio.mp3");

        let first = store.ensure_cover(&track).await;
        let second = store.ensure_cover(&track).await;

        assert_eq!(first.as_deref(), Some("/musics/covers/Tit_s_-_Epit_fio.jpg"));
        assert_eq!(first, second);
        assert_eq!(provider.searches.load(Ordering::SeqCst), 1);
        assert_eq!(provider.queries.lock().unwrap()[0], "Titãs Epitáfio");

        let saved = std::fs::read(store.cover_path("Tit_s_-_Epit_fio")).unwrap();
        assert_eq!(saved, "http://img/Titãs Epitáfio".as_bytes());
    }

    #[tokio::test]
    async fn test_no_match_means_no_cover() {
        let (root, store, _provider) = setup(MockProvider::default());
        let track = add_track(root.path(), "Rock", "Unknown.mp3");

        assert!(store.ensure_cover(&track).await.is_none());
        assert!(!store.cover_path("Unknown").exists());
    }

    #[tokio::test]
    async fn test_image_failure_means_no_cover() {
        let (root, store, _provider) = setup(MockProvider {
            has_match: true,
            image_fails: true,
            ..Default::default()
        });
        let track = add_track(root.path(), "Rock", "Song.mp3");

        assert!(store.ensure_cover(&track).await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_resolvers_fetch_once() {
        let (root, store, provider) = setup(MockProvider {
            has_match: true,
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let track = add_track(root.path(), "Rock", "Song.mp3");

        let results = futures::future::join_all((0..5).map(|_| store.ensure_cover(&track))).await;

        assert!(results.iter().all(|r| r.as_deref() == Some("/musics/covers/Song.jpg")));
        assert_eq!(provider.searches.load(Ordering::SeqCst), 1);
        assert!(store.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_playlist_cover_missing_dir_is_default() {
        let (_root, store, _provider) = setup(MockProvider::default());
        assert_eq!(
            store.get_or_create_playlist_cover("Nope").await,
            DEFAULT_COVER_URL
        );
        assert_eq!(
            store.get_or_create_playlist_cover("../etc").await,
            DEFAULT_COVER_URL
        );
    }

    #[tokio::test]
    async fn test_playlist_cover_copied_from_track() {
        let (root, store, provider) = setup(MockProvider {
            has_match: true,
            ..Default::default()
        });
        add_track(root.path(), "Rock Nacional", "Song.mp3");
        std::fs::write(root.path().join("Rock Nacional").join("notes.txt"), b"x").unwrap();

        let url = store.get_or_create_playlist_cover("Rock Nacional").await;
        assert_eq!(url, "/musics/covers/Rock_Nacional.jpg");
        assert!(store.cover_path("Rock_Nacional").is_file());
        assert!(store.cover_path("Song").is_file());

        // Second call is a pure cache hit.
        let again = store.get_or_create_playlist_cover("Rock Nacional").await;
        assert_eq!(again, url);
        assert_eq!(provider.searches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_playlist_cover_without_art_is_default() {
        let (root, store, _provider) = setup(MockProvider::default());
        add_track(root.path(), "Empty Art", "a.mp3");
        add_track(root.path(), "Empty Art", "b.flac");

        assert_eq!(
            store.get_or_create_playlist_cover("Empty Art").await,
            DEFAULT_COVER_URL
        );
    }

    #[tokio::test]
    async fn test_playlist_cover_copy_failure_returns_track_cover() {
        let (root, store, _provider) = setup(MockProvider {
            has_match: true,
            ..Default::default()
        });
        add_track(root.path(), "Mix", "Song.mp3");
        // A directory squatting on the playlist slot makes the final rename fail.
        std::fs::create_dir_all(store.cover_path("Mix")).unwrap();

        let url = store.get_or_create_playlist_cover("Mix").await;
        assert_eq!(url, "/musics/covers/Song.jpg");
    }

    #[tokio::test]
    async fn test_store_playlist_cover_from_url() {
        let (_root, store, _provider) = setup(MockProvider::default());

        let url = store
            .store_playlist_cover_from_url("Lo-fi: Beats", "http://thumb/1.jpg")
            .await;
        assert_eq!(url.as_deref(), Some("/musics/covers/Lo-fi_Beats.jpg"));
        assert_eq!(
            std::fs::read(store.cover_path("Lo-fi_Beats")).unwrap(),
            b"http://thumb/1.jpg"
        );
    }
}
