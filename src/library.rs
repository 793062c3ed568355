use anyhow::Context;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::audio::{is_audio_file, read_tags_blocking};
use crate::covers::{COVERS_DIR_NAME, CoverStore, DEFAULT_COVER_URL};
use crate::error::ApiError;
use crate::names::{infer_title_artist, is_plain_name, sanitize_playlist_name};

/// Playlist reported for files directly under the music root.
pub const ROOT_PLAYLIST: &str = "Geral";

/// Longest playlist name accepted on creation.
pub const MAX_PLAYLIST_NAME_LEN: usize = 100;

/// URL prefix the music root is served under.
pub const MEDIA_URL_PREFIX: &str = "/musics";

type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Clone, Serialize)]
pub struct PlaylistSummary {
    pub name: String,
    pub path: String,
    pub music_count: usize,
    pub cover: String,
}

/// Tag-derived fields, only present in full listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackDetails {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub year: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackEntry {
    pub id: String,
    pub name: String,
    pub path: String,
    pub playlist: String,
    pub cover: String,
    pub size: u64,
    pub modified: f64,
    #[serde(flatten)]
    pub details: Option<TrackDetails>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeEntry {
    pub name: String,
    pub path: String,
    pub playlist: String,
    pub size: u64,
    pub modified: f64,
    pub action: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedPlaylist {
    pub name: String,
    #[serde(skip)]
    pub dir: PathBuf,
}

/// An audio file found on disk, before any per-track work.
#[derive(Debug, Clone)]
struct FoundFile {
    path: PathBuf,
    relative: String,
    name: String,
    playlist: String,
    size: u64,
    modified: f64,
}

impl FoundFile {
    fn url(&self) -> String {
        format!("{}/{}", MEDIA_URL_PREFIX, self.relative)
    }
}

fn unix_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// `path` relative to `root`, always with `/` separators.
fn relative_url_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    Some(parts.join("/"))
}

/// Final component of a client-supplied filename, whatever separator it used.
pub fn upload_file_name(raw: &str) -> Option<&str> {
    let name = raw.rsplit(['/', '\\']).next()?.trim();
    (!name.is_empty() && name != "." && name != "..").then_some(name)
}

/// The music root as a catalog of playlists and tracks.
#[derive(Clone)]
pub struct MusicLibrary {
    root: PathBuf,
    covers: CoverStore,
}

impl MusicLibrary {
    pub fn new(root: PathBuf, covers: CoverStore) -> Self {
        Self { root, covers }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn covers(&self) -> &CoverStore {
        &self.covers
    }

    /// Directory of an existing playlist.
    pub fn playlist_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.root.join(name);
        if is_plain_name(name) && name != COVERS_DIR_NAME && dir.is_dir() {
            Ok(dir)
        } else {
            Err(ApiError::not_found(format!("Playlist not found: {}", name)))
        }
    }

    /// Every playlist with its track count and cover.
    pub async fn list_playlists(&self) -> Result<Vec<PlaylistSummary>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to read music root {}", self.root.display()))?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_dir && name != COVERS_DIR_NAME {
                names.push(name);
            }
        }

        let mut summaries = futures::future::join_all(names.into_iter().map(|name| async move {
            let music_count = self.count_tracks(&self.root.join(&name)).await;
            let cover = self.covers.get_or_create_playlist_cover(&name).await;
            PlaylistSummary {
                path: format!("{}/{}", MEDIA_URL_PREFIX, name),
                name,
                music_count,
                cover,
            }
        }))
        .await;

        summaries.sort_by_key(|p| p.name.to_lowercase());
        tracing::debug!("Listed {} playlists", summaries.len());
        Ok(summaries)
    }

    async fn count_tracks(&self, dir: &Path) -> usize {
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            return 0;
        };
        let mut count = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if is_audio_file(&path) && path.is_file() {
                count += 1;
            }
        }
        count
    }

    /// Walk a playlist (or the whole root) for audio files.
    async fn find_files(&self, playlist: Option<&str>) -> Result<Vec<FoundFile>> {
        let search_dir = match playlist {
            Some(name) => self.playlist_dir(name)?,
            None => self.root.clone(),
        };
        let root = self.root.clone();
        let covers_dir = self.covers.covers_dir().to_path_buf();

        let files = tokio::task::spawn_blocking(move || {
            WalkDir::new(&search_dir)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| e.path() != covers_dir.as_path())
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        tracing::warn!("Skipping unreadable entry: {}", e);
                        None
                    }
                })
                .filter(|e| e.file_type().is_file() && is_audio_file(e.path()))
                .filter_map(|entry| {
                    let path = entry.path();
                    let metadata = entry.metadata().ok()?;
                    let relative = relative_url_path(&root, path)?;
                    let parent = path.parent()?;
                    let playlist = if parent == root.as_path() {
                        ROOT_PLAYLIST.to_string()
                    } else {
                        parent.file_name()?.to_string_lossy().into_owned()
                    };

                    Some(FoundFile {
                        path: path.to_path_buf(),
                        name: entry.file_name().to_string_lossy().into_owned(),
                        relative,
                        playlist,
                        size: metadata.len(),
                        modified: metadata.modified().map(unix_seconds).unwrap_or(0.0),
                    })
                })
                .collect::<Vec<_>>()
        })
        .await
        .context("File walk panicked")?;

        Ok(files)
    }

    /// Tracks of one playlist, or of the whole catalog.
    ///
    /// With `skip_metadata` only filesystem facts and a cached cover are
    /// returned. Otherwise tags are read and, when title or artist are still
    /// unknown, the metadata provider is asked. Covers are never downloaded
    /// here.
    pub async fn list_tracks(&self, playlist: Option<&str>, skip_metadata: bool) -> Result<Vec<TrackEntry>> {
        let files = self.find_files(playlist).await?;
        tracing::debug!(
            "Listing {} tracks (playlist: {:?}, skip_metadata: {})",
            files.len(),
            playlist,
            skip_metadata
        );

        let mut tracks = Vec::with_capacity(files.len());
        for file in files {
            let cover = self
                .covers
                .cached_track_cover(&file.path)
                .await
                .unwrap_or_else(|| DEFAULT_COVER_URL.to_string());

            let details = if skip_metadata {
                None
            } else {
                Some(self.track_details(&file).await)
            };

            tracks.push(TrackEntry {
                id: format!("{:x}", md5::compute(file.relative.as_bytes())),
                path: file.url(),
                name: file.name,
                playlist: file.playlist,
                cover,
                size: file.size,
                modified: file.modified,
                details,
            });
        }

        tracks.sort_by_key(|t| t.name.to_lowercase());
        Ok(tracks)
    }

    async fn track_details(&self, file: &FoundFile) -> TrackDetails {
        let tags = read_tags_blocking(file.path.clone()).await.unwrap_or_default();
        let inferred = infer_title_artist(&file.name);

        let mut details = TrackDetails {
            title: tags.title.unwrap_or(inferred.title).trim().to_string(),
            artist: tags.artist.unwrap_or(inferred.artist).trim().to_string(),
            album: tags.album.unwrap_or_default(),
            year: tags.year.unwrap_or_default(),
        };

        if details.title.is_empty() || details.artist.is_empty() {
            let enriched = self
                .covers
                .provider()
                .enrich(&details.title, &details.artist)
                .await;
            if let Some(title) = enriched.title.filter(|t| !t.is_empty()) {
                details.title = title;
            }
            if let Some(artist) = enriched.artist.filter(|a| !a.is_empty()) {
                details.artist = artist;
            }
            if details.album.is_empty() {
                details.album = enriched.album.unwrap_or_default();
            }
            if details.year.is_empty() {
                details.year = enriched.year.unwrap_or_default();
            }
        }

        details
    }

    /// Audio files modified strictly after `last_check` (unix seconds).
    pub async fn changes_since(&self, playlist: Option<&str>, last_check: f64) -> Result<Vec<ChangeEntry>> {
        let files = self.find_files(playlist).await?;

        Ok(files
            .into_iter()
            .filter(|f| f.modified > last_check)
            .map(|f| ChangeEntry {
                path: f.url(),
                name: f.name,
                playlist: f.playlist,
                size: f.size,
                modified: f.modified,
                action: "modified",
            })
            .collect())
    }

    /// Create (or reuse) the directory of a playlist.
    pub async fn create_playlist(&self, name: &str) -> Result<CreatedPlaylist> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ApiError::invalid("Playlist name is required"));
        }
        if name.chars().count() > MAX_PLAYLIST_NAME_LEN {
            return Err(ApiError::invalid(format!(
                "Playlist name is too long (max {} characters)",
                MAX_PLAYLIST_NAME_LEN
            )));
        }

        let sanitized = sanitize_playlist_name(name);
        if !is_plain_name(&sanitized) || sanitized == COVERS_DIR_NAME {
            return Err(ApiError::invalid(format!("Invalid playlist name: {}", name)));
        }

        let dir = self.root.join(&sanitized);
        tokio::fs::create_dir_all(&dir).await?;
        tracing::info!("Playlist ready: {}", dir.display());

        Ok(CreatedPlaylist { name: sanitized, dir })
    }

    /// Store an uploaded audio file in a playlist and try to resolve its cover.
    ///
    /// Returns the stored file name.
    pub async fn save_upload(&self, playlist: &CreatedPlaylist, filename: &str, bytes: &[u8]) -> Result<String> {
        let name = upload_file_name(filename)
            .ok_or_else(|| ApiError::invalid(format!("Invalid file name: {}", filename)))?;

        let target = playlist.dir.join(name);
        if !is_audio_file(&target) {
            return Err(ApiError::invalid(format!("Unsupported format: {}", name)));
        }

        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("Failed to save {}", name))?;
        tracing::info!("Saved upload {} ({} bytes)", target.display(), bytes.len());

        if self.covers.ensure_cover(&target).await.is_none() {
            tracing::debug!("No cover found for upload {}", name);
        }

        Ok(name.to_string())
    }

    /// Map a URL path under the music root to a file on disk.
    ///
    /// Anything that could leave the root is reported as missing.
    pub async fn resolve_media_path(&self, relative: &str) -> Result<PathBuf> {
        let not_found = || ApiError::not_found(format!("File not found: {}", relative));

        let relative_path = Path::new(relative);
        if relative.is_empty()
            || !relative_path
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(not_found());
        }

        let root = tokio::fs::canonicalize(&self.root).await?;
        let candidate = tokio::fs::canonicalize(self.root.join(relative_path))
            .await
            .map_err(|_| not_found())?;

        if !candidate.starts_with(&root) || !candidate.is_file() {
            tracing::warn!("Rejected media path: {}", relative);
            return Err(not_found());
        }

        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::OfflineProvider;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (TempDir, MusicLibrary) {
        let dir = TempDir::new().unwrap();
        let covers = CoverStore::new(dir.path().to_path_buf(), Arc::new(OfflineProvider));
        let library = MusicLibrary::new(dir.path().to_path_buf(), covers);
        (dir, library)
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, b"data").unwrap();
        path
    }

    #[test]
    fn test_upload_file_name() {
        assert_eq!(upload_file_name("song.mp3"), Some("song.mp3"));
        assert_eq!(upload_file_name("../../etc/evil.mp3"), Some("evil.mp3"));
        assert_eq!(upload_file_name(r"C:\Users\me\track.flac"), Some("track.flac"));
        assert_eq!(upload_file_name("dir/"), None);
        assert_eq!(upload_file_name(".."), None);
        assert_eq!(upload_file_name(""), None);
    }

    #[tokio::test]
    async fn test_list_playlists_skips_covers() {
        let (dir, library) = setup();
        touch(&dir.path().join("rock"), "a.mp3");
        touch(&dir.path().join("rock"), "b.flac");
        touch(&dir.path().join("rock"), "notes.txt");
        touch(&dir.path().join("Jazz"), "c.m4a");
        touch(&dir.path().join(COVERS_DIR_NAME), "x.jpg");
        touch(dir.path(), "loose.mp3");

        let playlists = library.list_playlists().await.unwrap();
        let names: Vec<_> = playlists.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Jazz", "rock"]);

        assert_eq!(playlists[1].music_count, 2);
        assert_eq!(playlists[1].path, "/musics/rock");
        assert_eq!(playlists[1].cover, DEFAULT_COVER_URL);
    }

    #[tokio::test]
    async fn test_list_tracks_fast_mode() {
        let (dir, library) = setup();
        touch(&dir.path().join("Rock"), "b Song.mp3");
        touch(&dir.path().join("Rock"), "A Song.m4a");
        touch(dir.path(), "Loose.ogg");
        touch(&dir.path().join(COVERS_DIR_NAME), "Hidden.mp3");
        std::fs::write(dir.path().join(COVERS_DIR_NAME).join("A_Song.jpg"), b"jpg").unwrap();

        let tracks = library.list_tracks(None, true).await.unwrap();
        let names: Vec<_> = tracks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["A Song.m4a", "b Song.mp3", "Loose.ogg"]);

        assert_eq!(tracks[0].playlist, "Rock");
        assert_eq!(tracks[0].path, "/musics/Rock/A Song.m4a");
        assert_eq!(tracks[0].cover, "/musics/covers/A_Song.jpg");
        assert_eq!(tracks[0].size, 4);
        assert!(tracks[0].details.is_none());
        assert_eq!(
            tracks[0].id,
            format!("{:x}", md5::compute("Rock/A Song.m4a".as_bytes()))
        );

        assert_eq!(tracks[1].cover, DEFAULT_COVER_URL);
        assert_eq!(tracks[2].playlist, ROOT_PLAYLIST);
    }

    #[tokio::test]
    async fn test_list_tracks_full_mode_infers_from_filename() {
        let (dir, library) = setup();
        touch(&dir.path().join("Mix"), "Jota Quest - Fácil.mp3");

        let tracks = library.list_tracks(Some("Mix"), false).await.unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(
            tracks[0].details,
            Some(TrackDetails {
                title: "Fácil".to_string(),
                artist: "Jota Quest".to_string(),
                album: String::new(),
                year: String::new(),
            })
        );

        let json = serde_json::to_value(&tracks[0]).unwrap();
        assert_eq!(json["artist"], "Jota Quest");
        assert_eq!(json["album"], "");
    }

    #[tokio::test]
    async fn test_list_tracks_unknown_playlist() {
        let (_dir, library) = setup();
        assert!(matches!(
            library.list_tracks(Some("Nope"), true).await,
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            library.list_tracks(Some("../.."), true).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_changes_since() {
        let (dir, library) = setup();
        touch(&dir.path().join("Rock"), "new.mp3");

        let all = library.changes_since(None, 0.0).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].action, "modified");
        assert_eq!(all[0].path, "/musics/Rock/new.mp3");

        let future = unix_seconds(SystemTime::now()) + 3600.0;
        assert!(library.changes_since(None, future).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_playlist_validation() {
        let (dir, library) = setup();

        let created = library.create_playlist("  Rock: 80s?  ").await.unwrap();
        assert_eq!(created.name, "Rock_ 80s_");
        assert!(dir.path().join("Rock_ 80s_").is_dir());

        let long = "x".repeat(MAX_PLAYLIST_NAME_LEN + 1);
        for bad in ["", "   ", "..", ".", "covers", long.as_str()] {
            assert!(
                matches!(library.create_playlist(bad).await, Err(ApiError::InvalidInput(_))),
                "accepted {:?}",
                bad
            );
        }

        // Separators are sanitized, so this stays a single directory.
        let nested = library.create_playlist("a/b").await.unwrap();
        assert_eq!(nested.name, "a_b");
    }

    #[tokio::test]
    async fn test_save_upload() {
        let (dir, library) = setup();
        let playlist = library.create_playlist("Test").await.unwrap();

        let saved = library
            .save_upload(&playlist, "../../escape.mp3", b"ID3")
            .await
            .unwrap();
        assert_eq!(saved, "escape.mp3");
        assert!(dir.path().join("Test").join("escape.mp3").is_file());
        assert!(!dir.path().join("escape.mp3").exists());

        assert!(matches!(
            library.save_upload(&playlist, "notes.txt", b"x").await,
            Err(ApiError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_media_path() {
        let (dir, library) = setup();
        touch(&dir.path().join("Rock"), "a.mp3");
        let outside = TempDir::new().unwrap();
        touch(outside.path(), "secret.mp3");

        let resolved = library.resolve_media_path("Rock/a.mp3").await.unwrap();
        assert!(resolved.ends_with("Rock/a.mp3"));

        for bad in ["", "../secret.mp3", "/etc/passwd", "Rock/../../x", "Rock", "Rock/missing.mp3"] {
            assert!(
                matches!(library.resolve_media_path(bad).await, Err(ApiError::NotFound(_))),
                "resolved {:?}",
                bad
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_media_path_rejects_symlink_escape() {
        let (dir, library) = setup();
        let outside = TempDir::new().unwrap();
        let secret = touch(outside.path(), "secret.mp3");
        std::os::unix::fs::symlink(&secret, dir.path().join("link.mp3")).unwrap();

        assert!(matches!(
            library.resolve_media_path("link.mp3").await,
            Err(ApiError::NotFound(_))
        ));
    }
}
