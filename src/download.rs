//! Playlist downloads through an external extraction tool.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::library::{MAX_PLAYLIST_NAME_LEN, MusicLibrary};
use crate::names::sanitize_playlist_name;

/// Folder name used when the client gives none.
pub const DEFAULT_PLAYLIST_NAME: &str = "Playlist";

const AUDIO_FORMAT: &str = "bestaudio[ext=m4a]/bestaudio/best";
const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

/// What a source knows about a URL before downloading it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaylistInfo {
    /// Suggested folder name, already sanitized.
    pub name: Option<String>,
    pub thumbnail: Option<String>,
}

/// Something that can list and download the audio behind a URL.
#[async_trait]
pub trait PlaylistSource: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect a URL without downloading anything.
    async fn probe(&self, url: &str) -> Result<PlaylistInfo>;

    /// Download every item into `dir`, sending each finished file path.
    ///
    /// Items that fail individually are skipped; an error means the whole
    /// run failed.
    async fn fetch(&self, url: &str, dir: &Path, finished: mpsc::Sender<PathBuf>) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct YtThumbnail {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YtInfo {
    #[serde(rename = "_type")]
    kind: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<YtThumbnail>,
    #[serde(default)]
    entries: Vec<Option<YtInfo>>,
}

impl YtInfo {
    fn first_thumbnail(&self) -> Option<String> {
        self.thumbnails.first().and_then(|t| t.url.clone())
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn folder_name(raw: &str) -> String {
    let sanitized = sanitize_playlist_name(raw.trim());
    sanitized.chars().take(MAX_PLAYLIST_NAME_LEN).collect::<String>().trim().to_string()
}

impl From<YtInfo> for PlaylistInfo {
    fn from(info: YtInfo) -> Self {
        if info.kind.as_deref() == Some("playlist") {
            let thumbnail = info.first_thumbnail().or_else(|| {
                let first = info.entries.first()?.as_ref()?;
                first.first_thumbnail().or_else(|| first.thumbnail.clone())
            });
            return PlaylistInfo {
                name: Some(folder_name(
                    non_empty(&info.title).unwrap_or(DEFAULT_PLAYLIST_NAME),
                )),
                thumbnail,
            };
        }

        let name = match (non_empty(&info.uploader), non_empty(&info.title)) {
            (Some(uploader), Some(title)) => Some(format!("{} - {}", uploader, title)),
            (None, Some(title)) => Some(title.to_string()),
            _ => None,
        };

        PlaylistInfo {
            name: name.map(|n| folder_name(&n)),
            thumbnail: info.thumbnail,
        }
    }
}

/// `yt-dlp` driven as a child process.
pub struct YtDlp {
    program: PathBuf,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl PlaylistSource for YtDlp {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    async fn probe(&self, url: &str) -> Result<PlaylistInfo> {
        let mut cmd = Command::new(&self.program);
        cmd.args(["--dump-single-json", "--flat-playlist", "--no-warnings", "--", url])
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result
                .with_context(|| format!("Failed to run {}", self.program.display()))?,
            Err(_) => bail!("yt-dlp probe timed out after {}s", self.timeout.as_secs()),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("yt-dlp probe failed ({}): {}", output.status, stderr.trim());
        }

        let info: YtInfo =
            serde_json::from_slice(&output.stdout).context("Failed to parse yt-dlp JSON")?;
        Ok(info.into())
    }

    async fn fetch(&self, url: &str, dir: &Path, finished: mpsc::Sender<PathBuf>) -> Result<()> {
        let mut child = Command::new(&self.program)
            .arg("-f")
            .arg(AUDIO_FORMAT)
            .arg("-o")
            .arg(dir.join(OUTPUT_TEMPLATE))
            .args([
                "--ignore-errors",
                "--no-progress",
                "--yes-playlist",
                "--no-simulate",
                "--print",
                "after_move:filepath",
                "--",
                url,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to run {}", self.program.display()))?;

        let stdout = child.stdout.take().context("yt-dlp stdout not captured")?;
        let stderr = child.stderr.take().context("yt-dlp stderr not captured")?;

        let run = async move {
            let stderr_task = tokio::spawn(async move {
                let mut last_error = None;
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.starts_with("ERROR") {
                        tracing::warn!("yt-dlp: {}", line);
                        last_error = Some(line);
                    } else {
                        tracing::debug!("yt-dlp: {}", line);
                    }
                }
                last_error
            });

            let mut count = 0usize;
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                count += 1;
                if finished.send(PathBuf::from(line)).await.is_err() {
                    tracing::warn!("Download listener went away");
                    break;
                }
            }

            let status = child.wait().await?;
            let last_error = stderr_task.await.ok().flatten();
            Ok::<_, anyhow::Error>((status, count, last_error))
        };

        let (status, count, last_error) = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result?,
            Err(_) => bail!("yt-dlp download timed out after {}s", self.timeout.as_secs()),
        };

        if !status.success() {
            if count == 0 {
                bail!(
                    "yt-dlp exited with {}: {}",
                    status,
                    last_error.unwrap_or_else(|| "no files downloaded".to_string())
                );
            }
            tracing::warn!("yt-dlp exited with {} after {} files", status, count);
        }

        Ok(())
    }
}

/// Outcome of one playlist download.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadReport {
    pub success: bool,
    pub downloaded: Vec<String>,
    pub errors: Vec<String>,
    pub playlist: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadReport {
    pub fn new(playlist: String, downloaded: Vec<String>, errors: Vec<String>) -> Self {
        let success = !downloaded.is_empty() && errors.is_empty();
        let error = (!success).then(|| {
            errors
                .first()
                .cloned()
                .unwrap_or_else(|| "Download failed".to_string())
        });
        Self {
            success,
            downloaded,
            errors,
            playlist,
            error,
        }
    }
}

/// Downloads playlists into the library and resolves their covers.
#[derive(Clone)]
pub struct PlaylistDownloader {
    source: std::sync::Arc<dyn PlaylistSource>,
    library: MusicLibrary,
}

impl PlaylistDownloader {
    pub fn new(source: std::sync::Arc<dyn PlaylistSource>, library: MusicLibrary) -> Self {
        Self { source, library }
    }

    /// Folder name suggested for a URL; [`DEFAULT_PLAYLIST_NAME`] on failure.
    pub async fn playlist_name(&self, url: &str) -> String {
        match self.source.probe(url).await {
            Ok(info) => info
                .name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| DEFAULT_PLAYLIST_NAME.to_string()),
            Err(e) => {
                tracing::warn!("Could not read playlist name from {}: {:#}", url, e);
                DEFAULT_PLAYLIST_NAME.to_string()
            }
        }
    }

    /// Download `url` into a playlist folder.
    ///
    /// `None` uses [`DEFAULT_PLAYLIST_NAME`]; an empty name asks the source.
    pub async fn download(&self, url: &str, requested_name: Option<&str>) -> DownloadReport {
        let name = match requested_name.map(str::trim) {
            None => DEFAULT_PLAYLIST_NAME.to_string(),
            Some("") => self.playlist_name(url).await,
            Some(name) => name.to_string(),
        };

        let playlist = match self.library.create_playlist(&name).await {
            Ok(playlist) => playlist,
            Err(e) => return DownloadReport::new(name, Vec::new(), vec![e.to_string()]),
        };
        tracing::info!("Downloading {} into '{}'", url, playlist.name);

        let thumbnail = match self.source.probe(url).await {
            Ok(info) => info.thumbnail,
            Err(e) => {
                tracing::warn!("Could not read playlist thumbnail: {:#}", e);
                None
            }
        };

        let covers = self.library.covers();
        let (tx, mut rx) = mpsc::channel::<PathBuf>(16);
        let collect = async {
            let mut downloaded = Vec::new();
            while let Some(path) = rx.recv().await {
                let Some(file_name) = path.file_name() else {
                    continue;
                };
                downloaded.push(file_name.to_string_lossy().into_owned());
                if covers.ensure_cover(&path).await.is_none() {
                    tracing::debug!("No cover for downloaded {}", path.display());
                }
            }
            downloaded
        };

        let (fetched, downloaded) =
            tokio::join!(self.source.fetch(url, &playlist.dir, tx), collect);

        let mut errors = Vec::new();
        if let Err(e) = fetched {
            tracing::error!("Download of {} failed: {:#}", url, e);
            errors.push(format!("{:#}", e));
        }

        match thumbnail {
            Some(thumbnail) if errors.is_empty() => {
                covers
                    .store_playlist_cover_from_url(&playlist.name, &thumbnail)
                    .await;
            }
            _ => tracing::debug!("No thumbnail stored for '{}'", playlist.name),
        }

        let report = DownloadReport::new(playlist.name, downloaded, errors);
        tracing::info!(
            "Download of '{}' finished: {} files, {} errors",
            report.playlist,
            report.downloaded.len(),
            report.errors.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covers::CoverStore;
    use crate::metadata::OfflineProvider;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[test]
    fn test_playlist_info_from_playlist_json() {
        let json = r#"{"_type":"playlist","title":"Rock: Anos 80?",
            "thumbnails":[{"url":"http://t/pl.jpg"},{"url":"http://t/other.jpg"}],
            "entries":[{"title":"a","thumbnail":"http://t/a.jpg"}]}"#;
        let info: PlaylistInfo = serde_json::from_str::<YtInfo>(json).unwrap().into();
        assert_eq!(info.name.as_deref(), Some("Rock_ Anos 80_"));
        assert_eq!(info.thumbnail.as_deref(), Some("http://t/pl.jpg"));
    }

    #[test]
    fn test_playlist_thumbnail_falls_back_to_first_entry() {
        let json = r#"{"_type":"playlist","title":"Mix",
            "entries":[{"title":"a","thumbnails":[{"url":"http://t/a-list.jpg"}],"thumbnail":"http://t/a.jpg"}]}"#;
        let info: PlaylistInfo = serde_json::from_str::<YtInfo>(json).unwrap().into();
        assert_eq!(info.thumbnail.as_deref(), Some("http://t/a-list.jpg"));

        let json = r#"{"_type":"playlist","entries":[{"thumbnail":"http://t/b.jpg"}]}"#;
        let info: PlaylistInfo = serde_json::from_str::<YtInfo>(json).unwrap().into();
        assert_eq!(info.name.as_deref(), Some(DEFAULT_PLAYLIST_NAME));
        assert_eq!(info.thumbnail.as_deref(), Some("http://t/b.jpg"));
    }

    #[test]
    fn test_single_video_name() {
        let json = r#"{"title":"Epitáfio","uploader":"Titãs","thumbnail":"http://t/v.jpg"}"#;
        let info: PlaylistInfo = serde_json::from_str::<YtInfo>(json).unwrap().into();
        assert_eq!(info.name.as_deref(), Some("Titãs - Epitáfio"));
        assert_eq!(info.thumbnail.as_deref(), Some("http://t/v.jpg"));

        let info: PlaylistInfo = serde_json::from_str::<YtInfo>(r#"{"title":"Solo"}"#).unwrap().into();
        assert_eq!(info.name.as_deref(), Some("Solo"));

        let info: PlaylistInfo = serde_json::from_str::<YtInfo>("{}").unwrap().into();
        assert_eq!(info, PlaylistInfo::default());
    }

    #[test]
    fn test_long_names_are_truncated() {
        let json = format!(r#"{{"_type":"playlist","title":"{}"}}"#, "a".repeat(300));
        let info: PlaylistInfo = serde_json::from_str::<YtInfo>(&json).unwrap().into();
        assert_eq!(info.name.unwrap().chars().count(), MAX_PLAYLIST_NAME_LEN);
    }

    #[test]
    fn test_report_success_rules() {
        let ok = DownloadReport::new("P".into(), vec!["a.m4a".into()], vec![]);
        assert!(ok.success);
        assert!(ok.error.is_none());

        let empty = DownloadReport::new("P".into(), vec![], vec![]);
        assert!(!empty.success);
        assert_eq!(empty.error.as_deref(), Some("Download failed"));

        let partial = DownloadReport::new("P".into(), vec!["a.m4a".into()], vec!["boom".into()]);
        assert!(!partial.success);
        assert_eq!(partial.error.as_deref(), Some("boom"));

        let json = serde_json::to_value(&ok).unwrap();
        assert!(json.get("error").is_none());
    }

    struct FakeSource {
        info: PlaylistInfo,
        files: Vec<&'static str>,
        fail: bool,
        fetched_into: Mutex<Option<PathBuf>>,
    }

    #[async_trait]
    impl PlaylistSource for FakeSource {
        fn name(&self) -> &str {
            "fake"
        }

        async fn probe(&self, _url: &str) -> Result<PlaylistInfo> {
            Ok(self.info.clone())
        }

        async fn fetch(&self, _url: &str, dir: &Path, finished: mpsc::Sender<PathBuf>) -> Result<()> {
            *self.fetched_into.lock().unwrap() = Some(dir.to_path_buf());
            for file in &self.files {
                let path = dir.join(file);
                std::fs::write(&path, b"audio")?;
                finished.send(path).await?;
            }
            if self.fail {
                bail!("network unreachable");
            }
            Ok(())
        }
    }

    fn downloader(source: FakeSource) -> (TempDir, PlaylistDownloader, Arc<FakeSource>) {
        let root = TempDir::new().unwrap();
        let covers = CoverStore::new(root.path().to_path_buf(), Arc::new(OfflineProvider));
        let library = MusicLibrary::new(root.path().to_path_buf(), covers);
        let source = Arc::new(source);
        (root, PlaylistDownloader::new(source.clone(), library), source)
    }

    fn fake(files: Vec<&'static str>, fail: bool) -> FakeSource {
        FakeSource {
            info: PlaylistInfo {
                name: Some("Titãs - Ao Vivo".to_string()),
                thumbnail: None,
            },
            files,
            fail,
            fetched_into: Mutex::new(None),
        }
    }

    #[tokio::test]
    async fn test_download_into_requested_playlist() {
        let (root, downloader, source) = downloader(fake(vec!["Epitáfio.m4a", "Flores.m4a"], false));

        let report = downloader.download("https://example.com/list", Some(" Rock ")).await;

        assert!(report.success);
        assert_eq!(report.playlist, "Rock");
        assert_eq!(report.downloaded, vec!["Epitáfio.m4a", "Flores.m4a"]);
        assert_eq!(
            source.fetched_into.lock().unwrap().as_deref(),
            Some(root.path().join("Rock").as_path())
        );
        assert!(root.path().join("Rock").join("Flores.m4a").is_file());
    }

    #[tokio::test]
    async fn test_download_name_defaults() {
        let (root, downloader, _) = downloader(fake(vec!["a.m4a"], false));
        let report = downloader.download("https://example.com/x", None).await;
        assert_eq!(report.playlist, DEFAULT_PLAYLIST_NAME);
        assert!(root.path().join(DEFAULT_PLAYLIST_NAME).is_dir());

        let report = downloader.download("https://example.com/x", Some("")).await;
        assert_eq!(report.playlist, "Titãs - Ao Vivo");
    }

    #[tokio::test]
    async fn test_download_failure_is_reported() {
        let (_root, downloader, _) = downloader(fake(vec!["a.m4a"], true));

        let report = downloader.download("https://example.com/x", Some("P")).await;
        assert!(!report.success);
        assert_eq!(report.downloaded, vec!["a.m4a"]);
        assert_eq!(report.errors, vec!["network unreachable"]);
        assert_eq!(report.error.as_deref(), Some("network unreachable"));
    }

    #[tokio::test]
    async fn test_download_invalid_playlist_name() {
        let (_root, downloader, _) = downloader(fake(vec![], false));
        let report = downloader.download("https://example.com/x", Some("..")).await;
        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let ytdlp = YtDlp::new("/nonexistent/yt-dlp", Duration::from_secs(5));
        assert!(ytdlp.probe("https://example.com").await.is_err());

        let dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        assert!(ytdlp.fetch("https://example.com", dir.path(), tx).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ytdlp_against_fake_script() {
        use std::os::unix::fs::PermissionsExt;

        let bin = TempDir::new().unwrap();
        let script = bin.path().join("yt-dlp");
        std::fs::write(
            &script,
            r#"#!/bin/sh
if [ "$1" = "--dump-single-json" ]; then
  echo '{"_type":"playlist","title":"Fake List","thumbnails":[{"url":"http://t/x.jpg"}]}'
  exit 0
fi
for last in "$@"; do :; done
case "$last" in
  *slow*) sleep 5 ;;
esac
dir=$(dirname "$4")
touch "$dir/One.m4a"
echo "$dir/One.m4a"
echo "ERROR: [youtube] gone: Video unavailable" >&2
"#,
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let ytdlp = YtDlp::new(&script, Duration::from_secs(2));
        let info = ytdlp.probe("https://example.com/list").await.unwrap();
        assert_eq!(info.name.as_deref(), Some("Fake List"));
        assert_eq!(info.thumbnail.as_deref(), Some("http://t/x.jpg"));

        let out = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        ytdlp.fetch("https://example.com/list", out.path(), tx).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first, out.path().join("One.m4a"));
        assert!(first.is_file());

        let quick = YtDlp::new(&script, Duration::from_millis(300));
        let (tx, _rx) = mpsc::channel(4);
        let err = quick
            .fetch("https://example.com/slow", out.path(), tx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{}", err);
    }
}
