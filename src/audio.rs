use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use symphonia::core::meta::StandardTagKey;

/// Extensions the catalog treats as audio.
pub const AUDIO_EXTENSIONS: [&str; 8] = ["mp3", "m4a", "aac", "ogg", "opus", "wav", "flac", "webm"];

static YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{4}").expect("valid year pattern"));

/// Lowercased extension of a path, if it has one.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
}

pub fn is_audio_file(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| AUDIO_EXTENSIONS.contains(&ext.as_str()))
}

/// MIME type for files served from the music root.
pub fn content_type_for(path: &Path) -> &'static str {
    match extension_of(path).as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("aac") => "audio/aac",
        Some("ogg") => "audio/ogg",
        Some("opus") => "audio/opus",
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        Some("webm") => "audio/webm",
        Some("mp4") => "video/mp4",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// Embedded tags relevant to the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AudioTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub year: Option<String>,
}

impl AudioTags {
    /// Both title and artist are present.
    pub fn is_complete(&self) -> bool {
        self.title.is_some() && self.artist.is_some()
    }

    fn set(slot: &mut Option<String>, value: &str) {
        let value = value.trim();
        if !value.is_empty() {
            *slot = Some(value.to_string());
        }
    }

    fn set_year(&mut self, value: &str) {
        Self::set(&mut self.year, &normalize_year(value));
    }
}

/// Reduce a date-like tag value to its year when one is present.
pub fn normalize_year(value: &str) -> String {
    YEAR.find(value)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| value.trim().to_string())
}

/// Reads tags out of one kind of audio container.
pub trait TagReader: Send + Sync {
    /// Name of the reader (e.g., "m4a", "generic")
    fn format_name(&self) -> &'static str;

    /// Read the catalog tags from the file
    fn read_tags(&self, path: &Path) -> Result<AudioTags>;
}

/// iTunes-style atoms in MP4/M4A containers.
pub struct M4aFile;

impl TagReader for M4aFile {
    fn format_name(&self) -> &'static str {
        "m4a"
    }

    fn read_tags(&self, path: &Path) -> Result<AudioTags> {
        let tag = mp4ameta::Tag::read_from_path(path).context("Failed to read M4A tags")?;

        let mut tags = AudioTags::default();
        if let Some(title) = tag.title() {
            AudioTags::set(&mut tags.title, title);
        }
        if let Some(artist) = tag.artist() {
            AudioTags::set(&mut tags.artist, artist);
        }
        if let Some(album) = tag.album() {
            AudioTags::set(&mut tags.album, album);
        }
        if let Some(year) = tag.year() {
            tags.set_year(year);
        }
        Ok(tags)
    }
}

/// Any container symphonia can probe.
pub struct GenericFile {
    extension: Option<String>,
}

impl TagReader for GenericFile {
    fn format_name(&self) -> &'static str {
        "generic"
    }

    fn read_tags(&self, path: &Path) -> Result<AudioTags> {
        use symphonia::core::io::MediaSourceStream;
        use symphonia::core::meta::MetadataOptions;
        use symphonia::core::probe::Hint;

        let file = std::fs::File::open(path).context("Failed to open audio file")?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = &self.extension {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &Default::default(), &MetadataOptions::default())
            .context("Failed to probe audio file")?;

        let mut format = probed.format;
        let mut metadata = probed.metadata;

        let mut tags = AudioTags::default();

        // Container metadata first, then anything found while probing (ID3 in front of MP3)
        let format_metadata = format.metadata();
        if let Some(metadata_rev) = format_metadata.current().map_or_else(
            || metadata.get().and_then(|m| m.current().cloned()),
            |x| Some(x).cloned(),
        ) {
            for tag in metadata_rev.tags() {
                let value = tag.value.to_string();

                match tag.std_key {
                    Some(StandardTagKey::TrackTitle) => AudioTags::set(&mut tags.title, &value),
                    Some(StandardTagKey::Artist) => AudioTags::set(&mut tags.artist, &value),
                    Some(StandardTagKey::Album) => AudioTags::set(&mut tags.album, &value),
                    Some(StandardTagKey::Date) | Some(StandardTagKey::ReleaseDate) => {
                        tags.set_year(&value)
                    }
                    Some(_) => {}
                    None => match tag.key.to_uppercase().as_str() {
                        "TITLE" | "TIT2" => AudioTags::set(&mut tags.title, &value),
                        "ARTIST" | "TPE1" => AudioTags::set(&mut tags.artist, &value),
                        "ALBUM" | "TALB" => AudioTags::set(&mut tags.album, &value),
                        "DATE" | "YEAR" | "TDRC" | "TYER" => tags.set_year(&value),
                        _ => {}
                    },
                }
            }
        }

        Ok(tags)
    }
}

/// Pick the reader for a file extension.
pub fn tag_reader_for(extension: &str) -> Box<dyn TagReader> {
    match extension.to_lowercase().as_str() {
        "m4a" => Box::new(M4aFile),
        other => Box::new(GenericFile {
            extension: (!other.is_empty()).then(|| other.to_string()),
        }),
    }
}

/// Best-effort tag read. Any failure yields `None`.
pub fn read_tags(path: &Path) -> Option<AudioTags> {
    let extension = extension_of(path).unwrap_or_default();
    let reader = tag_reader_for(&extension);

    match reader.read_tags(path) {
        Ok(tags) => Some(tags),
        Err(e) => {
            tracing::debug!(
                "No {} tags for {}: {:#}",
                reader.format_name(),
                path.display(),
                e
            );
            None
        }
    }
}

/// [`read_tags`] on the blocking pool.
pub async fn read_tags_blocking(path: PathBuf) -> Option<AudioTags> {
    tokio::task::spawn_blocking(move || read_tags(&path))
        .await
        .ok()
        .flatten()
}
