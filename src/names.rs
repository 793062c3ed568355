//! Name transformations over filenames and playlist names.
//!
//! Everything that turns a user- or tool-supplied name into something we can
//! compare, key a cache on, or create on disk lives here, so the rules stay in
//! one place.

use std::path::{Component, Path};
use std::sync::LazyLock;

use regex::Regex;

/// Maximum length of a cover-cache stem.
pub const MAX_STEM_LEN: usize = 80;

/// Stem used when sanitization leaves nothing behind.
pub const FALLBACK_STEM: &str = "cover";

static TRAILING_PARENTHETICAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\([^)]*\)\s*$").expect("valid parenthetical pattern"));

static UNSAFE_STEM_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_-]+").expect("valid stem pattern"));

/// Characters that cannot appear in a playlist directory name.
const UNSAFE_PLAYLIST_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Strip the extension from a filename, the way a directory listing would.
pub fn strip_extension(filename: &str) -> &str {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
}

/// Derive the comparable song identity of a filename.
///
/// `"Song (Live).flac"` and `"Song.mp3"` both become `"song"`. Only the last
/// parenthetical group is removed: `"Song (A) (B).mp3"` becomes `"song (a)"`.
pub fn normalize(filename: &str) -> String {
    let name = strip_extension(filename);
    TRAILING_PARENTHETICAL
        .replace(name, "")
        .trim()
        .to_lowercase()
}

/// Replace path-unsafe characters in a playlist name with `_`.
///
/// Two different names may sanitize to the same directory.
pub fn sanitize_playlist_name(name: &str) -> String {
    name.chars()
        .map(|c| if UNSAFE_PLAYLIST_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

/// Exactly one normal path component: no separators, no `.` or `..`.
pub fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Cover-cache stem for an audio file.
pub fn cover_stem(filename: &str) -> String {
    let stem = strip_extension(filename);
    let safe = UNSAFE_STEM_CHARS.replace_all(stem, "_");
    finish_stem(&safe)
}

/// Cover-cache stem for a playlist.
///
/// Unlike [`cover_stem`] the whole name is used (no extension handling) and
/// leading/trailing underscores are trimmed.
pub fn playlist_cover_stem(name: &str) -> String {
    let safe = UNSAFE_STEM_CHARS.replace_all(name, "_");
    finish_stem(safe.trim_matches('_'))
}

fn finish_stem(safe: &str) -> String {
    // Only ASCII survives the replacement, so byte truncation is char-safe.
    let truncated = &safe[..safe.len().min(MAX_STEM_LEN)];
    if truncated.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        truncated.to_string()
    }
}

/// Title and artist guessed from a filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferredNames {
    pub artist: String,
    pub title: String,
}

/// Guess artist and title from an `"Artist - Title.ext"` filename.
///
/// Without the separator the whole stem is the title and the artist is empty.
pub fn infer_title_artist(filename: &str) -> InferredNames {
    let base = Path::new(filename)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    let stem = strip_extension(base);

    match stem.split_once(" - ") {
        Some((artist, title)) => InferredNames {
            artist: artist.trim().to_string(),
            title: title.trim().to_string(),
        },
        None => InferredNames {
            artist: String::new(),
            title: stem.to_string(),
        },
    }
}
