//! Musickera - a small music library server
//!
//! Playlists are directories under a music root. This crate lists them,
//! resolves cover art through an external music database, downloads
//! playlists with `yt-dlp` and cleans up duplicate tracks.

pub mod audio;
pub mod config;
pub mod covers;
pub mod download;
pub mod duplicates;
pub mod error;
pub mod jobs;
pub mod library;
pub mod metadata;
pub mod names;
pub mod server;
